use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use portal_core::{
    normalize, AuthState, Clock, FormatHint, Phase, PluginDescriptor, PluginInfo, PluginRegistry,
    PortalError, QueryRequest, QueryResult, RateBudget, SystemClock,
};
use portal_logging::{next_trace_id, portal_debug, portal_info, portal_warn};

use crate::auth::AuthenticationEngine;
use crate::config::OrchestratorConfig;
use crate::credentials::{missing_fields, CredentialProvider};
use crate::executor::QueryExecutor;
use crate::http_session::HttpSessionFactory;
use crate::loader::{DescriptorLoader, LoadError, LoadReport};
use crate::page::PageSessionFactory;
use crate::rate_limit::RateLimiter;
use crate::session_store::{FileSessionStore, InvalidateOutcome, SessionStore};

/// External capabilities the orchestrator is built on.
pub struct Collaborators {
    pub factory: Arc<dyn PageSessionFactory>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub store: Arc<dyn SessionStore>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        factory: Arc<dyn PageSessionFactory>,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            factory,
            credentials,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Entry point for callers: session reuse, single-flight login, rate limiting,
/// query execution and normalization for every registered plugin.
pub struct Orchestrator {
    registry: PluginRegistry,
    credentials: Arc<dyn CredentialProvider>,
    auth: AuthenticationEngine,
    limiter: RateLimiter,
    executor: QueryExecutor,
    pools: Mutex<HashMap<String, Arc<Semaphore>>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(registry: PluginRegistry, parts: Collaborators, config: OrchestratorConfig) -> Self {
        let auth = AuthenticationEngine::new(
            parts.factory.clone(),
            parts.credentials.clone(),
            parts.store,
            parts.clock,
        );
        Self {
            registry,
            credentials: parts.credentials,
            auth,
            limiter: RateLimiter::new(),
            executor: QueryExecutor::new(parts.factory),
            pools: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Plugins from `config.plugins_dir`, sessions under `config.session_dir`
    /// and pages over HTTP with `config.http`.
    ///
    /// Descriptor files that fail to load are skipped and listed in the report.
    pub fn from_config(
        config: OrchestratorConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<(Self, LoadReport), LoadError> {
        let (registry, report) = DescriptorLoader::load_dir(&config.plugins_dir)?;
        portal_info!(
            "loaded {} plugins from {}; sessions in {}",
            report.loaded.len(),
            config.plugins_dir.display(),
            config.session_dir.display()
        );
        let parts = Collaborators::new(
            Arc::new(HttpSessionFactory::new(config.http.clone())),
            credentials,
            Arc::new(FileSessionStore::new(&config.session_dir)),
        );
        Ok((Self::new(registry, parts, config), report))
    }

    pub fn list_plugins(&self) -> Vec<PluginDescriptor> {
        self.registry.list()
    }

    pub fn plugin_info(&self, plugin_id: &str) -> Result<PluginInfo, PortalError> {
        self.registry.info(plugin_id)
    }

    pub fn plugins_by_category(&self) -> BTreeMap<String, Vec<PluginInfo>> {
        self.registry.by_category()
    }

    /// Whether every credential the plugin's auth scenario needs is available.
    pub fn check_credentials(&self, plugin_id: &str) -> Result<bool, PortalError> {
        let descriptor = self.registry.get(plugin_id)?;
        let credentials = self.credentials.get(plugin_id).unwrap_or_default();
        Ok(missing_fields(&descriptor, &credentials).is_empty())
    }

    pub fn enable_plugin(&self, plugin_id: &str) -> Result<(), PortalError> {
        self.registry.enable(plugin_id)?;
        portal_info!("plugin {} enabled", plugin_id);
        Ok(())
    }

    pub fn disable_plugin(&self, plugin_id: &str) -> Result<(), PortalError> {
        self.registry.disable(plugin_id)?;
        portal_info!("plugin {} disabled", plugin_id);
        Ok(())
    }

    pub fn auth_state(&self, plugin_id: &str) -> AuthState {
        self.auth.state(plugin_id)
    }

    pub fn rate_budget(&self, plugin_id: &str) -> Option<RateBudget> {
        self.limiter.budget(plugin_id)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn run_query(
        &self,
        plugin_id: &str,
        query: &str,
        format: FormatHint,
    ) -> Result<QueryResult, PortalError> {
        let request = QueryRequest::new(plugin_id, query)?.with_format(format);
        self.run_request(request).await
    }

    pub async fn run_request(&self, request: QueryRequest) -> Result<QueryResult, PortalError> {
        self.run_query_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Like `run_request`, but aborts with `Cancelled` once `cancel` fires.
    ///
    /// A login shared with other callers keeps running.
    pub async fn run_query_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryResult, PortalError> {
        let trace = next_trace_id();
        let plugin_id = request.plugin_id().to_string();
        let result = self.run(&trace, &request, &cancel).await;
        match &result {
            Ok(result) => portal_info!(
                "[{}] {}: {} ({:?})",
                trace,
                plugin_id,
                result.summary,
                result.kind
            ),
            Err(err) => portal_warn!("[{}] {} failed in {} phase: {}", trace, plugin_id, err.phase(), err),
        }
        result
    }

    async fn run(
        &self,
        trace: &str,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, PortalError> {
        let plugin_id = request.plugin_id();
        let descriptor = self.registry.get(plugin_id)?;
        if !descriptor.enabled {
            return Err(PortalError::PluginDisabled {
                plugin_id: plugin_id.to_string(),
            });
        }
        portal_info!("[{}] query on {}: '{}'", trace, plugin_id, request.query());

        let pool = self.pool(&descriptor);
        let mut reauthenticated = false;
        let mut refreshed = false;
        let mut newer_session = None;
        loop {
            let session = match newer_session.take() {
                Some(session) => session,
                None => {
                    until_cancelled(
                        cancel,
                        plugin_id,
                        Phase::Authentication,
                        self.auth.ensure_authenticated(&descriptor),
                    )
                    .await?
                }
            };

            let _permit = until_cancelled(cancel, plugin_id, Phase::Query, async {
                pool.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| PortalError::Cancelled {
                        plugin_id: plugin_id.to_string(),
                        phase: Phase::Query,
                    })
            })
            .await?;

            until_cancelled(
                cancel,
                plugin_id,
                Phase::RateLimit,
                self.limiter.acquire(
                    plugin_id,
                    descriptor.rate_limit,
                    self.config.rate_limit_timeout,
                ),
            )
            .await?;

            let executed = until_cancelled(
                cancel,
                plugin_id,
                Phase::Query,
                self.executor.execute(&descriptor, &session, request),
            )
            .await;

            match executed {
                Ok(page) => return Ok(normalize(&descriptor, request, &page)),
                Err(PortalError::SessionExpiredDuringQuery { .. }) => {
                    // Only the session this query used is dropped; another
                    // caller may already have replaced it.
                    match self.auth.invalidate_used(plugin_id, &session).await? {
                        InvalidateOutcome::Superseded(newer) if !refreshed => {
                            portal_info!(
                                "[{}] {} logged us out mid-query; retrying with the newer session",
                                trace,
                                plugin_id
                            );
                            refreshed = true;
                            newer_session = Some(newer);
                        }
                        _ if !reauthenticated => {
                            portal_warn!(
                                "[{}] {} logged us out mid-query; re-authenticating once",
                                trace,
                                plugin_id
                            );
                            reauthenticated = true;
                        }
                        _ => {
                            return Err(PortalError::AuthenticationFailed {
                                plugin_id: plugin_id.to_string(),
                                reason: "portal still reports a logged-out page after re-authenticating"
                                    .to_string(),
                            });
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn pool(&self, descriptor: &PluginDescriptor) -> Arc<Semaphore> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry(descriptor.id.clone())
            .or_insert_with(|| {
                portal_debug!(
                    "query pool for {} sized {}",
                    descriptor.id,
                    descriptor.max_concurrent_queries
                );
                Arc::new(Semaphore::new(descriptor.max_concurrent_queries.max(1)))
            })
            .clone()
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    plugin_id: &str,
    phase: Phase,
    work: impl Future<Output = Result<T, PortalError>>,
) -> Result<T, PortalError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PortalError::Cancelled {
            plugin_id: plugin_id.to_string(),
            phase,
        }),
        result = work => result,
    }
}
