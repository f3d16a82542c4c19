use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::json;

use portal_core::{
    AuthEvent, AuthScenario, AuthState, Clock, Indicator, LoginFlow, Phase, PluginDescriptor,
    PortalError, Session, StateBlob,
};
use portal_logging::{portal_debug, portal_info, portal_warn};

use crate::credentials::{lookup, missing_fields, CredentialProvider};
use crate::page::{first_match, FormField, PageError, PageSession, PageSessionFactory};
use crate::persist::PersistError;
use crate::session_store::{InvalidateOutcome, SessionStore};

/// State blob key carrying the key of an api-key plugin to the page session.
pub(crate) const API_KEY_STATE: &str = "api_key";

type LoginFuture = Shared<BoxFuture<'static, Result<Session, PortalError>>>;

/// Drives form logins and hands out valid sessions.
///
/// At most one login per plugin runs at a time. It runs on its own task, so a
/// caller that stops waiting does not abort it for the others. Session store
/// calls run on the blocking pool.
#[derive(Clone)]
pub struct AuthenticationEngine {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<dyn PageSessionFactory>,
    credentials: Arc<dyn CredentialProvider>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, AuthState>>,
    in_flight: Mutex<HashMap<String, LoginFuture>>,
}

impl AuthenticationEngine {
    pub fn new(
        factory: Arc<dyn PageSessionFactory>,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                credentials,
                store,
                clock,
                states: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a stored valid session unchanged, or logs in and stores a new one.
    ///
    /// Api-key plugins get a session built from the key on every call; it is
    /// never stored.
    pub async fn ensure_authenticated(
        &self,
        descriptor: &PluginDescriptor,
    ) -> Result<Session, PortalError> {
        let plugin_id = descriptor.id.as_str();
        match &descriptor.auth {
            AuthScenario::None => return Ok(Session::anonymous(plugin_id, self.inner.clock.now())),
            AuthScenario::ApiKey { .. } => return self.api_key_session(descriptor),
            AuthScenario::Form(_) => {}
        }

        if let Some(session) = self.stored(plugin_id).await? {
            return Ok(session);
        }

        let login = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(plugin_id) {
                Some(existing) => {
                    portal_debug!("joining login already in flight for {}", plugin_id);
                    existing.clone()
                }
                None => {
                    let login = self.spawn_login(descriptor.clone());
                    in_flight.insert(plugin_id.to_string(), login.clone());
                    login
                }
            }
        };
        login.await
    }

    /// Drops the stored session and returns the plugin to `LoggedOut`.
    pub async fn invalidate(&self, plugin_id: &str) -> Result<Option<Session>, PortalError> {
        let id = plugin_id.to_string();
        let removed = self
            .with_store(plugin_id, move |store| store.invalidate(&id))
            .await?;
        self.settle_logged_out(plugin_id);
        portal_info!("session for {} invalidated", plugin_id);
        Ok(removed)
    }

    /// Drops the stored session only if it is still `used`.
    ///
    /// When a later login already replaced it, the newer session is kept and
    /// returned in `InvalidateOutcome::Superseded`.
    pub async fn invalidate_used(
        &self,
        plugin_id: &str,
        used: &Session,
    ) -> Result<InvalidateOutcome, PortalError> {
        let id = plugin_id.to_string();
        let used = used.clone();
        let outcome = self
            .with_store(plugin_id, move |store| store.invalidate_if(&id, &used))
            .await?;
        match &outcome {
            InvalidateOutcome::Superseded(newer) => portal_info!(
                "session for {} was already replaced by a login at {}",
                plugin_id,
                newer.created_at
            ),
            InvalidateOutcome::Removed | InvalidateOutcome::Absent => {
                self.settle_logged_out(plugin_id);
                portal_info!("session for {} invalidated", plugin_id);
            }
        }
        Ok(outcome)
    }

    pub fn state(&self, plugin_id: &str) -> AuthState {
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .copied()
            .unwrap_or_default()
    }

    async fn stored(&self, plugin_id: &str) -> Result<Option<Session>, PortalError> {
        let id = plugin_id.to_string();
        let stored = self.with_store(plugin_id, move |store| store.get(&id)).await?;
        match (&stored, self.state(plugin_id)) {
            (Some(_), AuthState::LoggedOut) => {
                // Restored from durable storage, e.g. after a restart.
                self.set_state(plugin_id, AuthState::Authenticated);
            }
            (None, AuthState::Authenticated) => {
                self.transition(plugin_id, AuthEvent::SessionExpired);
            }
            _ => {}
        }
        Ok(stored)
    }

    /// Runs `op` against the session store on the blocking pool.
    async fn with_store<T, F>(&self, plugin_id: &str, op: F) -> Result<T, PortalError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionStore) -> Result<T, PersistError> + Send + 'static,
    {
        let store = self.inner.store.clone();
        match tokio::task::spawn_blocking(move || op(store.as_ref())).await {
            Ok(result) => result.map_err(|err| storage_error(plugin_id, err)),
            Err(err) => Err(PortalError::Storage {
                plugin_id: plugin_id.to_string(),
                message: format!("session store task ended abnormally: {err}"),
            }),
        }
    }

    fn api_key_session(&self, descriptor: &PluginDescriptor) -> Result<Session, PortalError> {
        let plugin_id = descriptor.id.as_str();
        let credentials = self.inner.credentials.get(plugin_id).unwrap_or_default();
        let missing = missing_fields(descriptor, &credentials);
        let (true, Some(key)) = (missing.is_empty(), lookup(&credentials, API_KEY_STATE)) else {
            return Err(PortalError::CredentialsMissing {
                plugin_id: plugin_id.to_string(),
                missing,
            });
        };
        Ok(Session::new(
            plugin_id,
            StateBlob(json!({ API_KEY_STATE: key })),
            self.inner.clock.now(),
            Duration::from_secs(u64::MAX),
        ))
    }

    /// Moves a plugin whose session is gone back to `LoggedOut`.
    fn settle_logged_out(&self, plugin_id: &str) {
        if self.state(plugin_id) == AuthState::Authenticated {
            self.transition(plugin_id, AuthEvent::SessionInvalidated);
        }
        if matches!(
            self.state(plugin_id),
            AuthState::Expired | AuthState::Invalidated
        ) {
            self.transition(plugin_id, AuthEvent::Reset);
        }
    }

    fn spawn_login(&self, descriptor: PluginDescriptor) -> LoginFuture {
        let engine = self.clone();
        let plugin_id = descriptor.id.clone();
        let task = tokio::spawn(async move {
            let _in_flight = InFlightGuard {
                engine: engine.clone(),
                plugin_id: descriptor.id.clone(),
            };
            // A login may have finished between the caller's lookup and this task starting.
            match engine.stored(&descriptor.id).await {
                Ok(Some(session)) => Ok(session),
                Ok(None) => engine.login(&descriptor).await,
                Err(err) => Err(err),
            }
        });
        async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(PortalError::AuthenticationFailed {
                    plugin_id,
                    reason: format!("login task ended abnormally: {err}"),
                }),
            }
        }
        .boxed()
        .shared()
    }

    async fn login(&self, descriptor: &PluginDescriptor) -> Result<Session, PortalError> {
        let plugin_id = descriptor.id.as_str();
        let AuthScenario::Form(flow) = &descriptor.auth else {
            return Ok(Session::anonymous(plugin_id, self.inner.clock.now()));
        };

        self.transition(plugin_id, AuthEvent::LoginStarted);
        let result = self.run_login(descriptor, flow).await;
        match &result {
            Ok(session) => {
                self.transition(plugin_id, AuthEvent::LoginSucceeded);
                portal_info!(
                    "logged in to {}; session valid until {}",
                    plugin_id,
                    session.expires_at()
                );
            }
            Err(err) => {
                self.transition(plugin_id, AuthEvent::LoginFailed);
                portal_warn!("login to {} failed: {}", plugin_id, err);
            }
        }
        result
    }

    async fn run_login(
        &self,
        descriptor: &PluginDescriptor,
        flow: &LoginFlow,
    ) -> Result<Session, PortalError> {
        let plugin_id = descriptor.id.as_str();
        let credentials = self.inner.credentials.get(plugin_id).unwrap_or_default();
        let missing = missing_fields(descriptor, &credentials);
        let (Some(username), Some(password), true) = (
            lookup(&credentials, "username"),
            lookup(&credentials, "password"),
            missing.is_empty(),
        ) else {
            return Err(PortalError::CredentialsMissing {
                plugin_id: plugin_id.to_string(),
                missing,
            });
        };
        portal_debug!(
            "logging in to {} with fields {:?}",
            plugin_id,
            credentials.keys().collect::<Vec<_>>()
        );

        let mut page = self
            .inner
            .factory
            .open(descriptor, None)
            .await
            .map_err(|err| page_failure(plugin_id, Phase::Authentication, err))?;
        let outcome = self
            .drive_login(page.as_mut(), descriptor, flow, username, password)
            .await;
        page.close().await;
        let state = outcome?;

        let session = Session::new(
            plugin_id,
            state,
            self.inner.clock.now(),
            descriptor.session_ttl(),
        );
        let record = session.clone();
        self.with_store(plugin_id, move |store| store.put(&record))
            .await?;
        Ok(session)
    }

    async fn drive_login(
        &self,
        page: &mut dyn PageSession,
        descriptor: &PluginDescriptor,
        flow: &LoginFlow,
        username: &str,
        password: &str,
    ) -> Result<StateBlob, PortalError> {
        let plugin_id = descriptor.id.as_str();
        let fail = |err: PageError| page_failure(plugin_id, Phase::Authentication, err);

        page.navigate(&descriptor.login_url).await.map_err(fail)?;
        let mut fields = vec![
            FormField::new(&flow.username_field, username),
            FormField::new(&flow.password_field, password),
        ];
        fields.extend(
            flow.extra_fields
                .iter()
                .map(|extra| FormField::new(&extra.selector, &extra.value)),
        );
        page.fill_form(&fields).await.map_err(fail)?;
        page.submit().await.map_err(fail)?;

        if let Some(indicator) = first_match(page, &flow.failure).await.map_err(fail)? {
            let detail = match indicator {
                Indicator::ElementPresent(selector) => {
                    page.page_text(selector).await.unwrap_or_default()
                }
                _ => String::new(),
            };
            let reason = if detail.is_empty() {
                format!("login page reported failure ({indicator:?})")
            } else {
                format!("login page reported failure: {detail}")
            };
            return Err(PortalError::AuthenticationFailed {
                plugin_id: plugin_id.to_string(),
                reason,
            });
        }

        let success = flow.success_indicators();
        if first_match(page, &success).await.map_err(fail)?.is_none() {
            return Err(PortalError::AuthenticationFailed {
                plugin_id: plugin_id.to_string(),
                reason: format!(
                    "no success indicator matched at {}",
                    page.current_url().unwrap_or_default()
                ),
            });
        }

        page.storage_state().await.map_err(fail)
    }

    fn transition(&self, plugin_id: &str, event: AuthEvent) {
        let mut states = self
            .inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = states.get(plugin_id).copied().unwrap_or_default();
        match current.on(event) {
            Some(next) => {
                portal_debug!("{}: {:?} -> {:?} on {:?}", plugin_id, current, next, event);
                states.insert(plugin_id.to_string(), next);
            }
            None => portal_warn!(
                "{}: ignoring {:?} while {:?}",
                plugin_id,
                event,
                current
            ),
        }
    }

    fn set_state(&self, plugin_id: &str, state: AuthState) {
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.to_string(), state);
    }
}

/// Clears the in-flight entry when the login task ends, even by panic.
struct InFlightGuard {
    engine: AuthenticationEngine,
    plugin_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.engine
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.plugin_id);
        if self.engine.state(&self.plugin_id) == AuthState::Authenticating {
            portal_warn!("login task for {} ended mid-login", self.plugin_id);
            self.engine.transition(&self.plugin_id, AuthEvent::LoginFailed);
        }
    }
}

pub(crate) fn storage_error(plugin_id: &str, err: PersistError) -> PortalError {
    PortalError::Storage {
        plugin_id: plugin_id.to_string(),
        message: err.to_string(),
    }
}

/// Maps a page failure to the caller-facing taxonomy.
pub(crate) fn page_failure(plugin_id: &str, phase: Phase, err: PageError) -> PortalError {
    if err.is_network() || phase != Phase::Authentication {
        PortalError::NetworkUnavailable {
            plugin_id: plugin_id.to_string(),
            phase,
            message: err.to_string(),
        }
    } else {
        PortalError::AuthenticationFailed {
            plugin_id: plugin_id.to_string(),
            reason: err.to_string(),
        }
    }
}
