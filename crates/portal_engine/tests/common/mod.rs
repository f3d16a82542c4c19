#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portal_core::{
    AuthScenario, ExtractionRules, Indicator, LoginFlow, PluginDescriptor, PluginRegistry,
    QueryAction, RateLimit, RawNode, StateBlob,
};
use portal_engine::{
    url_markers, Collaborators, FormField, MemorySessionStore, Orchestrator, OrchestratorConfig,
    PageError, PageSession, PageSessionFactory, StaticCredentialProvider,
};

pub const LOGIN_URL: &str = "https://sitea.test/login";
pub const DASHBOARD_URL: &str = "https://sitea.test/dashboard";

/// Scripted portal with call counters.
#[derive(Default)]
pub struct FakePortal {
    pub opens: AtomicUsize,
    pub logins: AtomicUsize,
    pub queries: AtomicUsize,
    pub reject_login: AtomicBool,
    pub no_results: AtomicBool,
    /// Number of upcoming queries answered with a logged-out page.
    pub logged_out_responses: AtomicUsize,
    /// Sessions from logins numbered below this are rejected as revoked.
    pub min_generation: AtomicUsize,
    pub panic_on_login: AtomicBool,
    pub login_delay: Duration,
    pub query_delay: Duration,
}

impl FakePortal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_login_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            login_delay: delay,
            ..Self::default()
        })
    }

    pub fn with_query_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            query_delay: delay,
            ..Self::default()
        })
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn take_logged_out(&self) -> bool {
        self.logged_out_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct FakeFactory(pub Arc<FakePortal>);

#[async_trait::async_trait]
impl PageSessionFactory for FakeFactory {
    async fn open(
        &self,
        _descriptor: &PluginDescriptor,
        state: Option<&StateBlob>,
    ) -> Result<Box<dyn PageSession>, PageError> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        let generation = state
            .and_then(|blob| blob.0.get("generation"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as usize;
        let authenticated = state.is_some_and(|blob| blob.0.get("token").is_some())
            && generation >= self.0.min_generation.load(Ordering::SeqCst);
        Ok(Box::new(FakePage {
            portal: self.0.clone(),
            url: None,
            authenticated,
            generation,
            login_error: false,
            filled: Vec::new(),
        }))
    }
}

struct FakePage {
    portal: Arc<FakePortal>,
    url: Option<String>,
    authenticated: bool,
    /// Number of the login this page's state came from.
    generation: usize,
    login_error: bool,
    filled: Vec<FormField>,
}

impl FakePage {
    fn on_search(&self) -> bool {
        self.url.as_deref().is_some_and(|url| url.contains("/search"))
    }
}

#[async_trait::async_trait]
impl PageSession for FakePage {
    async fn navigate(&mut self, url: &str) -> Result<(), PageError> {
        if url.contains("/search") {
            self.portal.queries.fetch_add(1, Ordering::SeqCst);
            if !self.portal.query_delay.is_zero() {
                tokio::time::sleep(self.portal.query_delay).await;
            }
            if !self.authenticated || self.portal.take_logged_out() {
                self.url = Some(format!("{LOGIN_URL}?next=search"));
                return Ok(());
            }
        }
        self.url = Some(url.to_string());
        Ok(())
    }

    async fn fill_form(&mut self, fields: &[FormField]) -> Result<(), PageError> {
        self.filled.extend_from_slice(fields);
        Ok(())
    }

    async fn submit(&mut self) -> Result<(), PageError> {
        if self.url.as_deref() != Some(LOGIN_URL) {
            return Err(PageError::FormNotFound("not on the login page".into()));
        }
        let generation = self.portal.logins.fetch_add(1, Ordering::SeqCst) + 1;
        if self.portal.panic_on_login.load(Ordering::SeqCst) {
            panic!("login page crashed");
        }
        if !self.portal.login_delay.is_zero() {
            tokio::time::sleep(self.portal.login_delay).await;
        }
        if self.portal.reject_login.load(Ordering::SeqCst) {
            self.login_error = true;
        } else {
            self.authenticated = true;
            self.generation = generation;
            self.url = Some(DASHBOARD_URL.to_string());
        }
        Ok(())
    }

    async fn extract_dom(&mut self, selectors: &[String]) -> Result<Vec<RawNode>, PageError> {
        let mut nodes = Vec::new();
        for selector in selectors {
            if selector == ".error-message" && self.login_error {
                nodes.push(RawNode::new("div").with_text("Invalid credentials"));
            }
            if selector == "table" && self.on_search() && !self.portal.no_results.load(Ordering::SeqCst) {
                nodes.push(results_table());
            }
        }
        Ok(nodes)
    }

    async fn page_text(&mut self, selector: &str) -> Result<String, PageError> {
        if selector == ".error-message" && self.login_error {
            return Ok("Invalid credentials".into());
        }
        if self.on_search() {
            return Ok(if self.portal.no_results.load(Ordering::SeqCst) {
                "No matches found".into()
            } else {
                "C-1 2024-01-02".into()
            });
        }
        Ok(String::new())
    }

    fn current_url(&self) -> Option<String> {
        self.url.clone()
    }

    fn current_url_markers(&self) -> BTreeSet<String> {
        self.url.as_deref().map(url_markers).unwrap_or_default()
    }

    async fn storage_state(&mut self) -> Result<StateBlob, PageError> {
        Ok(StateBlob(serde_json::json!({
            "token": "fake-token",
            "generation": self.generation,
        })))
    }

    async fn close(&mut self) {}
}

pub fn results_table() -> RawNode {
    RawNode::new("table")
        .with_text("C-1 2024-01-02")
        .with_child(
            RawNode::new("tr")
                .with_child(RawNode::new("td").with_text("C-1"))
                .with_child(RawNode::new("td").with_text("2024-01-02")),
        )
}

pub fn descriptor(id: &str) -> PluginDescriptor {
    PluginDescriptor {
        id: id.into(),
        name: format!("Portal {id}"),
        version: "1.0.0".into(),
        description: String::new(),
        category: "legal".into(),
        tags: Vec::new(),
        base_url: "https://sitea.test".into(),
        login_url: LOGIN_URL.into(),
        query_url: "https://sitea.test/search?q={query}".into(),
        credential_fields: vec!["username".into(), "password".into()],
        session_ttl_secs: 3600,
        rate_limit: RateLimit {
            requests: 10,
            per_secs: 60,
        },
        enabled: true,
        auth: AuthScenario::Form(LoginFlow {
            username_field: "#user".into(),
            password_field: "#pass".into(),
            extra_fields: Vec::new(),
            success: Vec::new(),
            failure: vec![Indicator::ElementPresent(".error-message".into())],
        }),
        query: QueryAction::UrlTemplate,
        extraction: ExtractionRules {
            no_results: vec![Indicator::TextContains("no matches".into())],
            ..ExtractionRules::default()
        },
        logged_out: vec![Indicator::UrlContains("/login".into())],
        max_concurrent_queries: 1,
    }
}

pub struct Harness {
    pub portal: Arc<FakePortal>,
    pub credentials: Arc<StaticCredentialProvider>,
    pub store: Arc<MemorySessionStore>,
    pub orchestrator: Orchestrator,
}

pub fn harness(portal: Arc<FakePortal>, descriptors: Vec<PluginDescriptor>) -> Harness {
    harness_with_config(portal, descriptors, OrchestratorConfig::default())
}

pub fn harness_with_config(
    portal: Arc<FakePortal>,
    descriptors: Vec<PluginDescriptor>,
    config: OrchestratorConfig,
) -> Harness {
    portal_logging::initialize_for_tests();
    let credentials = Arc::new(StaticCredentialProvider::new());
    credentials.insert("siteA", [("username", "alice"), ("password", "secret")]);
    let store = Arc::new(MemorySessionStore::new());
    let orchestrator = Orchestrator::new(
        PluginRegistry::from_descriptors(descriptors),
        Collaborators::new(
            Arc::new(FakeFactory(portal.clone())),
            credentials.clone(),
            store.clone(),
        ),
        config,
    );
    Harness {
        portal,
        credentials,
        store,
        orchestrator,
    }
}
