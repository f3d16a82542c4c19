use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Placeholder substituted with the url-encoded query in `QueryAction::UrlTemplate`.
pub const QUERY_PLACEHOLDER: &str = "{query}";

/// Static description of one portal. Loaded once; only `enabled` changes at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub base_url: String,
    pub login_url: String,
    pub query_url: String,
    #[serde(default = "default_credential_fields")]
    pub credential_fields: Vec<String>,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auth: AuthScenario,
    pub query: QueryAction,
    #[serde(default)]
    pub extraction: ExtractionRules,
    /// Predicate over a query response: any match means the portal logged us out.
    #[serde(default)]
    pub logged_out: Vec<Indicator>,
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub per_secs: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests: 10,
            per_secs: 60,
        }
    }
}

impl RateLimit {
    pub fn per(&self) -> Duration {
        Duration::from_secs(self.per_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthScenario {
    /// Public portal; queries run without a login.
    #[default]
    None,
    Form(LoginFlow),
    /// Every request carries an API key taken from the `api_key` credential.
    ApiKey {
        #[serde(default)]
        method: ApiKeyMethod,
        #[serde(default = "default_api_key_name")]
        key_name: String,
    },
}

/// Where the API key goes on each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApiKeyMethod {
    /// `{key_name}: {key}`
    #[default]
    Header,
    /// `?{key_name}={key}`
    QueryParam,
    /// `Authorization: Bearer {key}`
    Bearer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginFlow {
    pub username_field: String,
    pub password_field: String,
    #[serde(default)]
    pub extra_fields: Vec<FixedField>,
    #[serde(default)]
    pub success: Vec<Indicator>,
    #[serde(default)]
    pub failure: Vec<Indicator>,
}

impl LoginFlow {
    /// Success indicators, falling back to "the url no longer mentions login".
    pub fn success_indicators(&self) -> Vec<Indicator> {
        if self.success.is_empty() {
            vec![Indicator::UrlLacks("login".to_string())]
        } else {
            self.success.clone()
        }
    }
}

/// A form field filled with a constant value during login (e.g. a "remember me" box).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedField {
    pub selector: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryAction {
    /// Navigate to `query_url` with `{query}` replaced by the encoded query.
    UrlTemplate,
    /// Navigate to `query_url`, fill `input_selector` and submit the form it belongs to.
    SearchForm {
        input_selector: String,
    },
}

/// Page conditions a login or query response is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Indicator {
    UrlContains(String),
    UrlLacks(String),
    ElementPresent(String),
    ElementAbsent(String),
    TextContains(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRules {
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    #[serde(default = "default_content")]
    pub content: Vec<String>,
    #[serde(default = "default_documents")]
    pub documents: Vec<String>,
    #[serde(default = "default_raw_text")]
    pub raw_text: String,
    #[serde(default)]
    pub no_results: Vec<Indicator>,
    #[serde(default)]
    pub max_rows: Option<usize>,
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            tables: default_tables(),
            content: default_content(),
            documents: default_documents(),
            raw_text: default_raw_text(),
            no_results: Vec::new(),
            max_rows: None,
            max_text_chars: default_max_text_chars(),
        }
    }
}

impl ExtractionRules {
    /// Every selector whose matches are handed to the normalizer, in extraction order.
    pub fn selectors(&self) -> Vec<String> {
        let mut all = Vec::new();
        for selector in self
            .tables
            .iter()
            .chain(self.content.iter())
            .chain(self.documents.iter())
        {
            if !all.contains(selector) {
                all.push(selector.clone());
            }
        }
        all
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("plugin id is empty")]
    EmptyId,
    #[error("plugin '{id}': invalid {field} '{value}'")]
    InvalidUrl {
        id: String,
        field: &'static str,
        value: String,
    },
    #[error("plugin '{id}': rate limit must allow at least one request per non-zero interval")]
    InvalidRateLimit { id: String },
    #[error("plugin '{id}': session ttl must be positive")]
    InvalidSessionTtl { id: String },
    #[error("plugin '{id}': query url template lacks {{query}}")]
    MissingQueryPlaceholder { id: String },
    #[error("plugin '{id}': max_concurrent_queries must be positive")]
    InvalidPoolSize { id: String },
    #[error("plugin '{id}': api key name is empty")]
    EmptyApiKeyName { id: String },
}

impl PluginDescriptor {
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.id.trim().is_empty() {
            return Err(DescriptorError::EmptyId);
        }
        for (field, value) in [
            ("base_url", &self.base_url),
            ("login_url", &self.login_url),
            ("query_url", &self.query_url),
        ] {
            // The template placeholder is not a valid url component on its own.
            let probe = value.replace(QUERY_PLACEHOLDER, "q");
            if Url::parse(&probe).is_err() {
                return Err(DescriptorError::InvalidUrl {
                    id: self.id.clone(),
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.rate_limit.requests == 0 || self.rate_limit.per_secs == 0 {
            return Err(DescriptorError::InvalidRateLimit {
                id: self.id.clone(),
            });
        }
        if self.session_ttl_secs == 0 {
            return Err(DescriptorError::InvalidSessionTtl {
                id: self.id.clone(),
            });
        }
        if self.query == QueryAction::UrlTemplate && !self.query_url.contains(QUERY_PLACEHOLDER) {
            return Err(DescriptorError::MissingQueryPlaceholder {
                id: self.id.clone(),
            });
        }
        if self.max_concurrent_queries == 0 {
            return Err(DescriptorError::InvalidPoolSize {
                id: self.id.clone(),
            });
        }
        if let AuthScenario::ApiKey { key_name, .. } = &self.auth {
            if key_name.trim().is_empty() {
                return Err(DescriptorError::EmptyApiKeyName {
                    id: self.id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn requires_login(&self) -> bool {
        matches!(self.auth, AuthScenario::Form(_))
    }

    /// Credential fields a query needs, in the order they are reported missing.
    ///
    /// Form logins always need `username` and `password`; API-key portals need
    /// `api_key` plus any non-login fields the descriptor lists.
    pub fn required_credentials(&self) -> Vec<String> {
        let mut fields: Vec<String> = match self.auth {
            AuthScenario::None => return Vec::new(),
            AuthScenario::Form(_) => self.credential_fields.clone(),
            AuthScenario::ApiKey { .. } => self
                .credential_fields
                .iter()
                .filter(|field| !matches!(field.as_str(), "username" | "password"))
                .cloned()
                .collect(),
        };
        let implied: &[&str] = match self.auth {
            AuthScenario::ApiKey { .. } => &["api_key"],
            _ => &["username", "password"],
        };
        for field in implied {
            if !fields.iter().any(|existing| existing == field) {
                fields.push((*field).to_string());
            }
        }
        fields
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Resolves the url to open for `query`.
    pub fn query_target(&self, query: &str) -> String {
        match self.query {
            QueryAction::UrlTemplate => {
                let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
                self.query_url.replace(QUERY_PLACEHOLDER, &encoded)
            }
            QueryAction::SearchForm { .. } => self.query_url.clone(),
        }
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_category() -> String {
    "general".to_string()
}

fn default_credential_fields() -> Vec<String> {
    vec!["username".to_string(), "password".to_string()]
}

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_queries() -> usize {
    1
}

fn default_tables() -> Vec<String> {
    vec!["table".to_string()]
}

fn default_content() -> Vec<String> {
    vec!["article".to_string(), "section".to_string()]
}

fn default_documents() -> Vec<String> {
    vec![
        "a[href*='detail']".to_string(),
        "a[href*='.pdf']".to_string(),
        "a[href*='download']".to_string(),
    ]
}

fn default_api_key_name() -> String {
    "X-API-Key".to_string()
}

fn default_raw_text() -> String {
    "body".to_string()
}

fn default_max_text_chars() -> usize {
    10_000
}
