use std::collections::BTreeSet;

use portal_core::{Indicator, PluginDescriptor, RawNode, StateBlob};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("redirect limit exceeded")]
    RedirectLimitExceeded,
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("response too large: limit {max_bytes} bytes, got {actual:?}")]
    TooLarge { max_bytes: u64, actual: Option<u64> },
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("invalid selector '{0}'")]
    InvalidSelector(String),
    #[error("no element matches '{0}'")]
    ElementNotFound(String),
    #[error("no form to submit: {0}")]
    FormNotFound(String),
    #[error("no page loaded")]
    NoPage,
    #[error("page session is closed")]
    Closed,
    #[error("session state could not be exported: {0}")]
    State(String),
}

impl PageError {
    /// Failures that mean the portal could not be reached at all.
    pub fn is_network(&self) -> bool {
        match self {
            PageError::Timeout(_) | PageError::Network(_) | PageError::RedirectLimitExceeded => true,
            PageError::HttpStatus(status) => *status >= 500,
            _ => false,
        }
    }
}

/// Input value to set on the currently loaded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub selector: String,
    pub value: String,
}

impl FormField {
    pub fn new(selector: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            value: value.into(),
        }
    }
}

/// One browser-like page bound to a single portal.
///
/// Implementations own their cookie or storage state; nothing else is shared
/// between sessions.
#[async_trait::async_trait]
pub trait PageSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), PageError>;

    async fn fill_form(&mut self, fields: &[FormField]) -> Result<(), PageError>;

    /// Submits the form the last filled fields belong to.
    async fn submit(&mut self) -> Result<(), PageError>;

    /// Elements matching any selector, in selector order, each at most once.
    async fn extract_dom(&mut self, selectors: &[String]) -> Result<Vec<RawNode>, PageError>;

    /// Whitespace-collapsed text of everything matching `selector`.
    async fn page_text(&mut self, selector: &str) -> Result<String, PageError>;

    fn current_url(&self) -> Option<String>;

    fn current_url_markers(&self) -> BTreeSet<String>;

    async fn storage_state(&mut self) -> Result<StateBlob, PageError>;

    async fn close(&mut self);
}

#[async_trait::async_trait]
pub trait PageSessionFactory: Send + Sync {
    /// Opens a fresh page for `descriptor`, seeded with a previously exported state.
    async fn open(
        &self,
        descriptor: &PluginDescriptor,
        state: Option<&StateBlob>,
    ) -> Result<Box<dyn PageSession>, PageError>;
}

/// Lowercased url, host, path segments and query keys.
pub fn url_markers(url: &str) -> BTreeSet<String> {
    let mut markers = BTreeSet::new();
    markers.insert(url.to_lowercase());
    let Ok(parsed) = Url::parse(url) else {
        return markers;
    };
    if let Some(host) = parsed.host_str() {
        markers.insert(host.to_lowercase());
    }
    if let Some(segments) = parsed.path_segments() {
        markers.extend(
            segments
                .filter(|segment| !segment.is_empty())
                .map(str::to_lowercase),
        );
    }
    markers.extend(parsed.query_pairs().map(|(key, _)| key.to_lowercase()));
    markers
}

/// Evaluates one indicator against the page as it is now.
pub async fn indicator_matches(
    page: &mut dyn PageSession,
    indicator: &Indicator,
) -> Result<bool, PageError> {
    match indicator {
        Indicator::UrlContains(pattern) => Ok(url_has(page, pattern)),
        Indicator::UrlLacks(pattern) => Ok(!url_has(page, pattern)),
        Indicator::ElementPresent(selector) => {
            Ok(!page.extract_dom(&[selector.clone()]).await?.is_empty())
        }
        Indicator::ElementAbsent(selector) => {
            Ok(page.extract_dom(&[selector.clone()]).await?.is_empty())
        }
        Indicator::TextContains(text) => Ok(page
            .page_text("body")
            .await?
            .to_lowercase()
            .contains(&text.to_lowercase())),
    }
}

/// First indicator in `indicators` that matches, if any.
pub async fn first_match<'a>(
    page: &mut dyn PageSession,
    indicators: &'a [Indicator],
) -> Result<Option<&'a Indicator>, PageError> {
    for indicator in indicators {
        if indicator_matches(page, indicator).await? {
            return Ok(Some(indicator));
        }
    }
    Ok(None)
}

fn url_has(page: &dyn PageSession, pattern: &str) -> bool {
    let pattern = pattern.to_lowercase();
    page.current_url_markers()
        .iter()
        .any(|marker| marker.contains(&pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_cover_host_path_and_query_keys() {
        let markers = url_markers("https://Portal.Example/Account/Login?ReturnUrl=%2Fsearch");
        assert!(markers.contains("portal.example"));
        assert!(markers.contains("account"));
        assert!(markers.contains("login"));
        assert!(markers.contains("returnurl"));
        assert!(markers.contains("https://portal.example/account/login?returnurl=%2fsearch"));
    }

    #[test]
    fn network_classification() {
        assert!(PageError::Timeout("slow".into()).is_network());
        assert!(PageError::HttpStatus(503).is_network());
        assert!(!PageError::HttpStatus(404).is_network());
        assert!(!PageError::ElementNotFound("#q".into()).is_network());
    }
}
