use serde::{Deserialize, Serialize};

use crate::error::PortalError;

pub const MAX_QUERY_CHARS: usize = 1000;

/// Which record kind the caller prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FormatHint {
    #[default]
    Auto,
    Tables,
    Content,
    Documents,
    RawText,
}

/// A validated query against one plugin. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    plugin_id: String,
    query: String,
    format: FormatHint,
    limit: Option<usize>,
}

impl QueryRequest {
    pub fn new(plugin_id: impl Into<String>, query: &str) -> Result<Self, PortalError> {
        let plugin_id = plugin_id.into();
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(PortalError::InvalidQuery {
                plugin_id,
                reason: "query cannot be empty".to_string(),
            });
        }
        if trimmed.chars().count() > MAX_QUERY_CHARS {
            return Err(PortalError::InvalidQuery {
                plugin_id,
                reason: format!("query exceeds {MAX_QUERY_CHARS} characters"),
            });
        }
        Ok(Self {
            plugin_id,
            query: trimmed.to_string(),
            format: FormatHint::Auto,
            limit: None,
        })
    }

    pub fn with_format(mut self, format: FormatHint) -> Self {
        self.format = format;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn format(&self) -> FormatHint {
        self.format
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_trimmed_and_bounded() {
        let request = QueryRequest::new("siteA", "  contracts  ").unwrap();
        assert_eq!(request.query(), "contracts");

        assert!(matches!(
            QueryRequest::new("siteA", "   "),
            Err(PortalError::InvalidQuery { .. })
        ));
        let long = "x".repeat(MAX_QUERY_CHARS + 1);
        assert!(matches!(
            QueryRequest::new("siteA", &long),
            Err(PortalError::InvalidQuery { .. })
        ));
        assert!(QueryRequest::new("siteA", &"x".repeat(MAX_QUERY_CHARS)).is_ok());
    }
}
