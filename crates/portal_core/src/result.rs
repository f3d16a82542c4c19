use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Table {
        headers: Option<Vec<String>>,
        rows: Vec<Vec<String>>,
    },
    Content {
        title: String,
        body: String,
        source_url: String,
    },
    Document {
        label: String,
        url: String,
        mime_hint: Option<String>,
    },
    /// Fallback holding unclassified page text.
    RawText { text: String, truncated: bool },
    /// The portal answered, but with an empty result set.
    NoResults { message: String },
}

impl Record {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Record::Table { .. } => "table",
            Record::Content { .. } => "content",
            Record::Document { .. } => "document",
            Record::RawText { .. } => "raw_text",
            Record::NoResults { .. } => "no_results",
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            Record::Table { .. } | Record::Content { .. } | Record::Document { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Structured,
    NoResults,
    /// Page captured but nothing classifiable; only the raw-text fallback is present.
    ExtractionFailed,
}

/// Normalized answer to one query. `records` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub plugin_id: String,
    pub source_name: String,
    pub source_url: String,
    pub query: String,
    pub kind: ResultKind,
    pub records: Vec<Record>,
    pub summary: String,
}

impl QueryResult {
    pub fn count(&self, kind_name: &str) -> usize {
        self.records
            .iter()
            .filter(|record| record.kind_name() == kind_name)
            .count()
    }
}
