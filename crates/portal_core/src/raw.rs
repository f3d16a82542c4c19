use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One extracted DOM element, detached from any document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawNode {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    /// Whitespace-collapsed text of the whole subtree.
    pub text: String,
    pub children: Vec<RawNode>,
}

impl RawNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: RawNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag.eq_ignore_ascii_case(tag)
    }

    /// Depth-first descendants (not including `self`) with the given tag.
    pub fn descendants<'a>(&'a self, tag: &'a str) -> Vec<&'a RawNode> {
        let mut found = Vec::new();
        collect(self, tag, &mut found);
        found
    }
}

fn collect<'a>(node: &'a RawNode, tag: &str, found: &mut Vec<&'a RawNode>) {
    for child in &node.children {
        if child.is(tag) {
            found.push(child);
        }
        collect(child, tag, found);
    }
}

/// Everything the query executor captured from one result page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawPage {
    pub source_url: String,
    pub nodes: Vec<RawNode>,
    pub page_text: String,
    /// Set when the page reported an empty result set.
    pub empty: bool,
}
