//! Raw DOM records to `QueryResult`.
//!
//! Classification per extracted node, first match wins:
//! tables, labeled sections, downloadable anchors. Containers that match none
//! of these are searched recursively; whatever is still unclassified feeds the
//! raw-text fallback. The output depends only on the inputs.

use std::collections::BTreeSet;

use url::Url;

use crate::descriptor::PluginDescriptor;
use crate::query::{FormatHint, QueryRequest};
use crate::raw::{RawNode, RawPage};
use crate::result::{QueryResult, Record, ResultKind};

const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6", "legend", "dt", "caption"];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "rtf", "csv", "txt", "xml",
    "json", "zip",
];

const DOWNLOAD_URL_MARKERS: &[&str] = &["download", "detail", "attachment"];

pub fn normalize(descriptor: &PluginDescriptor, request: &QueryRequest, page: &RawPage) -> QueryResult {
    let name = descriptor.display_name().to_string();
    let max_chars = descriptor.extraction.max_text_chars;

    if page.empty {
        return no_results(descriptor, request, page);
    }

    let mut classifier = Classifier {
        base: Url::parse(&page.source_url).ok(),
        source_url: &page.source_url,
        max_rows: descriptor.extraction.max_rows,
        max_chars,
        records: Vec::new(),
        seen_documents: BTreeSet::new(),
        leftovers: Vec::new(),
    };
    for node in &page.nodes {
        classifier.classify(node);
    }
    let Classifier {
        records: structured,
        leftovers,
        ..
    } = classifier;

    let leftover_text = leftovers.join("\n").trim().to_string();
    let fallback_source = if leftover_text.is_empty() {
        page.page_text.trim().to_string()
    } else {
        leftover_text
    };
    // Nodes without any text and a blank page carry nothing worth a raw record.
    if structured.is_empty() && fallback_source.is_empty() {
        return no_results(descriptor, request, page);
    }

    let kind = if structured.is_empty() {
        ResultKind::ExtractionFailed
    } else {
        ResultKind::Structured
    };

    let mut records = match request.format() {
        FormatHint::RawText => vec![raw_text_record(&page.page_text, max_chars)],
        _ if structured.is_empty() => vec![raw_text_record(&fallback_source, max_chars)],
        hint => filter_by_hint(structured, hint),
    };

    if let Some(limit) = request.limit() {
        records.truncate(limit.max(1));
    }

    let summary = format!(
        "Retrieved {} results from {name} for query: {}",
        records.len(),
        request.query()
    );

    QueryResult {
        plugin_id: descriptor.id.clone(),
        source_name: name,
        source_url: page.source_url.clone(),
        query: request.query().to_string(),
        kind,
        records,
        summary,
    }
}

fn filter_by_hint(records: Vec<Record>, hint: FormatHint) -> Vec<Record> {
    let wanted = match hint {
        FormatHint::Tables => "table",
        FormatHint::Content => "content",
        FormatHint::Documents => "document",
        FormatHint::Auto | FormatHint::RawText => return records,
    };
    if records.iter().any(|record| record.kind_name() == wanted) {
        records
            .into_iter()
            .filter(|record| record.kind_name() == wanted)
            .collect()
    } else {
        records
    }
}

fn no_results(descriptor: &PluginDescriptor, request: &QueryRequest, page: &RawPage) -> QueryResult {
    let name = descriptor.display_name();
    QueryResult {
        plugin_id: descriptor.id.clone(),
        source_name: name.to_string(),
        source_url: page.source_url.clone(),
        query: request.query().to_string(),
        kind: ResultKind::NoResults,
        records: vec![Record::NoResults {
            message: format!("No results found for '{}'", request.query()),
        }],
        summary: format!("No results from {name} for query: {}", request.query()),
    }
}

fn raw_text_record(text: &str, max_chars: usize) -> Record {
    let (text, truncated) = truncate_chars(text, max_chars);
    Record::RawText { text, truncated }
}

/// Cuts `text` to `max` characters, appending `...` when anything was dropped.
pub fn truncate_chars(text: &str, max: usize) -> (String, bool) {
    if text.chars().count() <= max {
        return (text.to_string(), false);
    }
    let mut cut: String = text.chars().take(max).collect();
    cut.push_str("...");
    (cut, true)
}

struct Classifier<'a> {
    base: Option<Url>,
    source_url: &'a str,
    max_rows: Option<usize>,
    max_chars: usize,
    records: Vec<Record>,
    seen_documents: BTreeSet<String>,
    leftovers: Vec<String>,
}

impl Classifier<'_> {
    /// Returns true when the node or anything below it produced a record.
    fn classify(&mut self, node: &RawNode) -> bool {
        if node.is("table") {
            if let Some(table) = self.table(node) {
                self.push(table);
                self.nested_documents(node);
                return true;
            }
        } else if node.is("a") {
            if let Some(document) = self.document(node) {
                self.push(document);
                return true;
            }
        } else if let Some(content) = self.content(node) {
            self.push(content);
            self.nested_documents(node);
            return true;
        }

        if node.children.is_empty() {
            self.leftover(&node.text);
            return false;
        }

        let leftovers_before = self.leftovers.len();
        let mut any = false;
        for child in &node.children {
            any |= self.classify(child);
        }
        if !any {
            // Keep the container's own text intact rather than its fragments.
            self.leftovers.truncate(leftovers_before);
            self.leftover(&node.text);
        }
        any
    }

    fn push(&mut self, record: Record) {
        if !self.records.contains(&record) {
            self.records.push(record);
        }
    }

    fn leftover(&mut self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            self.leftovers.push(text.to_string());
        }
    }

    fn nested_documents(&mut self, node: &RawNode) {
        for anchor in node.descendants("a") {
            if let Some(document) = self.document(anchor) {
                self.push(document);
            }
        }
    }

    fn table(&self, node: &RawNode) -> Option<Record> {
        let mut head_rows = Vec::new();
        let mut body_rows = Vec::new();
        collect_rows(node, false, &mut head_rows, &mut body_rows);

        let mut headers = head_rows.into_iter().next().map(cell_texts);
        let mut rows: Vec<Vec<String>> = Vec::new();
        for (index, row) in body_rows.into_iter().enumerate() {
            if index == 0 && headers.is_none() && is_header_row(row) {
                headers = Some(cell_texts(row));
                continue;
            }
            let cells = cell_texts(row);
            if !cells.is_empty() {
                rows.push(cells);
            }
        }
        if let Some(max) = self.max_rows {
            rows.truncate(max);
        }
        if rows.is_empty() && headers.is_none() {
            return None;
        }
        Some(Record::Table { headers, rows })
    }

    fn content(&self, node: &RawNode) -> Option<Record> {
        if !node.descendants("table").is_empty() {
            return None;
        }
        let title = heading_text(node)
            .or_else(|| node.attr("title").map(str::to_string))
            .or_else(|| node.attr("aria-label").map(str::to_string))?;
        let title = title.trim().to_string();
        if title.is_empty() {
            return None;
        }
        let text = node.text.trim();
        let body = text
            .strip_prefix(title.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| text.replacen(title.as_str(), "", 1));
        let body = body.trim();
        if body.is_empty() {
            return None;
        }
        let (body, _) = truncate_chars(body, self.max_chars);
        Some(Record::Content {
            title,
            body,
            source_url: self.source_url.to_string(),
        })
    }

    fn document(&mut self, node: &RawNode) -> Option<Record> {
        let href = node.attr("href")?;
        let url = resolve_url(href, self.base.as_ref())?;
        if !matches!(url.scheme(), "http" | "https" | "file" | "ftp") {
            return None;
        }
        if !(node.attrs.contains_key("download") || looks_downloadable(&url)) {
            return None;
        }
        let url_text = url.to_string();
        if !self.seen_documents.insert(url_text.clone()) {
            return None;
        }
        let label = [node.text.trim(), node.attr("title").unwrap_or("").trim()]
            .into_iter()
            .find(|candidate| !candidate.is_empty())
            .map(str::to_string)
            .or_else(|| last_segment(&url))
            .unwrap_or_else(|| url_text.clone());
        let mime_hint = node
            .attr("type")
            .map(str::to_string)
            .or_else(|| guess_mime(&url));
        Some(Record::Document {
            label,
            url: url_text,
            mime_hint,
        })
    }
}

fn collect_rows<'a>(
    node: &'a RawNode,
    in_head: bool,
    head_rows: &mut Vec<&'a RawNode>,
    body_rows: &mut Vec<&'a RawNode>,
) {
    for child in &node.children {
        if child.is("table") {
            continue;
        }
        if child.is("tr") {
            if in_head {
                head_rows.push(child);
            } else {
                body_rows.push(child);
            }
        } else {
            collect_rows(child, in_head || child.is("thead"), head_rows, body_rows);
        }
    }
}

fn is_cell(node: &RawNode) -> bool {
    node.is("td") || node.is("th")
}

fn is_header_row(row: &RawNode) -> bool {
    let mut cells = row.children.iter().filter(|child| is_cell(child)).peekable();
    cells.peek().is_some() && cells.all(|cell| cell.is("th"))
}

fn cell_texts(row: &RawNode) -> Vec<String> {
    row.children
        .iter()
        .filter(|child| is_cell(child))
        .map(|cell| cell.text.trim().to_string())
        .collect()
}

fn heading_text(node: &RawNode) -> Option<String> {
    for child in &node.children {
        if child.is("table") || child.is("a") {
            continue;
        }
        if HEADING_TAGS.iter().any(|tag| child.is(tag)) {
            let text = child.text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
        if let Some(found) = heading_text(child) {
            return Some(found);
        }
    }
    None
}

fn resolve_url(reference: &str, base: Option<&Url>) -> Option<Url> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with('#') || lower.starts_with("javascript:") || lower.starts_with("mailto:") {
        return None;
    }
    if let Ok(url) = Url::parse(trimmed) {
        return Some(url);
    }
    base.and_then(|base| base.join(trimmed).ok())
}

fn extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

fn looks_downloadable(url: &Url) -> bool {
    if extension(url).is_some_and(|ext| DOCUMENT_EXTENSIONS.contains(&ext.as_str())) {
        return true;
    }
    let lower = url.as_str().to_ascii_lowercase();
    DOWNLOAD_URL_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn guess_mime(url: &Url) -> Option<String> {
    extension(url)?;
    mime_guess::from_path(url.path())
        .first_raw()
        .map(str::to_string)
}

fn last_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(str::to_string)
}
