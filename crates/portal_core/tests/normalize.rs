use portal_core::{
    normalize, AuthScenario, ExtractionRules, FormatHint, PluginDescriptor, QueryAction,
    QueryRequest, RateLimit, RawNode, RawPage, Record, ResultKind,
};
use pretty_assertions::assert_eq;

fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        id: "siteA".into(),
        name: "Site A".into(),
        version: "1.0.0".into(),
        description: String::new(),
        category: "legal".into(),
        tags: Vec::new(),
        base_url: "https://portal.example".into(),
        login_url: "https://portal.example/login".into(),
        query_url: "https://portal.example/search?q={query}".into(),
        credential_fields: vec!["username".into(), "password".into()],
        session_ttl_secs: 3600,
        rate_limit: RateLimit::default(),
        enabled: true,
        auth: AuthScenario::None,
        query: QueryAction::UrlTemplate,
        extraction: ExtractionRules::default(),
        logged_out: Vec::new(),
        max_concurrent_queries: 1,
    }
}

fn cell(tag: &str, text: &str) -> RawNode {
    RawNode::new(tag).with_text(text)
}

fn results_table() -> RawNode {
    RawNode::new("table")
        .with_text("Case Date C-1 2024-01-02 C-2 2024-02-03")
        .with_child(
            RawNode::new("thead").with_child(
                RawNode::new("tr")
                    .with_child(cell("th", "Case"))
                    .with_child(cell("th", "Date")),
            ),
        )
        .with_child(
            RawNode::new("tbody")
                .with_child(
                    RawNode::new("tr")
                        .with_child(cell("td", "C-1"))
                        .with_child(cell("td", "2024-01-02")),
                )
                .with_child(
                    RawNode::new("tr")
                        .with_child(cell("td", "C-2"))
                        .with_child(
                            RawNode::new("td").with_text("2024-02-03").with_child(
                                RawNode::new("a")
                                    .with_attr("href", "/files/c2.pdf")
                                    .with_text("2024-02-03"),
                            ),
                        ),
                ),
        )
}

fn page(nodes: Vec<RawNode>) -> RawPage {
    RawPage {
        source_url: "https://portal.example/search?q=test".into(),
        nodes,
        page_text: "Case Date C-1 2024-01-02 C-2 2024-02-03".into(),
        empty: false,
    }
}

fn request() -> QueryRequest {
    QueryRequest::new("siteA", "test").unwrap()
}

#[test]
fn classifies_tables_content_and_documents_in_order() {
    let section = RawNode::new("section")
        .with_text("Summary The court ruled in favour.")
        .with_child(cell("h2", "Summary"))
        .with_child(cell("p", "The court ruled in favour."));
    let download = RawNode::new("a")
        .with_attr("href", "/download?id=7")
        .with_attr("download", "")
        .with_text("Full judgment");
    let plain_link = RawNode::new("a")
        .with_attr("href", "/about")
        .with_text("About us");

    let result = normalize(
        &descriptor(),
        &request(),
        &page(vec![results_table(), section, download, plain_link]),
    );

    assert_eq!(result.kind, ResultKind::Structured);
    assert_eq!(
        result.records,
        vec![
            Record::Table {
                headers: Some(vec!["Case".into(), "Date".into()]),
                rows: vec![
                    vec!["C-1".into(), "2024-01-02".into()],
                    vec!["C-2".into(), "2024-02-03".into()],
                ],
            },
            Record::Document {
                label: "2024-02-03".into(),
                url: "https://portal.example/files/c2.pdf".into(),
                mime_hint: Some("application/pdf".into()),
            },
            Record::Content {
                title: "Summary".into(),
                body: "The court ruled in favour.".into(),
                source_url: "https://portal.example/search?q=test".into(),
            },
            Record::Document {
                label: "Full judgment".into(),
                url: "https://portal.example/download?id=7".into(),
                mime_hint: None,
            },
        ]
    );
    assert_eq!(
        result.summary,
        "Retrieved 4 results from Site A for query: test"
    );
}

#[test]
fn first_row_of_th_cells_becomes_headers() {
    let table = RawNode::new("table").with_child(
        RawNode::new("tbody")
            .with_child(
                RawNode::new("tr")
                    .with_child(cell("th", "Name"))
                    .with_child(cell("th", "Value")),
            )
            .with_child(
                RawNode::new("tr")
                    .with_child(cell("td", "a"))
                    .with_child(cell("td", "1")),
            ),
    );
    let result = normalize(&descriptor(), &request(), &page(vec![table]));
    assert_eq!(
        result.records,
        vec![Record::Table {
            headers: Some(vec!["Name".into(), "Value".into()]),
            rows: vec![vec!["a".into(), "1".into()]],
        }]
    );
}

#[test]
fn max_rows_caps_table_rows() {
    let mut descriptor = descriptor();
    descriptor.extraction.max_rows = Some(1);
    let result = normalize(&descriptor, &request(), &page(vec![results_table()]));
    match &result.records[0] {
        Record::Table { rows, .. } => assert_eq!(rows.len(), 1),
        other => panic!("expected a table, got {other:?}"),
    }
}

#[test]
fn duplicate_document_urls_are_dropped() {
    let link = RawNode::new("a")
        .with_attr("href", "https://portal.example/detail/1")
        .with_text("Record 1");
    let result = normalize(
        &descriptor(),
        &request(),
        &page(vec![link.clone(), link]),
    );
    assert_eq!(result.records.len(), 1);
}

#[test]
fn unclassified_nodes_fall_back_to_raw_text() {
    let div = RawNode::new("div")
        .with_text("Only some loose text")
        .with_child(cell("span", "Only some"))
        .with_child(cell("span", "loose text"));
    let result = normalize(&descriptor(), &request(), &page(vec![div]));

    assert_eq!(result.kind, ResultKind::ExtractionFailed);
    assert_eq!(
        result.records,
        vec![Record::RawText {
            text: "Only some loose text".into(),
            truncated: false,
        }]
    );
}

#[test]
fn textless_nodes_on_a_blank_page_report_no_results() {
    let mut raw = page(vec![
        RawNode::new("div").with_child(RawNode::new("span")),
        RawNode::new("p"),
    ]);
    raw.page_text = "  \n".into();
    let result = normalize(&descriptor(), &request(), &raw);

    assert_eq!(result.kind, ResultKind::NoResults);
    assert_eq!(
        result.records,
        vec![Record::NoResults {
            message: "No results found for 'test'".into(),
        }]
    );
}

#[test]
fn textless_nodes_fall_back_to_the_page_text() {
    let mut raw = page(vec![RawNode::new("div")]);
    raw.page_text = "Service notice: try again later".into();
    let result = normalize(&descriptor(), &request(), &raw);

    assert_eq!(result.kind, ResultKind::ExtractionFailed);
    assert_eq!(
        result.records,
        vec![Record::RawText {
            text: "Service notice: try again later".into(),
            truncated: false,
        }]
    );
}

#[test]
fn raw_text_is_truncated_with_ellipsis() {
    let mut descriptor = descriptor();
    descriptor.extraction.max_text_chars = 5;
    let mut raw = page(Vec::new());
    raw.page_text = "abcdefghij".into();

    let result = normalize(&descriptor, &request(), &raw);
    assert_eq!(
        result.records,
        vec![Record::RawText {
            text: "abcde...".into(),
            truncated: true,
        }]
    );
}

#[test]
fn empty_page_yields_explicit_no_results_marker() {
    let mut raw = page(Vec::new());
    raw.empty = true;
    let result = normalize(&descriptor(), &request(), &raw);

    assert_eq!(result.kind, ResultKind::NoResults);
    assert_eq!(
        result.records,
        vec![Record::NoResults {
            message: "No results found for 'test'".into(),
        }]
    );
}

#[test]
fn format_hint_filters_and_limit_caps() {
    let link = RawNode::new("a")
        .with_attr("href", "/files/a.pdf")
        .with_text("A");
    let nodes = vec![results_table(), link];

    let documents_only = normalize(
        &descriptor(),
        &request().with_format(FormatHint::Documents),
        &page(nodes.clone()),
    );
    assert!(documents_only
        .records
        .iter()
        .all(|record| matches!(record, Record::Document { .. })));
    assert_eq!(documents_only.records.len(), 2);

    let capped = normalize(&descriptor(), &request().with_limit(0), &page(nodes.clone()));
    assert_eq!(capped.records.len(), 1);

    let raw_only = normalize(
        &descriptor(),
        &request().with_format(FormatHint::RawText),
        &page(nodes),
    );
    assert!(matches!(raw_only.records[..], [Record::RawText { .. }]));
}

#[test]
fn normalization_is_deterministic() {
    let nodes = vec![
        results_table(),
        RawNode::new("a")
            .with_attr("href", "/files/a.pdf")
            .with_text("A"),
        RawNode::new("div").with_text("tail"),
    ];
    let raw = page(nodes);
    let first = serde_json::to_string(&normalize(&descriptor(), &request(), &raw)).unwrap();
    for _ in 0..5 {
        let again = serde_json::to_string(&normalize(&descriptor(), &request(), &raw)).unwrap();
        assert_eq!(first, again);
    }
}
