use std::collections::BTreeMap;

use ego_tree::NodeRef;
use scraper::node::Node;
use scraper::ElementRef;

use portal_core::RawNode;

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "iframe"];

/// Detaches an element subtree into a `RawNode`, dropping script-like content.
pub fn raw_node(element: ElementRef<'_>) -> RawNode {
    let value = element.value();
    let attrs: BTreeMap<String, String> = value
        .attrs()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
        .collect();
    let children = element
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|child| !is_skipped(child))
        .map(raw_node)
        .collect();
    RawNode {
        tag: value.name().to_ascii_lowercase(),
        attrs,
        text: visible_text(element),
        children,
    }
}

/// Text content with runs of whitespace collapsed to one space.
pub fn visible_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    for child in element.children() {
        collect_text(child, &mut out);
    }
    collapse_whitespace(&out)
}

fn collect_text(node: NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => {
            out.push_str(text);
        }
        Node::Element(_) => {
            let Some(element) = ElementRef::wrap(node) else {
                return;
            };
            if is_skipped(&element) {
                return;
            }
            // Block boundaries must not glue words together.
            out.push(' ');
            for child in node.children() {
                collect_text(child, out);
            }
            out.push(' ');
        }
        _ => {}
    }
}

fn is_skipped(element: &ElementRef<'_>) -> bool {
    let name = element.value().name();
    SKIPPED_TAGS.iter().any(|tag| tag.eq_ignore_ascii_case(name))
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Selector};

    #[test]
    fn converts_subtree_and_skips_scripts() {
        let html = Html::parse_document(
            r#"<div id="r" class="hit"><h2>Title</h2><script>var x;</script><p>Body   text</p></div>"#,
        );
        let selector = Selector::parse("#r").unwrap();
        let element = html.select(&selector).next().unwrap();
        let node = raw_node(element);

        assert_eq!(node.tag, "div");
        assert_eq!(node.attr("class"), Some("hit"));
        assert_eq!(node.text, "Title Body text");
        let tags: Vec<_> = node.children.iter().map(|c| c.tag.as_str()).collect();
        assert_eq!(tags, vec!["h2", "p"]);
    }
}
