//! Title cleanup and feed metadata extraction.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html};

/// Unescape HTML entities, drop markup and collapse whitespace.
///
/// Returns `None` when nothing but whitespace remains.
pub fn clean_title(raw: &str) -> Option<String> {
    let text = if raw.contains('&') || raw.contains('<') {
        let fragment = Html::parse_fragment(raw);
        fragment.root_element().text().collect::<String>()
    } else {
        raw.to_string()
    };
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Split a Wikidot recent-changes title, `"Page Title" - new revision`,
/// into the page title and the change description.
pub fn split_change_title(title: &str) -> Option<(String, String)> {
    static CHANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"^"(?P<title>.*)" - (?P<action>[^"]+)$"#).expect("valid regex")
    });
    let caps = CHANGE_RE.captures(title)?;
    let page_title = caps["title"].trim().to_string();
    let action = caps["action"].trim().to_string();
    (!page_title.is_empty()).then_some((page_title, action))
}

/// Revision number from a Wikidot change link (`...#revision-2311`).
pub fn revision_id(link: &str) -> Option<String> {
    static REVISION_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"#revision-(\d+)$").expect("valid regex"));
    REVISION_RE
        .captures(link.trim())
        .map(|caps| caps[1].to_string())
}

/// Author name from the `span.printuser` in a Wikidot change summary.
///
/// Anonymous edits carry the editor's IP in a nested `span.ip`, which is left
/// out of the name.
pub fn printuser_name(summary_html: &str) -> Option<String> {
    if !summary_html.contains("printuser") {
        return None;
    }
    let fragment = Html::parse_fragment(summary_html);
    let printuser = fragment
        .tree
        .nodes()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "span" && has_class(el, "printuser"))?;

    let mut name = String::new();
    collect_text_skipping_ip(printuser, &mut name);
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    (!name.is_empty()).then_some(name)
}

fn has_class(el: &ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn collect_text_skipping_ip(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            if !has_class(&child_el, "ip") {
                collect_text_skipping_ip(child_el, out);
            }
        }
    }
}
