//! Tag-soup fallback for entries the strict reader could not read cleanly.
//!
//! The damaged markup is handed to the HTML5 parser, which never fails and
//! closes whatever was left open. Note that HTML treats `<link>` as a void
//! element, so RSS-style `<link>text</link>` is not recoverable here; Atom
//! `href` links and URL-shaped `<guid>`/`<id>` values are. A `<title>` whose
//! end tag is damaged swallows the rest of its entry as text.

use scraper::{ElementRef, Html};

use crate::fields::{Field, element_name};
use crate::format::SourceFormat;

/// Elements whose children keep their own parent. Anything else nested in an
/// entry is attributed to the entry itself, since broken markup often leaves
/// fields inside an element that was never closed.
const STRUCTURAL: [&str; 4] = ["author", "contributor", "image", "source"];

/// Extract the fields of every entry element in `markup`, in document order.
///
/// Entries nested inside another entry (the usual result of an unclosed
/// entry tag) are reported separately, not merged into their parent.
pub(crate) fn recover_entries(markup: &str, format: SourceFormat) -> Vec<Vec<Field>> {
    let doc = Html::parse_fragment(markup);
    let entry = format.entry_element();

    doc.tree
        .nodes()
        .filter_map(ElementRef::wrap)
        .filter(|el| element_name(el.value().name()) == entry)
        .map(|el| {
            let mut fields = Vec::new();
            collect_fields(el, entry, entry, &mut fields);
            fields
        })
        .collect()
}

fn collect_fields(el: ElementRef<'_>, parent: &str, entry: &str, out: &mut Vec<Field>) {
    for child in el.children() {
        let Some(child_el) = ElementRef::wrap(child) else {
            continue;
        };
        let name = element_name(child_el.value().name());
        if name == entry {
            continue;
        }

        let text: String = child_el
            .children()
            .filter_map(|n| n.value().as_text().map(|t| String::from(&**t)))
            .collect();
        let label = if STRUCTURAL.contains(&name.as_str()) {
            name.clone()
        } else {
            entry.to_string()
        };
        out.push(Field {
            name,
            parent: parent.to_string(),
            attrs: child_el
                .value()
                .attrs()
                .map(|(k, v)| (element_name(k), v.to_string()))
                .collect(),
            text,
        });
        collect_fields(child_el, &label, entry, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(fields: &'a [Field], name: &str) -> Option<&'a Field> {
        fields.iter().find(|f| f.name == name)
    }

    #[test]
    fn bare_ampersand_survives_as_text() {
        let markup = "<item><title>Tom & Jerry</title><guid>http://x/tom</guid></item>";
        let entries = recover_entries(markup, SourceFormat::Rss);
        assert_eq!(entries.len(), 1);
        assert_eq!(find(&entries[0], "title").map(|f| f.text.as_str()), Some("Tom & Jerry"));
        assert_eq!(find(&entries[0], "guid").map(|f| f.text.as_str()), Some("http://x/tom"));
    }

    #[test]
    fn unclosed_entries_are_split() {
        let markup = r#"<entry><title>A</title><link href="http://x/a"/>
            <entry><title>B</title><link href="http://x/b"/></entry>"#;
        let entries = recover_entries(markup, SourceFormat::Atom);
        assert_eq!(entries.len(), 2);
        let titles: Vec<_> = entries
            .iter()
            .filter_map(|fields| find(fields, "title").map(|f| f.text.clone()))
            .collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[test]
    fn fields_in_unclosed_elements_belong_to_the_entry() {
        let markup = r#"<entry><summary>x</sumary><link href="http://x/a"/>
            <author><name>Alice</name></author></entry>"#;
        let entries = recover_entries(markup, SourceFormat::Atom);
        let link = find(&entries[0], "link").expect("link");
        assert_eq!(link.parent, "entry");
        let name = find(&entries[0], "name").expect("name");
        assert_eq!(name.parent, "author");
    }

    #[test]
    fn sitemap_urls_recovered() {
        let markup = "<url><loc>http://x/a</loc><lastmod>2024-01-01</lastmod><url><loc>http://x/b";
        let entries = recover_entries(markup, SourceFormat::Sitemap);
        assert_eq!(entries.len(), 2);
        assert_eq!(find(&entries[1], "loc").map(|f| f.text.as_str()), Some("http://x/b"));
    }
}
