//! Mapping from the child elements of one entry to a [`RawEntry`].
//!
//! Both the strict reader and the tag-soup fallback flatten an entry into a
//! list of [`Field`]s, so a recovered entry goes through exactly the same
//! mapping as a well-formed one.

use wikiactivity_shared::{Extra, RawEntry};

use crate::format::SourceFormat;
use crate::xml::attr;

/// One element found inside an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Field {
    /// Local name, lowercased, without namespace prefix.
    pub name: String,
    /// Local name of the enclosing element.
    pub parent: String,
    pub attrs: Vec<(String, String)>,
    /// Concatenated direct text content.
    pub text: String,
}

impl Field {
    fn text(&self) -> Option<&str> {
        let t = self.text.trim();
        (!t.is_empty()).then_some(t)
    }
}

/// Normalize an element name the way both parsers see it.
pub(crate) fn element_name(raw: &str) -> String {
    raw.rsplit(':').next().unwrap_or(raw).to_ascii_lowercase()
}

/// What an entry turned into.
#[derive(Debug)]
pub(crate) enum Built {
    Page(RawEntry),
    /// A `<sitemap>` entry of a sitemap index.
    Nested(String),
}

const TIMESTAMP_FIELDS: [&str; 6] = ["pubdate", "date", "updated", "published", "modified", "issued"];
const SUMMARY_FIELDS: [&str; 4] = ["description", "summary", "encoded", "content"];

/// Map the fields of one entry. `Err` carries the reason it was unusable.
pub(crate) fn build(
    format: SourceFormat,
    site_id: &str,
    fields: &[Field],
) -> std::result::Result<Built, String> {
    match format {
        SourceFormat::Rss | SourceFormat::Atom => build_feed_entry(format, site_id, fields),
        SourceFormat::Sitemap => build_url_entry(site_id, fields),
        SourceFormat::SitemapIndex => {
            child_text(fields, "sitemap", "loc")
                .map(|loc| Built::Nested(loc.to_string()))
                .ok_or_else(|| "sitemap index entry has no <loc>".to_string())
        }
    }
}

fn child<'a>(fields: &'a [Field], parent: &str, name: &str) -> Option<&'a Field> {
    fields
        .iter()
        .find(|f| f.name == name && f.parent == parent && f.text().is_some())
}

fn child_text<'a>(fields: &'a [Field], parent: &str, name: &str) -> Option<&'a str> {
    child(fields, parent, name).and_then(Field::text)
}

fn build_feed_entry(
    format: SourceFormat,
    site_id: &str,
    fields: &[Field],
) -> std::result::Result<Built, String> {
    let root = format.entry_element();

    let guid = child_text(fields, root, "guid").or_else(|| child_text(fields, root, "id"));
    let link = alternate_link(fields, root)
        .or_else(|| child_text(fields, root, "link"))
        .or_else(|| guid.filter(|g| g.starts_with("http://") || g.starts_with("https://")))
        .ok_or_else(|| format!("<{root}> has no link"))?;

    let raw_title = child_text(fields, root, "title").map(str::to_string);
    let raw_timestamp = TIMESTAMP_FIELDS
        .iter()
        .find_map(|name| child_text(fields, root, name))
        .map(str::to_string);

    let mut extra = Extra::new();
    if let Some(guid) = guid {
        extra.insert("guid".into(), guid.to_string());
    }
    if let Some(summary) = SUMMARY_FIELDS
        .iter()
        .find_map(|name| child_text(fields, root, name))
    {
        extra.insert("summary".into(), summary.to_string());
    }
    let author = child_text(fields, root, "creator")
        .or_else(|| child_text(fields, root, "authorname"))
        .or_else(|| child_text(fields, "author", "name"))
        .or_else(|| child_text(fields, root, "author"));
    if let Some(author) = author {
        extra.insert("author".into(), author.to_string());
    }

    Ok(Built::Page(RawEntry {
        source_kind: format.source_kind(),
        site_id: site_id.to_string(),
        raw_url: link.to_string(),
        raw_title,
        raw_timestamp,
        raw_extra: extra,
    }))
}

/// Atom `<link href>` with no `rel` or `rel="alternate"`.
fn alternate_link<'a>(fields: &'a [Field], root: &str) -> Option<&'a str> {
    fields
        .iter()
        .filter(|f| f.name == "link" && f.parent == root)
        .filter(|f| matches!(attr(&f.attrs, "rel"), None | Some("alternate")))
        .find_map(|f| attr(&f.attrs, "href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
}

fn build_url_entry(site_id: &str, fields: &[Field]) -> std::result::Result<Built, String> {
    let loc = child_text(fields, "url", "loc").ok_or("sitemap <url> has no <loc>")?;

    let mut extra = Extra::new();
    for name in ["changefreq", "priority"] {
        if let Some(value) = child_text(fields, "url", name) {
            extra.insert(name.into(), value.to_string());
        }
    }

    Ok(Built::Page(RawEntry {
        source_kind: SourceFormat::Sitemap.source_kind(),
        site_id: site_id.to_string(),
        raw_url: loc.to_string(),
        raw_title: None,
        raw_timestamp: child_text(fields, "url", "lastmod").map(str::to_string),
        raw_extra: extra,
    }))
}
