//! Entry normalization: raw feed/sitemap records to canonical page observations.
//!
//! This crate provides:
//! - [`normalize`]: the full [`RawEntry`] to [`NormalizedEntry`] transform
//! - [`slug::page_slug`]: URL canonicalization with the cross-site guard
//! - [`timestamp::parse_timestamp`]: multi-format timestamp parsing
//! - [`title`]: title cleanup and Wikidot change metadata

pub mod slug;
pub mod timestamp;
pub mod title;

use chrono::{DateTime, Utc};
use tracing::debug;
use wikiactivity_shared::{
    NormalizedEntry, RawEntry, Site, SourceKind, WikiActivityError, page_namespace,
};

pub use slug::page_slug;
pub use timestamp::parse_timestamp;

/// Extra key marking a timestamp substituted with the fetch time.
pub const APPROXIMATE_KEY: &str = "timestamp";
pub const APPROXIMATE_VALUE: &str = "approximate";

/// Why an entry could not be attributed to a page of its site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{url} is on host {host}, not the site host {expected}")]
    ForeignHost {
        url: String,
        host: String,
        expected: String,
    },

    #[error("{url} is outside the site base path {base}")]
    OutsideBase { url: String, base: String },

    #[error("{url} does not name a page")]
    EmptySlug { url: String },

    #[error("entry for site {entry_site} handed to site {site}")]
    SiteMismatch { entry_site: String, site: String },
}

impl NormalizationError {
    pub fn url(&self) -> &str {
        match self {
            Self::InvalidUrl { url, .. }
            | Self::ForeignHost { url, .. }
            | Self::OutsideBase { url, .. }
            | Self::EmptySlug { url } => url,
            Self::SiteMismatch { entry_site, .. } => entry_site,
        }
    }
}

impl From<NormalizationError> for WikiActivityError {
    fn from(err: NormalizationError) -> Self {
        WikiActivityError::Normalization {
            url: err.url().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Canonicalize one raw entry of `site`.
///
/// `fetched_at` is when the payload was retrieved; it stands in for a missing
/// or unparseable timestamp, in which case the entry is flagged approximate.
/// Only the URL can make normalization fail.
pub fn normalize(
    raw: RawEntry,
    site: &Site,
    fetched_at: DateTime<Utc>,
) -> Result<NormalizedEntry, NormalizationError> {
    if raw.site_id != site.site_id {
        return Err(NormalizationError::SiteMismatch {
            entry_site: raw.site_id,
            site: site.site_id.clone(),
        });
    }

    let page_slug = page_slug(&raw.raw_url, site)?;
    let mut extra = raw.raw_extra;

    let parsed = raw.raw_timestamp.as_deref().and_then(parse_timestamp);
    let (last_seen_at, timestamp_approximate) = match parsed {
        Some(ts) => (ts, false),
        None => {
            if let Some(unparsed) = raw.raw_timestamp {
                debug!(site = %site.site_id, slug = %page_slug, raw = %unparsed, "unparseable timestamp");
                extra.insert("raw_timestamp".into(), unparsed);
            }
            extra.insert(APPROXIMATE_KEY.into(), APPROXIMATE_VALUE.into());
            (fetched_at, true)
        }
    };

    let mut title = None;
    if raw.source_kind.carries_title() {
        title = raw.raw_title.as_deref().and_then(title::clean_title);
        if let Some((page_title, action)) = title.as_deref().and_then(title::split_change_title) {
            extra.insert("action".into(), action);
            title = Some(page_title);
        }
    }

    if raw.source_kind == SourceKind::Feed {
        let revision = extra
            .get("guid")
            .and_then(|g| title::revision_id(g))
            .or_else(|| title::revision_id(&raw.raw_url));
        if let Some(revision) = revision {
            extra.insert("revision_id".into(), revision);
        }
        if !extra.contains_key("author") {
            if let Some(author) = extra.get("summary").and_then(|s| title::printuser_name(s)) {
                extra.insert("author".into(), author);
            }
        }
    }

    Ok(NormalizedEntry {
        site_id: raw.site_id,
        namespace: page_namespace(&page_slug).map(str::to_string),
        page_slug,
        title,
        last_seen_at,
        source_kind: raw.source_kind,
        timestamp_approximate,
        extra,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use url::Url;
    use wikiactivity_shared::Extra;

    use super::*;

    fn site(site_id: &str, base: &str) -> Site {
        let base_url = Url::parse(base).expect("base url");
        Site {
            site_id: site_id.into(),
            name: None,
            language_code: "en".into(),
            feed_url: base_url.join("feed/site-changes.xml").expect("feed"),
            sitemap_url: base_url.join("sitemap.xml").expect("sitemap"),
            base_url,
        }
    }

    fn raw(kind: SourceKind, url: &str, title: Option<&str>, ts: Option<&str>) -> RawEntry {
        RawEntry {
            source_kind: kind,
            site_id: "scp-wiki".into(),
            raw_url: url.into(),
            raw_title: title.map(str::to_string),
            raw_timestamp: ts.map(str::to_string),
            raw_extra: Extra::new(),
        }
    }

    fn fetched() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).single().expect("date")
    }

    #[test]
    fn sitemap_entry_without_lastmod_is_approximate() {
        let site = site("scp-wiki", "http://scp-wiki.wikidot.com/");
        let entry = normalize(
            raw(SourceKind::Sitemap, "http://scp-wiki.wikidot.com/p/1", None, None),
            &site,
            fetched(),
        )
        .expect("normalize");
        assert_eq!(entry.page_slug, "p/1");
        assert_eq!(entry.last_seen_at, fetched());
        assert!(entry.timestamp_approximate);
        assert_eq!(entry.extra[APPROXIMATE_KEY], APPROXIMATE_VALUE);
        assert_eq!(entry.title, None);
    }

    #[test]
    fn bad_timestamp_never_fails_normalization() {
        let site = site("scp-wiki", "http://scp-wiki.wikidot.com/");
        let entry = normalize(
            raw(SourceKind::Feed, "/scp-173", Some("SCP-173"), Some("last tuesday")),
            &site,
            fetched(),
        )
        .expect("normalize");
        assert!(entry.timestamp_approximate);
        assert_eq!(entry.extra["raw_timestamp"], "last tuesday");
    }

    #[test]
    fn wikidot_change_item() {
        let site = site("scp-wiki", "http://scp-wiki.wikidot.com/");
        let mut entry = raw(
            SourceKind::Feed,
            "http://scp-wiki.wikidot.com/component:theme",
            Some("&quot;Theme  Component&quot; - new revision"),
            Some("Fri, 05 Jan 2024 10:00:00 +0000"),
        );
        entry.raw_extra.insert(
            "guid".into(),
            "http://scp-wiki.wikidot.com/component:theme#revision-42".into(),
        );
        entry.raw_extra.insert(
            "summary".into(),
            r#"by <span class="printuser"><a href="u">Dr Gears</a></span>"#.into(),
        );

        let entry = normalize(entry, &site, fetched()).expect("normalize");
        assert_eq!(entry.title.as_deref(), Some("Theme Component"));
        assert_eq!(entry.extra["action"], "new revision");
        assert_eq!(entry.extra["revision_id"], "42");
        assert_eq!(entry.extra["author"], "Dr Gears");
        assert_eq!(entry.namespace.as_deref(), Some("component"));
        assert!(!entry.timestamp_approximate);
        assert_eq!(
            entry.last_seen_at,
            Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).single().expect("date")
        );
    }

    #[test]
    fn sitemap_titles_are_dropped() {
        let site = site("scp-wiki", "http://scp-wiki.wikidot.com/");
        let entry = normalize(
            raw(SourceKind::Sitemap, "/scp-173", Some("ignored"), Some("2024-01-01")),
            &site,
            fetched(),
        )
        .expect("normalize");
        assert_eq!(entry.title, None);
    }

    #[test]
    fn cross_site_url_is_rejected() {
        let site_a = site("scp-wiki", "http://scp-wiki.wikidot.com/");
        let err = normalize(
            raw(SourceKind::Feed, "http://fondationscp.wikidot.com/scp-173", Some("x"), None),
            &site_a,
            fetched(),
        )
        .expect_err("foreign page");
        assert!(matches!(err, NormalizationError::ForeignHost { .. }));

        let top: WikiActivityError = err.into();
        assert!(matches!(top, WikiActivityError::Normalization { .. }));
    }

    #[test]
    fn entry_for_another_site_is_rejected() {
        let other = site("fondation", "http://fondationscp.wikidot.com/");
        let err = normalize(
            raw(SourceKind::Feed, "http://fondationscp.wikidot.com/scp-173", None, None),
            &other,
            fetched(),
        )
        .expect_err("site mismatch");
        assert!(matches!(err, NormalizationError::SiteMismatch { .. }));
    }
}
