//! Core domain types for wiki activity aggregation.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Opaque passthrough values attached to an entry (author, guid, action, ...).
pub type Extra = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for ingest cycle identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Site
// ---------------------------------------------------------------------------

/// A configured wiki instance. Immutable once resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Stable slug, e.g. `scp-wiki-fr`.
    pub site_id: String,
    /// Display name, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Language of the instance (`en`, `fr`, ...).
    pub language_code: String,
    /// Root URL every page of the site lives under.
    pub base_url: Url,
    /// Recent-changes feed.
    pub feed_url: Url,
    /// XML sitemap (or sitemap index).
    pub sitemap_url: Url,
}

impl Site {
    /// Name for display, falling back to the site id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.site_id)
    }
}

// ---------------------------------------------------------------------------
// SourceKind
// ---------------------------------------------------------------------------

/// The kind of document an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Atom/RSS recent-changes feed. Supplies presence, freshness and title.
    Feed,
    /// XML sitemap. Supplies presence and (optionally) freshness.
    Sitemap,
}

impl SourceKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Feed => "feed",
            Self::Sitemap => "sitemap",
        }
    }

    /// Whether this kind of source can carry a page title.
    pub const fn carries_title(&self) -> bool {
        matches!(self, Self::Feed)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feed" | "rss" | "atom" => Ok(Self::Feed),
            "sitemap" => Ok(Self::Sitemap),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One unprocessed record extracted from a feed item or sitemap `<url>` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub source_kind: SourceKind,
    pub site_id: String,
    pub raw_url: String,
    /// Only feeds carry titles.
    pub raw_title: Option<String>,
    /// Format varies by source (RFC 2822 in feeds, W3C datetime in sitemaps).
    pub raw_timestamp: Option<String>,
    pub raw_extra: Extra,
}

/// A [`RawEntry`] after canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEntry {
    pub site_id: String,
    /// Path relative to the site's base URL, percent-decoded, case preserved.
    pub page_slug: String,
    pub title: Option<String>,
    /// Best available timestamp; the payload fetch time when `timestamp_approximate`.
    pub last_seen_at: DateTime<Utc>,
    pub source_kind: SourceKind,
    /// Set when the source gave no usable timestamp.
    #[serde(default)]
    pub timestamp_approximate: bool,
    /// Wikidot namespace (`system` in `system:recent-changes`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Extra,
}

impl NormalizedEntry {
    /// The store key of the page this entry describes.
    pub fn key(&self) -> PageKey {
        PageKey::new(&self.site_id, &self.page_slug)
    }
}

// ---------------------------------------------------------------------------
// PageKey
// ---------------------------------------------------------------------------

/// Identity of a logical page: `(site_id, page_slug)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageKey {
    pub site_id: String,
    pub page_slug: String,
}

impl PageKey {
    pub fn new(site_id: impl Into<String>, page_slug: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            page_slug: page_slug.into(),
        }
    }
}

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.site_id, self.page_slug)
    }
}

// ---------------------------------------------------------------------------
// ActivityRecord
// ---------------------------------------------------------------------------

/// The durable per-page activity state. Owned by the activity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Last known title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Set once on creation.
    pub first_seen_at: DateTime<Utc>,
    /// Best estimate of the latest modification.
    pub last_modified_at: DateTime<Utc>,
    /// Source kinds that have contributed to the current state.
    pub last_seen_sources: BTreeSet<SourceKind>,
    /// Non-decreasing.
    pub revision_count_estimate: u64,
    /// Distinct exact modification timestamps observed so far.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub revision_timestamps: BTreeSet<DateTime<Utc>>,
}

impl ActivityRecord {
    /// A freshly sighted page with nothing known beyond its existence.
    pub fn new(first_seen_at: DateTime<Utc>) -> Self {
        Self {
            title: None,
            first_seen_at,
            last_modified_at: first_seen_at,
            last_seen_sources: BTreeSet::new(),
            revision_count_estimate: 1,
            revision_timestamps: BTreeSet::new(),
        }
    }

    /// Check the invariants a reloaded record must satisfy.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.revision_count_estimate == 0 {
            return Err("revision_count_estimate must be at least 1".into());
        }
        if (self.revision_count_estimate as usize) < self.revision_timestamps.len() {
            return Err(format!(
                "revision_count_estimate {} is below {} observed revisions",
                self.revision_count_estimate,
                self.revision_timestamps.len()
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Report shape
// ---------------------------------------------------------------------------

/// How snapshot rows are grouped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    #[default]
    Site,
    Language,
}

/// Primary sort key for snapshot rows. Ties always break by page slug ascending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    LastModifiedDesc,
    RevisionCountDesc,
    PageSlugAsc,
}

impl std::str::FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "site" => Ok(Self::Site),
            "language" => Ok(Self::Language),
            other => Err(format!("unknown grouping: {other}")),
        }
    }
}

impl std::str::FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "last_modified_desc" | "last-modified" => Ok(Self::LastModifiedDesc),
            "revision_count_desc" | "revisions" => Ok(Self::RevisionCountDesc),
            "page_slug_asc" | "slug" => Ok(Self::PageSlugAsc),
            other => Err(format!("unknown sort key: {other}")),
        }
    }
}

/// Wikidot namespace of a page slug: the part before the first `:`.
///
/// Slugs in sub-paths (`forum/t-123`) have no namespace.
pub fn page_namespace(slug: &str) -> Option<&str> {
    if slug.contains('/') {
        return None;
    }
    slug.split_once(':')
        .map(|(ns, _)| ns)
        .filter(|ns| !ns.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn source_kind_serializes_lowercase() {
        let json = serde_json::to_string(&SourceKind::Sitemap).expect("serialize");
        assert_eq!(json, "\"sitemap\"");
        assert_eq!("RSS".parse::<SourceKind>(), Ok(SourceKind::Feed));
        assert!("wiki".parse::<SourceKind>().is_err());
    }

    #[test]
    fn namespace_extraction() {
        assert_eq!(page_namespace("system:recent-changes"), Some("system"));
        assert_eq!(page_namespace("scp-173"), None);
        assert_eq!(page_namespace(":odd"), None);
        assert_eq!(page_namespace("forum/t-1:x"), None);
    }

    #[test]
    fn record_serialization_keeps_invariant_fields() {
        let now = Utc::now();
        let mut record = ActivityRecord::new(now);
        record.last_seen_sources.insert(SourceKind::Feed);
        record.revision_timestamps.insert(now);

        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: ActivityRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, record);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn record_validation_rejects_reset_counter() {
        let mut record = ActivityRecord::new(Utc::now());
        record.revision_count_estimate = 0;
        assert!(record.validate().is_err());
    }

    #[test]
    fn page_key_display() {
        let key = PageKey::new("scp-wiki", "scp-173");
        assert_eq!(key.to_string(), "scp-wiki/scp-173");
    }
}
