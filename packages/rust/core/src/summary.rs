//! Per-site activity figures derived from one cycle's feed and the store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use wikiactivity_shared::NormalizedEntry;

/// Change actions that do not touch page content.
pub const NON_CONTENT_ACTIONS: &[&str] = &["page move/rename", "file action"];

/// Author names that are not real users.
pub const EXCLUDED_AUTHORS: &[&str] = &["Anonymous", "(account deleted)"];

/// Activity figures for one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteActivitySummary {
    pub site_id: String,
    /// Known content pages (namespace and forum filters applied).
    pub content_pages: usize,
    /// Content edits inside the window. `None` when unknown.
    pub recent_edits: Option<usize>,
    /// Distinct named authors inside the window. `None` when unknown.
    pub active_users: Option<usize>,
    /// Most recent content edit seen in the feed.
    pub latest_edit: Option<DateTime<Utc>>,
    /// The feed's oldest entry is still inside the window, so the window's
    /// activity is larger than what the feed shows.
    pub feed_window_saturated: bool,
    pub window_days: u32,
}

fn is_content_edit(entry: &NormalizedEntry) -> bool {
    entry
        .extra
        .get("action")
        .is_none_or(|action| !NON_CONTENT_ACTIONS.contains(&action.trim().to_ascii_lowercase().as_str()))
}

/// Summarize a site.
///
/// `feed` is `None` when the feed was not retrieved this cycle, which leaves
/// every feed-derived figure unknown. Entries with approximate timestamps say
/// nothing about when an edit happened and are ignored.
pub fn summarize(
    site_id: &str,
    content_pages: usize,
    feed: Option<&[NormalizedEntry]>,
    now: DateTime<Utc>,
    window_days: u32,
) -> SiteActivitySummary {
    let mut summary = SiteActivitySummary {
        site_id: site_id.to_string(),
        content_pages,
        recent_edits: None,
        active_users: None,
        latest_edit: None,
        feed_window_saturated: false,
        window_days,
    };
    let Some(feed) = feed else {
        return summary;
    };

    // Revisions can appear more than once (feed pages overlap); count each
    // page/timestamp pair once.
    let dated: BTreeMap<_, &NormalizedEntry> = feed
        .iter()
        .filter(|e| !e.timestamp_approximate)
        .map(|e| ((e.page_slug.as_str(), e.last_seen_at), e))
        .collect();

    summary.latest_edit = dated
        .values()
        .filter(|e| is_content_edit(e))
        .map(|e| e.last_seen_at)
        .max();

    let window_start = now - Duration::days(i64::from(window_days));
    let oldest = dated.values().map(|e| e.last_seen_at).min();
    if oldest.is_some_and(|ts| ts > window_start) {
        summary.feed_window_saturated = true;
        return summary;
    }

    let recent: Vec<_> = dated
        .values()
        .filter(|e| e.last_seen_at > window_start)
        .collect();
    summary.recent_edits = Some(recent.iter().filter(|e| is_content_edit(e)).count());
    summary.active_users = Some(
        recent
            .iter()
            .filter_map(|e| e.extra.get("author"))
            .map(|a| a.trim())
            .filter(|a| !a.is_empty() && !EXCLUDED_AUTHORS.contains(a))
            .collect::<BTreeSet<_>>()
            .len(),
    );
    summary
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use wikiactivity_shared::{Extra, SourceKind};

    use super::*;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).single().expect("date")
    }

    fn edit(slug: &str, d: u32, author: &str, action: Option<&str>) -> NormalizedEntry {
        let mut extra = Extra::new();
        extra.insert("author".into(), author.into());
        if let Some(action) = action {
            extra.insert("action".into(), action.into());
        }
        NormalizedEntry {
            site_id: "wl".into(),
            page_slug: slug.into(),
            title: Some(slug.into()),
            last_seen_at: day(d),
            source_kind: SourceKind::Feed,
            timestamp_approximate: false,
            namespace: None,
            extra,
        }
    }

    #[test]
    fn counts_content_edits_and_named_authors_in_window() {
        let feed = vec![
            edit("a", 1, "alice", Some("source changed")),
            edit("b", 20, "bob", Some("new page")),
            edit("c", 25, "Anonymous", Some("tags changed")),
            edit("d", 28, "alice", Some("page move/rename")),
            edit("d", 28, "alice", Some("page move/rename")),
        ];
        let s = summarize("wl", 42, Some(&feed), day(30), 14);

        assert!(!s.feed_window_saturated);
        assert_eq!(s.content_pages, 42);
        assert_eq!(s.recent_edits, Some(2));
        assert_eq!(s.active_users, Some(2));
        assert_eq!(s.latest_edit, Some(day(25)));
    }

    #[test]
    fn saturated_feed_leaves_window_figures_unknown() {
        let feed = vec![edit("a", 25, "alice", None), edit("b", 28, "bob", None)];
        let s = summarize("wl", 3, Some(&feed), day(30), 30);

        assert!(s.feed_window_saturated);
        assert_eq!(s.recent_edits, None);
        assert_eq!(s.active_users, None);
        assert_eq!(s.latest_edit, Some(day(28)));
    }

    #[test]
    fn missing_feed_is_unknown_not_zero() {
        let s = summarize("wl", 7, None, day(30), 30);
        assert_eq!(s.recent_edits, None);
        assert_eq!(s.latest_edit, None);
        assert!(!s.feed_window_saturated);

        let empty = summarize("wl", 7, Some(&[]), day(30), 30);
        assert_eq!(empty.recent_edits, Some(0));
        assert_eq!(empty.active_users, Some(0));
    }
}
