//! Merge policy for observations of the same page from different sources.
//!
//! Feed and sitemap are equally authoritative for a page's existence; they
//! differ only in what they can supply (a sitemap has no titles). Every entry
//! is decided on its own against the page's current record.

use std::cmp::Ordering;

use tracing::warn;
use wikiactivity_shared::{ActivityRecord, NormalizedEntry};
use wikiactivity_store::{MergeDecision, MergeKind, MergePolicy};

/// 1995-01-01T00:00:00Z. Timestamps before it are placeholder dates, not
/// edits, and never count as revisions.
const EARLIEST_REVISION_SECS: i64 = 788_918_400;

/// The reconciliation rules.
///
/// - New page: take the entry's timestamp and title.
/// - Approximate timestamp: record the sighting, change nothing else.
/// - Newer timestamp: the page changed; advance and count a revision.
/// - Same timestamp: another sighting of the known state.
/// - Older timestamp after `first_seen_at`: accepted as a correction from the
///   source. Older still: ignored, sighting recorded.
///
/// A title is adopted when the entry is not older than the current state, or
/// when the page has no title yet. The revision estimate counts distinct exact
/// timestamps, so replaying entries or reordering sources does not inflate it;
/// stale timestamps count too, ones before 1995 never do.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl MergePolicy for Reconciler {
    fn decide(&self, current: Option<&ActivityRecord>, entry: &NormalizedEntry) -> MergeDecision {
        let title = entry.title.clone().filter(|t| !t.trim().is_empty());
        let exact = (!entry.timestamp_approximate).then_some(entry.last_seen_at);
        let revision = exact.filter(|ts| ts.timestamp() >= EARLIEST_REVISION_SECS);

        let Some(record) = current else {
            return MergeDecision {
                kind: MergeKind::Created,
                source: entry.source_kind,
                title,
                last_modified_at: Some(entry.last_seen_at),
                observed_revision: revision,
            };
        };

        if entry.timestamp_approximate {
            return MergeDecision {
                kind: MergeKind::Approximate,
                source: entry.source_kind,
                title: None,
                last_modified_at: None,
                observed_revision: None,
            };
        }

        let ts = entry.last_seen_at;
        let (kind, last_modified_at) = match ts.cmp(&record.last_modified_at) {
            Ordering::Greater => (MergeKind::Advanced, Some(ts)),
            Ordering::Equal => (MergeKind::Duplicate, None),
            Ordering::Less if ts > record.first_seen_at => {
                warn!(
                    site = %entry.site_id,
                    slug = %entry.page_slug,
                    source = %entry.source_kind,
                    previous = %record.last_modified_at,
                    corrected = %ts,
                    "accepting backward timestamp correction"
                );
                (MergeKind::Corrected, Some(ts))
            }
            Ordering::Less => (MergeKind::Stale, None),
        };

        let title = title.filter(|_| ts >= record.last_modified_at || record.title.is_none());

        MergeDecision {
            kind,
            source: entry.source_kind,
            title,
            last_modified_at,
            observed_revision: revision,
        }
    }
}
