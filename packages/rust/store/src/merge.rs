//! Merge decisions and their application to a record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use wikiactivity_shared::{ActivityRecord, NormalizedEntry, PageKey, SourceKind};

/// What kind of change an entry caused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    /// First sighting of the page.
    Created,
    /// Newer timestamp: the page changed.
    Advanced,
    /// Same timestamp as the record: another sighting of a known state.
    Duplicate,
    /// Older timestamp accepted as a correction from the source.
    Corrected,
    /// Older timestamp not accepted; only the sighting counts.
    Stale,
    /// Entry without a usable timestamp; only the sighting counts.
    Approximate,
}

/// Changes to apply to one record, produced by a [`MergePolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDecision {
    pub kind: MergeKind,
    pub source: SourceKind,
    /// Title to adopt.
    pub title: Option<String>,
    /// New `last_modified_at`. Only a `Created` or `Corrected` decision may
    /// move it backward.
    pub last_modified_at: Option<DateTime<Utc>>,
    /// Exact modification timestamp to add to the revision history.
    pub observed_revision: Option<DateTime<Utc>>,
}

/// Decides how an entry changes the current state of its page.
///
/// Called with the key's lock held; implementations must not touch the store.
pub trait MergePolicy {
    fn decide(&self, current: Option<&ActivityRecord>, entry: &NormalizedEntry) -> MergeDecision;
}

/// An accepted backward move of `last_modified_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationCorrection {
    pub key: PageKey,
    pub source: SourceKind,
    pub previous: DateTime<Utc>,
    pub corrected: DateTime<Utc>,
}

/// Result of merging one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub key: PageKey,
    pub kind: MergeKind,
    /// State after the merge.
    pub record: ActivityRecord,
    pub correction: Option<ReconciliationCorrection>,
}

/// Apply `decision` to `record` in place, upholding the record invariants.
///
/// Returns the previous `last_modified_at` when a correction moved it back.
pub(crate) fn apply(record: &mut ActivityRecord, decision: &MergeDecision) -> Option<DateTime<Utc>> {
    record.last_seen_sources.insert(decision.source);

    if let Some(title) = decision.title.as_deref().filter(|t| !t.trim().is_empty()) {
        record.title = Some(title.to_string());
    }

    let mut corrected_from = None;
    if let Some(ts) = decision.last_modified_at {
        match decision.kind {
            MergeKind::Created => record.last_modified_at = ts,
            MergeKind::Corrected if ts < record.last_modified_at => {
                corrected_from = Some(record.last_modified_at);
                record.last_modified_at = ts;
            }
            _ if ts > record.last_modified_at => record.last_modified_at = ts,
            _ => {}
        }
    }

    if let Some(ts) = decision.observed_revision {
        record.revision_timestamps.insert(ts);
    }
    let observed = record.revision_timestamps.len() as u64;
    record.revision_count_estimate = record.revision_count_estimate.max(observed).max(1);

    corrected_from
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).single().expect("date")
    }

    fn decision(kind: MergeKind, ts: DateTime<Utc>) -> MergeDecision {
        MergeDecision {
            kind,
            source: SourceKind::Feed,
            title: None,
            last_modified_at: Some(ts),
            observed_revision: Some(ts),
        }
    }

    #[test]
    fn only_corrections_move_backward() {
        let mut record = ActivityRecord::new(day(1));
        record.last_modified_at = day(10);

        assert_eq!(apply(&mut record, &decision(MergeKind::Advanced, day(5))), None);
        assert_eq!(record.last_modified_at, day(10));

        assert_eq!(apply(&mut record, &decision(MergeKind::Corrected, day(5))), Some(day(10)));
        assert_eq!(record.last_modified_at, day(5));
    }

    #[test]
    fn revision_estimate_tracks_distinct_timestamps() {
        let mut record = ActivityRecord::new(day(1));
        apply(&mut record, &decision(MergeKind::Created, day(2)));
        apply(&mut record, &decision(MergeKind::Advanced, day(3)));
        apply(&mut record, &decision(MergeKind::Duplicate, day(3)));
        assert_eq!(record.revision_count_estimate, 2);
        assert_eq!(record.last_seen_sources.len(), 1);
    }

    #[test]
    fn blank_titles_are_not_adopted() {
        let mut record = ActivityRecord::new(day(1));
        record.title = Some("Kept".into());
        let mut d = decision(MergeKind::Duplicate, day(1));
        d.title = Some("  ".into());
        apply(&mut record, &d);
        assert_eq!(record.title.as_deref(), Some("Kept"));
    }
}
