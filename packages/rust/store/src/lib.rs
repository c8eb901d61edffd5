//! Activity store: per-page activity state, in memory and on disk.
//!
//! - [`ActivityStore`]: sharded in-memory table keyed by `(site_id, page_slug)`;
//!   merges are atomic per key and never take a global lock
//! - [`Storage`]: libSQL persistence for records and the ingest run ledger
//!
//! Records are never deleted: a page missing from a feed or sitemap is only
//! "not currently observed".

mod merge;
mod migrations;
mod storage;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use wikiactivity_shared::{ActivityRecord, NormalizedEntry, PageKey, SortKey, page_namespace};

pub use merge::{MergeDecision, MergeKind, MergeOutcome, MergePolicy, ReconciliationCorrection};
pub use storage::{IngestRun, Storage};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for `first_seen_at`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always reads the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Filtering and ordering
// ---------------------------------------------------------------------------

/// Which records a snapshot includes. The default includes everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Restrict to these sites; `None` means all sites.
    pub site_ids: Option<BTreeSet<String>>,
    /// Drop pages in these namespaces.
    pub excluded_namespaces: BTreeSet<String>,
}

impl RecordFilter {
    pub fn matches(&self, key: &PageKey) -> bool {
        if let Some(sites) = &self.site_ids {
            if !sites.contains(&key.site_id) {
                return false;
            }
        }
        match page_namespace(&key.page_slug) {
            Some(ns) => !self.excluded_namespaces.contains(ns),
            None => true,
        }
    }
}

/// Order records by `sort_key`; ties break by page slug, then site id.
pub fn sort_records(rows: &mut [(PageKey, ActivityRecord)], sort_key: SortKey) {
    rows.sort_by(|(ka, ra), (kb, rb)| {
        let primary = match sort_key {
            SortKey::LastModifiedDesc => rb.last_modified_at.cmp(&ra.last_modified_at),
            SortKey::RevisionCountDesc => rb.revision_count_estimate.cmp(&ra.revision_count_estimate),
            SortKey::PageSlugAsc => std::cmp::Ordering::Equal,
        };
        primary
            .then_with(|| ka.page_slug.cmp(&kb.page_slug))
            .then_with(|| ka.site_id.cmp(&kb.site_id))
    });
}

// ---------------------------------------------------------------------------
// ActivityStore
// ---------------------------------------------------------------------------

/// In-memory activity table.
///
/// Each key lives in one `DashMap` shard; a merge holds that shard's write
/// lock for the whole read-decide-apply sequence, so merges on the same key
/// serialize while merges on other shards proceed in parallel.
pub struct ActivityStore {
    records: DashMap<PageKey, ActivityRecord>,
    clock: Arc<dyn Clock>,
}

impl Default for ActivityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Current time according to the store clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy of one record.
    pub fn get(&self, key: &PageKey) -> Option<ActivityRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// The record for a page, created with `first_seen_at = now` if absent.
    pub fn get_or_create(&self, site_id: &str, page_slug: &str) -> ActivityRecord {
        let key = PageKey::new(site_id, page_slug);
        self.records
            .entry(key)
            .or_insert_with(|| ActivityRecord::new(self.clock.now()))
            .value()
            .clone()
    }

    /// Atomically apply a decision to the record at `key`, creating it first
    /// if needed, and return the updated record.
    pub fn apply_merge(&self, key: &PageKey, decision: &MergeDecision) -> ActivityRecord {
        let now = self.clock.now();
        let mut slot = self
            .records
            .entry(key.clone())
            .or_insert_with(|| ActivityRecord::new(now));
        merge::apply(slot.value_mut(), decision);
        slot.value().clone()
    }

    /// Merge one entry: read the current state, let `policy` decide and apply
    /// the decision, all under the key's lock.
    pub fn reconcile<P: MergePolicy + ?Sized>(&self, entry: &NormalizedEntry, policy: &P) -> MergeOutcome {
        let key = entry.key();
        let now = self.clock.now();

        let (decision, corrected_from, record) = match self.records.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let decision = policy.decide(Some(occupied.get()), entry);
                let corrected_from = merge::apply(occupied.get_mut(), &decision);
                (decision, corrected_from, occupied.get().clone())
            }
            Entry::Vacant(vacant) => {
                let decision = policy.decide(None, entry);
                let mut record = ActivityRecord::new(now);
                merge::apply(&mut record, &decision);
                vacant.insert(record.clone());
                (decision, None, record)
            }
        };

        let correction = corrected_from.map(|previous| ReconciliationCorrection {
            key: key.clone(),
            source: decision.source,
            previous,
            corrected: record.last_modified_at,
        });
        MergeOutcome {
            key,
            kind: decision.kind,
            record,
            correction,
        }
    }

    /// Point-in-time copy of the matching records in `sort_key` order.
    ///
    /// Every record is copied under its shard lock, so no row reflects a
    /// half-applied merge.
    pub fn snapshot(&self, filter: &RecordFilter, sort_key: SortKey) -> Vec<(PageKey, ActivityRecord)> {
        let mut rows: Vec<_> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.key()))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        sort_records(&mut rows, sort_key);
        rows
    }

    /// Put back records reloaded from persistence, replacing in-memory state.
    pub fn restore(&self, rows: impl IntoIterator<Item = (PageKey, ActivityRecord)>) {
        for (key, record) in rows {
            self.records.insert(key, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use wikiactivity_shared::{Extra, SourceKind};

    use super::*;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).single().expect("date")
    }

    fn store() -> ActivityStore {
        ActivityStore::with_clock(Arc::new(FixedClock(day(20))))
    }

    fn entry(site: &str, slug: &str, ts: DateTime<Utc>) -> NormalizedEntry {
        NormalizedEntry {
            site_id: site.into(),
            page_slug: slug.into(),
            title: None,
            last_seen_at: ts,
            source_kind: SourceKind::Sitemap,
            timestamp_approximate: false,
            namespace: None,
            extra: Extra::new(),
        }
    }

    /// Always advances to the entry timestamp.
    struct Advance;

    impl MergePolicy for Advance {
        fn decide(&self, current: Option<&ActivityRecord>, entry: &NormalizedEntry) -> MergeDecision {
            MergeDecision {
                kind: if current.is_some() { MergeKind::Advanced } else { MergeKind::Created },
                source: entry.source_kind,
                title: entry.title.clone(),
                last_modified_at: Some(entry.last_seen_at),
                observed_revision: Some(entry.last_seen_at),
            }
        }
    }

    #[test]
    fn get_or_create_sets_first_seen_once() {
        let store = store();
        let first = store.get_or_create("a", "p");
        assert_eq!(first.first_seen_at, day(20));
        assert_eq!(first.revision_count_estimate, 1);

        let again = store.get_or_create("a", "p");
        assert_eq!(again, first);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reconcile_creates_then_updates() {
        let store = store();
        let created = store.reconcile(&entry("a", "p", day(1)), &Advance);
        assert_eq!(created.kind, MergeKind::Created);
        assert_eq!(created.record.last_modified_at, day(1));
        assert_eq!(created.record.first_seen_at, day(20));

        let advanced = store.reconcile(&entry("a", "p", day(3)), &Advance);
        assert_eq!(advanced.kind, MergeKind::Advanced);
        assert_eq!(advanced.record.revision_count_estimate, 2);
        assert_eq!(store.get(&PageKey::new("a", "p")), Some(advanced.record));
    }

    #[test]
    fn apply_merge_creates_missing_record() {
        let store = store();
        let key = PageKey::new("a", "p");
        let record = store.apply_merge(
            &key,
            &MergeDecision {
                kind: MergeKind::Created,
                source: SourceKind::Feed,
                title: Some("P".into()),
                last_modified_at: Some(day(2)),
                observed_revision: Some(day(2)),
            },
        );
        assert_eq!(record.title.as_deref(), Some("P"));
        assert_eq!(record.last_modified_at, day(2));
        assert!(record.last_seen_sources.contains(&SourceKind::Feed));
    }

    #[test]
    fn snapshot_filters_and_sorts() {
        let store = store();
        store.reconcile(&entry("a", "zeta", day(5)), &Advance);
        store.reconcile(&entry("a", "alpha", day(5)), &Advance);
        store.reconcile(&entry("a", "system:nav", day(9)), &Advance);
        store.reconcile(&entry("b", "beta", day(7)), &Advance);

        let all = store.snapshot(&RecordFilter::default(), SortKey::LastModifiedDesc);
        let slugs: Vec<_> = all.iter().map(|(k, _)| k.page_slug.as_str()).collect();
        assert_eq!(slugs, vec!["system:nav", "beta", "alpha", "zeta"]);

        let filter = RecordFilter {
            site_ids: Some(BTreeSet::from(["a".to_string()])),
            excluded_namespaces: BTreeSet::from(["system".to_string()]),
        };
        let filtered = store.snapshot(&filter, SortKey::PageSlugAsc);
        let slugs: Vec<_> = filtered.iter().map(|(k, _)| k.page_slug.as_str()).collect();
        assert_eq!(slugs, vec!["alpha", "zeta"]);
    }

    #[test]
    fn concurrent_merges_on_one_key_serialize() {
        let store = Arc::new(store());
        let handles: Vec<_> = (1..=16u32)
            .map(|d| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.reconcile(&entry("a", "p", day(d)), &Advance);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("merge thread");
        }

        let record = store.get(&PageKey::new("a", "p")).expect("record");
        assert_eq!(record.revision_timestamps.len(), 16);
        assert_eq!(record.revision_count_estimate, 16);
        assert_eq!(record.last_modified_at, day(16));
    }
}
