//! Read-only views of the activity store for reporting.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use wikiactivity_shared::{ActivityRecord, GroupBy, Site, SortKey};
use wikiactivity_store::{ActivityStore, RecordFilter};

/// One page in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRow {
    pub site_id: String,
    pub site_name: String,
    pub language_code: String,
    pub page_slug: String,
    #[serde(flatten)]
    pub record: ActivityRecord,
}

/// Rows sharing a site or language, in sort order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityGroup {
    /// Site id or language code.
    pub key: String,
    pub label: String,
    /// Matching pages before the limit was applied.
    pub total: usize,
    pub rows: Vec<ActivityRow>,
}

/// Grouped, ordered view of the store at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivitySnapshot {
    pub group_by: GroupBy,
    pub sort_by: SortKey,
    /// Groups ordered by key.
    pub groups: Vec<ActivityGroup>,
}

impl ActivitySnapshot {
    /// Rows across all groups.
    pub fn row_count(&self) -> usize {
        self.groups.iter().map(|g| g.rows.len()).sum()
    }
}

/// Optional restrictions on what a snapshot includes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionFilter {
    pub site_ids: Option<BTreeSet<String>>,
    pub language_codes: Option<BTreeSet<String>>,
    pub excluded_namespaces: BTreeSet<String>,
}

/// Project the store into grouped rows.
///
/// Only pages of the given `sites` appear. Within a group rows follow
/// `sort_by`, ties broken by page slug then site id, and `limit` caps each
/// group separately. The store is not modified.
pub fn project(
    store: &ActivityStore,
    sites: &[Site],
    group_by: GroupBy,
    sort_by: SortKey,
    limit: Option<usize>,
    filter: &ProjectionFilter,
) -> ActivitySnapshot {
    let selected: BTreeMap<&str, &Site> = sites
        .iter()
        .filter(|s| filter.site_ids.as_ref().is_none_or(|ids| ids.contains(&s.site_id)))
        .filter(|s| {
            filter
                .language_codes
                .as_ref()
                .is_none_or(|langs| langs.contains(&s.language_code))
        })
        .map(|s| (s.site_id.as_str(), s))
        .collect();

    let record_filter = RecordFilter {
        site_ids: Some(selected.keys().map(|id| id.to_string()).collect()),
        excluded_namespaces: filter.excluded_namespaces.clone(),
    };

    let mut groups: BTreeMap<String, ActivityGroup> = BTreeMap::new();
    for (key, record) in store.snapshot(&record_filter, sort_by) {
        let Some(site) = selected.get(key.site_id.as_str()) else {
            continue;
        };
        let (group_key, label) = match group_by {
            GroupBy::Site => (site.site_id.clone(), site.display_name().to_string()),
            GroupBy::Language => (site.language_code.clone(), site.language_code.clone()),
        };

        let group = groups.entry(group_key.clone()).or_insert_with(|| ActivityGroup {
            key: group_key,
            label,
            total: 0,
            rows: Vec::new(),
        });
        group.total += 1;
        if limit.is_none_or(|n| group.rows.len() < n) {
            group.rows.push(ActivityRow {
                site_id: key.site_id,
                site_name: site.display_name().to_string(),
                language_code: site.language_code.clone(),
                page_slug: key.page_slug,
                record,
            });
        }
    }

    ActivitySnapshot {
        group_by,
        sort_by,
        groups: groups.into_values().collect(),
    }
}
