//! Ingest cycle orchestration.
//!
//! One pipeline per site (fetch → parse → normalize → filter → reconcile),
//! run concurrently under a semaphore. A site's failures and timeouts stay
//! in that site's [`SiteReport`]; nothing short of a storage fault stops the
//! cycle.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use url::Url;
use wikiactivity_normalize::normalize;
use wikiactivity_shared::{
    NormalizedEntry, Result, RunConfig, RunId, Site, SortKey, SourceKind, WikiActivityError,
    page_namespace,
};
use wikiactivity_sources::{DEFAULT_MAX_DECODED_BYTES, EntryRecoveryWarning, SourceFormat, parse_with_limit};
use wikiactivity_store::{ActivityStore, MergeKind, RecordFilter, ReconciliationCorrection, Storage};

use crate::fetch::{FetchedPayload, Fetcher};
use crate::reconciler::Reconciler;
use crate::summary::{SiteActivitySummary, summarize};

/// Corrections listed per site report; further ones are only counted.
const MAX_REPORTED_CORRECTIONS: usize = 100;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for cycle execution.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as each site pipeline completes.
    fn site_finished(&self, report: &SiteReport, completed: usize, total: usize);
    /// Called when the cycle completes.
    fn done(&self, report: &CycleReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn site_finished(&self, _report: &SiteReport, _completed: usize, _total: usize) {}
    fn done(&self, _report: &CycleReport) {}
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    /// Fetch failed; the source is unavailable this cycle.
    Unavailable,
    /// Fetched but not a recognizable feed or sitemap.
    Unparseable,
    /// The site timed out while this payload was merging. Some of its entries
    /// may be in the store without being counted in the report.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub kind: SourceKind,
    pub url: String,
    pub status: SourceStatus,
    /// Sitemap index nesting level; 0 for configured URLs.
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-entry tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub entries_seen: usize,
    /// Entries that reached the store.
    pub merged: usize,
    pub created: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub corrections: usize,
    pub stale: usize,
    pub approximate: usize,
    pub skipped_malformed: usize,
    pub recovered: usize,
    pub normalization_failures: usize,
    pub filtered: usize,
}

impl MergeCounts {
    fn record(&mut self, kind: MergeKind) {
        self.merged += 1;
        match kind {
            MergeKind::Created => self.created += 1,
            MergeKind::Advanced => self.updated += 1,
            MergeKind::Duplicate => self.duplicates += 1,
            MergeKind::Corrected => self.corrections += 1,
            MergeKind::Stale => self.stale += 1,
            MergeKind::Approximate => self.approximate += 1,
        }
    }

    pub fn add(&mut self, other: &MergeCounts) {
        self.entries_seen += other.entries_seen;
        self.merged += other.merged;
        self.created += other.created;
        self.updated += other.updated;
        self.duplicates += other.duplicates;
        self.corrections += other.corrections;
        self.stale += other.stale;
        self.approximate += other.approximate;
        self.skipped_malformed += other.skipped_malformed;
        self.recovered += other.recovered;
        self.normalization_failures += other.normalization_failures;
        self.filtered += other.filtered;
    }
}

/// Result of one site pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    pub site_id: String,
    pub language_code: String,
    pub sources: Vec<SourceReport>,
    pub counts: MergeCounts,
    /// First corrections of the cycle (all are counted in `counts`).
    pub corrections: Vec<ReconciliationCorrection>,
    pub recovery_warnings: Vec<EntryRecoveryWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SiteActivitySummary>,
    /// The site ran out of time; entries merged before that are kept.
    pub timed_out: bool,
    pub elapsed_ms: u64,
    /// Source being fetched or merged, moved to `sources` once it settles.
    #[serde(skip)]
    in_flight: Option<SourceReport>,
}

impl SiteReport {
    fn new(site: &Site) -> Self {
        Self {
            site_id: site.site_id.clone(),
            language_code: site.language_code.clone(),
            sources: Vec::new(),
            counts: MergeCounts::default(),
            corrections: Vec::new(),
            recovery_warnings: Vec::new(),
            summary: None,
            timed_out: false,
            elapsed_ms: 0,
            in_flight: None,
        }
    }

    /// Whether any source of the site was usable this cycle.
    pub fn available(&self) -> bool {
        self.sources
            .iter()
            .any(|s| matches!(s.status, SourceStatus::Ok | SourceStatus::Interrupted))
    }

    /// Record the in-flight source with its final status.
    fn settle(&mut self, status: SourceStatus, format: Option<String>, error: Option<String>) {
        if let Some(mut source) = self.in_flight.take() {
            source.status = status;
            source.format = format;
            source.error = error;
            self.sources.push(source);
        }
    }

    fn absorb(&mut self, outcome: &mut PayloadOutcome) {
        self.counts.add(&outcome.counts);
        let room = MAX_REPORTED_CORRECTIONS.saturating_sub(self.corrections.len());
        self.corrections
            .extend(std::mem::take(&mut outcome.corrections).into_iter().take(room));
        // Warnings are bounded per payload by the parser already.
        self.recovery_warnings.append(&mut outcome.warnings);
    }
}

/// Result of a whole cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sites: Vec<SiteReport>,
}

impl CycleReport {
    /// Counters summed over all sites.
    pub fn totals(&self) -> MergeCounts {
        let mut totals = MergeCounts::default();
        for site in &self.sites {
            totals.add(&site.counts);
        }
        totals
    }

    /// Compact JSON for the run ledger: totals plus per-site counters.
    pub fn stats_json(&self) -> Result<String> {
        let sites: serde_json::Map<String, serde_json::Value> = self
            .sites
            .iter()
            .map(|s| {
                let value = serde_json::json!({
                    "counts": s.counts,
                    "available": s.available(),
                    "timed_out": s.timed_out,
                });
                (s.site_id.clone(), value)
            })
            .collect();
        serde_json::to_string(&serde_json::json!({
            "totals": self.totals(),
            "sites": sites,
        }))
        .map_err(|e| WikiActivityError::validation(format!("failed to encode run stats: {e}")))
    }

    /// Sites with no usable source this cycle.
    pub fn unavailable_sites(&self) -> Vec<&str> {
        self.sites
            .iter()
            .filter(|s| !s.available())
            .map(|s| s.site_id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

/// Decides which pages are left out of the activity record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub excluded_namespaces: BTreeSet<String>,
    pub exclude_forum: bool,
}

impl EntryFilter {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            excluded_namespaces: config.excluded_namespaces.iter().cloned().collect(),
            exclude_forum: config.exclude_forum,
        }
    }

    pub fn excludes(&self, page_slug: &str) -> bool {
        if self.exclude_forum && (page_slug == "forum" || page_slug.starts_with("forum/")) {
            return true;
        }
        page_namespace(page_slug).is_some_and(|ns| self.excluded_namespaces.contains(ns))
    }
}

/// Per-payload ingest rules: what to leave out and how large a payload may decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub filter: EntryFilter,
    pub max_decoded_bytes: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            filter: EntryFilter::default(),
            max_decoded_bytes: DEFAULT_MAX_DECODED_BYTES,
        }
    }
}

impl IngestSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            filter: EntryFilter::from_config(config),
            max_decoded_bytes: config.max_payload_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload ingestion
// ---------------------------------------------------------------------------

/// What merging one payload produced.
#[derive(Debug, Clone)]
pub struct PayloadOutcome {
    pub format: SourceFormat,
    pub counts: MergeCounts,
    pub corrections: Vec<ReconciliationCorrection>,
    pub warnings: Vec<EntryRecoveryWarning>,
    /// Child sitemaps listed by a sitemap index.
    pub nested: Vec<String>,
    /// Every normalized feed entry, filtered ones included.
    pub feed_entries: Vec<NormalizedEntry>,
    /// Stopped early because `cancel` was raised.
    pub cancelled: bool,
}

/// Parse, normalize, filter and merge one payload into `store`.
///
/// Synchronous and CPU bound; the cycle runs it on the blocking pool.
/// Raising `cancel` stops it between entries, keeping what was merged.
/// Fails only when the payload is not a recognizable `kind` document.
pub fn ingest_payload(
    body: Vec<u8>,
    fetched_at: DateTime<Utc>,
    kind: SourceKind,
    site: &Site,
    settings: &IngestSettings,
    store: &ActivityStore,
    cancel: &AtomicBool,
) -> Result<PayloadOutcome> {
    let mut stream = parse_with_limit(body, kind, &site.site_id, settings.max_decoded_bytes)?;
    let mut counts = MergeCounts::default();
    let mut corrections = Vec::new();
    let mut feed_entries = Vec::new();
    let mut cancelled = false;

    for raw in stream.by_ref() {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            break;
        }
        counts.entries_seen += 1;

        let entry = match normalize(raw, site, fetched_at) {
            Ok(entry) => entry,
            Err(e) => {
                counts.normalization_failures += 1;
                debug!(site = %site.site_id, error = %e, "entry dropped");
                continue;
            }
        };
        if kind == SourceKind::Feed {
            feed_entries.push(entry.clone());
        }
        if settings.filter.excludes(&entry.page_slug) {
            counts.filtered += 1;
            continue;
        }

        let outcome = store.reconcile(&entry, &Reconciler);
        counts.record(outcome.kind);
        if let Some(correction) = outcome.correction {
            corrections.push(correction);
        }
    }

    let stats = stream.stats();
    counts.skipped_malformed = stats.skipped;
    counts.recovered = stats.recovered;

    Ok(PayloadOutcome {
        format: stream.format(),
        counts,
        corrections,
        warnings: stream.warnings().to_vec(),
        nested: stream.nested_sitemaps().to_vec(),
        feed_entries,
        cancelled,
    })
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// Settings shared by every site task.
struct SiteContext<F> {
    fetcher: Arc<F>,
    store: Arc<ActivityStore>,
    settings: IngestSettings,
    site_timeout: Duration,
    max_sitemap_depth: u32,
    recent_days: u32,
}

/// Run one ingest cycle over `sites`, merging into `store`.
///
/// Sites are processed concurrently, at most `config.concurrency` at a time.
/// Reports come back in the order of `sites`.
#[instrument(skip_all, fields(run_id = %run_id, sites = sites.len(), concurrency = config.concurrency))]
pub async fn run_cycle<F: Fetcher + 'static>(
    run_id: RunId,
    sites: &[Site],
    config: &RunConfig,
    fetcher: Arc<F>,
    store: Arc<ActivityStore>,
    progress: &dyn ProgressReporter,
) -> CycleReport {
    let started_at = Utc::now();
    info!("starting ingest cycle");
    progress.phase("Fetching sources");

    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1) as usize));
    let ctx = Arc::new(SiteContext {
        fetcher,
        store,
        settings: IngestSettings::from_config(config),
        site_timeout: config.site_timeout,
        max_sitemap_depth: config.max_sitemap_depth,
        recent_days: config.recent_days,
    });

    let handles: Vec<_> = sites
        .iter()
        .cloned()
        .map(|site| {
            let sem = Arc::clone(&semaphore);
            let ctx = Arc::clone(&ctx);
            let fallback = SiteReport::new(&site);
            let handle = tokio::spawn(async move {
                // The semaphore is never closed, so acquiring cannot fail.
                let _permit = sem.acquire().await.ok();
                process_site(site, &ctx).await
            });
            (handle, fallback)
        })
        .collect();

    let total = handles.len();
    let mut reports = Vec::with_capacity(total);
    for (i, (handle, fallback)) in handles.into_iter().enumerate() {
        let report = match handle.await {
            Ok(report) => report,
            Err(e) => {
                warn!(site = %fallback.site_id, error = %e, "site pipeline aborted");
                fallback
            }
        };
        progress.site_finished(&report, i + 1, total);
        reports.push(report);
    }

    let report = CycleReport {
        run_id,
        started_at,
        finished_at: Utc::now(),
        sites: reports,
    };
    let totals = report.totals();
    info!(
        run_id = %report.run_id,
        merged = totals.merged,
        created = totals.created,
        updated = totals.updated,
        corrections = totals.corrections,
        skipped = totals.skipped_malformed,
        unavailable = report.unavailable_sites().len(),
        "ingest cycle complete"
    );
    progress.done(&report);
    report
}

#[instrument(skip_all, fields(site = %site.site_id))]
async fn process_site<F: Fetcher + 'static>(site: Site, ctx: &SiteContext<F>) -> SiteReport {
    let start = Instant::now();
    let cancel = Arc::new(AtomicBool::new(false));
    let mut report = SiteReport::new(&site);
    let mut feed = None;

    let ran = tokio::time::timeout(
        ctx.site_timeout,
        ingest_site(&site, ctx, &cancel, &mut report, &mut feed),
    )
    .await;
    if ran.is_err() {
        // Stop any payload still merging on the blocking pool.
        cancel.store(true, Ordering::Relaxed);
        report.timed_out = true;
        if let Some(source) = report.in_flight.take() {
            report.sources.push(source);
        }
        warn!(
            timeout_secs = ctx.site_timeout.as_secs_f64(),
            "site timed out; keeping entries merged so far"
        );
    }

    let site_filter = RecordFilter {
        site_ids: Some(BTreeSet::from([site.site_id.clone()])),
        excluded_namespaces: ctx.settings.filter.excluded_namespaces.clone(),
    };
    let content_pages = ctx
        .store
        .snapshot(&site_filter, SortKey::PageSlugAsc)
        .iter()
        .filter(|(key, _)| !ctx.settings.filter.excludes(&key.page_slug))
        .count();
    report.summary = Some(summarize(
        &site.site_id,
        content_pages,
        feed.as_deref(),
        ctx.store.now(),
        ctx.recent_days,
    ));

    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        entries = report.counts.entries_seen,
        merged = report.counts.merged,
        corrections = report.counts.corrections,
        skipped = report.counts.skipped_malformed,
        elapsed_ms = report.elapsed_ms,
        "site done"
    );
    report
}

async fn ingest_site<F: Fetcher + 'static>(
    site: &Site,
    ctx: &SiteContext<F>,
    cancel: &Arc<AtomicBool>,
    report: &mut SiteReport,
    feed: &mut Option<Vec<NormalizedEntry>>,
) {
    if let Some(entries) = ingest_feed(site, ctx, cancel, report).await {
        *feed = Some(entries);
    }

    // Sitemaps, breadth first through any indexes.
    let mut queue = VecDeque::from([(site.sitemap_url.clone(), 0u32)]);
    let mut visited = HashSet::new();
    while let Some((url, depth)) = queue.pop_front() {
        if !visited.insert(url.clone()) {
            continue;
        }
        let Some(nested) = ingest_sitemap(site, url.clone(), depth, ctx, cancel, report).await else {
            continue;
        };
        for child in nested {
            let Some(child_url) = nested_sitemap_url(&url, &child) else {
                warn!(index = %url, child = %child, "ignoring sitemap outside the index host");
                continue;
            };
            if depth >= ctx.max_sitemap_depth {
                warn!(index = %url, child = %child_url, depth, "sitemap nesting too deep; not following");
                continue;
            }
            queue.push_back((child_url, depth + 1));
        }
    }
}

/// Ingest the site feed; returns its normalized entries when it was readable.
async fn ingest_feed<F: Fetcher + 'static>(
    site: &Site,
    ctx: &SiteContext<F>,
    cancel: &Arc<AtomicBool>,
    report: &mut SiteReport,
) -> Option<Vec<NormalizedEntry>> {
    fetch_and_merge(site, SourceKind::Feed, site.feed_url.clone(), 0, ctx, cancel, report)
        .await
        .map(|outcome| outcome.feed_entries)
}

/// Ingest a sitemap; returns the child sitemaps an index lists.
async fn ingest_sitemap<F: Fetcher + 'static>(
    site: &Site,
    url: Url,
    depth: u32,
    ctx: &SiteContext<F>,
    cancel: &Arc<AtomicBool>,
    report: &mut SiteReport,
) -> Option<Vec<String>> {
    fetch_and_merge(site, SourceKind::Sitemap, url, depth, ctx, cancel, report)
        .await
        .map(|outcome| outcome.nested)
}

async fn fetch_and_merge<F: Fetcher + 'static>(
    site: &Site,
    kind: SourceKind,
    url: Url,
    depth: u32,
    ctx: &SiteContext<F>,
    cancel: &Arc<AtomicBool>,
    report: &mut SiteReport,
) -> Option<PayloadOutcome> {
    report.in_flight = Some(SourceReport {
        kind,
        url: url.to_string(),
        status: SourceStatus::Unavailable,
        depth,
        format: None,
        sha256: None,
        bytes: 0,
        error: Some("site timed out while fetching".into()),
    });

    let payload = match ctx.fetcher.fetch(&url).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!(source = %kind, url = %url, error = %e, "source unavailable this cycle");
            report.settle(SourceStatus::Unavailable, None, Some(e.to_string()));
            return None;
        }
    };
    let FetchedPayload {
        body,
        fetched_at,
        sha256,
        ..
    } = payload;
    if let Some(source) = report.in_flight.as_mut() {
        source.status = SourceStatus::Interrupted;
        source.sha256 = Some(sha256);
        source.bytes = body.len();
        source.error = Some("site timed out while merging; merged entries are not counted".into());
    }

    let task_site = site.clone();
    let settings = ctx.settings.clone();
    let store = Arc::clone(&ctx.store);
    let task_cancel = Arc::clone(cancel);
    let merged = tokio::task::spawn_blocking(move || {
        ingest_payload(body, fetched_at, kind, &task_site, &settings, &store, &task_cancel)
    })
    .await
    .map_err(|e| WikiActivityError::parse(format!("parser task failed: {e}")))
    .and_then(|r| r);

    match merged {
        Ok(mut outcome) => {
            debug!(
                source = %kind,
                url = %url,
                format = %outcome.format,
                entries = outcome.counts.entries_seen,
                "payload merged"
            );
            report.settle(SourceStatus::Ok, Some(outcome.format.to_string()), None);
            report.absorb(&mut outcome);
            Some(outcome)
        }
        Err(e) => {
            warn!(source = %kind, url = %url, error = %e, "source unparseable");
            report.settle(SourceStatus::Unparseable, None, Some(e.to_string()));
            None
        }
    }
}

/// Resolve a sitemap index child, keeping it on the index's host.
fn nested_sitemap_url(index: &Url, child: &str) -> Option<Url> {
    let url = index.join(child.trim()).ok()?;
    let same_host = url
        .host_str()
        .zip(index.host_str())
        .is_some_and(|(a, b)| a.eq_ignore_ascii_case(b));
    (same_host && url.port_or_known_default() == index.port_or_known_default()).then_some(url)
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Reload persisted records into `store`. Returns how many were loaded.
pub async fn load_store(storage: &Storage, store: &ActivityStore) -> Result<usize> {
    let rows = storage.load_records().await?;
    let count = rows.len();
    store.restore(rows);
    debug!(records = count, "store restored");
    Ok(count)
}

/// Persist every record of `store`. Returns how many rows were written.
pub async fn save_store(storage: &Storage, store: &ActivityStore) -> Result<usize> {
    let rows = store.snapshot(&RecordFilter::default(), SortKey::PageSlugAsc);
    storage.save_records(&rows).await
}
