//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use wikiactivity_core::fetch::{FetchOptions, HttpFetcher};
use wikiactivity_core::pipeline::{
    CycleReport, IngestSettings, ProgressReporter, SiteReport, SourceStatus, ingest_payload, load_store,
    run_cycle, save_store,
};
use wikiactivity_core::projector::{ActivitySnapshot, ProjectionFilter, project};
use wikiactivity_shared::{
    AppConfig, GroupBy, RunConfig, RunId, Site, SortKey, SourceKind, init_config, load_config,
    load_config_from,
};
use wikiactivity_store::{ActivityStore, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// wikiactivity: unified page activity for a network of wikis.
#[derive(Parser)]
#[command(
    name = "wikiactivity",
    version,
    about = "Aggregate wiki feeds and sitemaps into one activity record per page.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.wikiactivity/wikiactivity.toml).
    #[arg(long, global = true, env = "WIKIACTIVITY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Report output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run one ingest cycle over the configured sites.
    Run {
        /// Only these site ids (comma-separated).
        #[arg(long, value_delimiter = ',')]
        sites: Vec<String>,

        /// Do not load or save the database.
        #[arg(long)]
        no_persist: bool,

        /// Print the cycle report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Merge a local feed or sitemap file for one site.
    Ingest {
        /// Site id the payload belongs to.
        #[arg(long)]
        site: String,

        /// Payload kind: feed or sitemap.
        #[arg(long)]
        kind: SourceKind,

        /// Payload file (may be gzip-compressed).
        file: PathBuf,
    },

    /// Report on the persisted activity record.
    Report {
        /// Group rows by site or language.
        #[arg(long)]
        group_by: Option<GroupBy>,

        /// last-modified, revisions or slug.
        #[arg(long)]
        sort_by: Option<SortKey>,

        /// Rows per group.
        #[arg(long)]
        limit: Option<usize>,

        /// Only these site ids (comma-separated).
        #[arg(long, value_delimiter = ',')]
        sites: Vec<String>,

        /// Only these language codes (comma-separated).
        #[arg(long, value_delimiter = ',')]
        languages: Vec<String>,

        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// List configured sites.
    Sites,

    /// Show recent ingest runs.
    Runs {
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "wikiactivity=info,wikiactivity_core=info,wikiactivity_sources=warn",
        1 => "wikiactivity=debug,wikiactivity_core=debug,wikiactivity_sources=info,wikiactivity_store=info",
        _ => "wikiactivity=trace,wikiactivity_core=trace,wikiactivity_sources=trace,wikiactivity_normalize=trace,wikiactivity_store=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run {
            sites,
            no_persist,
            json,
        } => cmd_run(config_path.as_deref(), &sites, !no_persist, json).await,
        Command::Ingest { site, kind, file } => {
            cmd_ingest(config_path.as_deref(), &site, kind, &file).await
        }
        Command::Report {
            group_by,
            sort_by,
            limit,
            sites,
            languages,
            format,
        } => {
            let config = load(config_path.as_deref())?;
            let opts = ReportOptions {
                group_by: group_by.unwrap_or(config.report.group_by),
                sort_by: sort_by.unwrap_or(config.report.sort_by),
                limit: limit.unwrap_or(config.report.limit),
                sites,
                languages,
                format,
            };
            cmd_report(&config, &opts).await
        }
        Command::Sites => cmd_sites(config_path.as_deref()),
        Command::Runs { limit } => cmd_runs(config_path.as_deref(), limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

fn load(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Configured sites, restricted to `wanted` when non-empty.
fn select_sites(config: &AppConfig, wanted: &[String]) -> Result<Vec<Site>> {
    let sites = config.resolve_sites()?;
    if sites.is_empty() {
        return Err(eyre!("no sites configured; add [[sites]] entries to the config file"));
    }
    if wanted.is_empty() {
        return Ok(sites);
    }
    for id in wanted {
        if !sites.iter().any(|s| &s.site_id == id) {
            return Err(eyre!("unknown site '{id}'"));
        }
    }
    Ok(sites.into_iter().filter(|s| wanted.contains(&s.site_id)).collect())
}

// ---------------------------------------------------------------------------
// run / ingest
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, wanted: &[String], persist: bool, json: bool) -> Result<()> {
    let config = load(config_path)?;
    let sites = select_sites(&config, wanted)?;
    let run_config = RunConfig::from(&config);
    let store = Arc::new(ActivityStore::new());

    let storage = if persist {
        let storage = Storage::open(&config.database_path()?).await?;
        let restored = load_store(&storage, &store).await?;
        info!(records = restored, "loaded activity records");
        Some(storage)
    } else {
        None
    };

    let run_id = RunId::new();
    let site_ids: Vec<String> = sites.iter().map(|s| s.site_id.clone()).collect();
    if let Some(storage) = &storage {
        storage.insert_run(&run_id, &site_ids).await?;
    }

    let fetcher = Arc::new(HttpFetcher::new(&FetchOptions::from(&config))?);
    let progress = CliProgress::new(sites.len());
    let report = run_cycle(run_id, &sites, &run_config, fetcher, Arc::clone(&store), &progress).await;

    if let Some(storage) = &storage {
        let saved = save_store(storage, &store).await?;
        storage.finish_run(&report.run_id, &report.stats_json()?).await?;
        info!(records = saved, "saved activity records");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_cycle(&report));
    }
    Ok(())
}

async fn cmd_ingest(config_path: Option<&Path>, site_id: &str, kind: SourceKind, file: &Path) -> Result<()> {
    let config = load(config_path)?;
    let site = select_sites(&config, &[site_id.to_string()])?
        .into_iter()
        .next()
        .ok_or_else(|| eyre!("unknown site '{site_id}'"))?;
    let body = std::fs::read(file).map_err(|e| eyre!("cannot read {}: {e}", file.display()))?;

    let storage = Storage::open(&config.database_path()?).await?;
    let store = ActivityStore::new();
    load_store(&storage, &store).await?;

    let run_id = RunId::new();
    storage.insert_run(&run_id, &[site.site_id.clone()]).await?;

    let settings = IngestSettings::from_config(&RunConfig::from(&config));
    let outcome = ingest_payload(body, Utc::now(), kind, &site, &settings, &store, &AtomicBool::new(false))?;

    save_store(&storage, &store).await?;
    let stats = serde_json::json!({ "totals": outcome.counts, "file": file.display().to_string() });
    storage.finish_run(&run_id, &stats.to_string()).await?;

    let c = outcome.counts;
    println!();
    println!("  Ingested {} ({}) into {}", file.display(), outcome.format, site.site_id);
    println!("  Entries:     {}", c.entries_seen);
    println!("  Created:     {}", c.created);
    println!("  Updated:     {}", c.updated);
    println!("  Duplicates:  {}", c.duplicates);
    println!("  Corrections: {}", c.corrections);
    println!("  Skipped:     {} malformed, {} unresolvable, {} filtered", c.skipped_malformed, c.normalization_failures, c.filtered);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// report
// ---------------------------------------------------------------------------

struct ReportOptions {
    group_by: GroupBy,
    sort_by: SortKey,
    limit: usize,
    sites: Vec<String>,
    languages: Vec<String>,
    format: OutputFormat,
}

async fn cmd_report(config: &AppConfig, opts: &ReportOptions) -> Result<()> {
    let sites = config.resolve_sites()?;
    let storage = Storage::open_readonly(&config.database_path()?).await?;
    let store = ActivityStore::new();
    load_store(&storage, &store).await?;

    let filter = ProjectionFilter {
        site_ids: non_empty_set(opts.sites.iter().cloned()),
        language_codes: non_empty_set(opts.languages.iter().map(|l| l.to_lowercase())),
        excluded_namespaces: config.filters.excluded_namespaces.iter().cloned().collect(),
    };
    let limit = (opts.limit > 0).then_some(opts.limit);
    let snapshot = project(&store, &sites, opts.group_by, opts.sort_by, limit, &filter);

    match opts.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        OutputFormat::Text => print!("{}", render_snapshot(&snapshot)),
    }
    Ok(())
}

fn non_empty_set(values: impl Iterator<Item = String>) -> Option<BTreeSet<String>> {
    let set: BTreeSet<String> = values.collect();
    (!set.is_empty()).then_some(set)
}

fn render_snapshot(snapshot: &ActivitySnapshot) -> String {
    let mut out = String::new();
    if snapshot.groups.is_empty() {
        out.push_str("No activity recorded yet.\n");
        return out;
    }
    for group in &snapshot.groups {
        out.push_str(&format!(
            "\n{} ({} of {} pages)\n",
            group.label,
            group.rows.len(),
            group.total
        ));
        for row in &group.rows {
            let sources: Vec<&str> = row.record.last_seen_sources.iter().map(|s| s.as_str()).collect();
            out.push_str(&format!(
                "  {}  rev {:>3}  {:<40} {}  [{}]\n",
                row.record.last_modified_at.format("%Y-%m-%d %H:%M"),
                row.record.revision_count_estimate,
                row.page_slug,
                row.record.title.as_deref().unwrap_or("-"),
                sources.join(",")
            ));
        }
    }
    out
}

fn render_cycle(report: &CycleReport) -> String {
    let mut out = format!("\n  Run {}\n", report.run_id);
    for site in &report.sites {
        let c = &site.counts;
        let status = if site.timed_out {
            "timed out"
        } else if site.available() {
            "ok"
        } else {
            "unavailable"
        };
        out.push_str(&format!(
            "  {:<24} {:<11} {:>5} entries  {:>4} new  {:>4} updated  {:>3} corrected  {:>3} skipped\n",
            site.site_id, status, c.entries_seen, c.created, c.updated, c.corrections, c.skipped_malformed
        ));
        for source in site.sources.iter().filter(|s| s.status != SourceStatus::Ok) {
            out.push_str(&format!(
                "      {} {}: {}\n",
                source.kind,
                source.url,
                source.error.as_deref().unwrap_or("failed")
            ));
        }
        if let Some(summary) = &site.summary {
            let edits = summary
                .recent_edits
                .map_or_else(|| "?".to_string(), |n| n.to_string());
            let users = summary
                .active_users
                .map_or_else(|| "?".to_string(), |n| n.to_string());
            out.push_str(&format!(
                "      {} pages, {} edits by {} users in {} days{}\n",
                summary.content_pages,
                edits,
                users,
                summary.window_days,
                if summary.feed_window_saturated { " (feed window saturated)" } else { "" }
            ));
        }
    }
    let totals = report.totals();
    out.push_str(&format!(
        "\n  {} merged, {} new, {} updated, {} corrections, {} skipped, {} unresolvable\n\n",
        totals.merged,
        totals.created,
        totals.updated,
        totals.corrections,
        totals.skipped_malformed,
        totals.normalization_failures
    ));
    out
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar over sites.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn site_finished(&self, report: &SiteReport, completed: usize, _total: usize) {
        self.bar.set_position(completed as u64);
        self.bar.set_message(format!("{} done", report.site_id));
    }

    fn done(&self, _report: &CycleReport) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// sites / runs / config
// ---------------------------------------------------------------------------

fn cmd_sites(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let sites = config.resolve_sites()?;
    if sites.is_empty() {
        println!("No sites configured.");
        return Ok(());
    }
    for site in sites {
        println!("{:<24} {:<4} {}", site.site_id, site.language_code, site.display_name());
        println!("    feed:    {}", site.feed_url);
        println!("    sitemap: {}", site.sitemap_url);
    }
    Ok(())
}

async fn cmd_runs(config_path: Option<&Path>, limit: usize) -> Result<()> {
    let config = load(config_path)?;
    let storage = Storage::open_readonly(&config.database_path()?).await?;
    let runs = storage.list_runs(limit).await?;
    println!("{} page records stored", storage.count_records().await?);
    if runs.is_empty() {
        println!("No runs recorded yet.");
    }
    for run in runs {
        println!(
            "{}  {} -> {}  [{}]",
            run.id,
            run.started_at,
            run.finished_at.as_deref().unwrap_or("unfinished"),
            run.sites.join(",")
        );
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::TimeZone;
    use wikiactivity_core::projector::{ActivityGroup, ActivityRow};
    use wikiactivity_shared::ActivityRecord;

    use super::*;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from(["wikiactivity", "run", "--sites", "a,b", "--no-persist"]).expect("parse");
        match cli.command {
            Command::Run { sites, no_persist, json } => {
                assert_eq!(sites, vec!["a", "b"]);
                assert!(no_persist);
                assert!(!json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_report_options() {
        let cli = Cli::try_parse_from([
            "wikiactivity",
            "report",
            "--group-by",
            "language",
            "--sort-by",
            "revisions",
            "--format",
            "json",
        ])
        .expect("parse");
        match cli.command {
            Command::Report { group_by, sort_by, format, .. } => {
                assert_eq!(group_by, Some(GroupBy::Language));
                assert_eq!(sort_by, Some(SortKey::RevisionCountDesc));
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn rejects_unknown_source_kind() {
        assert!(Cli::try_parse_from(["wikiactivity", "ingest", "--site", "a", "--kind", "wiki", "f.xml"]).is_err());
    }

    #[test]
    fn text_snapshot_lists_rows() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).single().expect("date");
        let mut record = ActivityRecord::new(ts);
        record.title = Some("SCP-173".into());
        record.last_seen_sources = BTreeSet::from([SourceKind::Feed, SourceKind::Sitemap]);
        let snapshot = ActivitySnapshot {
            group_by: GroupBy::Site,
            sort_by: SortKey::LastModifiedDesc,
            groups: vec![ActivityGroup {
                key: "scp-wiki".into(),
                label: "SCP Wiki".into(),
                total: 1,
                rows: vec![ActivityRow {
                    site_id: "scp-wiki".into(),
                    site_name: "SCP Wiki".into(),
                    language_code: "en".into(),
                    page_slug: "scp-173".into(),
                    record,
                }],
            }],
        };

        let text = render_snapshot(&snapshot);
        assert!(text.contains("SCP Wiki (1 of 1 pages)"));
        assert!(text.contains("2024-01-05 10:00"));
        assert!(text.contains("[feed,sitemap]"));
        assert_eq!(render_snapshot(&ActivitySnapshot { groups: vec![], ..snapshot }), "No activity recorded yet.\n");
    }
}
