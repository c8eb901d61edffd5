//! Application configuration for wikiactivity.
//!
//! User config lives at `~/.wikiactivity/wikiactivity.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, WikiActivityError};
use crate::types::{GroupBy, Site, SortKey};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "wikiactivity.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".wikiactivity";

/// Wikidot's recent-changes feed path, relative to the site root.
const DEFAULT_FEED_PATH: &str = "feed/site-changes.xml";

/// Sitemap path, relative to the site root.
const DEFAULT_SITEMAP_PATH: &str = "sitemap.xml";

// ---------------------------------------------------------------------------
// Config structs (matching wikiactivity.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Which pages count as content.
    #[serde(default)]
    pub filters: FiltersConfig,

    /// Report shape.
    #[serde(default)]
    pub report: ReportConfig,

    /// Configured wiki instances.
    #[serde(default)]
    pub sites: Vec<SiteEntry>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Number of sites processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Budget for one site's whole fetch+merge pipeline.
    #[serde(default = "default_site_timeout_secs")]
    pub site_timeout_secs: u64,

    /// Largest payload accepted from a source.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    /// How many levels of sitemap indexes are followed.
    #[serde(default = "default_max_sitemap_depth")]
    pub max_sitemap_depth: u32,

    /// Window for the recent edit / active user counts.
    #[serde(default = "default_recent_days")]
    pub recent_days: u32,

    /// Path to the activity database.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            site_timeout_secs: default_site_timeout_secs(),
            max_payload_bytes: default_max_payload_bytes(),
            max_sitemap_depth: default_max_sitemap_depth(),
            recent_days: default_recent_days(),
            database: default_database(),
        }
    }
}

fn default_concurrency() -> u32 {
    4
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_site_timeout_secs() -> u64 {
    180
}
fn default_max_payload_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_max_sitemap_depth() -> u32 {
    2
}
fn default_recent_days() -> u32 {
    30
}
fn default_database() -> String {
    "~/.wikiactivity/activity.db".into()
}

/// `[filters]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Namespaces whose pages are not content (Wikidot system pages).
    #[serde(default = "default_excluded_namespaces")]
    pub excluded_namespaces: Vec<String>,

    /// Skip `forum/...` URLs found in sitemaps.
    #[serde(default = "default_true")]
    pub exclude_forum: bool,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            excluded_namespaces: default_excluded_namespaces(),
            exclude_forum: true,
        }
    }
}

fn default_excluded_namespaces() -> Vec<String> {
    [
        "system",
        "poll",
        "forum",
        "nav",
        "search",
        "admin",
        "info",
        "deleted",
        "random",
        "more-by",
        "workbench",
        "component",
        "fragment",
        "theme",
        "attribution",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_true() -> bool {
    true
}

/// `[report]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub group_by: GroupBy,

    #[serde(default)]
    pub sort_by: SortKey,

    /// Rows per group.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            group_by: GroupBy::default(),
            sort_by: SortKey::default(),
            limit: default_limit(),
        }
    }
}

fn default_limit() -> usize {
    25
}

/// `[[sites]]` entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteEntry {
    pub site_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub language_code: String,
    pub base_url: String,
    /// Defaults to `<base_url>/feed/site-changes.xml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,
    /// Defaults to `<base_url>/sitemap.xml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sitemap_url: Option<String>,
}

impl SiteEntry {
    /// Resolve this entry into an immutable [`Site`].
    pub fn resolve(&self) -> Result<Site> {
        if self.site_id.trim().is_empty() {
            return Err(WikiActivityError::config("site_id must not be empty"));
        }

        let mut base_url = parse_absolute(&self.site_id, "base_url", &self.base_url)?;
        // Joining relative paths needs a trailing slash on the base.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let feed_url = match &self.feed_url {
            Some(raw) => parse_absolute(&self.site_id, "feed_url", raw)?,
            None => join(&base_url, DEFAULT_FEED_PATH)?,
        };
        let sitemap_url = match &self.sitemap_url {
            Some(raw) => parse_absolute(&self.site_id, "sitemap_url", raw)?,
            None => join(&base_url, DEFAULT_SITEMAP_PATH)?,
        };

        Ok(Site {
            site_id: self.site_id.clone(),
            name: self.name.clone(),
            language_code: self.language_code.to_lowercase(),
            base_url,
            feed_url,
            sitemap_url,
        })
    }
}

fn parse_absolute(site_id: &str, field: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| WikiActivityError::config(format!("site {site_id}: invalid {field} '{raw}': {e}")))?;
    if url.host_str().is_none() {
        return Err(WikiActivityError::config(format!(
            "site {site_id}: {field} has no host: {raw}"
        )));
    }
    Ok(url)
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| WikiActivityError::config(format!("cannot join {path} onto {base}: {e}")))
}

impl AppConfig {
    /// Resolve and validate all configured sites.
    pub fn resolve_sites(&self) -> Result<Vec<Site>> {
        let mut seen = HashSet::new();
        let mut sites = Vec::with_capacity(self.sites.len());
        for entry in &self.sites {
            if !seen.insert(entry.site_id.as_str()) {
                return Err(WikiActivityError::config(format!(
                    "duplicate site_id: {}",
                    entry.site_id
                )));
            }
            sites.push(entry.resolve()?);
        }
        Ok(sites)
    }

    /// Database path with a leading `~` expanded.
    pub fn database_path(&self) -> Result<PathBuf> {
        expand_home(&self.defaults.database)
    }
}

fn expand_home(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| WikiActivityError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime cycle configuration: merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum sites processed at once.
    pub concurrency: u32,
    /// Time budget per site pipeline.
    pub site_timeout: Duration,
    /// Levels of nested sitemap indexes to follow.
    pub max_sitemap_depth: u32,
    /// Window for recent-activity summaries.
    pub recent_days: u32,
    /// Namespaces excluded from the content record.
    pub excluded_namespaces: Vec<String>,
    /// Skip forum URLs.
    pub exclude_forum: bool,
    /// Largest payload fetched or decoded, in bytes.
    pub max_payload_bytes: u64,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.defaults.concurrency.max(1),
            site_timeout: Duration::from_secs(config.defaults.site_timeout_secs),
            max_sitemap_depth: config.defaults.max_sitemap_depth,
            recent_days: config.defaults.recent_days,
            excluded_namespaces: config.filters.excluded_namespaces.clone(),
            exclude_forum: config.filters.exclude_forum,
            max_payload_bytes: config.defaults.max_payload_bytes,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.wikiactivity/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| WikiActivityError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.wikiactivity/wikiactivity.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| WikiActivityError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        WikiActivityError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| WikiActivityError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| WikiActivityError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| WikiActivityError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("concurrency"));
        assert!(toml_str.contains("workbench"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.concurrency, 4);
        assert_eq!(parsed.report.limit, 25);
        assert_eq!(parsed.report.sort_by, SortKey::LastModifiedDesc);
    }

    #[test]
    fn config_with_sites() {
        let toml_str = r#"
[defaults]
database = "/tmp/activity.db"

[report]
group_by = "language"

[[sites]]
site_id = "scp-wiki"
language_code = "EN"
base_url = "https://scp-wiki.wikidot.com"

[[sites]]
site_id = "scp-fr"
language_code = "fr"
base_url = "http://fondationscp.wikidot.com/"
feed_url = "http://fondationscp.wikidot.com/feed/pages.xml"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.report.group_by, GroupBy::Language);

        let sites = config.resolve_sites().expect("resolve");
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].language_code, "en");
        assert_eq!(
            sites[0].feed_url.as_str(),
            "https://scp-wiki.wikidot.com/feed/site-changes.xml"
        );
        assert_eq!(
            sites[0].sitemap_url.as_str(),
            "https://scp-wiki.wikidot.com/sitemap.xml"
        );
        assert_eq!(
            sites[1].feed_url.as_str(),
            "http://fondationscp.wikidot.com/feed/pages.xml"
        );
        assert_eq!(
            config.database_path().expect("db path"),
            PathBuf::from("/tmp/activity.db")
        );
    }

    #[test]
    fn duplicate_site_ids_rejected() {
        let entry = SiteEntry {
            site_id: "a".into(),
            name: None,
            language_code: "en".into(),
            base_url: "https://a.wikidot.com".into(),
            feed_url: None,
            sitemap_url: None,
        };
        let config = AppConfig {
            sites: vec![entry.clone(), entry],
            ..AppConfig::default()
        };
        let err = config.resolve_sites().unwrap_err();
        assert!(err.to_string().contains("duplicate site_id"));
    }

    #[test]
    fn relative_base_url_rejected() {
        let entry = SiteEntry {
            site_id: "a".into(),
            name: None,
            language_code: "en".into(),
            base_url: "a.wikidot.com".into(),
            feed_url: None,
            sitemap_url: None,
        };
        assert!(entry.resolve().is_err());
    }

    #[test]
    fn run_config_from_app_config() {
        let app = AppConfig::default();
        let run = RunConfig::from(&app);
        assert_eq!(run.concurrency, 4);
        assert_eq!(run.max_sitemap_depth, 2);
        assert!(run.exclude_forum);
        assert!(run.excluded_namespaces.iter().any(|ns| ns == "system"));
    }
}
