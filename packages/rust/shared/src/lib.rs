//! Shared types, error model, and configuration for wikiactivity.
//!
//! This crate is the foundation depended on by all other wikiactivity crates.
//! It provides:
//! - [`WikiActivityError`]: the unified error type
//! - Domain types ([`Site`], [`RawEntry`], [`NormalizedEntry`], [`ActivityRecord`], [`PageKey`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, FiltersConfig, ReportConfig, RunConfig, SiteEntry, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{Result, WikiActivityError};
pub use types::{
    ActivityRecord, Extra, GroupBy, NormalizedEntry, PageKey, RawEntry, RunId, Site, SortKey,
    SourceKind, page_namespace,
};
