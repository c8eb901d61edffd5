//! libSQL persistence for activity records and the ingest run ledger.
//!
//! **Access rules:**
//! - `run` / `ingest`: read-write via [`Storage::open`]
//! - `report`: read-only via [`Storage::open_readonly`]

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use serde::Serialize;
use wikiactivity_shared::{ActivityRecord, PageKey, Result, RunId, SourceKind, WikiActivityError};

use crate::migrations;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// One row of the `ingest_runs` ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestRun {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub sites: Vec<String>,
    pub stats_json: Option<String>,
}

fn storage_err(e: impl std::fmt::Display) -> WikiActivityError {
    WikiActivityError::Storage(e.to_string())
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WikiActivityError::Storage(format!("invalid date {s:?}: {e}")))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WikiActivityError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(WikiActivityError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    WikiActivityError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(WikiActivityError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Activity records
    // -----------------------------------------------------------------------

    /// Upsert records in one transaction. Returns the number written.
    ///
    /// An existing row never loses revisions or gets a later `first_seen_at`.
    pub async fn save_records(&self, rows: &[(PageKey, ActivityRecord)]) -> Result<usize> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        for (key, record) in rows {
            let sources = record
                .last_seen_sources
                .iter()
                .map(SourceKind::as_str)
                .collect::<Vec<_>>()
                .join(",");
            let revisions = serde_json::to_string(
                &record.revision_timestamps.iter().map(format_ts).collect::<Vec<_>>(),
            )
            .map_err(storage_err)?;

            tx.execute(
                "INSERT INTO activity (site_id, page_slug, title, first_seen_at, last_modified_at,
                                       last_seen_sources, revision_count_estimate, revision_timestamps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(site_id, page_slug) DO UPDATE SET
                    title = COALESCE(excluded.title, activity.title),
                    first_seen_at = MIN(activity.first_seen_at, excluded.first_seen_at),
                    last_modified_at = excluded.last_modified_at,
                    last_seen_sources = excluded.last_seen_sources,
                    revision_count_estimate = MAX(activity.revision_count_estimate,
                                                  excluded.revision_count_estimate),
                    revision_timestamps = excluded.revision_timestamps",
                params![
                    key.site_id.as_str(),
                    key.page_slug.as_str(),
                    record.title.as_deref(),
                    format_ts(&record.first_seen_at),
                    format_ts(&record.last_modified_at),
                    sources,
                    record.revision_count_estimate as i64,
                    revisions
                ],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(rows.len())
    }

    /// Load every record, checking the invariants each must satisfy.
    pub async fn load_records(&self) -> Result<Vec<(PageKey, ActivityRecord)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT site_id, page_slug, title, first_seen_at, last_modified_at,
                        last_seen_sources, revision_count_estimate, revision_timestamps
                 FROM activity ORDER BY site_id, page_slug",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    /// Number of stored records.
    pub async fn count_records(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM activity", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Ingest run ledger
    // -----------------------------------------------------------------------

    /// Record the start of an ingest cycle.
    pub async fn insert_run(&self, run_id: &RunId, sites: &[String]) -> Result<()> {
        self.check_writable()?;
        let now = format_ts(&Utc::now());
        let sites = sites.join(",");
        self.conn
            .execute(
                "INSERT INTO ingest_runs (id, started_at, sites) VALUES (?1, ?2, ?3)",
                params![run_id.to_string(), now, sites],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Close an ingest cycle with its statistics.
    pub async fn finish_run(&self, run_id: &RunId, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = format_ts(&Utc::now());
        self.conn
            .execute(
                "UPDATE ingest_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now, stats_json, run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<IngestRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, sites, stats_json
                 FROM ingest_runs ORDER BY id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let sites: String = row.get(3).map_err(storage_err)?;
            runs.push(IngestRun {
                id: row.get(0).map_err(storage_err)?,
                started_at: row.get(1).map_err(storage_err)?,
                finished_at: row.get(2).ok(),
                sites: sites
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                stats_json: row.get(4).ok(),
            });
        }
        Ok(runs)
    }
}

fn row_to_record(row: &libsql::Row) -> Result<(PageKey, ActivityRecord)> {
    let site_id: String = row.get(0).map_err(storage_err)?;
    let page_slug: String = row.get(1).map_err(storage_err)?;
    let title: Option<String> = row.get(2).ok();
    let first_seen: String = row.get(3).map_err(storage_err)?;
    let last_modified: String = row.get(4).map_err(storage_err)?;
    let sources: String = row.get(5).map_err(storage_err)?;
    let revision_count: i64 = row.get(6).map_err(storage_err)?;
    let revisions_json: String = row.get(7).map_err(storage_err)?;

    let last_seen_sources = sources
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<SourceKind>().map_err(WikiActivityError::Storage))
        .collect::<Result<BTreeSet<_>>>()?;

    let revision_strings: Vec<String> = serde_json::from_str(&revisions_json).map_err(storage_err)?;
    let revision_timestamps = revision_strings
        .iter()
        .map(|s| parse_ts(s))
        .collect::<Result<BTreeSet<_>>>()?;

    let key = PageKey::new(site_id, page_slug);
    let record = ActivityRecord {
        title,
        first_seen_at: parse_ts(&first_seen)?,
        last_modified_at: parse_ts(&last_modified)?,
        last_seen_sources,
        revision_count_estimate: u64::try_from(revision_count).map_err(storage_err)?,
        revision_timestamps,
    };
    record
        .validate()
        .map_err(|e| WikiActivityError::validation(format!("record {key}: {e}")))?;
    Ok((key, record))
}
