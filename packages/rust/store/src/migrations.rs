//! SQL migration definitions for the wikiactivity database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: activity records",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (site, page). Timestamps are RFC 3339 UTC with fixed
-- precision so that text comparison orders them.
CREATE TABLE IF NOT EXISTS activity (
    site_id                 TEXT NOT NULL,
    page_slug               TEXT NOT NULL,
    title                   TEXT,
    first_seen_at           TEXT NOT NULL,
    last_modified_at        TEXT NOT NULL,
    last_seen_sources       TEXT NOT NULL,
    revision_count_estimate INTEGER NOT NULL CHECK (revision_count_estimate >= 1),
    revision_timestamps     TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (site_id, page_slug)
);

CREATE INDEX IF NOT EXISTS idx_activity_last_modified ON activity(site_id, last_modified_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Ingest run ledger",
            sql: r#"
CREATE TABLE IF NOT EXISTS ingest_runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    sites       TEXT NOT NULL,
    stats_json  TEXT
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
