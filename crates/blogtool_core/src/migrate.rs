//! Embedded schema migrations for the content database.
//!
//! Applied versions are recorded in `schema_migrations`; each migration runs in
//! its own transaction together with its bookkeeping row.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

const SCHEMA: &[(u32, &str, &str)] = &[
    (1, "baseline", include_str!("migrations/v001_baseline.sql")),
    (2, "indexes", include_str!("migrations/v002_indexes.sql")),
    (3, "run_journal", include_str!("migrations/v003_run_journal.sql")),
];

pub fn latest_version() -> u32 {
    SCHEMA.last().map_or(0, |(version, _, _)| *version)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaStatus {
    pub version: u32,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateReport {
    /// `v003_run_journal` style labels, in application order.
    pub applied: Vec<String>,
    pub version: u32,
}

/// Opens (creating if needed) the database file and brings it to the latest schema.
pub fn migrate_database(db_path: &Path) -> Result<MigrateReport> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let connection = open_connection(db_path)?;
    migrate_connection(&connection)
}

pub fn migrate_connection(connection: &Connection) -> Result<MigrateReport> {
    ensure_bookkeeping(connection)?;
    let mut version = applied_version(connection)?;
    let mut applied = Vec::new();

    for (step, name, sql) in SCHEMA.iter().filter(move |(step, _, _)| *step > version) {
        let label = format!("v{step:03}_{name}");
        let transaction = connection
            .unchecked_transaction()
            .with_context(|| format!("failed to begin {label}"))?;
        transaction
            .execute_batch(sql)
            .with_context(|| format!("failed to apply {label}"))?;
        transaction
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![i64::from(*step), name, chrono::Utc::now().timestamp()],
            )
            .with_context(|| format!("failed to record {label}"))?;
        transaction
            .commit()
            .with_context(|| format!("failed to commit {label}"))?;

        tracing::debug!(migration = %label, "applied schema migration");
        version = *step;
        applied.push(label);
    }

    Ok(MigrateReport { applied, version })
}

/// Schema version of an existing database file without migrating it.
/// A missing file reports version 0 with every migration pending.
pub fn schema_status(db_path: &Path) -> Result<SchemaStatus> {
    let version = if db_path.exists() {
        let connection = open_connection(db_path)?;
        let has_table: Option<String> = connection
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up schema_migrations")?;
        match has_table {
            Some(_) => applied_version(&connection)?,
            None => 0,
        }
    } else {
        0
    };
    Ok(SchemaStatus {
        version,
        pending: SCHEMA.iter().filter(|(step, _, _)| *step > version).count(),
    })
}

fn ensure_bookkeeping(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations")
}

fn applied_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read schema version")?;
    u32::try_from(version).context("schema version out of range")
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}
