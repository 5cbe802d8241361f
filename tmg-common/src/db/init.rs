//! Database initialization
//!
//! Creates the timing schema on first run and opens it unchanged afterwards.
//! Every statement is `IF NOT EXISTS`, so initialization is safe to repeat.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// SQLite busy timeout applied to every pooled connection
pub const BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pragmas go on the connect options so every pooled connection gets them,
    // not just whichever connection happens to run a PRAGMA statement.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all timing tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_raw_data_table(pool).await?;
    create_pulsars_table(pool).await?;
    create_toas_table(pool).await?;
    create_extraction_failures_table(pool).await?;
    create_snapshots_table(pool).await?;
    create_warnings_table(pool).await?;
    Ok(())
}

/// `ALTER TABLE ... ADD COLUMN` when `PRAGMA table_info` lacks the column
async fn add_missing_column(pool: &SqlitePool, table: &str, column: &str, sql_type: &str) -> Result<()> {
    let existing: Vec<String> = sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{}')", table))
        .fetch_all(pool)
        .await?;
    if existing.iter().any(|name| name == column) {
        return Ok(());
    }
    sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, sql_type))
        .execute(pool)
        .await?;
    info!(table, column, "Added missing column");
    Ok(())
}

/// Master Database catalog: one row per discovered observation file
async fn create_raw_data_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            psr_id TEXT NOT NULL,
            ar_id TEXT NOT NULL,
            location TEXT NOT NULL UNIQUE,
            mjd REAL NOT NULL,
            backend TEXT NOT NULL,
            checksum TEXT,
            size INTEGER NOT NULL DEFAULT 0,
            format TEXT,
            status TEXT NOT NULL DEFAULT 'good' CHECK (status IN ('good', 'corrupted')),
            notes TEXT,
            catalogued_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // (pulsar, epoch, backend) is catalogued at most once among usable files
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_data_epoch
            ON raw_data(psr_id, backend, mjd) WHERE status = 'good'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_raw_data_psr ON raw_data(psr_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_pulsars_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pulsars (
            psr_id TEXT PRIMARY KEY,
            source_dir TEXT NOT NULL,
            tag TEXT NOT NULL DEFAULT 'untagged',
            effective_config TEXT,
            last_status TEXT,
            last_run_at TEXT,
            last_updated TEXT,
            consecutive_fit_failures INTEGER NOT NULL DEFAULT 0,
            claimed_by TEXT,
            claimed_at TEXT,
            notes TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before run claims existed
    add_missing_column(pool, "pulsars", "claimed_by", "TEXT").await?;
    add_missing_column(pool, "pulsars", "claimed_at", "TEXT").await?;

    Ok(())
}

/// Per-pulsar TOA set; rows are immutable once written
async fn create_toas_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS toas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            psr_id TEXT NOT NULL REFERENCES pulsars(psr_id),
            raw_data_id INTEGER NOT NULL REFERENCES raw_data(id),
            backend TEXT NOT NULL,
            template_version TEXT NOT NULL,
            source_name TEXT NOT NULL,
            obs_mjd REAL NOT NULL,
            arrival TEXT NOT NULL,
            arrival_mjd REAL NOT NULL,
            uncertainty_us REAL NOT NULL,
            freq_mhz REAL NOT NULL,
            telescope TEXT NOT NULL,
            jump_value REAL NOT NULL DEFAULT 0,
            jump_uncertainty REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(psr_id, raw_data_id, template_version, arrival)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_toas_psr_mjd ON toas(psr_id, arrival_mjd)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_extraction_failures_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_failures (
            psr_id TEXT NOT NULL,
            raw_data_id INTEGER NOT NULL REFERENCES raw_data(id),
            attempts INTEGER NOT NULL DEFAULT 1,
            last_error TEXT NOT NULL,
            last_attempt_at TEXT NOT NULL,
            PRIMARY KEY (psr_id, raw_data_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Timing solution history; committed_at_us strictly increases per pulsar
async fn create_snapshots_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            psr_id TEXT NOT NULL REFERENCES pulsars(psr_id),
            committed_at TEXT NOT NULL,
            committed_at_us INTEGER NOT NULL,
            fit_mode TEXT NOT NULL CHECK (fit_mode IN ('incremental', 'full_refit')),
            fitted_params TEXT NOT NULL,
            uncertainties TEXT NOT NULL,
            chi2 REAL NOT NULL,
            chi2_reduced REAL NOT NULL,
            span_start_mjd REAL NOT NULL,
            span_end_mjd REAL NOT NULL,
            ntoa INTEGER NOT NULL,
            residuals TEXT NOT NULL,
            parfile TEXT NOT NULL,
            UNIQUE(psr_id, committed_at_us)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_warnings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS warnings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            psr_id TEXT NOT NULL REFERENCES pulsars(psr_id),
            snapshot_id INTEGER REFERENCES snapshots(id),
            run_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            severity INTEGER NOT NULL,
            message TEXT NOT NULL,
            metric REAL,
            threshold REAL,
            epoch_mjd REAL,
            raised_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_warnings_identity
            ON warnings(psr_id, snapshot_id, kind) WHERE snapshot_id IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
