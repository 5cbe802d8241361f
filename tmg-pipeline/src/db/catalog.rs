//! Master Database catalog queries (`raw_data` table)
//!
//! Append-only: rows are inserted once and never updated or deleted.

use crate::models::{FileStatus, NewObservation, ObservationFile};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use tmg_common::time::{parse_db_timestamp, to_db_timestamp};
use tmg_common::{BackendId, Result};

const SELECT_COLUMNS: &str = "r.id, r.psr_id, r.ar_id, r.location, r.mjd, r.backend, r.checksum, \
     r.size, r.format, r.status, r.catalogued_at";

/// Insert an observation unless its path or (pulsar, backend, epoch) is
/// already catalogued. Returns true when a row was written.
pub async fn insert_observation(pool: &SqlitePool, obs: &NewObservation) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO raw_data (psr_id, ar_id, location, mjd, backend, checksum, size, format, status, catalogued_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&obs.psr_id)
    .bind(&obs.ar_id)
    .bind(obs.location.to_string_lossy().as_ref())
    .bind(obs.mjd)
    .bind(obs.backend.as_str())
    .bind(&obs.checksum)
    .bind(obs.size)
    .bind(&obs.format)
    .bind(obs.status.as_str())
    .bind(to_db_timestamp(tmg_common::time::now()))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// True when the path is already catalogued (lets the scan skip hashing)
pub async fn is_catalogued(pool: &SqlitePool, location: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM raw_data WHERE location = ?")
        .bind(location)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// Good files for a pulsar that have no TOAs yet and have not exhausted
/// their extraction attempts, oldest epoch first.
pub async fn list_unprocessed(
    pool: &SqlitePool,
    psr_id: &str,
    max_attempts: u32,
) -> Result<Vec<ObservationFile>> {
    let sql = format!(
        r#"
        SELECT {SELECT_COLUMNS}
        FROM raw_data r
        LEFT JOIN extraction_failures f
            ON f.raw_data_id = r.id AND f.psr_id = r.psr_id
        WHERE r.psr_id = ?
          AND r.status = 'good'
          AND NOT EXISTS (SELECT 1 FROM toas t WHERE t.raw_data_id = r.id)
          AND COALESCE(f.attempts, 0) < ?
        ORDER BY r.mjd, r.id
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(psr_id)
        .bind(max_attempts as i64)
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_observation).collect()
}

/// Every good file for a pulsar regardless of processing state (full refit)
pub async fn list_good_files(pool: &SqlitePool, psr_id: &str) -> Result<Vec<ObservationFile>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM raw_data r \
         WHERE r.psr_id = ? AND r.status = 'good' ORDER BY r.mjd, r.id"
    );
    let rows = sqlx::query(&sql).bind(psr_id).fetch_all(pool).await?;
    rows.iter().map(row_to_observation).collect()
}

/// Operator view: every row for one pulsar, including corrupted placeholders
pub async fn list_for_pulsar(pool: &SqlitePool, psr_id: &str) -> Result<Vec<ObservationFile>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM raw_data r WHERE r.psr_id = ? ORDER BY r.mjd, r.id"
    );
    let rows = sqlx::query(&sql).bind(psr_id).fetch_all(pool).await?;
    rows.iter().map(row_to_observation).collect()
}

pub async fn count_all(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_data")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn row_to_observation(row: &SqliteRow) -> Result<ObservationFile> {
    let location: String = row.get("location");
    let backend: String = row.get("backend");
    let status: String = row.get("status");
    let catalogued_at: String = row.get("catalogued_at");

    Ok(ObservationFile {
        id: row.get("id"),
        psr_id: row.get("psr_id"),
        ar_id: row.get("ar_id"),
        location: PathBuf::from(location),
        mjd: row.get("mjd"),
        backend: BackendId::new(backend),
        checksum: row.get("checksum"),
        size: row.get("size"),
        format: row.get("format"),
        status: FileStatus::parse(&status),
        catalogued_at: parse_db_timestamp(&catalogued_at)?,
    })
}
