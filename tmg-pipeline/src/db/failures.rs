//! Extraction failure ledger
//!
//! A file whose TOA extraction failed is retried on later runs until it has
//! used up `max_extraction_attempts`.

use sqlx::{Row, SqliteConnection, SqlitePool};
use tmg_common::time::to_db_timestamp;
use tmg_common::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub raw_data_id: i64,
    pub attempts: i64,
    pub last_error: String,
}

/// Record one more failed attempt for a file
pub async fn record_failure(
    pool: &SqlitePool,
    psr_id: &str,
    raw_data_id: i64,
    error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO extraction_failures (psr_id, raw_data_id, attempts, last_error, last_attempt_at)
        VALUES (?, ?, 1, ?, ?)
        ON CONFLICT(psr_id, raw_data_id) DO UPDATE SET
            attempts = attempts + 1,
            last_error = excluded.last_error,
            last_attempt_at = excluded.last_attempt_at
        "#,
    )
    .bind(psr_id)
    .bind(raw_data_id)
    .bind(error)
    .bind(to_db_timestamp(tmg_common::time::now()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Forget failures for files that now have TOAs
pub async fn clear_for_files(
    conn: &mut SqliteConnection,
    psr_id: &str,
    raw_data_ids: &[i64],
) -> Result<()> {
    for id in raw_data_ids {
        sqlx::query("DELETE FROM extraction_failures WHERE psr_id = ? AND raw_data_id = ?")
            .bind(psr_id)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn list_for_pulsar(pool: &SqlitePool, psr_id: &str) -> Result<Vec<FailureRecord>> {
    let rows = sqlx::query(
        "SELECT raw_data_id, attempts, last_error FROM extraction_failures WHERE psr_id = ? ORDER BY raw_data_id",
    )
    .bind(psr_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| FailureRecord {
            raw_data_id: row.get("raw_data_id"),
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
        })
        .collect())
}
