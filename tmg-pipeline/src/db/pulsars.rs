//! Pulsar status table queries

use crate::models::PulsarSource;
use sqlx::{Row, SqlitePool};
use tmg_common::time::{parse_db_timestamp, to_db_timestamp};
use tmg_common::Result;

/// Stored status of one pulsar
#[derive(Debug, Clone, PartialEq)]
pub struct PulsarRow {
    pub psr_id: String,
    pub source_dir: String,
    pub tag: String,
    pub effective_config: Option<String>,
    pub last_status: Option<String>,
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
    pub consecutive_fit_failures: i64,
}

/// Register a pulsar the first time its source directory is seen
pub async fn ensure_pulsar(pool: &SqlitePool, source: &PulsarSource) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pulsars (psr_id, source_dir)
        VALUES (?, ?)
        ON CONFLICT(psr_id) DO UPDATE SET source_dir = excluded.source_dir
        "#,
    )
    .bind(&source.psr_id)
    .bind(source.dir.to_string_lossy().as_ref())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_effective_config(pool: &SqlitePool, psr_id: &str) -> Result<Option<String>> {
    let stored: Option<Option<String>> =
        sqlx::query_scalar("SELECT effective_config FROM pulsars WHERE psr_id = ?")
            .bind(psr_id)
            .fetch_optional(pool)
            .await?;
    Ok(stored.flatten())
}

pub async fn store_effective_config(
    pool: &SqlitePool,
    psr_id: &str,
    config_json: &str,
    tag: &str,
) -> Result<()> {
    sqlx::query("UPDATE pulsars SET effective_config = ?, tag = ? WHERE psr_id = ?")
        .bind(config_json)
        .bind(tag)
        .bind(psr_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Bump the consecutive fit failure counter, returning the new value
pub async fn increment_fit_failures(pool: &SqlitePool, psr_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        UPDATE pulsars
        SET consecutive_fit_failures = consecutive_fit_failures + 1
        WHERE psr_id = ?
        RETURNING consecutive_fit_failures
        "#,
    )
    .bind(psr_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Record how the latest run went for a pulsar
pub async fn set_last_status(pool: &SqlitePool, psr_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE pulsars SET last_status = ?, last_run_at = ? WHERE psr_id = ?")
        .bind(status)
        .bind(to_db_timestamp(tmg_common::time::now()))
        .bind(psr_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_pulsar(pool: &SqlitePool, psr_id: &str) -> Result<Option<PulsarRow>> {
    let row = sqlx::query(
        r#"
        SELECT psr_id, source_dir, tag, effective_config, last_status, last_updated, consecutive_fit_failures
        FROM pulsars WHERE psr_id = ?
        "#,
    )
    .bind(psr_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let last_updated: Option<String> = row.get("last_updated");
            Ok(Some(PulsarRow {
                psr_id: row.get("psr_id"),
                source_dir: row.get("source_dir"),
                tag: row.get("tag"),
                effective_config: row.get("effective_config"),
                last_status: row.get("last_status"),
                last_updated: last_updated.as_deref().map(parse_db_timestamp).transpose()?,
                consecutive_fit_failures: row.get("consecutive_fit_failures"),
            }))
        }
        None => Ok(None),
    }
}

/// Claim a pulsar for one run, across processes sharing the database.
///
/// Succeeds when the pulsar is unclaimed, already held by `run_id`, or held
/// by a claim taken before `stale_before` (a run that died holding it).
pub async fn try_claim(
    pool: &SqlitePool,
    psr_id: &str,
    run_id: &str,
    stale_before: chrono::DateTime<chrono::Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE pulsars
        SET claimed_by = ?, claimed_at = ?
        WHERE psr_id = ?
          AND (claimed_by IS NULL OR claimed_by = ? OR claimed_at < ?)
        "#,
    )
    .bind(run_id)
    .bind(to_db_timestamp(tmg_common::time::now()))
    .bind(psr_id)
    .bind(run_id)
    .bind(to_db_timestamp(stale_before))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Drop the claim if `run_id` still holds it
pub async fn release_claim(pool: &SqlitePool, psr_id: &str, run_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE pulsars SET claimed_by = NULL, claimed_at = NULL WHERE psr_id = ? AND claimed_by = ?",
    )
    .bind(psr_id)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn claim_holder(pool: &SqlitePool, psr_id: &str) -> Result<Option<String>> {
    let holder: Option<Option<String>> =
        sqlx::query_scalar("SELECT claimed_by FROM pulsars WHERE psr_id = ?")
            .bind(psr_id)
            .fetch_optional(pool)
            .await?;
    Ok(holder.flatten())
}
