//! Timing solution snapshot persistence
//!
//! A snapshot and the TOAs it was fitted on are committed in one transaction.
//! Readers either see the whole snapshot (fitted values, residuals, TOAs) or
//! the previous one.

use crate::db::{failures, toas};
use crate::models::{FitMode, SnapshotDraft, TimingSolutionSnapshot, Toa};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tmg_common::time::{parse_db_timestamp, to_db_timestamp};
use tmg_common::{Error, Result};

const SELECT_COLUMNS: &str = "id, psr_id, committed_at, fit_mode, fitted_params, uncertainties, \
     chi2, chi2_reduced, span_start_mjd, span_end_mjd, ntoa, residuals, parfile";

/// Commit a fitted snapshot together with the TOAs it added.
///
/// With `replace_toas` the pulsar's previous TOA set is deleted first, inside
/// the same transaction. The commit time is forced strictly after the
/// pulsar's previous snapshot.
pub async fn commit_snapshot(
    pool: &SqlitePool,
    draft: SnapshotDraft,
    new_toas: &[Toa],
    replace_toas: bool,
) -> Result<TimingSolutionSnapshot> {
    let mut tx = pool.begin().await?;

    if replace_toas {
        toas::delete_for_pulsar(&mut *tx, &draft.psr_id).await?;
    }
    toas::insert_toas(&mut *tx, new_toas).await?;

    let mut processed: Vec<i64> = new_toas.iter().map(|t| t.raw_data_id).collect();
    processed.sort_unstable();
    processed.dedup();
    failures::clear_for_files(&mut *tx, &draft.psr_id, &processed).await?;

    let last_us: Option<i64> =
        sqlx::query_scalar("SELECT MAX(committed_at_us) FROM snapshots WHERE psr_id = ?")
            .bind(&draft.psr_id)
            .fetch_one(&mut *tx)
            .await?;
    let committed_at = next_commit_time(tmg_common::time::now(), last_us)?;
    let committed_at_str = to_db_timestamp(committed_at);

    let result = sqlx::query(
        r#"
        INSERT INTO snapshots (psr_id, committed_at, committed_at_us, fit_mode, fitted_params,
                               uncertainties, chi2, chi2_reduced, span_start_mjd, span_end_mjd,
                               ntoa, residuals, parfile)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&draft.psr_id)
    .bind(&committed_at_str)
    .bind(committed_at.timestamp_micros())
    .bind(draft.fit_mode.as_str())
    .bind(serde_json::to_string(&draft.fitted_params)?)
    .bind(serde_json::to_string(&draft.uncertainties)?)
    .bind(draft.chi2)
    .bind(draft.chi2_reduced)
    .bind(draft.span_start_mjd)
    .bind(draft.span_end_mjd)
    .bind(draft.ntoa as i64)
    .bind(serde_json::to_string(&draft.residuals)?)
    .bind(&draft.parfile)
    .execute(&mut *tx)
    .await?;
    let id = result.last_insert_rowid();

    sqlx::query(
        "UPDATE pulsars SET last_updated = ?, consecutive_fit_failures = 0 WHERE psr_id = ?",
    )
    .bind(&committed_at_str)
    .bind(&draft.psr_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(TimingSolutionSnapshot::from_draft(id, committed_at, draft))
}

/// `now`, or one microsecond after the previous commit if the clock has not
/// moved past it
fn next_commit_time(now: DateTime<Utc>, last_us: Option<i64>) -> Result<DateTime<Utc>> {
    let mut micros = now.timestamp_micros();
    if let Some(last) = last_us {
        if micros <= last {
            micros = last + 1;
        }
    }
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| Error::Internal(format!("Commit time out of range: {}", micros)))
}

pub async fn latest(pool: &SqlitePool, psr_id: &str) -> Result<Option<TimingSolutionSnapshot>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM snapshots WHERE psr_id = ? ORDER BY committed_at_us DESC LIMIT 1"
    );
    let row = sqlx::query(&sql).bind(psr_id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_snapshot).transpose()
}

/// Up to `limit` snapshots committed before `before_id`, oldest first
pub async fn history_before(
    pool: &SqlitePool,
    psr_id: &str,
    before_id: i64,
    limit: usize,
) -> Result<Vec<TimingSolutionSnapshot>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM snapshots WHERE psr_id = ? AND id <> ? \
         AND committed_at_us < (SELECT committed_at_us FROM snapshots WHERE id = ?) \
         ORDER BY committed_at_us DESC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(psr_id)
        .bind(before_id)
        .bind(before_id)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    let mut history = rows.iter().map(row_to_snapshot).collect::<Result<Vec<_>>>()?;
    history.reverse();
    Ok(history)
}

/// Commit times in order, for auditing monotonicity
pub async fn commit_times(pool: &SqlitePool, psr_id: &str) -> Result<Vec<DateTime<Utc>>> {
    let values: Vec<String> = sqlx::query_scalar(
        "SELECT committed_at FROM snapshots WHERE psr_id = ? ORDER BY id",
    )
    .bind(psr_id)
    .fetch_all(pool)
    .await?;
    values.iter().map(|v| parse_db_timestamp(v)).collect()
}

pub async fn count_for_pulsar(pool: &SqlitePool, psr_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots WHERE psr_id = ?")
        .bind(psr_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn row_to_snapshot(row: &SqliteRow) -> Result<TimingSolutionSnapshot> {
    let committed_at: String = row.get("committed_at");
    let fit_mode: String = row.get("fit_mode");
    let fitted_params: String = row.get("fitted_params");
    let uncertainties: String = row.get("uncertainties");
    let residuals: String = row.get("residuals");
    let ntoa: i64 = row.get("ntoa");

    Ok(TimingSolutionSnapshot {
        id: row.get("id"),
        psr_id: row.get("psr_id"),
        committed_at: parse_db_timestamp(&committed_at)?,
        fit_mode: FitMode::parse(&fit_mode),
        fitted_params: serde_json::from_str(&fitted_params)?,
        uncertainties: serde_json::from_str(&uncertainties)?,
        chi2: row.get("chi2"),
        chi2_reduced: row.get("chi2_reduced"),
        span_start_mjd: row.get("span_start_mjd"),
        span_end_mjd: row.get("span_end_mjd"),
        ntoa: ntoa.max(0) as usize,
        residuals: serde_json::from_str(&residuals)?,
        parfile: row.get("parfile"),
    })
}
