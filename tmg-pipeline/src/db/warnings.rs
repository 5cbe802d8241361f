//! Warning persistence

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tmg_common::events::{Severity, WarningEvent, WarningKind};
use tmg_common::time::{parse_db_timestamp, to_db_timestamp};
use tmg_common::Result;
use uuid::Uuid;

const SELECT_COLUMNS: &str =
    "psr_id, snapshot_id, kind, severity, message, metric, threshold, epoch_mjd, raised_at";

/// Store fired warnings. Re-storing the same (pulsar, snapshot, kind) is a no-op.
pub async fn insert_warnings(
    pool: &SqlitePool,
    run_id: Uuid,
    warnings: &[WarningEvent],
) -> Result<u64> {
    let mut inserted = 0;
    for w in warnings {
        let result = sqlx::query(
            r#"
            INSERT INTO warnings (psr_id, snapshot_id, run_id, kind, severity, message,
                                  metric, threshold, epoch_mjd, raised_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&w.psr_id)
        .bind(w.snapshot_id)
        .bind(run_id.to_string())
        .bind(w.kind.as_str())
        .bind(w.severity.level() as i64)
        .bind(&w.message)
        .bind(w.metric)
        .bind(w.threshold)
        .bind(w.epoch_mjd)
        .bind(to_db_timestamp(w.raised_at))
        .execute(pool)
        .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

/// Warnings raised against one snapshot
pub async fn for_snapshot(pool: &SqlitePool, snapshot_id: i64) -> Result<Vec<WarningEvent>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM warnings WHERE snapshot_id = ? ORDER BY id");
    let rows = sqlx::query(&sql).bind(snapshot_id).fetch_all(pool).await?;
    rows.iter().map(row_to_warning).collect()
}

/// Warnings currently standing for a pulsar: those of its latest snapshot,
/// plus fit failures raised since that snapshot was committed.
pub async fn current_for_pulsar(pool: &SqlitePool, psr_id: &str) -> Result<Vec<WarningEvent>> {
    let sql = format!(
        r#"
        SELECT {SELECT_COLUMNS} FROM warnings
        WHERE psr_id = ?1
          AND (
            snapshot_id = (SELECT id FROM snapshots WHERE psr_id = ?1
                           ORDER BY committed_at_us DESC LIMIT 1)
            OR (snapshot_id IS NULL
                AND raised_at > COALESCE((SELECT MAX(committed_at) FROM snapshots WHERE psr_id = ?1), ''))
          )
        ORDER BY id
        "#
    );
    let rows = sqlx::query(&sql).bind(psr_id).fetch_all(pool).await?;
    rows.iter().map(row_to_warning).collect()
}

fn row_to_warning(row: &SqliteRow) -> Result<WarningEvent> {
    let kind: String = row.get("kind");
    let severity: i64 = row.get("severity");
    let raised_at: String = row.get("raised_at");

    Ok(WarningEvent {
        psr_id: row.get("psr_id"),
        snapshot_id: row.get("snapshot_id"),
        kind: kind.parse::<WarningKind>()?,
        severity: Severity::from_level(severity),
        message: row.get("message"),
        metric: row.get("metric"),
        threshold: row.get("threshold"),
        epoch_mjd: row.get("epoch_mjd"),
        raised_at: parse_db_timestamp(&raised_at)?,
    })
}
