//! TOA set queries
//!
//! Writes only happen inside the snapshot commit transaction, so they take a
//! connection rather than the pool.

use crate::models::Toa;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tmg_common::pipeline_config::ToaJump;
use tmg_common::time::to_db_timestamp;
use tmg_common::{BackendId, Result};

/// Append TOAs; a TOA already present is left untouched
pub async fn insert_toas(conn: &mut SqliteConnection, toas: &[Toa]) -> Result<u64> {
    let created_at = to_db_timestamp(tmg_common::time::now());
    let mut inserted = 0;

    for toa in toas {
        let result = sqlx::query(
            r#"
            INSERT INTO toas (psr_id, raw_data_id, backend, template_version, source_name, obs_mjd,
                              arrival, arrival_mjd, uncertainty_us, freq_mhz, telescope,
                              jump_value, jump_uncertainty, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&toa.psr_id)
        .bind(toa.raw_data_id)
        .bind(toa.backend.as_str())
        .bind(&toa.template_version)
        .bind(&toa.source_name)
        .bind(toa.obs_mjd)
        .bind(&toa.arrival)
        .bind(toa.arrival_mjd)
        .bind(toa.uncertainty_us)
        .bind(toa.freq_mhz)
        .bind(&toa.telescope)
        .bind(toa.jump.value)
        .bind(toa.jump.uncertainty)
        .bind(&created_at)
        .execute(&mut *conn)
        .await?;
        inserted += result.rows_affected();
    }

    Ok(inserted)
}

/// Drop a pulsar's whole TOA set (full reprocess only)
pub async fn delete_for_pulsar(conn: &mut SqliteConnection, psr_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM toas WHERE psr_id = ?")
        .bind(psr_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

/// Current TOA set ordered by arrival time
pub async fn load_toas(pool: &SqlitePool, psr_id: &str) -> Result<Vec<Toa>> {
    let rows = sqlx::query(
        r#"
        SELECT psr_id, raw_data_id, backend, template_version, source_name, obs_mjd, arrival,
               arrival_mjd, uncertainty_us, freq_mhz, telescope, jump_value, jump_uncertainty
        FROM toas
        WHERE psr_id = ?
        ORDER BY arrival_mjd, id
        "#,
    )
    .bind(psr_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let backend: String = row.get("backend");
            Toa {
                psr_id: row.get("psr_id"),
                raw_data_id: row.get("raw_data_id"),
                backend: BackendId::new(backend),
                template_version: row.get("template_version"),
                obs_mjd: row.get("obs_mjd"),
                source_name: row.get("source_name"),
                arrival: row.get("arrival"),
                arrival_mjd: row.get("arrival_mjd"),
                uncertainty_us: row.get("uncertainty_us"),
                freq_mhz: row.get("freq_mhz"),
                telescope: row.get("telescope"),
                jump: ToaJump::new(row.get("jump_value"), row.get("jump_uncertainty")),
            }
        })
        .collect())
}

pub async fn count_for_pulsar(pool: &SqlitePool, psr_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM toas WHERE psr_id = ?")
        .bind(psr_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// TOA count per integer MJD day for one pulsar
pub async fn daily_counts(pool: &SqlitePool, psr_id: &str) -> Result<Vec<(i64, i64)>> {
    let rows = sqlx::query(
        r#"
        SELECT CAST(arrival_mjd AS INTEGER) AS day, COUNT(*) AS n
        FROM toas
        WHERE psr_id = ?
        GROUP BY day
        ORDER BY day
        "#,
    )
    .bind(psr_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|row| (row.get("day"), row.get("n"))).collect())
}
