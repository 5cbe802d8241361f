//! Monitoring State Cache
//!
//! Dashboard-ready aggregates derived from committed snapshots. The state is
//! a pure read of the database and can be rebuilt from scratch at any time;
//! it is never consulted by the pipeline itself.

use crate::db::{pulsars, snapshots, toas, warnings};
use crate::error::PipelineResult;
use crate::models::{FitMode, ParamValue, PulsarSource, Residual, TimingSolutionSnapshot};
use crate::utils::write_atomic;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tmg_common::events::WarningEvent;
use tmg_common::human_time::format_last_updated;
use tmg_common::pipeline_config::CheckerThresholds;
use tmg_common::time::mjd_day_to_date;
use tmg_common::GlobalConfig;

pub const STATE_FILE: &str = "state.json";
pub const LAST_RUN_FILE: &str = "last_run.json";

/// One calendar day in the TOA heatmap
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatmapCell {
    pub count: i64,
    /// Count scaled to 0..=1 against the busiest day in the window
    pub intensity: f64,
}

/// Per-day TOA counts across every pulsar, keyed `YYYY-MM-DD`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Heatmap {
    pub start_mjd: Option<i64>,
    pub end_mjd: Option<i64>,
    pub days: BTreeMap<String, HeatmapCell>,
}

/// Latest fitted solution of one pulsar
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestSolution {
    pub snapshot_id: i64,
    pub committed_at: DateTime<Utc>,
    pub fit_mode: FitMode,
    pub fitted_params: BTreeMap<String, ParamValue>,
    pub uncertainties: BTreeMap<String, f64>,
    pub chi2_reduced: f64,
    pub ntoa: usize,
    pub span_start_mjd: f64,
    pub span_end_mjd: f64,
}

impl From<&TimingSolutionSnapshot> for LatestSolution {
    fn from(s: &TimingSolutionSnapshot) -> Self {
        Self {
            snapshot_id: s.id,
            committed_at: s.committed_at,
            fit_mode: s.fit_mode,
            fitted_params: s.fitted_params.clone(),
            uncertainties: s.uncertainties.clone(),
            chi2_reduced: s.chi2_reduced,
            ntoa: s.ntoa,
            span_start_mjd: s.span_start_mjd,
            span_end_mjd: s.span_end_mjd,
        }
    }
}

/// Downloadable files for one pulsar
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifacts {
    pub parfile: PathBuf,
    pub tim: PathBuf,
    /// Most recent retained workspace (kept after failed fits)
    pub diagnostics: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PulsarState {
    pub psr_id: String,
    pub tag: String,
    pub last_status: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_updated_text: Option<String>,
    pub latest: Option<LatestSolution>,
    /// From the latest snapshot only
    pub residuals: Vec<Residual>,
    pub warnings: Vec<WarningEvent>,
    pub warning_count: usize,
    /// Sum of warning severity levels
    pub warning_score: u32,
    pub artifacts: Artifacts,
}

/// One pulsar's point on the population trend plots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub psr_id: String,
    pub ra_deg: Option<f64>,
    pub dec_deg: Option<f64>,
    /// Spin period (s)
    pub period: Option<f64>,
    pub period_derivative: Option<f64>,
    pub dm: Option<f64>,
    pub ntoa: usize,
    pub chi2r: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringState {
    pub generated_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_updated_text: Option<String>,
    pub heatmap: Heatmap,
    /// Highest warning score first
    pub pulsars: Vec<PulsarState>,
    /// Trend points grouped by display tag
    pub trends: BTreeMap<String, Vec<TrendPoint>>,
}

/// Rebuild the monitoring state for the given pulsars
pub async fn refresh(
    db: &SqlitePool,
    sources: &[PulsarSource],
    config: &GlobalConfig,
    workspace_dir: &Path,
    now: DateTime<Utc>,
) -> PipelineResult<MonitoringState> {
    let mut states = Vec::with_capacity(sources.len());
    let mut trends: BTreeMap<String, Vec<TrendPoint>> = BTreeMap::new();
    let mut daily: BTreeMap<i64, i64> = BTreeMap::new();

    for source in sources {
        let psr_id = source.psr_id.as_str();
        let row = pulsars::get_pulsar(db, psr_id).await?;
        let latest = snapshots::latest(db, psr_id).await?;
        let current = warnings::current_for_pulsar(db, psr_id).await?;

        for (day, n) in toas::daily_counts(db, psr_id).await? {
            *daily.entry(day).or_default() += n;
        }

        let tag = row
            .as_ref()
            .map(|r| r.tag.clone())
            .unwrap_or_else(|| crate::config::DEFAULT_TAG.to_string());

        if let Some(snapshot) = &latest {
            if passes_trend_gates(snapshot, &config.checker) {
                trends.entry(tag.clone()).or_default().push(trend_point(snapshot));
            }
        }

        let last_updated = latest.as_ref().map(|s| s.committed_at);
        states.push(PulsarState {
            psr_id: psr_id.to_string(),
            tag,
            last_status: row.and_then(|r| r.last_status),
            last_updated,
            last_updated_text: last_updated.map(|ts| format_last_updated(ts, now)),
            residuals: latest.as_ref().map(|s| s.residuals.clone()).unwrap_or_default(),
            latest: latest.as_ref().map(LatestSolution::from),
            warning_count: current.len(),
            warning_score: current.iter().map(|w| w.severity.level()).sum(),
            warnings: current,
            artifacts: Artifacts {
                parfile: source.parfile_path(),
                tim: source.tim_path(),
                diagnostics: latest_workspace(workspace_dir, psr_id),
            },
        });
    }

    states.sort_by(|a, b| {
        b.warning_score
            .cmp(&a.warning_score)
            .then_with(|| a.psr_id.cmp(&b.psr_id))
    });

    let last_updated = states.iter().filter_map(|s| s.last_updated).max();

    Ok(MonitoringState {
        generated_at: now,
        last_updated,
        last_updated_text: last_updated.map(|ts| format_last_updated(ts, now)),
        heatmap: build_heatmap(&daily, config.monitor.heatmap_days),
        pulsars: states,
        trends,
    })
}

/// Window of `days` days ending at the latest day with TOAs, zero-filled
pub fn build_heatmap(daily: &BTreeMap<i64, i64>, days: u32) -> Heatmap {
    let Some(&end) = daily.keys().next_back() else {
        return Heatmap::default();
    };
    let start = end - i64::from(days.max(1)) + 1;

    let max = daily
        .range(start..=end)
        .map(|(_, n)| *n)
        .max()
        .unwrap_or(0);

    let mut cells = BTreeMap::new();
    for day in start..=end {
        let Some(date) = mjd_day_to_date(day) else { continue };
        let count = daily.get(&day).copied().unwrap_or(0);
        let intensity = if max > 0 { count as f64 / max as f64 } else { 0.0 };
        cells.insert(
            date.format("%Y-%m-%d").to_string(),
            HeatmapCell { count, intensity },
        );
    }

    Heatmap {
        start_mjd: Some(start),
        end_mjd: Some(end),
        days: cells,
    }
}

/// Pulsars with unreliable fits or short baselines stay off the trend plots
fn passes_trend_gates(snapshot: &TimingSolutionSnapshot, t: &CheckerThresholds) -> bool {
    snapshot.chi2_reduced <= t.chi2r_threshold && snapshot.span_days() >= t.min_span_days
}

fn trend_point(s: &TimingSolutionSnapshot) -> TrendPoint {
    let f0 = s.f0().filter(|f| *f != 0.0);
    TrendPoint {
        psr_id: s.psr_id.clone(),
        ra_deg: s.param_text("RAJ").and_then(|v| sexagesimal_to_degrees(&v, 15.0)),
        dec_deg: s.param_text("DECJ").and_then(|v| sexagesimal_to_degrees(&v, 1.0)),
        period: f0.map(|f| 1.0 / f),
        period_derivative: f0.zip(s.f1()).map(|(f0, f1)| -f1 / (f0 * f0)),
        dm: s.dm(),
        ntoa: s.ntoa,
        chi2r: s.chi2_reduced,
    }
}

/// `[+-]dd:mm:ss.s` to degrees; `scale` is 15 for hour angles
pub fn sexagesimal_to_degrees(value: &str, scale: f64) -> Option<f64> {
    let value = value.trim();
    let (sign, body) = match value.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, value.strip_prefix('+').unwrap_or(value)),
    };

    let mut total = 0.0;
    let mut divisor = 1.0;
    for part in body.split(':') {
        let v: f64 = part.parse().ok()?;
        total += v / divisor;
        divisor *= 60.0;
    }
    Some(sign * total * scale)
}

/// Newest `<workspace>/<psr>__*` directory, if any were kept
fn latest_workspace(workspace_dir: &Path, psr_id: &str) -> Option<PathBuf> {
    let pattern = workspace_dir.join(format!("{}__*", glob::Pattern::escape(psr_id)));
    glob::glob(&pattern.to_string_lossy())
        .ok()?
        .filter_map(Result::ok)
        .filter(|p| p.is_dir())
        .filter_map(|p| {
            let modified = p.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, p)| p)
}

/// Write any serializable report atomically into the monitor directory
pub async fn write_json<T: Serialize>(dir: &Path, file_name: &str, value: &T) -> PipelineResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    let json = serde_json::to_string_pretty(value)?;
    write_atomic(&path, &json).await?;
    Ok(path)
}

/// Write `state.json` atomically
pub async fn write_state(dir: &Path, state: &MonitoringState) -> PipelineResult<PathBuf> {
    write_json(dir, STATE_FILE, state).await
}
