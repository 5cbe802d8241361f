//! Per-Pulsar Pipeline
//!
//! One call processes one pulsar end to end: select candidate observation
//! files, extract TOAs, fit, commit a snapshot, run the anomaly checker,
//! update the parameter and tim files.
//!
//! **Failure domains**
//! - Extraction failure for one file: recorded in the failure ledger, the
//!   file is skipped, the rest continue.
//! - Fit failure: nothing is committed, the previous snapshot stands, a
//!   high-severity warning is raised.
//! - Export failure after commit: logged; the snapshot and its warnings stand
//!   and the pulsar still succeeds. The next successful commit rewrites both
//!   files.
//! - Anything else bubbles up to the orchestrator, which reports the pulsar
//!   as failed and moves on.

use crate::config::EffectiveConfig;
use crate::db::{catalog, failures, pulsars, snapshots, toas, warnings};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    toa::render_tim, FitMode, ObservationFile, PulsarSource, SnapshotDraft, TimingSolutionSnapshot,
    Toa,
};
use crate::services::anomaly_checker;
use crate::services::fitter::{FitOutput, FitRequest};
use crate::services::master_database::sha256_file;
use crate::services::parfile::Parfile;
use crate::utils::{retry_on_lock, write_atomic, RetryPolicy};
use crate::PipelineContext;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tmg_common::events::{Severity, TmgEvent, WarningEvent, WarningKind};
use tmg_common::time::file_stamp;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Snapshots of history handed to the checker
const CHECKER_HISTORY: usize = 32;
/// Hex digits of the template checksum used as its version
const TEMPLATE_VERSION_LEN: usize = 16;

/// How the next fit is built, chosen once per pulsar per run
#[derive(Debug, Clone, PartialEq)]
pub enum FitPlan {
    /// Extend the prior solution with newly extracted TOAs
    Incremental {
        prior_parfile: PathBuf,
        prior_toas: Vec<Toa>,
        new_toas: Vec<Toa>,
    },
    /// Restart from the static parameter file with a freshly extracted set
    FullRefit {
        static_parfile: PathBuf,
        all_toas: Vec<Toa>,
    },
}

impl FitPlan {
    pub fn select(
        cfg: &EffectiveConfig,
        source: &PulsarSource,
        prior_toas: Vec<Toa>,
        extracted: Vec<Toa>,
    ) -> Self {
        if cfg.reset_params {
            FitPlan::FullRefit {
                static_parfile: source.initial_parfile_path(),
                all_toas: extracted,
            }
        } else {
            FitPlan::Incremental {
                prior_parfile: source.parfile_path(),
                prior_toas: prior_toas
                    .into_iter()
                    .filter(|t| !cfg.is_ignored(t.obs_mjd) && cfg.accepts_backend(&t.backend))
                    .collect(),
                new_toas: extracted,
            }
        }
    }

    pub fn mode(&self) -> FitMode {
        match self {
            FitPlan::Incremental { .. } => FitMode::Incremental,
            FitPlan::FullRefit { .. } => FitMode::FullRefit,
        }
    }

    /// Parameter file the fit starts from
    pub fn base_parfile(&self) -> &Path {
        match self {
            FitPlan::Incremental { prior_parfile, .. } => prior_parfile,
            FitPlan::FullRefit { static_parfile, .. } => static_parfile,
        }
    }

    /// TOAs written by the commit
    pub fn new_toas(&self) -> &[Toa] {
        match self {
            FitPlan::Incremental { new_toas, .. } => new_toas,
            FitPlan::FullRefit { all_toas, .. } => all_toas,
        }
    }

    /// Whether the commit replaces the stored TOA set
    pub fn replaces_toas(&self) -> bool {
        matches!(self, FitPlan::FullRefit { .. })
    }

    /// Every TOA the fit runs over, ordered by arrival time
    pub fn fit_toas(&self) -> Vec<Toa> {
        let mut all: Vec<Toa> = match self {
            FitPlan::Incremental {
                prior_toas,
                new_toas,
                ..
            } => prior_toas.iter().chain(new_toas).cloned().collect(),
            FitPlan::FullRefit { all_toas, .. } => all_toas.clone(),
        };
        all.sort_by(|a, b| a.arrival_mjd.total_cmp(&b.arrival_mjd));
        all
    }
}

/// Outcome of one pulsar
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PulsarStatus {
    Succeeded { snapshot_id: i64 },
    Skipped { reason: String },
    Failed { error: String },
}

impl PulsarStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PulsarStatus::Succeeded { .. } => "succeeded",
            PulsarStatus::Skipped { .. } => "skipped",
            PulsarStatus::Failed { .. } => "failed",
        }
    }
}

/// Per-pulsar entry of the run report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PulsarReport {
    pub psr_id: String,
    pub status: PulsarStatus,
    pub new_toas: usize,
    pub extraction_failures: usize,
    pub warnings: Vec<WarningEvent>,
}

impl PulsarReport {
    fn new(psr_id: &str, status: PulsarStatus) -> Self {
        Self {
            psr_id: psr_id.to_string(),
            status,
            new_toas: 0,
            extraction_failures: 0,
            warnings: Vec::new(),
        }
    }

    pub fn failed(psr_id: &str, error: impl Into<String>) -> Self {
        Self::new(
            psr_id,
            PulsarStatus::Failed {
                error: error.into(),
            },
        )
    }
}

/// Process one pulsar with its resolved configuration
pub async fn process(
    ctx: &PipelineContext,
    source: &PulsarSource,
    cfg: &EffectiveConfig,
) -> PipelineResult<PulsarReport> {
    let psr_id = source.psr_id.as_str();
    ensure_initial_parfile(source).await?;
    let template_version = template_version(&source.template_path()).await?;

    let candidates = select_candidates(ctx, cfg).await?;
    if candidates.is_empty() {
        let reason = if cfg.reset_params {
            "reset requested but no eligible observations"
        } else {
            "no new observations"
        };
        debug!(psr_id, reason, "Nothing to do");
        return Ok(PulsarReport::new(
            psr_id,
            PulsarStatus::Skipped {
                reason: reason.to_string(),
            },
        ));
    }

    info!(psr_id, candidates = candidates.len(), reset = cfg.reset_params, "Extracting TOAs");
    let (extracted, extraction_failures) =
        extract_all(ctx, source, cfg, &candidates, &template_version).await?;

    let mut report = PulsarReport::new(psr_id, PulsarStatus::Skipped { reason: String::new() });
    report.extraction_failures = extraction_failures;

    if extracted.is_empty() {
        report.status = PulsarStatus::Skipped {
            reason: format!("all {} candidate file(s) failed extraction", candidates.len()),
        };
        return Ok(report);
    }

    let prior_toas = if cfg.reset_params {
        Vec::new()
    } else {
        toas::load_toas(&ctx.db, psr_id).await?
    };
    let plan = FitPlan::select(cfg, source, prior_toas, extracted);
    let fit_toas = plan.fit_toas();
    report.new_toas = plan.new_toas().len();

    let min_toas = ctx.config.pipeline.min_toas;
    if fit_toas.len() < min_toas {
        report.status = PulsarStatus::Skipped {
            reason: format!("{} TOA(s) available, at least {} needed", fit_toas.len(), min_toas),
        };
        report.new_toas = 0;
        return Ok(report);
    }

    // Parameter file the fitter sees: base plus backend jumps
    let mut parfile = Parfile::load(plan.base_parfile()).await?;
    let backends: BTreeSet<_> = fit_toas.iter().map(|t| t.backend.clone()).collect();
    for backend in &backends {
        if parfile.add_jump(backend, cfg.jump_for(backend)) {
            debug!(psr_id, backend = %backend, "Added backend JUMP");
        }
    }

    let workspace = ctx
        .layout
        .workspace_dir()
        .join(format!("{}__{}", psr_id, Uuid::new_v4()));
    tokio::fs::create_dir_all(&workspace).await?;
    let request = FitRequest {
        psr_id: psr_id.to_string(),
        parfile: workspace.join("pulsar.par"),
        tim: workspace.join("pulsar.tim"),
        fit_params: cfg.fit_params.clone(),
        workspace: workspace.clone(),
    };
    tokio::fs::write(&request.parfile, parfile.render()).await?;
    tokio::fs::write(&request.tim, render_tim(&fit_toas)).await?;

    let output = match ctx.fitter.fit(&request).await {
        Ok(output) => output,
        Err(e) => {
            error!(psr_id, workspace = %workspace.display(), error = %e, "Fit failed, keeping previous snapshot");
            report.warnings = record_fit_failure(ctx, psr_id, &e).await?;
            report.status = PulsarStatus::Failed {
                error: e.to_string(),
            };
            report.new_toas = 0;
            return Ok(report);
        }
    };

    parfile.apply_fitted(&output.fitted_params, &output.uncertainties);
    let draft = build_draft(psr_id, plan.mode(), &fit_toas, output, parfile.render());

    let snapshot = retry_on_lock("snapshot commit", RetryPolicy::default(), || {
        snapshots::commit_snapshot(&ctx.db, draft.clone(), plan.new_toas(), plan.replaces_toas())
    })
    .await?;

    info!(
        psr_id,
        snapshot_id = snapshot.id,
        mode = snapshot.fit_mode.as_str(),
        ntoa = snapshot.ntoa,
        chi2r = snapshot.chi2_reduced,
        "Committed timing solution"
    );

    // The snapshot is committed; checking it comes before any file export
    let history = snapshots::history_before(&ctx.db, psr_id, snapshot.id, CHECKER_HISTORY).await?;
    let fired = anomaly_checker::check(&snapshot, &history, &ctx.config.checker);
    publish_warnings(ctx, &fired).await?;
    report.warnings = fired;

    if let Err(e) = update_source_files(ctx, source, &snapshot).await {
        error!(
            psr_id,
            snapshot_id = snapshot.id,
            error = %e,
            "Exporting pulsar.par/pulsar.tim failed; snapshot stays committed"
        );
    }

    if ctx.config.pipeline.workspace_cleanup {
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            warn!(psr_id, workspace = %workspace.display(), error = %e, "Workspace cleanup failed");
        }
    }

    report.status = PulsarStatus::Succeeded {
        snapshot_id: snapshot.id,
    };
    Ok(report)
}

/// Copy `pulsar.par` to the static backup the first time a pulsar is seen
async fn ensure_initial_parfile(source: &PulsarSource) -> PipelineResult<()> {
    let initial = source.initial_parfile_path();
    if initial.is_file() {
        return Ok(());
    }
    // Validates the operator's file before anything depends on it
    Parfile::load(&source.parfile_path()).await?;
    tokio::fs::create_dir_all(source.backup_dir()).await?;
    tokio::fs::copy(source.parfile_path(), &initial).await?;
    info!(psr_id = %source.psr_id, path = %initial.display(), "Saved static parameter file");
    Ok(())
}

async fn template_version(template: &Path) -> PipelineResult<String> {
    let digest = sha256_file(template).await.map_err(|reason| PipelineError::SkippableFile {
        path: template.to_path_buf(),
        reason,
    })?;
    Ok(digest[..TEMPLATE_VERSION_LEN].to_string())
}

/// Candidates: unprocessed files, or every good file on reset; then the
/// ignore window and backend filter
async fn select_candidates(
    ctx: &PipelineContext,
    cfg: &EffectiveConfig,
) -> PipelineResult<Vec<ObservationFile>> {
    let files = if cfg.reset_params {
        catalog::list_good_files(&ctx.db, &cfg.psr_id).await?
    } else {
        catalog::list_unprocessed(&ctx.db, &cfg.psr_id, ctx.config.pipeline.max_extraction_attempts)
            .await?
    };

    let total = files.len();
    let kept: Vec<ObservationFile> = files.into_iter().filter(|f| cfg.includes(f)).collect();
    if kept.len() < total {
        debug!(
            psr_id = %cfg.psr_id,
            excluded = total - kept.len(),
            "Observations excluded by ignore window or backend filter"
        );
    }
    Ok(kept)
}

async fn extract_all(
    ctx: &PipelineContext,
    source: &PulsarSource,
    cfg: &EffectiveConfig,
    candidates: &[ObservationFile],
    template_version: &str,
) -> PipelineResult<(Vec<Toa>, usize)> {
    let template = source.template_path();
    let mut extracted = Vec::new();
    let mut failed = 0;

    for file in candidates {
        match ctx.extractor.extract(&file.location, &template).await {
            Ok(found) => {
                let jump = cfg.jump_for(&file.backend);
                extracted.extend(found.into_iter().map(|toa| {
                    Toa::from_extracted(
                        &source.psr_id,
                        file.id,
                        file.backend.clone(),
                        template_version,
                        file.mjd,
                        jump,
                        toa,
                    )
                }));
            }
            Err(e) => {
                failed += 1;
                let skipped = PipelineError::SkippableFile {
                    path: file.location.clone(),
                    reason: e.to_string(),
                };
                warn!(psr_id = %source.psr_id, raw_data_id = file.id, "{}", skipped);
                failures::record_failure(&ctx.db, &source.psr_id, file.id, &e.to_string()).await?;
            }
        }
    }

    Ok((extracted, failed))
}

fn build_draft(
    psr_id: &str,
    fit_mode: FitMode,
    fit_toas: &[Toa],
    output: FitOutput,
    parfile: String,
) -> SnapshotDraft {
    let span_start = fit_toas
        .iter()
        .map(|t| t.arrival_mjd)
        .fold(f64::INFINITY, f64::min);
    let span_end = fit_toas
        .iter()
        .map(|t| t.arrival_mjd)
        .fold(f64::NEG_INFINITY, f64::max);

    SnapshotDraft {
        psr_id: psr_id.to_string(),
        fit_mode,
        fitted_params: output.fitted_params,
        uncertainties: output.uncertainties,
        chi2: output.chi2,
        chi2_reduced: output.chi2_reduced,
        span_start_mjd: span_start,
        span_end_mjd: span_end,
        ntoa: fit_toas.len(),
        residuals: output.residuals,
        parfile,
    }
}

/// Back up and replace `pulsar.par`, then re-export `pulsar.tim`.
/// Runs only after the snapshot transaction committed.
async fn update_source_files(
    ctx: &PipelineContext,
    source: &PulsarSource,
    snapshot: &TimingSolutionSnapshot,
) -> PipelineResult<()> {
    let backup = source
        .backup_dir()
        .join(format!("parfile__{}.bak", file_stamp(snapshot.committed_at)));
    tokio::fs::create_dir_all(source.backup_dir()).await?;
    tokio::fs::copy(source.parfile_path(), &backup).await?;
    write_atomic(&source.parfile_path(), &snapshot.parfile).await?;

    let current = toas::load_toas(&ctx.db, &source.psr_id).await?;
    write_atomic(&source.tim_path(), &render_tim(&current)).await?;
    Ok(())
}

async fn record_fit_failure(
    ctx: &PipelineContext,
    psr_id: &str,
    err: &PipelineError,
) -> PipelineResult<Vec<WarningEvent>> {
    let streak = pulsars::increment_fit_failures(&ctx.db, psr_id).await?;
    let mut fired = vec![WarningEvent::new(
        psr_id,
        None,
        WarningKind::FitFailed,
        Severity::High,
        format!("Fit failed, previous solution retained: {}", err),
    )];

    let limit = ctx.config.checker.fit_failure_streak as i64;
    if streak >= limit {
        fired.push(
            WarningEvent::new(
                psr_id,
                None,
                WarningKind::RepeatedFitFailure,
                Severity::High,
                format!("{} consecutive fit failures", streak),
            )
            .with_metric(streak as f64, limit as f64),
        );
    }

    publish_warnings(ctx, &fired).await?;
    Ok(fired)
}

/// Persist warnings, broadcast one event per warning and queue each for
/// notification
async fn publish_warnings(ctx: &PipelineContext, fired: &[WarningEvent]) -> PipelineResult<()> {
    if fired.is_empty() {
        return Ok(());
    }
    warnings::insert_warnings(&ctx.db, ctx.run_id, fired).await?;
    for warning in fired {
        warn!(
            psr_id = %warning.psr_id,
            kind = %warning.kind,
            severity = ?warning.severity,
            "{}",
            warning.message
        );
        ctx.event_bus.emit_lossy(TmgEvent::WarningRaised {
            run_id: ctx.run_id,
            warning: warning.clone(),
            timestamp: chrono::Utc::now(),
        });
        if let Some(outbox) = &ctx.outbox {
            outbox.send(warning);
        }
    }
    Ok(())
}
