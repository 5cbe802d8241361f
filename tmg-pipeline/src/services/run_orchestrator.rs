//! Batch run orchestrator
//!
//! One invocation is one run:
//!
//! INGEST → RESOLVE → PROCESS (worker pool, one pulsar per task) → MONITOR
//!
//! Every per-pulsar problem ends up in that pulsar's [`PulsarReport`]; only
//! database failures outside any pulsar (ingest, monitor) and configuration
//! errors abort the run.

use crate::config::{self, EffectiveConfig};
use crate::db::pulsars;
use crate::error::{PipelineError, PipelineResult};
use crate::models::PulsarSource;
use crate::services::epoch_parser::{EpochParser, FilenameMjd, HeaderCommand};
use crate::services::external_tool::{CommandRunner, ToolRunner};
use crate::services::file_scanner::discover_sources;
use crate::services::fitter::{CommandFitter, Fitter};
use crate::services::master_database::{IngestSummary, MasterDatabase};
use crate::services::monitor::{self, MonitoringState, LAST_RUN_FILE};
use crate::services::notifier::WarningOutbox;
use crate::services::pulsar_pipeline::{self, PulsarReport, PulsarStatus};
use crate::services::toa_extractor::{CommandToaExtractor, ToaExtractor};
use crate::PipelineContext;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tmg_common::config::RootLayout;
use tmg_common::events::{EventBus, TmgEvent, WarningEvent};
use tmg_common::GlobalConfig;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Age after which another run's claim on a pulsar is taken over
const CLAIM_STALE_HOURS: i64 = 12;

/// Knobs for a single run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to these pulsars; empty means all
    pub pulsars: BTreeSet<String>,
    pub skip_ingest: bool,
    /// Overrides `pipeline.workers`
    pub workers: Option<usize>,
}

/// What a run did, per pulsar
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingest: IngestSummary,
    pub pulsars: Vec<PulsarReport>,
    /// Every warning raised during the run
    pub warnings: Vec<WarningEvent>,
}

impl RunReport {
    pub fn count(&self, status: &str) -> usize {
        self.pulsars
            .iter()
            .filter(|p| p.status.as_str() == status)
            .count()
    }

    pub fn report(&self, psr_id: &str) -> Option<&PulsarReport> {
        self.pulsars.iter().find(|p| p.psr_id == psr_id)
    }
}

/// Pulsars currently owned by a worker of this process.
///
/// Overlapping runs in other processes are kept apart by the claim columns
/// of the `pulsars` table, taken after this registry.
#[derive(Debug, Default, Clone)]
pub struct ClaimRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

/// Held while a worker owns a pulsar; dropping it releases the claim
#[derive(Debug)]
pub struct PulsarClaim {
    psr_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl ClaimRegistry {
    /// `None` when another worker already holds this pulsar
    pub fn claim(&self, psr_id: &str) -> Option<PulsarClaim> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(psr_id.to_string()) {
            return None;
        }
        Some(PulsarClaim {
            psr_id: psr_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_claimed(&self, psr_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(psr_id)
    }
}

impl Drop for PulsarClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.psr_id);
    }
}

/// Batch run orchestrator
pub struct RunOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    layout: RootLayout,
    config: Arc<GlobalConfig>,
    extractor: Arc<dyn ToaExtractor>,
    fitter: Arc<dyn Fitter>,
    epoch_parser: Arc<dyn EpochParser>,
    outbox: Option<WarningOutbox>,
    claims: ClaimRegistry,
}

impl RunOrchestrator {
    /// Orchestrator with command-backed tools from `config.tools`
    pub fn new(db: SqlitePool, event_bus: EventBus, layout: RootLayout, config: GlobalConfig) -> Self {
        let runner: Arc<dyn ToolRunner> = Arc::new(CommandRunner::from_secs(config.tools.timeout_secs));

        let epoch_parser: Arc<dyn EpochParser> = match &config.tools.epoch_reader {
            Some(template) => Arc::new(HeaderCommand::new(template.clone(), Arc::clone(&runner))),
            None => Arc::new(FilenameMjd),
        };

        Self {
            extractor: Arc::new(CommandToaExtractor::new(
                config.tools.toa_extractor.clone(),
                Arc::clone(&runner),
            )),
            fitter: Arc::new(CommandFitter::new(config.tools.fitter.clone(), runner)),
            epoch_parser,
            db,
            event_bus,
            layout,
            config: Arc::new(config),
            outbox: None,
            claims: ClaimRegistry::default(),
        }
    }

    /// Swap the external tools, e.g. for in-process fakes
    pub fn with_tools(mut self, extractor: Arc<dyn ToaExtractor>, fitter: Arc<dyn Fitter>) -> Self {
        self.extractor = extractor;
        self.fitter = fitter;
        self
    }

    pub fn with_epoch_parser(mut self, epoch_parser: Arc<dyn EpochParser>) -> Self {
        self.epoch_parser = epoch_parser;
        self
    }

    /// Queue every warning raised by this orchestrator's runs for notification
    pub fn with_outbox(mut self, outbox: WarningOutbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn claims(&self) -> &ClaimRegistry {
        &self.claims
    }

    /// Execute one complete run
    pub async fn run(&self, options: &RunOptions) -> PipelineResult<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(run_id = %run_id, "Starting timing run");

        let ingest = if options.skip_ingest {
            tracing::info!(run_id = %run_id, "Ingest skipped");
            IngestSummary::default()
        } else {
            self.ingest(run_id).await?
        };

        let sources = self.sources(&options.pulsars)?;
        self.event_bus.emit_lossy(TmgEvent::RunStarted {
            run_id,
            pulsars: sources.len(),
            timestamp: Utc::now(),
        });

        let mut jobs = Vec::with_capacity(sources.len());
        let mut reports = Vec::new();
        for source in sources.iter().cloned() {
            match self.prepare(&source).await {
                Ok(cfg) => jobs.push((source, cfg)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(psr_id = %source.psr_id, error = %e, "Pulsar setup failed");
                    reports.push(PulsarReport::failed(&source.psr_id, e.to_string()));
                }
            }
        }

        let ctx = Arc::new(PipelineContext {
            db: self.db.clone(),
            event_bus: self.event_bus.clone(),
            outbox: self.outbox.clone(),
            config: Arc::clone(&self.config),
            extractor: Arc::clone(&self.extractor),
            fitter: Arc::clone(&self.fitter),
            layout: self.layout.clone(),
            run_id,
        });
        let workers = options.workers.unwrap_or(self.config.pipeline.workers).max(1);
        reports.extend(self.process_all(ctx, jobs, workers).await);

        for report in &reports {
            if let Err(e) = pulsars::set_last_status(&self.db, &report.psr_id, report.status.as_str()).await {
                tracing::warn!(psr_id = %report.psr_id, error = %e, "Failed to store pulsar status");
            }
            self.event_bus.emit_lossy(TmgEvent::PulsarProcessed {
                run_id,
                psr_id: report.psr_id.clone(),
                status: report.status.as_str().to_string(),
                new_toas: report.new_toas,
                timestamp: Utc::now(),
            });
        }
        reports.sort_by(|a, b| a.psr_id.cmp(&b.psr_id));

        let warnings: Vec<WarningEvent> = reports
            .iter()
            .flat_map(|r| r.warnings.iter().cloned())
            .collect();

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            ingest,
            pulsars: reports,
            warnings,
        };

        let succeeded = report.count("succeeded");
        let skipped = report.count("skipped");
        let failed = report.count("failed");
        tracing::info!(
            run_id = %run_id,
            succeeded,
            skipped,
            failed,
            warnings = report.warnings.len(),
            "Timing run complete"
        );
        self.event_bus.emit_lossy(TmgEvent::RunCompleted {
            run_id,
            succeeded,
            skipped,
            failed,
            warnings: report.warnings.len(),
            timestamp: report.finished_at,
        });

        self.refresh_monitor(&sources).await?;
        monitor::write_json(&self.layout.output_dir, LAST_RUN_FILE, &report).await?;

        Ok(report)
    }

    /// Rebuild and write the monitoring state without processing anything
    pub async fn monitor_only(&self, only: &BTreeSet<String>) -> PipelineResult<MonitoringState> {
        let sources = self.sources(only)?;
        self.refresh_monitor(&sources).await
    }

    async fn ingest(&self, run_id: Uuid) -> PipelineResult<IngestSummary> {
        let master = MasterDatabase::new(self.db.clone(), Arc::clone(&self.epoch_parser))
            .with_corrupted_placeholders(self.config.pipeline.placeholder_if_corrupted);
        let summary = master.ingest(&self.config.backends).await?;

        self.event_bus.emit_lossy(TmgEvent::IngestCompleted {
            run_id,
            discovered: summary.discovered,
            catalogued: summary.catalogued,
            skipped: summary.skipped,
            timestamp: Utc::now(),
        });
        Ok(summary)
    }

    fn sources(&self, only: &BTreeSet<String>) -> PipelineResult<Vec<PulsarSource>> {
        discover_sources(&self.layout.sources_dir(), only)
            .map_err(|e| PipelineError::Config(e.to_string()))
    }

    async fn prepare(&self, source: &PulsarSource) -> PipelineResult<EffectiveConfig> {
        pulsars::ensure_pulsar(&self.db, source).await?;
        config::resolve(&self.db, &self.config, source).await
    }

    async fn process_all(
        &self,
        ctx: Arc<PipelineContext>,
        jobs: Vec<(PulsarSource, EffectiveConfig)>,
        workers: usize,
    ) -> Vec<PulsarReport> {
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut reports = Vec::with_capacity(jobs.len());
        let mut pending = BTreeSet::new();

        tracing::info!(pulsars = jobs.len(), workers, "Processing pulsars");

        for (source, cfg) in jobs {
            let Some(claim) = self.claims.claim(&source.psr_id) else {
                tracing::warn!(psr_id = %source.psr_id, "Pulsar already being processed");
                reports.push(PulsarReport::failed(&source.psr_id, "pulsar is already being processed"));
                continue;
            };
            let run_claim = ctx.run_id.to_string();
            let stale_before = Utc::now() - chrono::Duration::hours(CLAIM_STALE_HOURS);
            match pulsars::try_claim(&self.db, &source.psr_id, &run_claim, stale_before).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(psr_id = %source.psr_id, "Pulsar claimed by another run");
                    reports.push(PulsarReport::failed(&source.psr_id, "pulsar is claimed by another run"));
                    continue;
                }
                Err(e) => {
                    tracing::error!(psr_id = %source.psr_id, error = %e, "Pulsar claim failed");
                    reports.push(PulsarReport::failed(&source.psr_id, e.to_string()));
                    continue;
                }
            }
            pending.insert(source.psr_id.clone());
            let ctx = Arc::clone(&ctx);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _claim = claim;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let _ = pulsars::release_claim(&ctx.db, &source.psr_id, &run_claim).await;
                        return PulsarReport::failed(&source.psr_id, e.to_string());
                    }
                };
                let outcome = AssertUnwindSafe(pulsar_pipeline::process(&ctx, &source, &cfg))
                    .catch_unwind()
                    .await;
                if let Err(e) = pulsars::release_claim(&ctx.db, &source.psr_id, &run_claim).await {
                    tracing::warn!(psr_id = %source.psr_id, error = %e, "Failed to release pulsar claim");
                }
                match outcome {
                    Ok(Ok(report)) => report,
                    Ok(Err(e)) => {
                        tracing::error!(psr_id = %source.psr_id, error = %e, "Pulsar processing failed");
                        PulsarReport::failed(&source.psr_id, e.to_string())
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(psr_id = %source.psr_id, panic = %message, "Pulsar task panicked");
                        PulsarReport::failed(&source.psr_id, format!("panicked: {}", message))
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    if let PulsarStatus::Succeeded { snapshot_id } = &report.status {
                        tracing::info!(
                            psr_id = %report.psr_id,
                            snapshot_id,
                            new_toas = report.new_toas,
                            "Pulsar updated"
                        );
                    }
                    pending.remove(&report.psr_id);
                    reports.push(report);
                }
                Err(e) => tracing::error!(error = %e, "Pulsar task aborted"),
            }
        }

        // Tasks that never reported back
        for psr_id in pending {
            reports.push(PulsarReport::failed(&psr_id, "task aborted"));
        }

        reports
    }

    async fn refresh_monitor(&self, sources: &[PulsarSource]) -> PipelineResult<MonitoringState> {
        let state = monitor::refresh(
            &self.db,
            sources,
            &self.config,
            &self.layout.workspace_dir(),
            Utc::now(),
        )
        .await?;
        let path = monitor::write_state(&self.layout.output_dir, &state).await?;

        self.event_bus.emit_lossy(TmgEvent::MonitoringRefreshed {
            pulsars: state.pulsars.len(),
            timestamp: state.generated_at,
        });
        tracing::info!(path = %path.display(), pulsars = state.pulsars.len(), "Monitoring state written");
        Ok(state)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
