//! tmg-pipeline library interface
//!
//! Exposes the pipeline components for the binary and integration tests.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{PipelineError, PipelineResult};

use sqlx::SqlitePool;
use std::sync::Arc;
use tmg_common::config::RootLayout;
use tmg_common::events::EventBus;
use tmg_common::GlobalConfig;
use uuid::Uuid;

use crate::services::{Fitter, ToaExtractor, WarningOutbox};

/// Everything one pulsar's processing needs, shared read-only across workers
#[derive(Clone)]
pub struct PipelineContext {
    pub db: SqlitePool,
    /// Warning and progress events
    pub event_bus: EventBus,
    /// Notifier queue; `None` when nothing delivers notifications
    pub outbox: Option<WarningOutbox>,
    pub config: Arc<GlobalConfig>,
    pub extractor: Arc<dyn ToaExtractor>,
    pub fitter: Arc<dyn Fitter>,
    pub layout: RootLayout,
    pub run_id: Uuid,
}
