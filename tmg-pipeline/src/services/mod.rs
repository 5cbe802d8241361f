//! Service modules for the timing pipeline
//!
//! Leaves first: external tools and file discovery, then the Master
//! Database, the Per-Pulsar Pipeline and Anomaly Checker, the Monitoring
//! State Cache, and the run orchestrator tying them together.

pub mod anomaly_checker;
pub mod epoch_parser;
pub mod external_tool;
pub mod file_scanner;
pub mod fitter;
pub mod master_database;
pub mod monitor;
pub mod notifier;
pub mod parfile;
pub mod pulsar_pipeline;
pub mod run_orchestrator;
pub mod toa_extractor;

pub use epoch_parser::{EpochParser, FilenameMjd, HeaderCommand};
pub use external_tool::{CommandRunner, ToolError, ToolOutput, ToolRunner};
pub use file_scanner::{discover_sources, DiscoveredFile, ScanError, ScanResult};
pub use fitter::{CommandFitter, FitOutput, FitRequest, Fitter};
pub use master_database::{IngestSummary, MasterDatabase};
pub use monitor::MonitoringState;
pub use notifier::{LogNotifier, Notifier, WarningOutbox, WebhookNotifier};
pub use parfile::Parfile;
pub use pulsar_pipeline::{FitPlan, PulsarReport, PulsarStatus};
pub use run_orchestrator::{ClaimRegistry, RunOptions, RunOrchestrator, RunReport};
pub use toa_extractor::{CommandToaExtractor, ToaExtractor};
