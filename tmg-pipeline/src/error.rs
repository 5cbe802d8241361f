//! Error types for tmg-pipeline
//!
//! Failure domains, narrowest first:
//! - one observation file (`SkippableFile`, `Extraction`): skip the file
//! - one pulsar (`Fit`, `OverrideConfig`, anything else raised while
//!   processing it): recorded against that pulsar, the run continues
//! - the whole run (`Config`): nothing can be processed safely

use std::path::PathBuf;
use thiserror::Error;

/// Pipeline error type
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unreadable or malformed observation file; skip it and continue
    #[error("Skipping file {path}: {reason}")]
    SkippableFile { path: PathBuf, reason: String },

    /// External TOA extractor failed for one file
    #[error("TOA extraction failed for {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    /// Fit routine failed or produced non-finite values
    #[error("Fit failed for {psr_id}: {reason}")]
    Fit { psr_id: String, reason: String },

    /// Missing or invalid global configuration (fatal for the run)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed per-pulsar override; caller falls back to prior config
    #[error("Invalid override for {psr_id}: {reason}")]
    OverrideConfig { psr_id: String, reason: String },

    /// Parameter file missing required content
    #[error("Invalid parameter file {path}: {reason}")]
    Parfile { path: PathBuf, reason: String },

    /// tmg-common error
    #[error("Common error: {0}")]
    Common(#[from] tmg_common::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Only global configuration failures may terminate a run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_) | PipelineError::Common(tmg_common::Error::Config(_))
        )
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
