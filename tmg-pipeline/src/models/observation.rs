//! Observation files as catalogued by the Master Database

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tmg_common::BackendId;

/// Catalog status of an observation file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Good,
    /// Placeholder for an unreadable file; never processed
    Corrupted,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Good => "good",
            FileStatus::Corrupted => "corrupted",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "corrupted" {
            FileStatus::Corrupted
        } else {
            FileStatus::Good
        }
    }
}

/// Row to insert into the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct NewObservation {
    pub psr_id: String,
    pub ar_id: String,
    pub location: PathBuf,
    pub mjd: f64,
    pub backend: BackendId,
    pub checksum: Option<String>,
    pub size: i64,
    pub format: Option<String>,
    pub status: FileStatus,
}

/// Catalogued observation file (append-only, never mutated)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationFile {
    pub id: i64,
    pub psr_id: String,
    pub ar_id: String,
    pub location: PathBuf,
    pub mjd: f64,
    pub backend: BackendId,
    pub checksum: Option<String>,
    pub size: i64,
    pub format: Option<String>,
    pub status: FileStatus,
    pub catalogued_at: DateTime<Utc>,
}
