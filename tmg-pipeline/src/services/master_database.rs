//! Master Database ingest
//!
//! Scans every backend's data path and catalogues each observation file
//! exactly once. Re-running over the same (or an overlapping) file set adds
//! nothing; a bad file is skipped with a warning and never aborts the scan.

use crate::db::catalog;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{FileStatus, NewObservation, ObservationFile};
use crate::services::epoch_parser::EpochParser;
use crate::services::file_scanner::{scan_backend, DiscoveredFile};
use crate::utils::{retry_on_lock, RetryPolicy};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tmg_common::pipeline_config::BackendConfig;
use tmg_common::BackendId;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Counts from one ingest pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    /// Files matched by the data-path globs
    pub discovered: usize,
    /// Rows newly written (good and corrupted)
    pub catalogued: usize,
    /// Path or (pulsar, backend, epoch) already present
    pub already_known: usize,
    /// Unreadable or malformed files
    pub skipped: usize,
}

/// Outcome of cataloguing one file
enum FileOutcome {
    Inserted,
    Known,
}

/// Append-only observation catalog
#[derive(Clone)]
pub struct MasterDatabase {
    db: SqlitePool,
    epoch_parser: Arc<dyn EpochParser>,
    /// Serializes catalog writes
    write_lock: Arc<Mutex<()>>,
    placeholder_if_corrupted: bool,
}

impl MasterDatabase {
    pub fn new(db: SqlitePool, epoch_parser: Arc<dyn EpochParser>) -> Self {
        Self {
            db,
            epoch_parser,
            write_lock: Arc::new(Mutex::new(())),
            placeholder_if_corrupted: false,
        }
    }

    /// Catalogue empty/unreadable files as `corrupted` instead of skipping them
    pub fn with_corrupted_placeholders(mut self, enabled: bool) -> Self {
        self.placeholder_if_corrupted = enabled;
        self
    }

    /// Scan every backend and catalogue new files.
    ///
    /// Only database failures that survive lock retries are returned as
    /// errors; per-file problems are counted in `skipped`.
    pub async fn ingest(
        &self,
        backends: &BTreeMap<BackendId, BackendConfig>,
    ) -> PipelineResult<IngestSummary> {
        let mut summary = IngestSummary::default();

        for (backend, config) in backends {
            let scan = match scan_backend(backend, config) {
                Ok(scan) => scan,
                Err(e) => {
                    warn!(backend = %backend, error = %e, "Backend scan failed, skipping backend");
                    continue;
                }
            };
            summary.skipped += scan.errors.len();
            summary.discovered += scan.files.len();

            for file in scan.files {
                match self.catalogue_file(&file).await {
                    Ok(FileOutcome::Inserted) => summary.catalogued += 1,
                    Ok(FileOutcome::Known) => summary.already_known += 1,
                    Err(e @ PipelineError::SkippableFile { .. }) => {
                        warn!(psr_id = %file.psr_id, backend = %backend, "{}", e);
                        summary.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            discovered = summary.discovered,
            catalogued = summary.catalogued,
            already_known = summary.already_known,
            skipped = summary.skipped,
            "Master Database ingest complete"
        );
        Ok(summary)
    }

    /// Good files for a pulsar with no TOAs and attempts left
    pub async fn list_unprocessed(
        &self,
        psr_id: &str,
        max_attempts: u32,
    ) -> PipelineResult<Vec<ObservationFile>> {
        Ok(catalog::list_unprocessed(&self.db, psr_id, max_attempts).await?)
    }

    async fn catalogue_file(&self, file: &DiscoveredFile) -> PipelineResult<FileOutcome> {
        let skip = |reason: String| PipelineError::SkippableFile {
            path: file.path.clone(),
            reason,
        };

        let location = tokio::fs::canonicalize(&file.path)
            .await
            .map_err(|e| skip(format!("cannot resolve path: {}", e)))?;
        let location_str = location.to_string_lossy().into_owned();

        if catalog::is_catalogued(&self.db, &location_str).await? {
            return Ok(FileOutcome::Known);
        }

        let metadata = tokio::fs::metadata(&location)
            .await
            .map_err(|e| skip(format!("cannot stat: {}", e)))?;
        let size = metadata.len() as i64;

        let checksum = if size == 0 {
            Err("file is empty".to_string())
        } else {
            sha256_file(&location).await
        };

        let observation = match checksum {
            Ok(checksum) => {
                let mjd = self.epoch_parser.epoch_of(&location).await.map_err(skip)?;
                self.new_observation(file, location, mjd, Some(checksum), size, FileStatus::Good)
            }
            Err(reason) if self.placeholder_if_corrupted => {
                debug!(path = %location.display(), reason = %reason, "Cataloguing corrupted placeholder");
                self.new_observation(file, location, 0.0, None, size, FileStatus::Corrupted)
            }
            Err(reason) => return Err(skip(reason)),
        };

        let inserted = {
            let _guard = self.write_lock.lock().await;
            retry_on_lock("catalog insert", RetryPolicy::default(), || {
                catalog::insert_observation(&self.db, &observation)
            })
            .await?
        };

        if inserted {
            debug!(
                psr_id = %observation.psr_id,
                backend = %observation.backend,
                mjd = observation.mjd,
                "Catalogued observation"
            );
            Ok(FileOutcome::Inserted)
        } else {
            Ok(FileOutcome::Known)
        }
    }

    fn new_observation(
        &self,
        file: &DiscoveredFile,
        location: PathBuf,
        mjd: f64,
        checksum: Option<String>,
        size: i64,
        status: FileStatus,
    ) -> NewObservation {
        NewObservation {
            psr_id: file.psr_id.clone(),
            ar_id: file.ar_id.clone(),
            location,
            mjd,
            backend: file.backend.clone(),
            checksum,
            size,
            format: file.format.clone(),
            status,
        }
    }
}

/// SHA-256 of a file's content, hex encoded
pub async fn sha256_file(path: &Path) -> Result<String, String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String, String> {
        use std::io::Read;

        let mut file = std::fs::File::open(&path).map_err(|e| format!("cannot open: {}", e))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];
        loop {
            let n = file
                .read(&mut buffer)
                .map_err(|e| format!("cannot read: {}", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| format!("hash task failed: {}", e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sha256_matches_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.ar");
        std::fs::write(&path, b"archive bytes").unwrap();

        let hash = sha256_file(&path).await.unwrap();
        assert_eq!(hash, format!("{:x}", Sha256::digest(b"archive bytes")));
    }

    #[tokio::test]
    async fn test_sha256_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(sha256_file(&dir.path().join("missing")).await.is_err());
    }
}
