//! Observation file and pulsar source discovery
//!
//! Observation files are found by expanding each backend's data-path glob.
//! Pulsar sources are the subdirectories of `<root>/sources/` that hold both
//! a parameter file and a template.

use crate::models::PulsarSource;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tmg_common::pipeline_config::{BackendConfig, PSR_PLACEHOLDER};
use tmg_common::BackendId;

/// Scanner errors
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid data path pattern '{pattern}': {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("Sources directory not found: {0}")]
    SourcesNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One file matched by a backend's data path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub backend: BackendId,
    pub psr_id: String,
    pub ar_id: String,
    /// Last extension, e.g. `ar`
    pub format: Option<String>,
}

/// Result of scanning one backend
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Sorted by path
    pub files: Vec<DiscoveredFile>,
    /// Entries the glob could not read
    pub errors: Vec<String>,
}

/// Expand one backend's data path into the files it matches.
///
/// Directories are ignored. Results are sorted by path so that downstream
/// catalog order does not depend on file system enumeration order.
pub fn scan_backend(backend: &BackendId, config: &BackendConfig) -> Result<ScanResult, ScanError> {
    let pattern = config.glob_pattern();
    let entries = glob::glob(&pattern).map_err(|e| ScanError::BadPattern {
        pattern: pattern.clone(),
        reason: e.to_string(),
    })?;

    let mut result = ScanResult::default();
    let mut paths = BTreeSet::new();

    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => {
                paths.insert(path);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "Unreadable entry during scan");
                result.errors.push(e.to_string());
            }
        }
    }

    for path in paths {
        let Some(psr_id) = pulsar_id_from_path(&path, &config.data_path) else {
            result
                .errors
                .push(format!("{}: no path component names the pulsar", path.display()));
            continue;
        };
        let ar_id = ar_id_from_path(&path);
        let format = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        result.files.push(DiscoveredFile {
            path,
            backend: backend.clone(),
            psr_id,
            ar_id,
            format,
        });
    }

    tracing::debug!(
        backend = %backend,
        pattern = %pattern,
        files = result.files.len(),
        "Backend scan complete"
    );
    Ok(result)
}

/// Pulsar name for a file matched by `data_path`.
///
/// Taken from the path component in the `%PSR%` position, so files nested
/// below it (`%PSR%/**/*.ar`) still belong to that pulsar. Falls back to the
/// immediate parent directory when the template has no placeholder or a `**`
/// comes before it.
pub fn pulsar_id_from_path(path: &Path, data_path: &str) -> Option<String> {
    placeholder_component(path, data_path).or_else(|| parent_dir_name(path))
}

fn placeholder_component(path: &Path, data_path: &str) -> Option<String> {
    let template: Vec<Component> = Path::new(data_path).components().collect();
    let index = template
        .iter()
        .position(|c| c.as_os_str().to_string_lossy().contains(PSR_PLACEHOLDER))?;
    if template[..index].iter().any(|c| c.as_os_str() == "**") {
        return None;
    }

    let pattern = template[index].as_os_str().to_string_lossy();
    let (prefix, suffix) = pattern.split_once(PSR_PLACEHOLDER)?;
    let component = path.components().nth(index)?;
    let name = component.as_os_str().to_string_lossy();
    name.strip_prefix(prefix)?
        .strip_suffix(suffix)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

fn parent_dir_name(path: &Path) -> Option<String> {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}

/// Archive id: file name with extensions stripped.
///
/// A dot between two digits is part of a number (`cand_59000.123.ar` keeps
/// `cand_59000.123`); the first other dot starts the extensions.
pub fn ar_id_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let parts: Vec<&str> = name.split('.').collect();
    let mut ar_id = parts[0].to_string();

    for pair in parts.windows(2) {
        let prev_ends_digit = pair[0].chars().last().is_some_and(|c| c.is_ascii_digit());
        let next_starts_digit = pair[1].chars().next().is_some_and(|c| c.is_ascii_digit());
        if prev_ends_digit && next_starts_digit {
            ar_id.push('.');
            ar_id.push_str(pair[1]);
        } else {
            break;
        }
    }
    ar_id
}

/// Pulsar source directories under `sources_dir`, sorted by name.
///
/// Incomplete directories (missing parameter file or template) are skipped
/// with a warning. A non-empty `only` restricts the result to those names.
pub fn discover_sources(
    sources_dir: &Path,
    only: &BTreeSet<String>,
) -> Result<Vec<PulsarSource>, ScanError> {
    if !sources_dir.is_dir() {
        return Err(ScanError::SourcesNotFound(sources_dir.to_path_buf()));
    }

    let mut sources = Vec::new();
    for entry in std::fs::read_dir(sources_dir)? {
        let entry = entry?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let psr_id = entry.file_name().to_string_lossy().into_owned();
        if !only.is_empty() && !only.contains(&psr_id) {
            continue;
        }
        if !PulsarSource::is_complete(&dir) {
            tracing::warn!(
                psr_id = %psr_id,
                dir = %dir.display(),
                "Source directory lacks pulsar.par or paas.std, skipping"
            );
            continue;
        }
        sources.push(PulsarSource::new(psr_id, dir));
    }

    sources.sort_by(|a, b| a.psr_id.cmp(&b.psr_id));
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tmg_common::pipeline_config::ToaJump;

    #[test]
    fn test_ar_id_strips_extensions() {
        assert_eq!(ar_id_from_path(Path::new("/d/J1/cand_59000.ar")), "cand_59000");
        assert_eq!(ar_id_from_path(Path::new("/d/J1/obs.ar.gz")), "obs");
        assert_eq!(ar_id_from_path(Path::new("/d/J1/noext")), "noext");
    }

    #[test]
    fn test_ar_id_keeps_numeric_continuation() {
        assert_eq!(
            ar_id_from_path(Path::new("/d/J1/cand_59000.123.ar")),
            "cand_59000.123"
        );
        assert_eq!(ar_id_from_path(Path::new("/d/J1/a1.2.3.FT")), "a1.2.3");
    }

    #[test]
    fn test_pulsar_id_from_placeholder_position() {
        assert_eq!(
            pulsar_id_from_path(Path::new("/data/B0000+00/cand_59000.ar"), "/data/%PSR%/*.ar")
                .as_deref(),
            Some("B0000+00")
        );
        assert_eq!(
            pulsar_id_from_path(
                Path::new("/fold/J0534+2200/2024/06/cand_60200.ar"),
                "/fold/%PSR%/**/*.ar"
            )
            .as_deref(),
            Some("J0534+2200")
        );
        assert_eq!(
            pulsar_id_from_path(Path::new("/d/psr_J1/x.ar"), "/d/psr_%PSR%/*.ar").as_deref(),
            Some("J1")
        );
    }

    #[test]
    fn test_pulsar_id_falls_back_to_parent_dir() {
        assert_eq!(
            pulsar_id_from_path(Path::new("/data/J1/x.ar"), "/data/*/*.ar").as_deref(),
            Some("J1")
        );
        assert_eq!(
            pulsar_id_from_path(Path::new("/data/a/b/J1/x.ar"), "/data/**/%PSR%/*.ar").as_deref(),
            Some("J1")
        );
    }

    #[test]
    fn test_scan_nested_files_keep_pulsar_name() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("J0534+2200").join("2024");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("cand_60200.ar"), b"x").unwrap();
        fs::write(dir.path().join("J0534+2200").join("cand_60100.ar"), b"x").unwrap();

        let config = BackendConfig {
            data_path: format!("{}/%PSR%/**/*.ar", dir.path().display()),
            toa_jump: ToaJump::default(),
        };
        let result = scan_backend(&BackendId::new("fold"), &config).unwrap();

        let ids: Vec<_> = result.files.iter().map(|f| f.psr_id.as_str()).collect();
        assert_eq!(ids, vec!["J0534+2200", "J0534+2200"]);
        let ar_ids: BTreeSet<_> = result.files.iter().map(|f| f.ar_id.as_str()).collect();
        assert_eq!(ar_ids, BTreeSet::from(["cand_60100", "cand_60200"]));
    }

    #[test]
    fn test_scan_backend_sorted_and_files_only() {
        let dir = TempDir::new().unwrap();
        let psr = dir.path().join("B0000+00");
        fs::create_dir_all(psr.join("sub.ar")).unwrap();
        fs::write(psr.join("z_59002.ar"), b"x").unwrap();
        fs::write(psr.join("a_59001.ar"), b"x").unwrap();
        fs::write(psr.join("notes.txt"), b"x").unwrap();

        let config = BackendConfig {
            data_path: format!("{}/%PSR%/*.ar", dir.path().display()),
            toa_jump: ToaJump::default(),
        };
        let result = scan_backend(&BackendId::new("fil"), &config).unwrap();

        let names: Vec<_> = result.files.iter().map(|f| f.ar_id.as_str()).collect();
        assert_eq!(names, vec!["a_59001", "z_59002"]);
        assert!(result.files.iter().all(|f| f.psr_id == "B0000+00"));
        assert_eq!(result.files[0].format.as_deref(), Some("ar"));
    }

    #[test]
    fn test_discover_sources_requires_par_and_std() {
        let dir = TempDir::new().unwrap();
        let complete = dir.path().join("J2");
        let partial = dir.path().join("J1");
        fs::create_dir_all(&complete).unwrap();
        fs::create_dir_all(&partial).unwrap();
        fs::write(complete.join("pulsar.par"), "PSRJ J2\n").unwrap();
        fs::write(complete.join("paas.std"), "std").unwrap();
        fs::write(partial.join("pulsar.par"), "PSRJ J1\n").unwrap();

        let sources = discover_sources(dir.path(), &BTreeSet::new()).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].psr_id, "J2");

        let only: BTreeSet<String> = ["J9".to_string()].into();
        assert!(discover_sources(dir.path(), &only).unwrap().is_empty());
    }

    #[test]
    fn test_discover_sources_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            discover_sources(&dir.path().join("nope"), &BTreeSet::new()),
            Err(ScanError::SourcesNotFound(_))
        ));
    }
}
