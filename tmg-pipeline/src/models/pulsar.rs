//! Pulsar source directory layout

use std::path::{Path, PathBuf};

/// Operator-supplied timing parameter file
pub const PARFILE_NAME: &str = "pulsar.par";
/// Operator-supplied standard profile template
pub const TEMPLATE_NAME: &str = "paas.std";
/// Optional per-pulsar override
pub const OVERRIDE_NAME: &str = "config.json";
/// Pipeline-maintained TOA export
pub const TIM_NAME: &str = "pulsar.tim";
const BACKUP_DIR: &str = "parfile_bak";
const INITIAL_PARFILE: &str = "initial_parfile.bak";

/// One pulsar's configuration subfolder under `<root>/sources/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulsarSource {
    pub psr_id: String,
    pub dir: PathBuf,
}

impl PulsarSource {
    pub fn new(psr_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            psr_id: psr_id.into(),
            dir: dir.into(),
        }
    }

    /// A directory is a pulsar source once it holds both static inputs
    pub fn is_complete(dir: &Path) -> bool {
        dir.join(PARFILE_NAME).is_file() && dir.join(TEMPLATE_NAME).is_file()
    }

    pub fn parfile_path(&self) -> PathBuf {
        self.dir.join(PARFILE_NAME)
    }

    pub fn template_path(&self) -> PathBuf {
        self.dir.join(TEMPLATE_NAME)
    }

    pub fn override_path(&self) -> PathBuf {
        self.dir.join(OVERRIDE_NAME)
    }

    pub fn tim_path(&self) -> PathBuf {
        self.dir.join(TIM_NAME)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    /// Static parameter file used for full refits
    pub fn initial_parfile_path(&self) -> PathBuf {
        self.backup_dir().join(INITIAL_PARFILE)
    }
}
