//! Bootstrap configuration loading and root folder resolution
//!
//! The bootstrap TOML only says where things live and how to log. Everything
//! that drives processing comes from the global JSON (see `pipeline_config`).

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "TMG_ROOT_FOLDER";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    /// Root folder holding sources/, the database, workspace/ and monitor/
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Path to the global pipeline configuration JSON
    #[serde(default)]
    pub global_config: Option<PathBuf>,

    /// Override for the SQLite database location (default `<root>/tmg.db`)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Override for derived monitoring output (default `<root>/monitor`)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load the bootstrap TOML.
///
/// An explicit path must exist and parse. Without one, the platform config
/// locations are tried; finding nothing is not an error, defaults are used.
pub fn load_toml_config(explicit: Option<&Path>) -> Result<TomlConfig> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Bootstrap config not found: {}",
                    path.display()
                )));
            }
            path.to_path_buf()
        }
        None => match default_config_file() {
            Some(path) => path,
            None => {
                warn!("No bootstrap config file found, using built-in defaults");
                return Ok(TomlConfig::default());
            }
        },
    };

    let content = std::fs::read_to_string(&path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid TOML in {}: {}", path.display(), e)))?;

    info!(path = %path.display(), "Loaded bootstrap config");
    Ok(config)
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_config: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Platform config file locations, first existing wins
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("tmg").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/tmg/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/tmg (or /var/lib/tmg for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("tmg"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/tmg"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("tmg"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/tmg"))
    } else {
        dirs::data_local_dir()
            .map(|d| d.join("tmg"))
            .unwrap_or_else(|| PathBuf::from("./tmg_data"))
    }
}

/// Directory layout under the resolved root folder
#[derive(Debug, Clone)]
pub struct RootLayout {
    pub root: PathBuf,
    pub database_path: PathBuf,
    pub output_dir: PathBuf,
}

impl RootLayout {
    pub fn new(root: PathBuf, toml_config: &TomlConfig) -> Self {
        let database_path = toml_config
            .database_path
            .clone()
            .unwrap_or_else(|| root.join("tmg.db"));
        let output_dir = toml_config
            .output_dir
            .clone()
            .unwrap_or_else(|| root.join("monitor"));
        Self {
            root,
            database_path,
            output_dir,
        }
    }

    /// One subdirectory per pulsar
    pub fn sources_dir(&self) -> PathBuf {
        self.root.join("sources")
    }

    /// Scratch space for per-run fitter workspaces
    pub fn workspace_dir(&self) -> PathBuf {
        self.root.join("workspace")
    }

    /// Create every directory the pipeline writes into
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.sources_dir(),
            self.workspace_dir(),
            self.output_dir.clone(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_defaults_under_root() {
        let layout = RootLayout::new(PathBuf::from("/srv/tmg"), &TomlConfig::default());
        assert_eq!(layout.database_path, PathBuf::from("/srv/tmg/tmg.db"));
        assert_eq!(layout.output_dir, PathBuf::from("/srv/tmg/monitor"));
        assert_eq!(layout.sources_dir(), PathBuf::from("/srv/tmg/sources"));
        assert_eq!(layout.workspace_dir(), PathBuf::from("/srv/tmg/workspace"));
    }

    #[test]
    fn test_layout_honors_toml_overrides() {
        let toml_config = TomlConfig {
            database_path: Some(PathBuf::from("/var/db/timing.db")),
            output_dir: Some(PathBuf::from("/var/www/monitor")),
            ..Default::default()
        };
        let layout = RootLayout::new(PathBuf::from("/srv/tmg"), &toml_config);
        assert_eq!(layout.database_path, PathBuf::from("/var/db/timing.db"));
        assert_eq!(layout.output_dir, PathBuf::from("/var/www/monitor"));
    }

    #[test]
    fn test_logging_defaults() {
        let config: TomlConfig = toml::from_str("root_folder = \"/data\"").unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
        assert_eq!(config.root_folder, Some(PathBuf::from("/data")));
    }
}
