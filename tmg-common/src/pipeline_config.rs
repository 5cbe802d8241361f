//! Global pipeline configuration (JSON)
//!
//! Loaded once per run and passed by value into every component. There is no
//! ambient/global settings object: anything that needs a threshold or a tool
//! command receives it from here.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::info;

/// Placeholder in data-path templates replaced by the pulsar name
pub const PSR_PLACEHOLDER: &str = "%PSR%";

/// Identifier of an observation backend (e.g. `chimepsr_fil`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

/// Backend timing offset, serialized as `[value, uncertainty]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct ToaJump {
    pub value: f64,
    pub uncertainty: f64,
}

impl ToaJump {
    pub fn new(value: f64, uncertainty: f64) -> Self {
        Self { value, uncertainty }
    }

    /// A zero jump is never written to a parameter file
    pub fn is_zero(&self) -> bool {
        self.value == 0.0
    }
}

impl From<[f64; 2]> for ToaJump {
    fn from([value, uncertainty]: [f64; 2]) -> Self {
        Self { value, uncertainty }
    }
}

impl From<ToaJump> for [f64; 2] {
    fn from(jump: ToaJump) -> Self {
        [jump.value, jump.uncertainty]
    }
}

/// Per-backend data location and timing offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Glob template; `%PSR%` matches any pulsar directory
    pub data_path: String,
    #[serde(default)]
    pub toa_jump: ToaJump,
}

impl BackendConfig {
    /// Template with the pulsar placeholder turned into a wildcard
    pub fn glob_pattern(&self) -> String {
        self.data_path.replace(PSR_PLACEHOLDER, "*")
    }
}

/// External command templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub toa_extractor: String,
    pub fitter: String,
    /// Optional header reader used instead of filename epochs
    pub epoch_reader: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            toa_extractor: "pat -A FDM -f tempo2 -s {template} {archive}".to_string(),
            fitter: "tmg-fit --par {par} --tim {tim} --fit {fit_params}".to_string(),
            epoch_reader: None,
            timeout_secs: 600,
        }
    }
}

/// Run-level processing knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub workers: usize,
    /// Fewer TOAs than this and no fit is attempted
    pub min_toas: usize,
    pub max_extraction_attempts: u32,
    pub workspace_cleanup: bool,
    pub placeholder_if_corrupted: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            min_toas: 2,
            max_extraction_attempts: 3,
            workspace_cleanup: true,
            placeholder_if_corrupted: false,
        }
    }
}

/// Anomaly checker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerThresholds {
    pub chi2r_threshold: f64,
    pub min_span_days: f64,
    pub outlier_sigma: f64,
    pub glitch_sigma: f64,
    pub glitch_min_history: usize,
    pub chi2r_history: usize,
    pub fit_failure_streak: u32,
}

impl Default for CheckerThresholds {
    fn default() -> Self {
        Self {
            chi2r_threshold: 10.0,
            min_span_days: 180.0,
            outlier_sigma: 3.0,
            glitch_sigma: 5.0,
            glitch_min_history: 4,
            chi2r_history: 7,
            fit_failure_streak: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub heatmap_days: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { heatmap_days: 1050 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    /// Slack-compatible incoming webhook; unset means log-only
    pub webhook_url: Option<String>,
}

/// Global configuration shared by every pulsar in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub backends: BTreeMap<BackendId, BackendConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub checker: CheckerThresholds,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub notifier: NotifierSettings,
}

impl GlobalConfig {
    /// Parse and validate from a JSON string
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: GlobalConfig = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid global config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn backend_ids(&self) -> BTreeSet<BackendId> {
        self.backends.keys().cloned().collect()
    }

    pub fn jump_for(&self, backend: &BackendId) -> ToaJump {
        self.backends
            .get(backend)
            .map(|b| b.toa_jump)
            .unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(Error::Config(
                "Global config defines no backends".to_string(),
            ));
        }

        for (id, backend) in &self.backends {
            if backend.data_path.trim().is_empty() {
                return Err(Error::Config(format!("Backend '{}' has an empty data_path", id)));
            }
            glob::Pattern::new(&backend.glob_pattern()).map_err(|e| {
                Error::Config(format!("Backend '{}' data_path is not a valid glob: {}", id, e))
            })?;
            if !backend.toa_jump.value.is_finite() || !backend.toa_jump.uncertainty.is_finite() {
                return Err(Error::Config(format!("Backend '{}' toa_jump is not finite", id)));
            }
        }

        if self.tools.timeout_secs == 0 {
            return Err(Error::Config("tools.timeout_secs must be positive".to_string()));
        }
        if self.pipeline.workers == 0 {
            return Err(Error::Config("pipeline.workers must be at least 1".to_string()));
        }
        if self.pipeline.min_toas == 0 {
            return Err(Error::Config("pipeline.min_toas must be at least 1".to_string()));
        }

        Ok(())
    }
}

/// Load the global configuration. Missing or invalid is always an error.
pub fn load_global_config(path: &Path) -> Result<GlobalConfig> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Global config not found: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    let config = GlobalConfig::from_json_str(&content)?;
    info!(
        path = %path.display(),
        backends = config.backends.len(),
        "Loaded global config"
    );
    Ok(config)
}
