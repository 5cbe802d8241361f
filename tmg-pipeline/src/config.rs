//! Config Resolver
//!
//! Merges the global configuration with a pulsar's optional `config.json`
//! override into one immutable [`EffectiveConfig`] per pulsar per run.
//!
//! **Fallback order** for a malformed override: last stored effective config
//! for the pulsar, then defaults merged with the global config. A bad
//! override never fails the run.

use crate::db::pulsars;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ObservationFile, PulsarSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use tmg_common::pipeline_config::ToaJump;
use tmg_common::{BackendId, GlobalConfig};
use tracing::{debug, info, warn};

pub const DEFAULT_TAG: &str = "untagged";
pub const DEFAULT_FIT_PARAMS: [&str; 4] = ["F0", "F1", "RAJ", "DECJ"];

/// Epoch window excluded from processing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IgnoreMjds {
    /// Epochs strictly before this are ignored (0 = no lower bound)
    pub earlier_than: f64,
    /// Epochs strictly after this are ignored
    pub later_than: Option<f64>,
}

impl Default for IgnoreMjds {
    fn default() -> Self {
        Self {
            earlier_than: 0.0,
            later_than: None,
        }
    }
}

impl IgnoreMjds {
    pub fn is_ignored(&self, mjd: f64) -> bool {
        mjd < self.earlier_than || self.later_than.is_some_and(|upper| mjd > upper)
    }
}

/// Backends whose files are processed for a pulsar
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "backends", rename_all = "snake_case")]
pub enum ActiveBackends {
    #[default]
    All,
    Only(BTreeSet<BackendId>),
}

impl ActiveBackends {
    pub fn contains(&self, backend: &BackendId) -> bool {
        match self {
            ActiveBackends::All => true,
            ActiveBackends::Only(set) => set.contains(backend),
        }
    }
}

/// Resolved per-pulsar configuration for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub psr_id: String,
    pub ignore: IgnoreMjds,
    /// Full refit from the static parameter file
    pub reset_params: bool,
    pub active_backends: ActiveBackends,
    pub fit_params: Vec<String>,
    /// Display grouping only
    pub tag: String,
    /// Per-backend timing offsets from the global config
    pub jumps: BTreeMap<BackendId, ToaJump>,
}

impl EffectiveConfig {
    /// Defaults merged with the global config
    pub fn defaults(psr_id: &str, global: &GlobalConfig) -> Self {
        Self {
            psr_id: psr_id.to_string(),
            ignore: IgnoreMjds::default(),
            reset_params: false,
            active_backends: ActiveBackends::All,
            fit_params: DEFAULT_FIT_PARAMS.iter().map(|p| p.to_string()).collect(),
            tag: DEFAULT_TAG.to_string(),
            jumps: global
                .backends
                .iter()
                .map(|(id, b)| (id.clone(), b.toa_jump))
                .collect(),
        }
    }

    pub fn is_ignored(&self, mjd: f64) -> bool {
        self.ignore.is_ignored(mjd)
    }

    pub fn accepts_backend(&self, backend: &BackendId) -> bool {
        self.active_backends.contains(backend)
    }

    /// Candidate filter: epoch not ignored and backend active
    pub fn includes(&self, file: &ObservationFile) -> bool {
        !self.is_ignored(file.mjd) && self.accepts_backend(&file.backend)
    }

    pub fn jump_for(&self, backend: &BackendId) -> ToaJump {
        self.jumps.get(backend).copied().unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
struct OverrideFile {
    ignore_mjds: Option<IgnoreSection>,
    settings: Option<SettingsSection>,
    metadata: Option<MetadataSection>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct IgnoreSection {
    earlier_than: Option<f64>,
    later_than: Option<f64>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsSection {
    reset_params: Option<bool>,
    use_filters: Option<Vec<String>>,
    fit_params: Option<Vec<String>>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataSection {
    tag: Option<String>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

/// Merge an override document onto the defaults.
///
/// Unknown keys are logged and ignored. Wrong types, non-finite epochs and
/// unknown backend names in `use_filters` are errors.
pub fn apply_override(
    psr_id: &str,
    content: &str,
    global: &GlobalConfig,
) -> PipelineResult<EffectiveConfig> {
    let malformed = |reason: String| PipelineError::OverrideConfig {
        psr_id: psr_id.to_string(),
        reason,
    };

    let file: OverrideFile = serde_json::from_str(content).map_err(|e| malformed(e.to_string()))?;
    let mut config = EffectiveConfig::defaults(psr_id, global);

    warn_unknown(psr_id, None, &file.unknown);

    if let Some(ignore) = file.ignore_mjds {
        warn_unknown(psr_id, Some("ignore_mjds"), &ignore.unknown);
        if let Some(earlier) = ignore.earlier_than {
            if !earlier.is_finite() {
                return Err(malformed("ignore_mjds.earlier_than is not finite".to_string()));
            }
            config.ignore.earlier_than = earlier;
        }
        if let Some(later) = ignore.later_than {
            if !later.is_finite() {
                return Err(malformed("ignore_mjds.later_than is not finite".to_string()));
            }
            config.ignore.later_than = Some(later);
        }
    }

    if let Some(settings) = file.settings {
        warn_unknown(psr_id, Some("settings"), &settings.unknown);
        if let Some(reset) = settings.reset_params {
            config.reset_params = reset;
        }
        if let Some(filters) = settings.use_filters {
            let known = global.backend_ids();
            let mut selected = BTreeSet::new();
            for name in filters {
                let id = BackendId::new(name);
                if !known.contains(&id) {
                    return Err(malformed(format!("use_filters names unknown backend '{}'", id)));
                }
                selected.insert(id);
            }
            config.active_backends = if selected.is_empty() {
                ActiveBackends::All
            } else {
                ActiveBackends::Only(selected)
            };
        }
        if let Some(params) = settings.fit_params {
            if params.iter().any(|p| p.trim().is_empty()) {
                return Err(malformed("fit_params contains an empty name".to_string()));
            }
            config.fit_params = params;
        }
    }

    if let Some(metadata) = file.metadata {
        warn_unknown(psr_id, Some("metadata"), &metadata.unknown);
        if let Some(tag) = metadata.tag {
            config.tag = tag;
        }
    }

    Ok(config)
}

fn warn_unknown(psr_id: &str, section: Option<&str>, unknown: &BTreeMap<String, Value>) {
    for key in unknown.keys() {
        match section {
            Some(section) => warn!(psr_id, key = %format!("{}.{}", section, key), "Unknown override key ignored"),
            None => warn!(psr_id, key = %key, "Unknown override section ignored"),
        }
    }
}

/// Resolve and persist the effective config for one pulsar
pub async fn resolve(
    db: &SqlitePool,
    global: &GlobalConfig,
    source: &PulsarSource,
) -> PipelineResult<EffectiveConfig> {
    let override_path = source.override_path();

    let resolved = if override_path.is_file() {
        let parsed = match tokio::fs::read_to_string(&override_path).await {
            Ok(content) => apply_override(&source.psr_id, &content, global),
            Err(e) => Err(PipelineError::OverrideConfig {
                psr_id: source.psr_id.clone(),
                reason: format!("cannot read {}: {}", override_path.display(), e),
            }),
        };
        match parsed {
            Ok(config) => {
                debug!(psr_id = %source.psr_id, "Applied pulsar override");
                Some(config)
            }
            Err(e) => {
                warn!(psr_id = %source.psr_id, error = %e, "Falling back to prior effective config");
                None
            }
        }
    } else {
        Some(EffectiveConfig::defaults(&source.psr_id, global))
    };

    let config = match resolved {
        Some(config) => {
            let json = serde_json::to_string(&config)?;
            pulsars::store_effective_config(db, &source.psr_id, &json, &config.tag).await?;
            config
        }
        None => prior_or_defaults(db, global, &source.psr_id).await?,
    };

    info!(
        psr_id = %config.psr_id,
        reset_params = config.reset_params,
        tag = %config.tag,
        "Resolved effective config"
    );
    Ok(config)
}

async fn prior_or_defaults(
    db: &SqlitePool,
    global: &GlobalConfig,
    psr_id: &str,
) -> PipelineResult<EffectiveConfig> {
    if let Some(stored) = pulsars::load_effective_config(db, psr_id).await? {
        match serde_json::from_str::<EffectiveConfig>(&stored) {
            Ok(mut prior) => {
                // Jumps always follow the current global config
                prior.jumps = EffectiveConfig::defaults(psr_id, global).jumps;
                return Ok(prior);
            }
            Err(e) => warn!(psr_id, error = %e, "Stored effective config unreadable, using defaults"),
        }
    }
    Ok(EffectiveConfig::defaults(psr_id, global))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> GlobalConfig {
        GlobalConfig::from_json_str(
            r#"{ "backends": {
                "chimepsr_fil": { "data_path": "/d/%PSR%/*.ar", "toa_jump": [0.25, 0.0004] },
                "chimepsr_fold": { "data_path": "/f/%PSR%/*.ar" }
            } }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_override_is_defaults() {
        let config = apply_override("J1", "{}", &global()).unwrap();
        assert_eq!(config, EffectiveConfig::defaults("J1", &global()));
        assert_eq!(config.tag, "untagged");
        assert_eq!(config.fit_params, vec!["F0", "F1", "RAJ", "DECJ"]);
        assert!(!config.reset_params);
        assert_eq!(config.jump_for(&BackendId::new("chimepsr_fil")), ToaJump::new(0.25, 0.0004));
    }

    #[test]
    fn test_full_override() {
        let config = apply_override(
            "J1",
            r#"{
                "ignore_mjds": { "earlier_than": 60300, "later_than": 61000 },
                "settings": { "reset_params": true, "use_filters": ["chimepsr_fil"], "fit_params": ["F0"] },
                "metadata": { "tag": "msp" }
            }"#,
            &global(),
        )
        .unwrap();

        assert!(config.is_ignored(60200.0));
        assert!(!config.is_ignored(60400.0));
        assert!(config.is_ignored(61000.5));
        assert!(config.reset_params);
        assert!(config.accepts_backend(&BackendId::new("chimepsr_fil")));
        assert!(!config.accepts_backend(&BackendId::new("chimepsr_fold")));
        assert_eq!(config.fit_params, vec!["F0"]);
        assert_eq!(config.tag, "msp");
    }

    #[test]
    fn test_empty_filter_list_means_all() {
        let config =
            apply_override("J1", r#"{ "settings": { "use_filters": [] } }"#, &global()).unwrap();
        assert_eq!(config.active_backends, ActiveBackends::All);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = apply_override(
            "J1",
            r#"{ "settings": { "fit_every_n_days": 3 }, "plots": { "x": 1 } }"#,
            &global(),
        )
        .unwrap();
        assert_eq!(config, EffectiveConfig::defaults("J1", &global()));
    }

    #[test]
    fn test_malformed_overrides_rejected() {
        for bad in [
            "{ not json",
            r#"{ "settings": { "reset_params": "yes" } }"#,
            r#"{ "ignore_mjds": { "earlier_than": "soon" } }"#,
            r#"{ "settings": { "use_filters": ["no_such_backend"] } }"#,
            r#"{ "metadata": { "tag": 7 } }"#,
        ] {
            assert!(
                matches!(
                    apply_override("J1", bad, &global()),
                    Err(PipelineError::OverrideConfig { .. })
                ),
                "accepted: {bad}"
            );
        }
    }

    #[test]
    fn test_effective_config_json_round_trip() {
        let config = apply_override(
            "J1",
            r#"{ "settings": { "use_filters": ["chimepsr_fold"] } }"#,
            &global(),
        )
        .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: EffectiveConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
