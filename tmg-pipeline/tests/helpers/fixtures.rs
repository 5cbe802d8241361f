//! Scratch root folder with sources, observation data and a database

use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tmg_common::config::{RootLayout, TomlConfig};
use tmg_common::events::EventBus;
use tmg_common::pipeline_config::{BackendConfig, ToaJump};
use tmg_common::{BackendId, GlobalConfig};
use tmg_pipeline::db::{init_database, pulsars};
use tmg_pipeline::models::PulsarSource;
use tmg_pipeline::services::{FilenameMjd, MasterDatabase};
use tmg_pipeline::PipelineContext;
use uuid::Uuid;

use super::fakes::{FakeExtractor, FakeFitter};

pub const PSR: &str = "B0000+00";
pub const FIL: &str = "chimepsr_fil";
pub const FOLD: &str = "chimepsr_fold";

const PARFILE: &str = "PSRJ           {psr}\n\
RAJ            05:34:31.97    1\n\
DECJ           +22:00:52.1    1\n\
F0             29.9469        1\n\
F1             -3.77e-10      1\n\
DM             56.77\n";

/// Temp root laid out like a deployment: `sources/`, `data/<backend>/<psr>/`,
/// `workspace/`, `monitor/` and `tmg.db`
pub struct TestRoot {
    pub dir: TempDir,
    pub layout: RootLayout,
    pub db: SqlitePool,
}

impl TestRoot {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let layout = RootLayout::new(dir.path().to_path_buf(), &TomlConfig::default());
        layout.ensure_directories().unwrap();
        let db = init_database(&layout.database_path).await.unwrap();
        Self { dir, layout, db }
    }

    pub fn data_dir(&self, backend: &str) -> PathBuf {
        self.dir.path().join("data").join(backend)
    }

    /// Two backends; the fold backend carries a jump
    pub fn global_config(&self) -> GlobalConfig {
        let mut backends = BTreeMap::new();
        backends.insert(
            BackendId::new(FIL),
            BackendConfig {
                data_path: format!("{}/%PSR%/*.ar", self.data_dir(FIL).display()),
                toa_jump: ToaJump::default(),
            },
        );
        backends.insert(
            BackendId::new(FOLD),
            BackendConfig {
                data_path: format!("{}/%PSR%/*.ar", self.data_dir(FOLD).display()),
                toa_jump: ToaJump::new(0.25165824, 0.00039286),
            },
        );
        let json = serde_json::json!({ "backends": backends });
        GlobalConfig::from_json_str(&json.to_string()).unwrap()
    }

    /// Source directory with a parameter file and template
    pub fn add_pulsar(&self, psr: &str) -> PulsarSource {
        let dir = self.layout.sources_dir().join(psr);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("pulsar.par"), PARFILE.replace("{psr}", psr)).unwrap();
        std::fs::write(dir.join("paas.std"), format!("template for {}\n", psr)).unwrap();
        PulsarSource::new(psr, dir)
    }

    /// Register the pulsar the way the orchestrator does before processing
    pub async fn register(&self, source: &PulsarSource) {
        pulsars::ensure_pulsar(&self.db, source).await.unwrap();
    }

    pub fn write_override(&self, psr: &str, json: &str) {
        let dir = self.layout.sources_dir().join(psr);
        std::fs::write(dir.join("config.json"), json).unwrap();
    }

    /// Observation archive named after its epoch, e.g. `obs_60200.ar`
    pub fn add_observation(&self, backend: &str, psr: &str, mjd: u32) -> PathBuf {
        let dir = self.data_dir(backend).join(psr);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("obs_{}.ar", mjd));
        std::fs::write(&path, format!("{} {} {}\n", backend, psr, mjd)).unwrap();
        path
    }

    pub async fn ingest(&self, config: &GlobalConfig) -> tmg_pipeline::services::IngestSummary {
        MasterDatabase::new(self.db.clone(), Arc::new(FilenameMjd))
            .ingest(&config.backends)
            .await
            .unwrap()
    }

    pub fn context(
        &self,
        config: GlobalConfig,
        extractor: Arc<FakeExtractor>,
        fitter: Arc<FakeFitter>,
    ) -> PipelineContext {
        PipelineContext {
            db: self.db.clone(),
            event_bus: EventBus::new(64),
            outbox: None,
            config: Arc::new(config),
            extractor,
            fitter,
            layout: self.layout.clone(),
            run_id: Uuid::new_v4(),
        }
    }
}
