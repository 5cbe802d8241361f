//! In-process stand-ins for the external TOA extractor and fitter

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tmg_pipeline::error::{PipelineError, PipelineResult};
use tmg_pipeline::models::{ExtractedToa, ParamValue, Residual};
use tmg_pipeline::services::epoch_parser::mjd_from_name;
use tmg_pipeline::services::{FitOutput, FitRequest, Fitter, ToaExtractor};

/// One TOA per archive at the epoch in its file name (+0.5 d)
#[derive(Default)]
pub struct FakeExtractor {
    failing: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl FakeExtractor {
    /// Fail every extraction of the archive with this file name
    pub fn fail_on(&self, file_name: &str) {
        self.failing.lock().unwrap().insert(file_name.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToaExtractor for FakeExtractor {
    async fn extract(&self, archive: &Path, _template: &Path) -> PipelineResult<Vec<ExtractedToa>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if self.failing.lock().unwrap().contains(&name) {
            return Err(PipelineError::Extraction {
                path: archive.to_path_buf(),
                reason: "pat exited with code 1".to_string(),
            });
        }

        let mjd = mjd_from_name(&name).unwrap_or(60000.0) + 0.5;
        Ok(vec![ExtractedToa {
            source_name: name,
            freq_mhz: 600.0,
            arrival: format!("{:.13}", mjd),
            arrival_mjd: mjd,
            uncertainty_us: 2.5,
            telescope: "chime".to_string(),
        }])
    }
}

/// Fits by counting: one residual per TOA line in the tim file
pub struct FakeFitter {
    chi2_reduced: Mutex<f64>,
    f0: Mutex<f64>,
    fail: Mutex<bool>,
    /// TOA count of each fit request, in order
    pub requests: Mutex<Vec<usize>>,
}

impl Default for FakeFitter {
    fn default() -> Self {
        Self {
            chi2_reduced: Mutex::new(1.1),
            f0: Mutex::new(29.9469),
            fail: Mutex::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl FakeFitter {
    pub fn set_chi2_reduced(&self, value: f64) {
        *self.chi2_reduced.lock().unwrap() = value;
    }

    pub fn set_f0(&self, value: f64) {
        *self.f0.lock().unwrap() = value;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn last_ntoa(&self) -> Option<usize> {
        self.requests.lock().unwrap().last().copied()
    }
}

#[async_trait]
impl Fitter for FakeFitter {
    async fn fit(&self, request: &FitRequest) -> PipelineResult<FitOutput> {
        let tim = tokio::fs::read_to_string(&request.tim).await?;
        let epochs: Vec<f64> = tim
            .lines()
            .filter(|l| !l.starts_with("FORMAT"))
            .filter_map(|l| l.split_whitespace().nth(2))
            .filter_map(|v| v.parse().ok())
            .collect();
        self.requests.lock().unwrap().push(epochs.len());

        if *self.fail.lock().unwrap() {
            return Err(PipelineError::Fit {
                psr_id: request.psr_id.clone(),
                reason: "fitted F0 is NaN".to_string(),
            });
        }

        let chi2_reduced = *self.chi2_reduced.lock().unwrap();
        let mut fitted_params = BTreeMap::new();
        fitted_params.insert("F0".to_string(), ParamValue::Number(*self.f0.lock().unwrap()));
        fitted_params.insert("F1".to_string(), ParamValue::Number(-3.77e-10));
        fitted_params.insert("RAJ".to_string(), ParamValue::Text("05:34:31.97".to_string()));
        fitted_params.insert("DECJ".to_string(), ParamValue::Text("+22:00:52.1".to_string()));
        fitted_params.insert("DM".to_string(), ParamValue::Number(56.77));

        let mut uncertainties = BTreeMap::new();
        uncertainties.insert("F0".to_string(), 1e-11);

        Ok(FitOutput {
            fitted_params,
            uncertainties,
            chi2: chi2_reduced * epochs.len() as f64,
            chi2_reduced,
            residuals: epochs
                .iter()
                .map(|mjd| Residual {
                    mjd: *mjd,
                    residual_us: 1.0,
                    uncertainty_us: 2.5,
                })
                .collect(),
        })
    }
}
