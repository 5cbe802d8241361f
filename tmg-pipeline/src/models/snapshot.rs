//! Timing solution snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A fitted parameter value: numeric, or text such as sexagesimal RAJ/DECJ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl ParamValue {
    /// Numeric value; text is parsed, accepting Fortran `D` exponents
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            ParamValue::Text(s) => s.replace(['D', 'd'], "e").parse().ok(),
        }
    }

    /// Non-finite numbers mark a failed fit
    pub fn is_finite(&self) -> bool {
        match self {
            ParamValue::Number(v) => v.is_finite(),
            ParamValue::Text(s) => !matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "nan" | "inf" | "-inf" | "+inf" | "infinity" | "-infinity"
            ),
        }
    }

    /// Representation written into a parameter file
    pub fn to_parfile_string(&self) -> String {
        match self {
            ParamValue::Number(v) => {
                let abs = v.abs();
                if abs != 0.0 && !(1e-4..1e10).contains(&abs) {
                    format!("{:e}", v)
                } else {
                    format!("{}", v)
                }
            }
            ParamValue::Text(s) => s.clone(),
        }
    }
}

/// Whether a fit extended the prior solution or restarted from static params
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    Incremental,
    FullRefit,
}

impl FitMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FitMode::Incremental => "incremental",
            FitMode::FullRefit => "full_refit",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "full_refit" {
            FitMode::FullRefit
        } else {
            FitMode::Incremental
        }
    }
}

/// Post-fit residual of one TOA
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Residual {
    pub mjd: f64,
    pub residual_us: f64,
    pub uncertainty_us: f64,
}

/// A fit result that has not been committed yet
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDraft {
    pub psr_id: String,
    pub fit_mode: FitMode,
    pub fitted_params: BTreeMap<String, ParamValue>,
    pub uncertainties: BTreeMap<String, f64>,
    pub chi2: f64,
    pub chi2_reduced: f64,
    pub span_start_mjd: f64,
    pub span_end_mjd: f64,
    pub ntoa: usize,
    pub residuals: Vec<Residual>,
    /// Parameter file content the fit produced
    pub parfile: String,
}

/// Committed timing solution; fields are written together or not at all
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSolutionSnapshot {
    pub id: i64,
    pub psr_id: String,
    pub committed_at: DateTime<Utc>,
    pub fit_mode: FitMode,
    pub fitted_params: BTreeMap<String, ParamValue>,
    pub uncertainties: BTreeMap<String, f64>,
    pub chi2: f64,
    pub chi2_reduced: f64,
    pub span_start_mjd: f64,
    pub span_end_mjd: f64,
    pub ntoa: usize,
    pub residuals: Vec<Residual>,
    #[serde(skip)]
    pub parfile: String,
}

impl TimingSolutionSnapshot {
    pub fn from_draft(id: i64, committed_at: DateTime<Utc>, draft: SnapshotDraft) -> Self {
        Self {
            id,
            psr_id: draft.psr_id,
            committed_at,
            fit_mode: draft.fit_mode,
            fitted_params: draft.fitted_params,
            uncertainties: draft.uncertainties,
            chi2: draft.chi2,
            chi2_reduced: draft.chi2_reduced,
            span_start_mjd: draft.span_start_mjd,
            span_end_mjd: draft.span_end_mjd,
            ntoa: draft.ntoa,
            residuals: draft.residuals,
            parfile: draft.parfile,
        }
    }

    pub fn span_days(&self) -> f64 {
        self.span_end_mjd - self.span_start_mjd
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.fitted_params.get(name).and_then(ParamValue::as_f64)
    }

    pub fn param_text(&self, name: &str) -> Option<String> {
        self.fitted_params.get(name).map(ParamValue::to_parfile_string)
    }

    pub fn f0(&self) -> Option<f64> {
        self.param("F0")
    }

    pub fn f1(&self) -> Option<f64> {
        self.param("F1")
    }

    pub fn dm(&self) -> Option<f64> {
        self.param("DM")
    }
}
