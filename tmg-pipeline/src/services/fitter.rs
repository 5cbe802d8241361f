//! Timing fit routine

use crate::error::{PipelineError, PipelineResult};
use crate::models::{ParamValue, Residual};
use crate::services::external_tool::{render_command, ToolRunner};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Inputs for one fit, already written into the run workspace
#[derive(Debug, Clone)]
pub struct FitRequest {
    pub psr_id: String,
    pub parfile: PathBuf,
    pub tim: PathBuf,
    pub fit_params: Vec<String>,
    pub workspace: PathBuf,
}

/// Fitter output as printed on stdout
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FitOutput {
    pub fitted_params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub uncertainties: BTreeMap<String, f64>,
    pub chi2: f64,
    pub chi2_reduced: f64,
    pub residuals: Vec<Residual>,
}

impl FitOutput {
    /// Reject results that must never be committed
    pub fn validate(&self) -> Result<(), String> {
        if !self.chi2.is_finite() || !self.chi2_reduced.is_finite() {
            return Err(format!(
                "non-finite chi-square (chi2={}, chi2r={})",
                self.chi2, self.chi2_reduced
            ));
        }
        if let Some((name, _)) = self.fitted_params.iter().find(|(_, v)| !v.is_finite()) {
            return Err(format!("non-finite fitted value for {}", name));
        }
        if let Some((name, _)) = self.uncertainties.iter().find(|(_, v)| !v.is_finite()) {
            return Err(format!("non-finite uncertainty for {}", name));
        }
        if self.residuals.is_empty() {
            return Err("fit returned no residuals".to_string());
        }
        if self
            .residuals
            .iter()
            .any(|r| !r.mjd.is_finite() || !r.residual_us.is_finite() || !r.uncertainty_us.is_finite())
        {
            return Err("non-finite residual".to_string());
        }
        Ok(())
    }
}

/// Fits a timing model to a TOA set
#[async_trait]
pub trait Fitter: Send + Sync {
    async fn fit(&self, request: &FitRequest) -> PipelineResult<FitOutput>;
}

/// Fitter backed by the configured command
pub struct CommandFitter {
    template: String,
    runner: Arc<dyn ToolRunner>,
}

impl CommandFitter {
    pub fn new(template: impl Into<String>, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            template: template.into(),
            runner,
        }
    }
}

#[async_trait]
impl Fitter for CommandFitter {
    async fn fit(&self, request: &FitRequest) -> PipelineResult<FitOutput> {
        let fail = |reason: String| PipelineError::Fit {
            psr_id: request.psr_id.clone(),
            reason,
        };

        let argv = render_command(
            &self.template,
            &[
                ("par", request.parfile.to_string_lossy().into_owned()),
                ("tim", request.tim.to_string_lossy().into_owned()),
                ("fit_params", request.fit_params.join(",")),
            ],
        )
        .map_err(|e| fail(e.to_string()))?;

        let output = self
            .runner
            .run(&argv, Some(&request.workspace))
            .await
            .map_err(|e| fail(e.to_string()))?;

        parse_fit_output(&output.stdout).map_err(fail)
    }
}

/// Parse and validate fitter JSON
pub fn parse_fit_output(stdout: &str) -> Result<FitOutput, String> {
    let output: FitOutput =
        serde_json::from_str(stdout.trim()).map_err(|e| format!("unparsable fit output: {}", e))?;
    output.validate()?;
    Ok(output)
}
