//! TOA extraction from observation archives

use crate::error::{PipelineError, PipelineResult};
use crate::models::ExtractedToa;
use crate::services::external_tool::{render_command, ToolRunner};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Produces TOAs for one observation file against a standard template
#[async_trait]
pub trait ToaExtractor: Send + Sync {
    async fn extract(&self, archive: &Path, template: &Path) -> PipelineResult<Vec<ExtractedToa>>;
}

/// Extractor backed by the configured command (e.g. psrchive `pat`)
pub struct CommandToaExtractor {
    template: String,
    runner: Arc<dyn ToolRunner>,
}

impl CommandToaExtractor {
    pub fn new(template: impl Into<String>, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            template: template.into(),
            runner,
        }
    }
}

#[async_trait]
impl ToaExtractor for CommandToaExtractor {
    async fn extract(&self, archive: &Path, template: &Path) -> PipelineResult<Vec<ExtractedToa>> {
        let fail = |reason: String| PipelineError::Extraction {
            path: archive.to_path_buf(),
            reason,
        };

        let argv = render_command(
            &self.template,
            &[
                ("archive", archive.to_string_lossy().into_owned()),
                ("template", template.to_string_lossy().into_owned()),
            ],
        )
        .map_err(|e| fail(e.to_string()))?;

        let output = self
            .runner
            .run(&argv, None)
            .await
            .map_err(|e| fail(e.to_string()))?;

        parse_tim_output(&output.stdout).map_err(fail)
    }
}

/// Parse tempo2 FORMAT 1 lines.
///
/// `<file> <freq MHz> <arrival MJD> <uncertainty us> <telescope> [flags]`.
/// Headers, comments and short lines are skipped; no TOAs at all is an error.
pub fn parse_tim_output(stdout: &str) -> Result<Vec<ExtractedToa>, String> {
    let mut toas = Vec::new();

    for (lineno, line) in stdout.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with("FORMAT")
            || trimmed.starts_with('#')
            || trimmed.starts_with("C ")
        {
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }

        let number = |idx: usize, what: &str| -> Result<f64, String> {
            let value: f64 = fields[idx]
                .parse()
                .map_err(|_| format!("line {}: bad {} '{}'", lineno + 1, what, fields[idx]))?;
            if value.is_finite() {
                Ok(value)
            } else {
                Err(format!("line {}: non-finite {}", lineno + 1, what))
            }
        };

        toas.push(ExtractedToa {
            source_name: fields[0].to_string(),
            freq_mhz: number(1, "frequency")?,
            arrival: fields[2].to_string(),
            arrival_mjd: number(2, "arrival time")?,
            uncertainty_us: number(3, "uncertainty")?,
            telescope: fields[4].to_string(),
        });
    }

    if toas.is_empty() {
        return Err("extractor produced no TOAs".to_string());
    }
    Ok(toas)
}
