//! Timing parameter file handling
//!
//! Parameter files are edited in place: line order, comments and untouched
//! lines are preserved byte for byte. Only lines whose value changed are
//! re-rendered.

use crate::error::{PipelineError, PipelineResult};
use crate::models::ParamValue;
use std::collections::BTreeMap;
use std::path::Path;
use tmg_common::pipeline_config::ToaJump;
use tmg_common::BackendId;

#[derive(Debug, Clone, PartialEq)]
enum ParLine {
    /// Blank or comment line, kept verbatim
    Raw(String),
    Entry {
        key: String,
        /// Value, then optional fit flag and uncertainty
        fields: Vec<String>,
        /// Original text while the entry is unmodified
        original: Option<String>,
    },
}

/// Parsed parameter file
#[derive(Debug, Clone, PartialEq)]
pub struct Parfile {
    lines: Vec<ParLine>,
}

impl Parfile {
    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("C ") {
                    return ParLine::Raw(line.to_string());
                }
                let mut tokens = trimmed.split_whitespace();
                let key = tokens.next().unwrap_or_default().to_string();
                ParLine::Entry {
                    key,
                    fields: tokens.map(str::to_string).collect(),
                    original: Some(line.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    /// Read a parameter file that must name its pulsar
    pub async fn load(path: &Path) -> PipelineResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let parfile = Self::parse(&content);
        if parfile.name().is_none() {
            return Err(PipelineError::Parfile {
                path: path.to_path_buf(),
                reason: "no PSR or PSRJ line".to_string(),
            });
        }
        Ok(parfile)
    }

    /// Pulsar name from the PSRJ (preferred) or PSR line
    pub fn name(&self) -> Option<&str> {
        self.value_of("PSRJ").or_else(|| self.value_of("PSR"))
    }

    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            ParLine::Entry { key: k, fields, .. } if k == key => fields.first().map(String::as_str),
            _ => None,
        })
    }

    /// Write fitted values back.
    ///
    /// Existing keys keep their fit flag and get the new uncertainty; missing
    /// keys are appended as fitted. JUMP lines are left alone.
    pub fn apply_fitted(
        &mut self,
        values: &BTreeMap<String, ParamValue>,
        uncertainties: &BTreeMap<String, f64>,
    ) {
        for (name, value) in values {
            if name == "JUMP" {
                continue;
            }
            let rendered = value.to_parfile_string();
            let unc = uncertainties.get(name).map(|u| format_uncertainty(*u));

            let existing = self.lines.iter_mut().find_map(|line| match line {
                ParLine::Entry {
                    key,
                    fields,
                    original,
                } if key == name => Some((fields, original)),
                _ => None,
            });

            match existing {
                Some((fields, original)) => {
                    if fields.is_empty() {
                        fields.push(rendered);
                    } else {
                        fields[0] = rendered;
                    }
                    if let Some(unc) = unc {
                        match fields.len() {
                            1 => fields.extend(["1".to_string(), unc]),
                            2 => fields.push(unc),
                            _ => fields[2] = unc,
                        }
                    }
                    *original = None;
                }
                None => {
                    let mut fields = vec![rendered, "1".to_string()];
                    fields.extend(unc);
                    self.lines.push(ParLine::Entry {
                        key: name.clone(),
                        fields,
                        original: None,
                    });
                }
            }
        }
    }

    /// True when a JUMP line already targets this backend's receiver flag
    pub fn has_jump_for(&self, backend: &BackendId) -> bool {
        self.lines.iter().any(|line| match line {
            ParLine::Entry { key, fields, .. } if key == "JUMP" => fields
                .windows(2)
                .any(|w| w[0] == "-rcvr" && w[1] == backend.as_str()),
            _ => false,
        })
    }

    /// Append `JUMP -rcvr <backend> <value> 0 <uncertainty>` unless the jump
    /// is zero or already present. Returns true when a line was added.
    pub fn add_jump(&mut self, backend: &BackendId, jump: ToaJump) -> bool {
        if jump.is_zero() || self.has_jump_for(backend) {
            return false;
        }
        self.lines.push(ParLine::Entry {
            key: "JUMP".to_string(),
            fields: vec![
                "-rcvr".to_string(),
                backend.to_string(),
                jump.value.to_string(),
                "0".to_string(),
                jump.uncertainty.to_string(),
            ],
            original: None,
        });
        true
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                ParLine::Raw(text) => out.push_str(text),
                ParLine::Entry {
                    original: Some(text),
                    ..
                } => out.push_str(text),
                ParLine::Entry { key, fields, .. } => {
                    out.push_str(&format!("{:<15} {}", key, fields.join(" ")));
                }
            }
            out.push('\n');
        }
        out
    }
}

fn format_uncertainty(value: f64) -> String {
    ParamValue::Number(value).to_parfile_string()
}
