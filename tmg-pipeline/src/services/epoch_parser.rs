//! Observation epoch extraction
//!
//! The epoch of an observation file comes either from its file name
//! (`FilenameMjd`, default) or from a header-reading tool (`HeaderCommand`).

use crate::services::external_tool::{render_command, ToolRunner};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Plausible MJD range for modern observations
const MJD_MIN: f64 = 40_000.0;
const MJD_MAX: f64 = 99_999.0;

/// Determines the observation MJD of one file
#[async_trait]
pub trait EpochParser: Send + Sync {
    /// `Err` carries a human-readable reason; the file is then skipped
    async fn epoch_of(&self, path: &Path) -> Result<f64, String>;
}

/// First 5-digit number (optionally with a fraction) in the file stem
#[derive(Debug, Clone, Copy, Default)]
pub struct FilenameMjd;

#[async_trait]
impl EpochParser for FilenameMjd {
    async fn epoch_of(&self, path: &Path) -> Result<f64, String> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| "path has no file name".to_string())?;
        mjd_from_name(&name).ok_or_else(|| format!("no MJD in file name '{}'", name))
    }
}

/// Scan a file name for the first number whose integer part has exactly five
/// digits and falls in the MJD range.
pub fn mjd_from_name(name: &str) -> Option<f64> {
    let bytes = name.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let int_end = i;
        if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }

        if int_end - start == 5 {
            if let Ok(mjd) = name[start..i].parse::<f64>() {
                if (MJD_MIN..=MJD_MAX).contains(&mjd) {
                    return Some(mjd);
                }
            }
        }
    }
    None
}

/// Reads the epoch with an external tool; first stdout token is the MJD
pub struct HeaderCommand {
    template: String,
    runner: Arc<dyn ToolRunner>,
}

impl HeaderCommand {
    pub fn new(template: impl Into<String>, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            template: template.into(),
            runner,
        }
    }
}

#[async_trait]
impl EpochParser for HeaderCommand {
    async fn epoch_of(&self, path: &Path) -> Result<f64, String> {
        let argv = render_command(
            &self.template,
            &[("archive", path.to_string_lossy().into_owned())],
        )
        .map_err(|e| e.to_string())?;
        let output = self.runner.run(&argv, None).await.map_err(|e| e.to_string())?;

        let token = output
            .stdout
            .split_whitespace()
            .next()
            .ok_or_else(|| "epoch reader printed nothing".to_string())?;
        let mjd: f64 = token
            .parse()
            .map_err(|_| format!("epoch reader printed '{}', not an MJD", token))?;
        if !mjd.is_finite() || mjd <= 0.0 {
            return Err(format!("epoch reader printed invalid MJD {}", mjd));
        }
        Ok(mjd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::external_tool::CommandRunner;

    #[test]
    fn test_mjd_from_typical_names() {
        assert_eq!(mjd_from_name("cand_59000.ar"), Some(59000.0));
        assert_eq!(mjd_from_name("B0000+00_60200.4567_fil.ar"), Some(60200.4567));
        assert_eq!(mjd_from_name("J0534+2200_59123.5.FT"), Some(59123.5));
    }

    #[test]
    fn test_mjd_skips_numbers_of_other_widths() {
        // 2200 and 202301011 are not five-digit integers
        assert_eq!(mjd_from_name("J0534+2200_202301011_60001.ar"), Some(60001.0));
        assert_eq!(mjd_from_name("obs_1234.ar"), None);
    }

    #[test]
    fn test_mjd_out_of_range_ignored() {
        assert_eq!(mjd_from_name("run_12345_59500.ar"), Some(59500.0));
        assert_eq!(mjd_from_name("run_12345.ar"), None);
    }

    #[tokio::test]
    async fn test_filename_parser_error_names_file() {
        let err = FilenameMjd.epoch_of(Path::new("/d/J1/noepoch.ar")).await.unwrap_err();
        assert!(err.contains("noepoch.ar"));
    }

    #[tokio::test]
    async fn test_header_command_reads_first_token() {
        let parser = HeaderCommand::new(
            "echo 60300.25 {archive}",
            Arc::new(CommandRunner::from_secs(5)),
        );
        let mjd = parser.epoch_of(Path::new("/d/J1/a.ar")).await.unwrap();
        assert_eq!(mjd, 60300.25);
    }

    #[tokio::test]
    async fn test_header_command_rejects_garbage() {
        let parser = HeaderCommand::new("echo MJD:unknown", Arc::new(CommandRunner::from_secs(5)));
        assert!(parser.epoch_of(Path::new("/d/J1/a.ar")).await.is_err());
    }
}
