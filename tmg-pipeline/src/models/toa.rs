//! Time-of-arrival records

use serde::{Deserialize, Serialize};
use tmg_common::pipeline_config::ToaJump;
use tmg_common::BackendId;

/// One TOA as printed by the external extractor (tempo2 format)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedToa {
    pub source_name: String,
    pub freq_mhz: f64,
    /// Arrival MJD exactly as printed; f64 would lose sub-microsecond digits
    pub arrival: String,
    pub arrival_mjd: f64,
    pub uncertainty_us: f64,
    pub telescope: String,
}

/// A TOA in a pulsar's persistent set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toa {
    pub psr_id: String,
    pub raw_data_id: i64,
    pub backend: BackendId,
    pub template_version: String,
    /// Epoch of the observation file the TOA came from
    pub obs_mjd: f64,
    pub source_name: String,
    pub arrival: String,
    pub arrival_mjd: f64,
    pub uncertainty_us: f64,
    pub freq_mhz: f64,
    pub telescope: String,
    pub jump: ToaJump,
}

impl Toa {
    pub fn from_extracted(
        psr_id: &str,
        raw_data_id: i64,
        backend: BackendId,
        template_version: &str,
        obs_mjd: f64,
        jump: ToaJump,
        extracted: ExtractedToa,
    ) -> Self {
        Self {
            psr_id: psr_id.to_string(),
            raw_data_id,
            backend,
            template_version: template_version.to_string(),
            obs_mjd,
            source_name: extracted.source_name,
            arrival: extracted.arrival,
            arrival_mjd: extracted.arrival_mjd,
            uncertainty_us: extracted.uncertainty_us,
            freq_mhz: extracted.freq_mhz,
            telescope: extracted.telescope,
            jump,
        }
    }

    /// tempo2 FORMAT 1 line; `-rcvr` ties the TOA to its backend JUMP
    pub fn tim_line(&self) -> String {
        format!(
            " {} {} {} {} {} -rcvr {}",
            self.source_name,
            self.freq_mhz,
            self.arrival,
            self.uncertainty_us,
            self.telescope,
            self.backend
        )
    }
}

/// Render a complete tim file for the given TOAs
pub fn render_tim(toas: &[Toa]) -> String {
    let mut out = String::from("FORMAT 1\n");
    for toa in toas {
        out.push_str(&toa.tim_line());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Toa {
        Toa::from_extracted(
            "J0534+2200",
            7,
            BackendId::new("chimepsr_fil"),
            "abc123",
            60200.4,
            ToaJump::new(0.25, 0.0004),
            ExtractedToa {
                source_name: "cand_60200.ar".into(),
                freq_mhz: 600.0,
                arrival: "60200.412345678901234".into(),
                arrival_mjd: 60200.412345678901234,
                uncertainty_us: 12.5,
                telescope: "chime".into(),
            },
        )
    }

    #[test]
    fn test_tim_line_keeps_full_precision_arrival() {
        let line = sample().tim_line();
        assert!(line.contains("60200.412345678901234"));
        assert!(line.ends_with("-rcvr chimepsr_fil"));
    }

    #[test]
    fn test_render_tim_has_format_header() {
        let tim = render_tim(&[sample(), sample()]);
        let lines: Vec<&str> = tim.lines().collect();
        assert_eq!(lines[0], "FORMAT 1");
        assert_eq!(lines.len(), 3);
    }
}
