//! Warning event types shared by the checker, the monitor and notifiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Warning severity
///
/// Numeric level is what monitoring sums into a per-pulsar score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Worth a look; normal notification
    Low,
    /// Needs attention; urgent notification
    High,
}

impl Severity {
    pub fn level(self) -> u32 {
        match self {
            Severity::Low => 1,
            Severity::High => 2,
        }
    }

    pub fn from_level(level: i64) -> Self {
        if level >= 2 {
            Severity::High
        } else {
            Severity::Low
        }
    }
}

/// Kind of anomaly raised for a pulsar
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Reduced chi-square above threshold
    UnreliableEphemeris,
    /// Fitted epoch span too short
    InsufficientBaseline,
    /// Single residual far outside the population scatter
    OutlierToa,
    /// Latest TOA uncertainty far above the others
    ToaUncertaintyIncrease,
    /// Spin parameter jump between consecutive snapshots
    PossibleGlitch,
    /// Reduced chi-square jumped relative to recent history
    Chi2rSuddenIncrease,
    /// Reduced chi-square rising over consecutive snapshots
    Chi2rSteadyIncrease,
    /// Fit routine failed; previous snapshot retained
    FitFailed,
    /// Several fits in a row failed
    RepeatedFitFailure,
}

impl WarningKind {
    pub const ALL: [WarningKind; 9] = [
        WarningKind::UnreliableEphemeris,
        WarningKind::InsufficientBaseline,
        WarningKind::OutlierToa,
        WarningKind::ToaUncertaintyIncrease,
        WarningKind::PossibleGlitch,
        WarningKind::Chi2rSuddenIncrease,
        WarningKind::Chi2rSteadyIncrease,
        WarningKind::FitFailed,
        WarningKind::RepeatedFitFailure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WarningKind::UnreliableEphemeris => "unreliable_ephemeris",
            WarningKind::InsufficientBaseline => "insufficient_baseline",
            WarningKind::OutlierToa => "outlier_toa",
            WarningKind::ToaUncertaintyIncrease => "toa_uncertainty_increase",
            WarningKind::PossibleGlitch => "possible_glitch",
            WarningKind::Chi2rSuddenIncrease => "chi2r_sudden_increase",
            WarningKind::Chi2rSteadyIncrease => "chi2r_steady_increase",
            WarningKind::FitFailed => "fit_failed",
            WarningKind::RepeatedFitFailure => "repeated_fit_failure",
        }
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WarningKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WarningKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown warning kind: {}", s)))
    }
}

/// One fired warning
///
/// Identity is (pulsar, snapshot, kind). Fit failures have no snapshot of
/// their own and carry `snapshot_id = None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningEvent {
    pub psr_id: String,
    pub snapshot_id: Option<i64>,
    pub kind: WarningKind,
    pub severity: Severity,
    pub message: String,
    /// Value of the metric that tripped the rule
    pub metric: Option<f64>,
    pub threshold: Option<f64>,
    /// Offending epoch, for rules that point at one TOA
    pub epoch_mjd: Option<f64>,
    pub raised_at: DateTime<Utc>,
}

impl WarningEvent {
    pub fn new(
        psr_id: impl Into<String>,
        snapshot_id: Option<i64>,
        kind: WarningKind,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            psr_id: psr_id.into(),
            snapshot_id,
            kind,
            severity,
            message: message.into(),
            metric: None,
            threshold: None,
            epoch_mjd: None,
            raised_at: Utc::now(),
        }
    }

    pub fn with_metric(mut self, metric: f64, threshold: f64) -> Self {
        self.metric = Some(metric);
        self.threshold = Some(threshold);
        self
    }

    pub fn at_epoch(mut self, mjd: f64) -> Self {
        self.epoch_mjd = Some(mjd);
        self
    }

    /// Notification text, e.g. "*Checker Warning for J0534+2200*: `...`".
    /// High severity reads "Checker Important Warning".
    pub fn notification_text(&self) -> String {
        let title = match self.severity {
            Severity::High => "Checker Important Warning",
            Severity::Low => "Checker Warning",
        };
        format!("*{} for {}*: `{}`", title, self.psr_id, self.message)
    }
}
