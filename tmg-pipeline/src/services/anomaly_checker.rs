//! Anomaly Checker
//!
//! Inspects a freshly committed snapshot against the pulsar's fit history.
//! Rules are evaluated independently and any subset may fire; each firing
//! rule yields exactly one warning. The checker is a pure function of its
//! inputs: warnings carry the snapshot's commit time, never the wall clock.
//!
//! Missing or insufficient input (no residuals, short history, absent F0/F1)
//! makes a rule abstain. Nothing here returns an error.

use crate::models::TimingSolutionSnapshot;
use crate::utils::stats::{mad_zscores, mean, median, robust_sigma, std_dev};
use tmg_common::events::{Severity, WarningEvent, WarningKind};
use tmg_common::pipeline_config::CheckerThresholds;
use tracing::debug;

/// Consecutive snapshots that must show rising chi2r
const STEADY_INCREASE_RUN: usize = 6;
const SUDDEN_LOW_SIGMA: f64 = 3.0;
const SUDDEN_HIGH_SIGMA: f64 = 7.0;
/// Fewest residuals for a meaningful scatter estimate
const MIN_RESIDUALS: usize = 3;
const UNCERTAINTY_LOW_SIGMA: f64 = 1.96;
const UNCERTAINTY_HIGH_SIGMA: f64 = 3.0;
/// Typical TOA uncertainty is about 1% of a rotation; below this nothing fires
const UNCERTAINTY_MIN_PHASE: f64 = 0.01;

/// Run every rule. `history` holds earlier snapshots, oldest first, and must
/// not include `snapshot`.
pub fn check(
    snapshot: &TimingSolutionSnapshot,
    history: &[TimingSolutionSnapshot],
    thresholds: &CheckerThresholds,
) -> Vec<WarningEvent> {
    let rules = [
        fit_quality(snapshot, thresholds),
        baseline(snapshot, thresholds),
        residual_outlier(snapshot, thresholds),
        uncertainty_increase(snapshot),
        parameter_jump(snapshot, history, thresholds),
        chi2r_sudden_increase(snapshot, history, thresholds),
        chi2r_steady_increase(snapshot, history, thresholds),
    ];

    rules
        .into_iter()
        .flatten()
        .map(|mut warning| {
            warning.raised_at = snapshot.committed_at;
            warning
        })
        .collect()
}

fn warning(
    snapshot: &TimingSolutionSnapshot,
    kind: WarningKind,
    severity: Severity,
    message: String,
) -> WarningEvent {
    WarningEvent::new(&snapshot.psr_id, Some(snapshot.id), kind, severity, message)
}

fn fit_quality(s: &TimingSolutionSnapshot, t: &CheckerThresholds) -> Option<WarningEvent> {
    if s.chi2_reduced <= t.chi2r_threshold {
        return None;
    }
    Some(
        warning(
            s,
            WarningKind::UnreliableEphemeris,
            Severity::High,
            format!(
                "CHI2R {:.2} exceeds {:.2}; ephemeris unreliable",
                s.chi2_reduced, t.chi2r_threshold
            ),
        )
        .with_metric(s.chi2_reduced, t.chi2r_threshold),
    )
}

fn baseline(s: &TimingSolutionSnapshot, t: &CheckerThresholds) -> Option<WarningEvent> {
    let span = s.span_days();
    if span >= t.min_span_days {
        return None;
    }
    Some(
        warning(
            s,
            WarningKind::InsufficientBaseline,
            Severity::Low,
            format!(
                "Timing span {:.1} days is below {:.1} days",
                span, t.min_span_days
            ),
        )
        .with_metric(span, t.min_span_days),
    )
}

/// Worst residual by robust z-score; one warning naming that epoch
fn residual_outlier(s: &TimingSolutionSnapshot, t: &CheckerThresholds) -> Option<WarningEvent> {
    if s.residuals.len() < MIN_RESIDUALS {
        debug!(psr_id = %s.psr_id, residuals = s.residuals.len(), "Too few residuals for outlier check");
        return None;
    }

    let values: Vec<f64> = s.residuals.iter().map(|r| r.residual_us).collect();
    let scores = mad_zscores(&values);

    let (worst, score) = scores
        .iter()
        .enumerate()
        .map(|(i, z)| (i, z.abs()))
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))?;
    if score <= t.outlier_sigma {
        return None;
    }

    let count = scores.iter().filter(|z| z.abs() > t.outlier_sigma).count();
    let epoch = s.residuals[worst].mjd;
    Some(
        warning(
            s,
            WarningKind::OutlierToa,
            Severity::Low,
            format!(
                "Residual at MJD {:.4} is {:.1} sigma from the median ({} outlier(s))",
                epoch, score, count
            ),
        )
        .with_metric(score, t.outlier_sigma)
        .at_epoch(epoch),
    )
}

/// Latest TOA uncertainty against the robust scatter of all uncertainties in
/// the fit, gated on the uncertainty being a noticeable fraction of a turn
fn uncertainty_increase(s: &TimingSolutionSnapshot) -> Option<WarningEvent> {
    if s.residuals.len() < MIN_RESIDUALS {
        return None;
    }
    let f0 = s.f0()?;
    let last = s
        .residuals
        .iter()
        .max_by(|a, b| a.mjd.total_cmp(&b.mjd))?;

    let errors: Vec<f64> = s.residuals.iter().map(|r| r.uncertainty_us).collect();
    let (center, sigma) = (median(&errors)?, robust_sigma(&errors)?);
    if sigma == 0.0 || last.uncertainty_us <= center {
        return None;
    }
    let score = (last.uncertainty_us - center) / sigma;
    let in_phase = last.uncertainty_us * 1e-6 * f0;
    if in_phase <= UNCERTAINTY_MIN_PHASE {
        return None;
    }

    let severity = if score > UNCERTAINTY_HIGH_SIGMA {
        Severity::High
    } else if score > UNCERTAINTY_LOW_SIGMA {
        Severity::Low
    } else {
        return None;
    };
    Some(
        warning(
            s,
            WarningKind::ToaUncertaintyIncrease,
            severity,
            format!(
                "Uncertainty of the last TOA (MJD {:.4}) is {:.1} sigma above the rest ({:.3} in phase)",
                last.mjd, score, in_phase
            ),
        )
        .with_metric(score, UNCERTAINTY_LOW_SIGMA)
        .at_epoch(last.mjd),
    )
}

/// Spin parameter change against the scatter of its historical changes
fn parameter_jump(
    s: &TimingSolutionSnapshot,
    history: &[TimingSolutionSnapshot],
    t: &CheckerThresholds,
) -> Option<WarningEvent> {
    let mut fired = Vec::new();

    for (name, get) in [
        ("F0", TimingSolutionSnapshot::f0 as fn(&TimingSolutionSnapshot) -> Option<f64>),
        ("F1", TimingSolutionSnapshot::f1),
    ] {
        let Some(current) = get(s) else { continue };
        let series: Vec<f64> = history.iter().filter_map(get).collect();
        let deltas: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();
        if deltas.len() < t.glitch_min_history {
            debug!(psr_id = %s.psr_id, param = name, deltas = deltas.len(), "Insufficient history for jump check");
            continue;
        }

        let Some(&last) = series.last() else { continue };
        let jump = current - last;
        let (Some(center), Some(noise)) = (median(&deltas), noise_floor(&deltas)) else {
            continue;
        };
        if noise == 0.0 {
            continue;
        }
        let sigma = (jump - center).abs() / noise;
        if sigma > t.glitch_sigma {
            fired.push((name, jump, sigma, noise));
        }
    }

    let (_, jump, _, noise) = *fired.first()?;
    let detail: Vec<String> = fired
        .iter()
        .map(|(name, jump, sigma, _)| format!("{} changed by {:.3e} ({:.1} sigma)", name, jump, sigma))
        .collect();
    Some(
        warning(
            s,
            WarningKind::PossibleGlitch,
            Severity::High,
            format!("Possible glitch: {}", detail.join("; ")),
        )
        .with_metric(jump, noise * t.glitch_sigma),
    )
}

/// Robust scatter, falling back to the plain deviation when the MAD is zero
fn noise_floor(deltas: &[f64]) -> Option<f64> {
    match robust_sigma(deltas) {
        Some(sigma) if sigma > 0.0 => Some(sigma),
        _ => std_dev(deltas),
    }
}

/// chi2r series of history plus the new snapshot, when long enough
fn chi2r_series(
    s: &TimingSolutionSnapshot,
    history: &[TimingSolutionSnapshot],
    t: &CheckerThresholds,
) -> Option<Vec<f64>> {
    let mut series: Vec<f64> = history.iter().map(|h| h.chi2_reduced).collect();
    series.push(s.chi2_reduced);
    if series.len() < t.chi2r_history.max(2) {
        debug!(psr_id = %s.psr_id, snapshots = series.len(), "Insufficient history for chi2r trend");
        return None;
    }
    let start = series.len() - t.chi2r_history.max(2);
    Some(series.split_off(start))
}

fn chi2r_sudden_increase(
    s: &TimingSolutionSnapshot,
    history: &[TimingSolutionSnapshot],
    t: &CheckerThresholds,
) -> Option<WarningEvent> {
    let series = chi2r_series(s, history, t)?;
    let (previous, current) = series.split_at(series.len() - 1);
    let current = current[0];
    let (m, sd) = (mean(previous)?, std_dev(previous)?);
    if sd == 0.0 {
        return None;
    }

    let severity = if current > m + SUDDEN_HIGH_SIGMA * sd {
        Severity::High
    } else if current > m + SUDDEN_LOW_SIGMA * sd {
        Severity::Low
    } else {
        return None;
    };
    let limit = m + SUDDEN_LOW_SIGMA * sd;
    Some(
        warning(
            s,
            WarningKind::Chi2rSuddenIncrease,
            severity,
            format!(
                "CHI2R jumped to {:.2} (recent mean {:.2}, sigma {:.2})",
                current, m, sd
            ),
        )
        .with_metric(current, limit),
    )
}

fn chi2r_steady_increase(
    s: &TimingSolutionSnapshot,
    history: &[TimingSolutionSnapshot],
    t: &CheckerThresholds,
) -> Option<WarningEvent> {
    let series = chi2r_series(s, history, t)?;
    if series.len() < STEADY_INCREASE_RUN {
        return None;
    }
    let run = &series[series.len() - STEADY_INCREASE_RUN..];
    if !run.windows(2).all(|w| w[1] > w[0]) {
        return None;
    }
    Some(
        warning(
            s,
            WarningKind::Chi2rSteadyIncrease,
            Severity::Low,
            format!(
                "CHI2R rose over the last {} fits: {:.2} -> {:.2}",
                STEADY_INCREASE_RUN,
                run[0],
                run[STEADY_INCREASE_RUN - 1]
            ),
        )
        .with_metric(run[STEADY_INCREASE_RUN - 1], run[0]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FitMode, ParamValue, Residual};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn snapshot(id: i64, chi2r: f64, f0: f64, span: f64) -> TimingSolutionSnapshot {
        let mut params = BTreeMap::new();
        params.insert("F0".to_string(), ParamValue::Number(f0));
        params.insert("F1".to_string(), ParamValue::Number(-1e-15));
        TimingSolutionSnapshot {
            id,
            psr_id: "B0000+00".to_string(),
            committed_at: Utc.timestamp_opt(1_700_000_000 + id * 86_400, 0).unwrap(),
            fit_mode: FitMode::Incremental,
            fitted_params: params,
            uncertainties: BTreeMap::new(),
            chi2: chi2r * 10.0,
            chi2_reduced: chi2r,
            span_start_mjd: 59000.0,
            span_end_mjd: 59000.0 + span,
            ntoa: 12,
            residuals: (0..12)
                .map(|i| Residual {
                    mjd: 59000.0 + i as f64 * 30.0,
                    residual_us: if i % 2 == 0 { 1.0 } else { -1.0 } * (1.0 + i as f64 * 0.1),
                    uncertainty_us: 1.0,
                })
                .collect(),
            parfile: String::new(),
        }
    }

    #[test]
    fn test_quiet_snapshot_fires_nothing() {
        let s = snapshot(1, 1.1, 10.0, 400.0);
        assert!(check(&s, &[], &CheckerThresholds::default()).is_empty());
    }

    #[test]
    fn test_short_span_flagged() {
        let s = snapshot(1, 1.1, 10.0, 90.0);
        let warnings = check(&s, &[], &CheckerThresholds::default());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::InsufficientBaseline);
        assert_eq!(warnings[0].metric, Some(90.0));
    }

    #[test]
    fn test_outlier_names_epoch() {
        let mut s = snapshot(1, 1.1, 10.0, 400.0);
        s.residuals[5].residual_us = 250.0;
        let warnings = check(&s, &[], &CheckerThresholds::default());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::OutlierToa);
        assert_eq!(warnings[0].epoch_mjd, Some(59150.0));
        assert!(warnings[0].message.contains("59150.0000"));
    }

    #[test]
    fn test_too_few_residuals_abstains() {
        let mut s = snapshot(1, 1.1, 10.0, 400.0);
        s.residuals.truncate(2);
        s.residuals[1].residual_us = 1e6;
        assert!(check(&s, &[], &CheckerThresholds::default()).is_empty());
    }

    fn with_uncertainties(f0: f64, last: f64) -> TimingSolutionSnapshot {
        let mut s = snapshot(1, 1.1, f0, 400.0);
        for (i, r) in s.residuals.iter_mut().enumerate() {
            r.uncertainty_us = if i % 2 == 0 { 1000.0 } else { 1200.0 };
        }
        s.residuals[11].uncertainty_us = last;
        s
    }

    #[test]
    fn test_uncertainty_increase_severity() {
        let thresholds = CheckerThresholds::default();

        let mild = check(&with_uncertainties(10.0, 1450.0), &[], &thresholds);
        assert_eq!(mild.len(), 1);
        assert_eq!(mild[0].kind, WarningKind::ToaUncertaintyIncrease);
        assert_eq!(mild[0].severity, Severity::Low);
        assert_eq!(mild[0].epoch_mjd, Some(59330.0));

        let severe = check(&with_uncertainties(10.0, 2000.0), &[], &thresholds);
        assert_eq!(severe[0].kind, WarningKind::ToaUncertaintyIncrease);
        assert_eq!(severe[0].severity, Severity::High);
        assert!(severe[0].message.contains("0.020 in phase"));
    }

    #[test]
    fn test_uncertainty_increase_ignored_when_small_in_phase() {
        // Same outlier, but 2 ms is only 0.002 of a 1 Hz rotation
        let s = with_uncertainties(1.0, 2000.0);
        assert!(check(&s, &[], &CheckerThresholds::default()).is_empty());
    }

    #[test]
    fn test_glitch_against_history_scatter() {
        let f0s = [10.0, 10.0 + 1e-9, 10.0 + 2.1e-9, 10.0 + 2.9e-9, 10.0 + 4.0e-9, 10.0 + 5.1e-9];
        let history: Vec<_> = f0s
            .iter()
            .enumerate()
            .map(|(i, f0)| snapshot(i as i64 + 1, 1.0, *f0, 400.0))
            .collect();

        let calm = snapshot(7, 1.0, 10.0 + 6.0e-9, 400.0);
        assert!(check(&calm, &history, &CheckerThresholds::default())
            .iter()
            .all(|w| w.kind != WarningKind::PossibleGlitch));

        let glitch = snapshot(7, 1.0, 10.0 + 5.1e-9 + 1e-6, 400.0);
        let warnings = check(&glitch, &history, &CheckerThresholds::default());
        let found: Vec<_> = warnings
            .iter()
            .filter(|w| w.kind == WarningKind::PossibleGlitch)
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::High);
        assert!(found[0].message.contains("F0 changed by"));
    }

    #[test]
    fn test_glitch_needs_history() {
        let history = vec![snapshot(1, 1.0, 10.0, 400.0), snapshot(2, 1.0, 10.0, 400.0)];
        let s = snapshot(3, 1.0, 11.0, 400.0);
        assert!(check(&s, &history, &CheckerThresholds::default()).is_empty());
    }

    #[test]
    fn test_chi2r_sudden_increase_severity() {
        let history: Vec<_> = [1.0, 1.1, 0.9, 1.0, 1.1, 0.9]
            .iter()
            .enumerate()
            .map(|(i, c)| snapshot(i as i64 + 1, *c, 10.0, 400.0))
            .collect();

        let mild = snapshot(7, 1.3, 10.0, 400.0);
        let w = check(&mild, &history, &CheckerThresholds::default());
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].kind, WarningKind::Chi2rSuddenIncrease);
        assert_eq!(w[0].severity, Severity::Low);

        let severe = snapshot(7, 5.0, 10.0, 400.0);
        let w = check(&severe, &history, &CheckerThresholds::default());
        assert_eq!(w[0].kind, WarningKind::Chi2rSuddenIncrease);
        assert_eq!(w[0].severity, Severity::High);
    }

    #[test]
    fn test_chi2r_steady_increase() {
        let history: Vec<_> = [1.0, 1.0, 1.1, 1.2, 1.3, 1.4]
            .iter()
            .enumerate()
            .map(|(i, c)| snapshot(i as i64 + 1, *c, 10.0, 400.0))
            .collect();
        let s = snapshot(7, 1.5, 10.0, 400.0);
        let kinds: Vec<_> = check(&s, &history, &CheckerThresholds::default())
            .into_iter()
            .map(|w| w.kind)
            .collect();
        assert!(kinds.contains(&WarningKind::Chi2rSteadyIncrease));
    }

    #[test]
    fn test_multiple_rules_all_retained() {
        let mut s = snapshot(1, 15.0, 10.0, 30.0);
        s.residuals[3].residual_us = -500.0;
        let kinds: Vec<_> = check(&s, &[], &CheckerThresholds::default())
            .into_iter()
            .map(|w| w.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                WarningKind::UnreliableEphemeris,
                WarningKind::InsufficientBaseline,
                WarningKind::OutlierToa
            ]
        );
    }

    #[test]
    fn test_deterministic() {
        let history: Vec<_> = (1..=6).map(|i| snapshot(i, 1.0 + i as f64 * 0.01, 10.0, 400.0)).collect();
        let s = snapshot(7, 12.0, 10.5, 100.0);
        let a = check(&s, &history, &CheckerThresholds::default());
        let b = check(&s, &history, &CheckerThresholds::default());
        assert_eq!(a, b);
        assert!(a.iter().all(|w| w.raised_at == s.committed_at));
    }
}
