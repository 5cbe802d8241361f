//! Small robust-statistics helpers used by the anomaly checker

/// Scale factor turning a median absolute deviation into a Gaussian sigma
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Median of the finite values; `None` when there are none
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Median absolute deviation from the median
pub fn mad(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let deviations: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - center).abs())
        .collect();
    median(&deviations)
}

/// Outlier-resistant estimate of the standard deviation
pub fn robust_sigma(values: &[f64]) -> Option<f64> {
    mad(values).map(|m| m * MAD_TO_SIGMA)
}

/// Robust z-score of every value; all zero when the spread is zero
pub fn mad_zscores(values: &[f64]) -> Vec<f64> {
    let (Some(center), Some(sigma)) = (median(values), robust_sigma(values)) else {
        return vec![0.0; values.len()];
    };
    if sigma == 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - center) / sigma).collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}
