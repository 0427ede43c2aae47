//! Robust center estimation over per-template means.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logits::GroupedSamples;

/// Symmetric trim fraction applied to sorted template means.
pub const DEFAULT_TRIM_FRACTION: f64 = 0.2;

/// Below this many surviving templates, trimming is not statistically
/// meaningful and the untrimmed mean of template means is used instead.
pub const MIN_TEMPLATES_FOR_TRIM: usize = 5;

/// No template produced a successful sample; there is nothing to estimate.
#[derive(Debug, Clone, Copy, Error)]
#[error("no template produced a successful sample")]
pub struct InsufficientDataError;

/// Diagnostic mean for one template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMean {
    pub ordinal: usize,
    pub slug: String,
    pub hash: String,
    pub mean_logit: f64,
    /// Successful replicates behind the mean. Regardless of this count, the
    /// template contributes exactly one value to the center.
    pub samples: usize,
}

/// Center estimate in log-odds space plus per-template diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub center_logit: f64,
    /// One entry per surviving template, in ordinal order.
    pub template_means: Vec<TemplateMean>,
    /// Whether the symmetric trim was applied.
    pub trimmed: bool,
    /// Values dropped from each end of the sorted means.
    pub trimmed_each_side: usize,
}

/// Mean of `values` after dropping `floor(trim_fraction * n)` from each end
/// of the sorted sequence, when `n >= MIN_TEMPLATES_FOR_TRIM`. Below that,
/// the plain mean. Returns the count dropped from each side.
pub fn trimmed_mean(values: &[f64], trim_fraction: f64) -> (f64, usize) {
    debug_assert!(!values.is_empty());
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let n = sorted.len();
    let drop_each_side = if n >= MIN_TEMPLATES_FOR_TRIM {
        ((trim_fraction * n as f64).floor() as usize).min((n - 1) / 2)
    } else {
        0
    };

    let kept = &sorted[drop_each_side..n - drop_each_side];
    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    (mean, drop_each_side)
}

/// Combine grouped logits into a single center in log-odds space.
///
/// Each surviving template contributes exactly one value — its mean logit —
/// so imbalance in replicate counts across templates cannot tilt the center.
pub fn aggregate(
    samples: &GroupedSamples,
    trim_fraction: f64,
) -> Result<Aggregate, InsufficientDataError> {
    let template_means: Vec<TemplateMean> = samples
        .surviving()
        .map(|group| TemplateMean {
            ordinal: group.ordinal,
            slug: group.slug.clone(),
            hash: group.hash.clone(),
            mean_logit: group.mean_logit().expect("surviving group has samples"),
            samples: group.logits.len(),
        })
        .collect();

    if template_means.is_empty() {
        return Err(InsufficientDataError);
    }

    let means: Vec<f64> = template_means.iter().map(|m| m.mean_logit).collect();
    let (center_logit, trimmed_each_side) = trimmed_mean(&means, trim_fraction);

    Ok(Aggregate {
        center_logit,
        template_means,
        trimmed: trimmed_each_side > 0,
        trimmed_each_side,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_values_drop_exactly_min_and_max() {
        let (mean, dropped) = trimmed_mean(&[-2.0, -1.0, 0.0, 1.0, 5.0], 0.2);
        assert_eq!(dropped, 1);
        assert!((mean - 0.0).abs() < 1e-12);
    }

    #[test]
    fn below_five_values_no_trim() {
        let (mean, dropped) = trimmed_mean(&[-3.0, 0.0, 9.0], 0.2);
        assert_eq!(dropped, 0);
        assert!((mean - 2.0).abs() < 1e-12);
    }

    #[test]
    fn ten_values_drop_two_each_side() {
        let values: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let (mean, dropped) = trimmed_mean(&values, 0.2);
        assert_eq!(dropped, 2);
        // mean of 2..=7
        assert!((mean - 4.5).abs() < 1e-12);
    }
}
