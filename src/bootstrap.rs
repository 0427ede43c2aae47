//! Two-stage cluster bootstrap for the confidence interval.
//!
//! Templates (not individual calls) are the resampling unit: wording-to-
//! wording variation dominates real uncertainty, so the first stage draws
//! whole templates with replacement and the second stage resamples
//! replicates within each drawn template.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::aggregate::{trimmed_mean, InsufficientDataError};
use crate::logits::{sigmoid, GroupedSamples};

pub const DEFAULT_BOOTSTRAP_REPLICAS: u32 = 5_000;

/// Percentile bounds of the replica distribution.
const LOWER_QUANTILE: f64 = 0.025;
const UPPER_QUANTILE: f64 = 0.975;

/// Interval bounds in probability space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

/// Compute the [2.5, 97.5] percentile interval over `replicas` bootstrap
/// estimates of the trimmed center.
///
/// Draw order is fixed so the interval is reproducible bit-for-bit from
/// (data, seed, replicas): one `StdRng` seeded once; replicas run in order;
/// within a replica, cluster draw `k` (uniform over the surviving templates,
/// in ordinal order) is immediately followed by that draw's replicate
/// indices (uniform over the template's own logit sequence), for k = 0..T.
/// A template drawn twice is resampled independently each time. The seed
/// only ever selects which existing logits are reused; it never perturbs
/// the logits themselves.
///
/// With a single surviving template every replica resamples that template's
/// replicates, so the interval reflects replicate noise only; callers flag
/// that case as degenerate rather than skipping the computation.
pub fn bootstrap_ci(
    samples: &GroupedSamples,
    trim_fraction: f64,
    replicas: u32,
    seed: u64,
) -> Result<ConfidenceInterval, InsufficientDataError> {
    let clusters: Vec<&[f64]> = samples.surviving().map(|g| g.logits.as_slice()).collect();
    let t = clusters.len();
    if t == 0 {
        return Err(InsufficientDataError);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut estimates = Vec::with_capacity(replicas as usize);
    let mut draw_means = Vec::with_capacity(t);

    for _ in 0..replicas {
        draw_means.clear();
        for _ in 0..t {
            let cluster = clusters[rng.gen_range(0..t)];
            let m = cluster.len();
            let mut sum = 0.0;
            for _ in 0..m {
                sum += cluster[rng.gen_range(0..m)];
            }
            draw_means.push(sum / m as f64);
        }
        let (estimate, _) = trimmed_mean(&draw_means, trim_fraction);
        estimates.push(estimate);
    }

    estimates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    Ok(ConfidenceInterval {
        lower: sigmoid(percentile(&estimates, LOWER_QUANTILE)),
        upper: sigmoid(percentile(&estimates, UPPER_QUANTILE)),
    })
}

/// Quantile of a sorted sequence with linear interpolation between order
/// statistics: index `h = (n-1) * q`, interpolating between `floor(h)` and
/// `ceil(h)`.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = h - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}
