//! Log-odds transform and per-template grouping.
//!
//! Aggregation and resampling happen in logit space for statistical
//! stability; conversion back to probability happens only at the reporting
//! boundary.

use serde::{Deserialize, Serialize};

use crate::sampling::{SampleOutcome, SampleRecord};

/// `ln(p / (1-p))`. Callers are responsible for the open-interval domain
/// check (see `sampling::validated_logit`).
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Inverse of `logit`: `1 / (1 + e^-x)`.
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Per-template unit counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateCounts {
    pub planned: usize,
    pub succeeded: usize,
    /// Terminal failures other than timeouts.
    pub failed: usize,
    pub timed_out: usize,
    /// Units skipped because the run was cancelled first.
    pub not_attempted: usize,
}

impl TemplateCounts {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }

    fn absorb(&mut self, other: &TemplateCounts) {
        self.planned += other.planned;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.not_attempted += other.not_attempted;
    }
}

/// Successful logits for one template, in plan sequence order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateGroup {
    pub ordinal: usize,
    pub slug: String,
    pub hash: String,
    pub logits: Vec<f64>,
    pub counts: TemplateCounts,
}

impl TemplateGroup {
    pub fn mean_logit(&self) -> Option<f64> {
        if self.logits.is_empty() {
            return None;
        }
        Some(self.logits.iter().sum::<f64>() / self.logits.len() as f64)
    }
}

/// Immutable snapshot of grouped logits: the input to aggregation and the
/// bootstrap, and the thing a later CI refinement recomputes over.
///
/// Groups are ordered by template ordinal. Templates with zero successful
/// results stay in the snapshot (for diagnostics) but are excluded from
/// every estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedSamples {
    pub groups: Vec<TemplateGroup>,
    pub totals: TemplateCounts,
}

impl GroupedSamples {
    /// Group terminal records by template. Grouping is order-independent:
    /// any permutation of `records` yields the same snapshot because logits
    /// are re-sorted into plan sequence order per template.
    pub fn from_records(records: &[SampleRecord]) -> Self {
        let mut ordered: Vec<&SampleRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.unit.sequence);

        let mut groups: Vec<TemplateGroup> = Vec::new();
        for record in ordered {
            let ordinal = record.unit.template_ordinal;
            let group = match groups.iter_mut().find(|g| g.ordinal == ordinal) {
                Some(g) => g,
                None => {
                    groups.push(TemplateGroup {
                        ordinal,
                        slug: record.unit.template_slug.clone(),
                        hash: record.unit.template_hash.clone(),
                        logits: Vec::new(),
                        counts: TemplateCounts::default(),
                    });
                    groups.last_mut().expect("just pushed")
                }
            };

            group.counts.planned += 1;
            match &record.outcome {
                SampleOutcome::Success { logit, .. } => {
                    group.counts.succeeded += 1;
                    group.logits.push(*logit);
                }
                SampleOutcome::Failed { reason } if reason.is_timeout() => {
                    group.counts.timed_out += 1;
                }
                SampleOutcome::Failed { .. } => {
                    group.counts.failed += 1;
                }
                SampleOutcome::NotAttempted => {
                    group.counts.not_attempted += 1;
                }
            }
        }
        groups.sort_by_key(|g| g.ordinal);

        let mut totals = TemplateCounts::default();
        for group in &groups {
            totals.absorb(&group.counts);
        }

        Self { groups, totals }
    }

    /// Templates with at least one successful result, in ordinal order.
    pub fn surviving(&self) -> impl Iterator<Item = &TemplateGroup> {
        self.groups.iter().filter(|g| !g.logits.is_empty())
    }

    pub fn surviving_count(&self) -> usize {
        self.surviving().count()
    }

    /// Templates excluded because every unit failed or was skipped.
    pub fn excluded(&self) -> impl Iterator<Item = &TemplateGroup> {
        self.groups.iter().filter(|g| g.logits.is_empty())
    }

    /// Fraction of attempted calls that returned a valid in-range
    /// probability. Cancelled units don't count against the provider.
    pub fn compliance_rate(&self) -> f64 {
        let attempted = self.totals.attempted();
        if attempted == 0 {
            return 0.0;
        }
        self.totals.succeeded as f64 / attempted as f64
    }
}
