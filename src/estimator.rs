//! Run orchestration: plan, execute, group, aggregate, bootstrap, report.

use std::sync::atomic::AtomicBool;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::aggregate::{aggregate, TemplateMean, MIN_TEMPLATES_FOR_TRIM};
use crate::bootstrap::{bootstrap_ci, ConfidenceInterval};
use crate::config::{ConfigError, RunConfig};
use crate::logits::{sigmoid, GroupedSamples, TemplateCounts};
use crate::sampling::{run_worklist, SampleExecutor};
use crate::templates::TemplateCatalog;
use crate::trace::{SampleTrace, TraceError, TraceSink};
use crate::worklist::build_worklist;

// =============================================================================
// Errors and diagnostics
// =============================================================================

/// What was attempted, for callers that need to debug a failed or partial
/// run. Attached to `InsufficientData` so a failure still reports everything
/// that happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub counts_by_template: Vec<TemplateCountsEntry>,
    pub totals: TemplateCounts,
    pub compliance_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateCountsEntry {
    pub ordinal: usize,
    pub slug: String,
    pub hash: String,
    pub counts: TemplateCounts,
}

impl RunDiagnostics {
    fn from_samples(samples: &GroupedSamples) -> Self {
        Self {
            counts_by_template: samples
                .groups
                .iter()
                .map(|g| TemplateCountsEntry {
                    ordinal: g.ordinal,
                    slug: g.slug.clone(),
                    hash: g.hash.clone(),
                    counts: g.counts,
                })
                .collect(),
            totals: samples.totals,
            compliance_rate: samples.compliance_rate(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EstimateError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Zero templates produced a successful sample. Never papered over with
    /// a default estimate.
    #[error("insufficient data: no template produced a successful sample")]
    InsufficientData { diagnostics: Box<RunDiagnostics> },
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

/// Non-fatal conditions the caller should see alongside the estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimateWarning {
    /// Only one template survived; the interval reflects replicate noise
    /// only and understates true uncertainty.
    SingleTemplate,
    /// Fewer surviving templates than the trim threshold; the center is an
    /// untrimmed mean.
    NoTrimApplied { templates: usize },
    /// The run was cancelled before every unit was attempted.
    PartialRun { not_attempted: usize },
}

// =============================================================================
// Artifact
// =============================================================================

/// The final artifact of a run. Immutable once produced; a later interval
/// refinement yields a new value differing only in the CI fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeliefEstimate {
    pub id: Uuid,
    pub created_at: String,
    pub claim: String,
    pub model: String,
    pub prompt_version: String,

    /// Point estimate, probability space.
    pub probability: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Point estimate in log-odds space (what the math actually produced).
    pub center_logit: f64,

    /// One mean per surviving template, for diagnostics.
    pub template_means: Vec<TemplateMean>,
    pub counts_by_template: Vec<TemplateCountsEntry>,
    pub totals: TemplateCounts,
    pub compliance_rate: f64,

    pub trim_fraction: f64,
    pub trimmed_each_side: usize,
    pub bootstrap_replicas: u32,
    /// The resolved seed that produced (and can reproduce) the interval.
    pub seed: u64,

    pub warnings: Vec<EstimateWarning>,
}

impl BeliefEstimate {
    /// The merge rule for two-phase interval computation: the refined result
    /// replaces the CI bounds and replica count, nothing else.
    pub fn with_refined_interval(&self, interval: ConfidenceInterval, replicas: u32) -> Self {
        let mut refined = self.clone();
        refined.ci_lower = interval.lower;
        refined.ci_upper = interval.upper;
        refined.bootstrap_replicas = replicas;
        refined
    }
}

/// An estimate together with the immutable grouped-logit snapshot it was
/// computed from. Persist this if the interval may be refined later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimateSession {
    pub estimate: BeliefEstimate,
    pub samples: GroupedSamples,
}

impl EstimateSession {
    /// Recompute the interval at a different replica count against the
    /// stored snapshot and seed. Pure; both the fast and the refined
    /// interval are functions of the same snapshot, so the two computations
    /// can run concurrently without coordination.
    pub fn refine_interval(&self, replicas: u32) -> Result<BeliefEstimate, EstimateError> {
        if replicas < 1 {
            return Err(ConfigError::InvalidBootstrapReplicas.into());
        }
        let interval = bootstrap_ci(
            &self.samples,
            self.estimate.trim_fraction,
            replicas,
            self.estimate.seed,
        )
        .map_err(|_| EstimateError::InsufficientData {
            diagnostics: Box::new(RunDiagnostics::from_samples(&self.samples)),
        })?;
        Ok(self.estimate.with_refined_interval(interval, replicas))
    }
}

// =============================================================================
// Orchestration
// =============================================================================

/// Run a full estimate: plan the worklist, execute it through the boundary,
/// and combine whatever results exist.
pub async fn estimate(
    executor: &dyn SampleExecutor,
    catalog: &TemplateCatalog,
    config: &RunConfig,
) -> Result<EstimateSession, EstimateError> {
    estimate_with_options(executor, catalog, config, None, None).await
}

/// Full estimate with optional trace capture and cancellation.
///
/// Cancellation mid-run is not an error: remaining units complete as
/// not-attempted and aggregation proceeds over whatever succeeded, subject
/// to the minimum-data condition.
pub async fn estimate_with_options(
    executor: &dyn SampleExecutor,
    catalog: &TemplateCatalog,
    config: &RunConfig,
    trace: Option<&dyn TraceSink>,
    cancel: Option<&AtomicBool>,
) -> Result<EstimateSession, EstimateError> {
    config.validate()?;

    let catalog = match config.template_cap {
        Some(cap) => catalog.clone().with_cap(cap)?,
        None => catalog.clone(),
    };

    let units = build_worklist(config.paraphrase_slots, config.replicates, &catalog)?;
    let seed = config.resolve_seed();

    info!(
        model = %config.model,
        slots = config.paraphrase_slots,
        replicates = config.replicates,
        units = units.len(),
        seed,
        "starting estimation run"
    );

    let records = run_worklist(executor, &units, config.concurrency, cancel).await;

    if let Some(sink) = trace {
        for record in &records {
            sink.record(SampleTrace::from_record(record, &config.model))?;
        }
    }

    let samples = GroupedSamples::from_records(&records);
    let estimate = estimate_from_samples(&samples, config, seed)?;

    info!(
        probability = estimate.probability,
        ci_lower = estimate.ci_lower,
        ci_upper = estimate.ci_upper,
        succeeded = estimate.totals.succeeded,
        failed = estimate.totals.failed + estimate.totals.timed_out,
        "estimation run complete"
    );

    Ok(EstimateSession { estimate, samples })
}

/// Pure aggregation over an existing snapshot. Everything after the executor
/// boundary goes through here, so a stored snapshot reproduces the artifact
/// exactly.
pub fn estimate_from_samples(
    samples: &GroupedSamples,
    config: &RunConfig,
    seed: u64,
) -> Result<BeliefEstimate, EstimateError> {
    let insufficient = || EstimateError::InsufficientData {
        diagnostics: Box::new(RunDiagnostics::from_samples(samples)),
    };

    let agg = aggregate(samples, config.trim_fraction).map_err(|_| insufficient())?;
    let interval = bootstrap_ci(
        samples,
        config.trim_fraction,
        config.bootstrap_replicas,
        seed,
    )
    .map_err(|_| insufficient())?;

    let surviving = samples.surviving_count();
    let mut warnings = Vec::new();
    if surviving == 1 {
        warnings.push(EstimateWarning::SingleTemplate);
    } else if surviving < MIN_TEMPLATES_FOR_TRIM {
        warnings.push(EstimateWarning::NoTrimApplied {
            templates: surviving,
        });
    }
    if samples.totals.not_attempted > 0 {
        warnings.push(EstimateWarning::PartialRun {
            not_attempted: samples.totals.not_attempted,
        });
    }

    let diagnostics = RunDiagnostics::from_samples(samples);

    Ok(BeliefEstimate {
        id: Uuid::new_v4(),
        created_at: Utc::now().to_rfc3339(),
        claim: config.claim.clone(),
        model: config.model.clone(),
        prompt_version: config.prompt_version.clone(),
        probability: sigmoid(agg.center_logit),
        ci_lower: interval.lower,
        ci_upper: interval.upper,
        center_logit: agg.center_logit,
        template_means: agg.template_means,
        counts_by_template: diagnostics.counts_by_template,
        totals: diagnostics.totals,
        compliance_rate: diagnostics.compliance_rate,
        trim_fraction: config.trim_fraction,
        trimmed_each_side: agg.trimmed_each_side,
        bootstrap_replicas: config.bootstrap_replicas,
        seed,
        warnings,
    })
}
