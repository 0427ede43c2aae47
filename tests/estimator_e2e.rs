use std::sync::atomic::AtomicBool;

use async_trait::async_trait;

use credence_harness::config::RunConfig;
use credence_harness::estimator::{estimate, estimate_with_options, EstimateError, EstimateWarning};
use credence_harness::logits::{logit, sigmoid};
use credence_harness::sampling::{ExecuteResult, ExecuteSuccess, SampleExecutor, SampleFailure};
use credence_harness::templates::TemplateCatalog;
use credence_harness::worklist::SampleUnit;

/// Fixed probabilities per (slot, replicate): five wordings, two replicates.
const PROBS: [[f64; 2]; 5] = [
    [0.60, 0.62],
    [0.55, 0.57],
    [0.50, 0.52],
    [0.45, 0.47],
    [0.40, 0.42],
];

struct ScriptedExecutor {
    /// Slots whose every unit fails with a refusal.
    refuse_slots: Vec<usize>,
}

impl ScriptedExecutor {
    fn all_succeed() -> Self {
        Self {
            refuse_slots: Vec::new(),
        }
    }
}

#[async_trait]
impl SampleExecutor for ScriptedExecutor {
    async fn execute(&self, unit: &SampleUnit) -> ExecuteResult {
        if self.refuse_slots.contains(&unit.slot) {
            return Err(SampleFailure::Refused);
        }
        Ok(ExecuteSuccess {
            probability: PROBS[unit.slot][unit.replicate],
            cached: false,
            latency_ms: 1,
        })
    }
}

fn scripted_config() -> RunConfig {
    let mut config = RunConfig::new(
        "the claim under test",
        "scripted/model",
    );
    config.paraphrase_slots = 5;
    config.replicates = 2;
    config.template_cap = Some(5);
    config.bootstrap_replicas = 200;
    config.seed = Some(4242);
    config
}

/// The reference center: per-template mean logits, sorted, min and max
/// dropped (T = 5, trim 0.2), remainder averaged.
fn reference_center() -> f64 {
    let mut means: Vec<f64> = PROBS
        .iter()
        .map(|pair| (logit(pair[0]) + logit(pair[1])) / 2.0)
        .collect();
    means.sort_by(|a, b| a.partial_cmp(b).unwrap());
    (means[1] + means[2] + means[3]) / 3.0
}

#[tokio::test]
async fn full_run_matches_reference_estimate() {
    let catalog = TemplateCatalog::builtin();
    let config = scripted_config();
    let session = estimate(&ScriptedExecutor::all_succeed(), &catalog, &config)
        .await
        .unwrap();

    let est = &session.estimate;
    let expected = sigmoid(reference_center());
    assert!(
        (est.probability - expected).abs() < 1e-12,
        "point estimate {} != reference {expected}",
        est.probability
    );
    assert!((est.center_logit - reference_center()).abs() < 1e-12);

    assert_eq!(est.totals.planned, 10);
    assert_eq!(est.totals.succeeded, 10);
    assert_eq!(est.totals.failed, 0);
    assert!((est.compliance_rate - 1.0).abs() < 1e-12);
    assert_eq!(est.template_means.len(), 5);
    assert_eq!(est.trimmed_each_side, 1);
    assert_eq!(est.seed, 4242);
    assert!(est.warnings.is_empty());

    assert!(est.ci_lower < est.probability && est.probability < est.ci_upper);
}

#[tokio::test]
async fn identical_configuration_reproduces_the_artifact_exactly() {
    let catalog = TemplateCatalog::builtin();
    let config = scripted_config();
    let executor = ScriptedExecutor::all_succeed();

    let a = estimate(&executor, &catalog, &config).await.unwrap();
    let b = estimate(&executor, &catalog, &config).await.unwrap();

    assert_eq!(a.estimate.probability, b.estimate.probability);
    assert_eq!(a.estimate.ci_lower, b.estimate.ci_lower);
    assert_eq!(a.estimate.ci_upper, b.estimate.ci_upper);
}

#[tokio::test]
async fn refinement_replaces_only_the_interval() {
    let catalog = TemplateCatalog::builtin();
    let config = scripted_config();
    let session = estimate(&ScriptedExecutor::all_succeed(), &catalog, &config)
        .await
        .unwrap();

    let refined = session.refine_interval(2_000).unwrap();
    assert_eq!(refined.probability, session.estimate.probability);
    assert_eq!(refined.center_logit, session.estimate.center_logit);
    assert_eq!(refined.totals, session.estimate.totals);
    assert_eq!(refined.seed, session.estimate.seed);
    assert_eq!(refined.id, session.estimate.id);
    assert_eq!(refined.bootstrap_replicas, 2_000);

    // Recomputing at the original replica count reproduces the original
    // interval: the refinement path is the same pure function of the
    // snapshot and seed.
    let replay = session.refine_interval(200).unwrap();
    assert_eq!(replay.ci_lower, session.estimate.ci_lower);
    assert_eq!(replay.ci_upper, session.estimate.ci_upper);
}

#[tokio::test]
async fn partial_failures_are_tolerated_and_flagged() {
    let catalog = TemplateCatalog::builtin();
    let config = scripted_config();
    let executor = ScriptedExecutor {
        refuse_slots: vec![2],
    };
    let session = estimate(&executor, &catalog, &config).await.unwrap();

    let est = &session.estimate;
    assert_eq!(est.totals.succeeded, 8);
    assert_eq!(est.totals.failed, 2);
    assert_eq!(est.template_means.len(), 4);
    assert!((est.compliance_rate - 0.8).abs() < 1e-12);
    assert!(est
        .warnings
        .contains(&EstimateWarning::NoTrimApplied { templates: 4 }));

    // The excluded wording stays visible in diagnostics.
    let excluded = est
        .counts_by_template
        .iter()
        .find(|entry| entry.ordinal == 2)
        .unwrap();
    assert_eq!(excluded.counts.failed, 2);
    assert_eq!(excluded.counts.succeeded, 0);
}

#[tokio::test]
async fn single_surviving_template_is_flagged_degenerate() {
    let catalog = TemplateCatalog::builtin();
    let config = scripted_config();
    let executor = ScriptedExecutor {
        refuse_slots: vec![1, 2, 3, 4],
    };
    let session = estimate(&executor, &catalog, &config).await.unwrap();

    let est = &session.estimate;
    assert_eq!(est.template_means.len(), 1);
    assert!(est.warnings.contains(&EstimateWarning::SingleTemplate));
    assert!(est.ci_lower < est.ci_upper);
}

#[tokio::test]
async fn cancelled_run_reports_everything_it_attempted() {
    let catalog = TemplateCatalog::builtin();
    let config = scripted_config();
    let cancel = AtomicBool::new(true);

    let err = estimate_with_options(
        &ScriptedExecutor::all_succeed(),
        &catalog,
        &config,
        None,
        Some(&cancel),
    )
    .await
    .unwrap_err();

    match err {
        EstimateError::InsufficientData { diagnostics } => {
            assert_eq!(diagnostics.totals.planned, 10);
            assert_eq!(diagnostics.totals.not_attempted, 10);
            assert_eq!(diagnostics.totals.succeeded, 0);
            assert_eq!(diagnostics.counts_by_template.len(), 5);
            assert_eq!(diagnostics.compliance_rate, 0.0);
        }
        other => panic!("expected InsufficientData, got {other:?}"),
    }
}

#[tokio::test]
async fn session_round_trips_through_json() {
    let catalog = TemplateCatalog::builtin();
    let config = scripted_config();
    let session = estimate(&ScriptedExecutor::all_succeed(), &catalog, &config)
        .await
        .unwrap();

    let json = serde_json::to_string(&session).unwrap();
    let loaded: credence_harness::estimator::EstimateSession = serde_json::from_str(&json).unwrap();

    // A reloaded session refines to the same interval as the live one.
    let a = session.refine_interval(500).unwrap();
    let b = loaded.refine_interval(500).unwrap();
    assert_eq!(a.ci_lower, b.ci_lower);
    assert_eq!(a.ci_upper, b.ci_upper);
}
