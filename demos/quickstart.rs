//! Minimal end-to-end example for `credence-harness`.
//!
//! This estimates a model's belief in one claim and prints the point
//! estimate with its confidence interval.
//!
//! To run:
//! - Set `OPENROUTER_API_KEY`
//! - `cargo run --example quickstart`

use std::sync::Arc;

use credence_harness::cache::SqliteSampleCache;
use credence_harness::config::RunConfig;
use credence_harness::elicit::GatewayExecutor;
use credence_harness::estimator::estimate;
use credence_harness::gateway::ProviderGateway;
use credence_harness::templates::TemplateCatalog;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // -- Infrastructure setup ------------------------------------------------

    // SQLite cache for probe results — re-running this example reuses prior
    // LLM calls, so you only pay for new probes.
    let cache = SqliteSampleCache::new(SqliteSampleCache::default_path())?;

    // OpenRouter gateway — reads OPENROUTER_API_KEY from the environment.
    let gateway = Arc::new(ProviderGateway::from_env()?);

    // -- The actual request --------------------------------------------------

    let mut config = RunConfig::new(
        "A single sheet of office paper cannot be folded in half more than eight times by hand.",
        "openai/gpt-5-mini",
    );
    config.paraphrase_slots = 6; // one slot per built-in paraphrase
    config.replicates = 2;
    config.seed = Some(42); // set for reproducibility; omit to derive from the run inputs
    config.bootstrap_replicas = 2_000;

    let catalog = TemplateCatalog::builtin();
    let executor = GatewayExecutor::new(gateway, catalog.clone(), &config).with_cache(Arc::new(cache));

    let session = estimate(&executor, &catalog, &config).await?;
    let est = &session.estimate;

    println!(
        "p(true) = {:.3}  95% CI [{:.3}, {:.3}]",
        est.probability, est.ci_lower, est.ci_upper
    );
    println!(
        "{} of {} probes succeeded across {} paraphrases",
        est.totals.succeeded,
        est.totals.planned,
        est.template_means.len()
    );
    for mean in &est.template_means {
        println!(
            "  {:<16} mean logit {:+.3} ({} samples)",
            mean.slug, mean.mean_logit, mean.samples
        );
    }

    // A quick interval can be tightened later without re-probing: the session
    // stores the logit snapshot, so refinement replaces only the CI.
    let refined = session.refine_interval(20_000)?;
    println!(
        "refined CI at B=20000: [{:.3}, {:.3}]",
        refined.ci_lower, refined.ci_upper
    );

    Ok(())
}
