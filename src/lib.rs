#![forbid(unsafe_code)]

//! # credence-harness
//!
//! Estimate what a language model actually believes.
//!
//! Asking a model "is this true?" once gives you one noisy, wording-sensitive
//! answer. credence-harness asks the same claim many ways — K paraphrased
//! probes, R replicates each — and combines the reported probabilities in
//! log-odds space: per-template means, a trimmed mean across templates, and a
//! two-stage cluster bootstrap for the confidence interval, because
//! wording-to-wording variation (not sampling noise) dominates real
//! uncertainty. The whole pipeline is deterministic given a seed, so an
//! estimate is reproducible to the bit.
//!
//! See `DESIGN.md` for the statistical rationale and determinism contract.

pub mod aggregate;
pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod elicit;
pub mod estimator;
pub mod gateway;
pub mod logits;
pub mod sampling;
pub mod templates;
pub mod trace;
pub mod worklist;

pub use aggregate::{aggregate, Aggregate, InsufficientDataError, TemplateMean};
pub use bootstrap::{bootstrap_ci, ConfidenceInterval, DEFAULT_BOOTSTRAP_REPLICAS};
pub use cache::{SampleCache, SampleCacheKey, SqliteSampleCache};
pub use config::{ConfigError, RunConfig};
pub use elicit::GatewayExecutor;
pub use estimator::{
    estimate, estimate_with_options, BeliefEstimate, EstimateError, EstimateSession,
    EstimateWarning,
};
pub use gateway::{Attribution, ChatGateway, ProviderGateway};
pub use logits::{logit, sigmoid, GroupedSamples};
pub use sampling::{run_worklist, SampleExecutor, SampleFailure, SampleOutcome, SampleRecord};
pub use templates::{ProbeTemplate, TemplateCatalog};
pub use trace::{JsonlTraceSink, SampleTrace, TraceSink, TraceWorker};
pub use worklist::{build_worklist, SampleUnit};
