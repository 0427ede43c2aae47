//! Sampling executor boundary and the concurrent worklist driver.
//!
//! The core never retries, caches, or re-dispatches a unit; it requires
//! exactly one terminal outcome per unit and attributes outcomes to units
//! regardless of completion order. Everything behind `SampleExecutor` —
//! transport, retry, caching — is the executor's business.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::logits::logit;
use crate::worklist::SampleUnit;

/// Terminal failure for one sample unit. Recovered locally: the unit is
/// excluded from aggregation and counted in diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SampleFailure {
    #[error("provider error ({code}): {message}")]
    Provider { code: String, message: String },
    #[error("provider call timed out")]
    Timeout,
    #[error("model refused the probe")]
    Refused,
    #[error("malformed response: {message}")]
    Malformed { message: String },
    /// A probability of exactly 0 or 1 (or a non-finite value) is a
    /// provider-compliance failure, never clamped: clamping would bias the
    /// tail behavior of the bootstrap.
    #[error("probability outside the open interval (0,1): {value}")]
    OutOfRange { value: f64 },
}

impl SampleFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SampleFailure::Timeout)
    }
}

/// Terminal outcome of one sample unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SampleOutcome {
    Success { probability: f64, logit: f64 },
    Failed { reason: SampleFailure },
    /// The run was cancelled before this unit was dispatched.
    NotAttempted,
}

impl SampleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SampleOutcome::Success { .. })
    }
}

/// One executed (or skipped) unit with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    pub unit: SampleUnit,
    pub outcome: SampleOutcome,
    /// Whether the executor served this outcome from its cache.
    pub cached: bool,
    pub latency_ms: u64,
}

/// Result of one executor call: a raw probability, or a terminal failure.
pub type ExecuteResult = Result<ExecuteSuccess, SampleFailure>;

#[derive(Debug, Clone, Copy)]
pub struct ExecuteSuccess {
    pub probability: f64,
    pub cached: bool,
    pub latency_ms: u64,
}

/// Boundary capability: execute one planned unit, yielding exactly one
/// terminal result. May be invoked for multiple units concurrently.
#[async_trait]
pub trait SampleExecutor: Send + Sync {
    async fn execute(&self, unit: &SampleUnit) -> ExecuteResult;
}

/// Validate a raw probability and transform it to log-odds.
pub fn validated_logit(probability: f64) -> Result<f64, SampleFailure> {
    if !probability.is_finite() || probability <= 0.0 || probability >= 1.0 {
        return Err(SampleFailure::OutOfRange { value: probability });
    }
    Ok(logit(probability))
}

/// Drive every unit through the executor with a bounded concurrent pool.
///
/// Each unit yields exactly one record; a failure in one unit never blocks
/// another. When `cancel` is set, units not yet dispatched complete as
/// `NotAttempted` so partial runs still aggregate with full diagnostics.
/// Records are returned in sequence order, independent of completion order.
pub async fn run_worklist(
    executor: &dyn SampleExecutor,
    units: &[SampleUnit],
    concurrency: usize,
    cancel: Option<&AtomicBool>,
) -> Vec<SampleRecord> {
    let mut records: Vec<SampleRecord> = stream::iter(units.iter().cloned().map(|unit| {
        async move {
            if let Some(flag) = cancel {
                if flag.load(AtomicOrdering::Relaxed) {
                    return SampleRecord {
                        unit,
                        outcome: SampleOutcome::NotAttempted,
                        cached: false,
                        latency_ms: 0,
                    };
                }
            }

            match executor.execute(&unit).await {
                Ok(success) => {
                    let outcome = match validated_logit(success.probability) {
                        Ok(logit) => SampleOutcome::Success {
                            probability: success.probability,
                            logit,
                        },
                        Err(reason) => SampleOutcome::Failed { reason },
                    };
                    SampleRecord {
                        unit,
                        outcome,
                        cached: success.cached,
                        latency_ms: success.latency_ms,
                    }
                }
                Err(reason) => SampleRecord {
                    unit,
                    outcome: SampleOutcome::Failed { reason },
                    cached: false,
                    latency_ms: 0,
                },
            }
        }
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await;

    records.sort_by_key(|r| r.unit.sequence);
    records
}
