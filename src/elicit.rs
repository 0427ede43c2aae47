//! Gateway-backed probe execution.
//!
//! Implements the contract between LLM JSON responses and sample outcomes:
//! render the unit's paraphrase template with the claim, ask the model for a
//! probability, parse it, and consult the sample cache on the way.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{CachedSample, SampleCache, SampleCacheKey};
use crate::config::RunConfig;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::sampling::{ExecuteResult, ExecuteSuccess, SampleExecutor, SampleFailure};
use crate::templates::TemplateCatalog;
use crate::worklist::SampleUnit;

/// Decoding temperature for probes. Replicates measure response noise;
/// greedy decoding would collapse them into copies of one sample.
const PROBE_TEMPERATURE: f32 = 1.0;

/// Hard cap on generation for a probe. The reply is a tiny JSON object.
const PROBE_MAX_OUTPUT_TOKENS_DEFAULT: u32 = 128;
const PROBE_MAX_OUTPUT_TOKENS_GPT5: u32 = 512;

/// GPT-5 family tends to spend ~128 tokens on internal reasoning before
/// emitting any visible output; a 128-token cap can yield empty content.
pub fn probe_max_output_tokens(model: &str, configured: u32) -> u32 {
    let floor = if model.starts_with("openai/gpt-5") {
        PROBE_MAX_OUTPUT_TOKENS_GPT5
    } else {
        PROBE_MAX_OUTPUT_TOKENS_DEFAULT
    };
    configured.max(floor)
}

// =============================================================================
// JSON parsing
// =============================================================================

/// Raw JSON structure from the LLM response.
#[derive(Debug, Deserialize)]
struct ProbeJson {
    #[serde(default)]
    p_true: Option<f64>,
    /// Some models echo the field name they were shown imperfectly.
    #[serde(default)]
    probability: Option<f64>,
    #[serde(default)]
    refused: Option<bool>,
}

/// A parsed probe reply: a raw (not yet validated) probability, or a refusal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeReply {
    Probability(f64),
    Refused,
}

/// Parse an LLM response into a probe reply.
pub fn parse_probe_response(raw: &str) -> Result<ProbeReply, SampleFailure> {
    let json_str = extract_json(raw);

    let parsed: ProbeJson = serde_json::from_str(json_str).map_err(|e| {
        SampleFailure::Malformed {
            message: e.to_string(),
        }
    })?;

    if parsed.refused.unwrap_or(false) {
        return Ok(ProbeReply::Refused);
    }

    let p = parsed
        .p_true
        .or(parsed.probability)
        .ok_or_else(|| SampleFailure::Malformed {
            message: "missing 'p_true'".into(),
        })?;

    Ok(ProbeReply::Probability(p))
}

/// Extract a JSON object from a response (handles models that add
/// surrounding text) via brace matching.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        let mut depth = 0;
        for (i, c) in remainder.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return &remainder[..=i];
                    }
                }
                _ => {}
            }
        }
    }

    trimmed
}

// =============================================================================
// Executor
// =============================================================================

/// Production sample executor: one provider call per unit through the chat
/// gateway, with optional sample-cache read-through.
pub struct GatewayExecutor {
    gateway: Arc<dyn ChatGateway>,
    cache: Option<Arc<dyn SampleCache>>,
    catalog: TemplateCatalog,
    claim: String,
    model: String,
    prompt_version: String,
    max_output_tokens: u32,
    run_id: Uuid,
}

impl GatewayExecutor {
    pub fn new(gateway: Arc<dyn ChatGateway>, catalog: TemplateCatalog, config: &RunConfig) -> Self {
        Self {
            gateway,
            cache: None,
            catalog,
            claim: config.claim.clone(),
            model: config.model.clone(),
            prompt_version: config.prompt_version.clone(),
            max_output_tokens: config.max_output_tokens,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn SampleCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    fn cache_key(&self, unit: &SampleUnit) -> SampleCacheKey {
        SampleCacheKey::new(
            &self.model,
            &self.prompt_version,
            &unit.template_hash,
            &self.claim,
            unit.replicate,
        )
    }

    async fn cache_put(&self, key: &SampleCacheKey, value: CachedSample) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put(key, &value).await {
                warn!(error = %err, "cache write failed");
            }
        }
    }
}

#[async_trait]
impl SampleExecutor for GatewayExecutor {
    async fn execute(&self, unit: &SampleUnit) -> ExecuteResult {
        let template = self
            .catalog
            .get(unit.template_ordinal)
            .ok_or_else(|| SampleFailure::Malformed {
                message: format!("unit references unknown template ordinal {}", unit.template_ordinal),
            })?;

        let key = self.cache_key(unit);
        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(hit)) => {
                    if hit.refused {
                        return Err(SampleFailure::Refused);
                    }
                    if let Some(probability) = hit.probability {
                        return Ok(ExecuteSuccess {
                            probability,
                            cached: true,
                            latency_ms: 0,
                        });
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "cache read failed; falling back to live probe");
                }
            }
        }

        let prompt = template.render(&self.claim);
        let mut request = ChatRequest::new(
            ChatModel::openrouter(&self.model),
            prompt.to_messages(),
            Attribution::new("elicit::probe").with_run(self.run_id),
        )
        .temperature(PROBE_TEMPERATURE)
        .max_tokens(probe_max_output_tokens(&self.model, self.max_output_tokens));
        // Only OpenAI models reliably support response_format=json_object via OpenRouter.
        if self.model.starts_with("openai/") {
            request = request.json();
        }

        let start = Instant::now();
        let response = match self.gateway.chat(request).await {
            Ok(resp) => resp,
            Err(ProviderError::Refused { .. }) => {
                self.cache_put(
                    &key,
                    CachedSample {
                        probability: None,
                        refused: true,
                    },
                )
                .await;
                return Err(SampleFailure::Refused);
            }
            Err(ProviderError::Timeout(_, _)) => return Err(SampleFailure::Timeout),
            Err(ProviderError::Http(e)) if e.is_timeout() => return Err(SampleFailure::Timeout),
            Err(err) => {
                return Err(SampleFailure::Provider {
                    code: err.code().to_string(),
                    message: err.to_string(),
                })
            }
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        match parse_probe_response(&response.content)? {
            ProbeReply::Refused => {
                self.cache_put(
                    &key,
                    CachedSample {
                        probability: None,
                        refused: true,
                    },
                )
                .await;
                Err(SampleFailure::Refused)
            }
            ProbeReply::Probability(probability) => {
                // Only well-formed in-range values are worth replaying; an
                // out-of-range value may be transient noncompliance.
                if probability.is_finite() && probability > 0.0 && probability < 1.0 {
                    self.cache_put(
                        &key,
                        CachedSample {
                            probability: Some(probability),
                            refused: false,
                        },
                    )
                    .await;
                }
                Ok(ExecuteSuccess {
                    probability,
                    cached: false,
                    latency_ms,
                })
            }
        }
    }
}
