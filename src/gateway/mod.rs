//! Provider gateway for OpenRouter chat completions.

pub mod error;
pub mod openrouter;
pub mod types;

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use openrouter::{ChatProvider, OpenRouterAdapter};

pub use error::{ErrorContext, ProviderError};
pub use types::*;

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Retry wrapper around the OpenRouter adapter.
///
/// Retry policy lives here, at the provider boundary; the sampling driver
/// above it never re-dispatches a unit.
pub struct ProviderGateway {
    openrouter: OpenRouterAdapter,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl ChatGateway for ProviderGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl ProviderGateway {
    pub fn from_env() -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        Ok(Self {
            openrouter,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(openrouter: OpenRouterAdapter, config: GatewayConfig) -> Self {
        Self { openrouter, config }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            let result = self.openrouter.chat(&req).await;
            match result {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    debug!(
                        caller = req.attribution.caller,
                        model = req.model.model_id(),
                        code = err.code(),
                        attempt,
                        "provider call failed"
                    );

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider("openrouter", "unknown error", false)))
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}
