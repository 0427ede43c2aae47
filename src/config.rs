//! Run configuration: resolved once at run start, passed by reference into
//! the estimator. Nothing below this layer reads process-wide state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::DEFAULT_TRIM_FRACTION;
use crate::bootstrap::DEFAULT_BOOTSTRAP_REPLICAS;
use crate::templates::CATALOG_VERSION;

/// Environment override for the bootstrap seed (u64, decimal).
pub const SEED_ENV_VAR: &str = "CREDENCE_SEED";

/// Hard cap on concurrent provider calls.
pub const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("paraphrase_slots must be >= 1")]
    InvalidSlots,
    #[error("replicates must be >= 1")]
    InvalidReplicates,
    #[error("bootstrap_replicas must be >= 1")]
    InvalidBootstrapReplicas,
    #[error("trim_fraction must lie in [0, 0.5): {0}")]
    InvalidTrimFraction(f64),
    #[error("concurrency must be between 1 and {MAX_CONCURRENCY}")]
    InvalidConcurrency,
    #[error("template catalog is empty")]
    EmptyCatalog,
    #[error("claim must not be empty")]
    EmptyClaim,
}

/// Configuration for one estimation run.
///
/// Deserializable so the CLI can accept a JSON request file; every field has
/// a default except the claim and model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// The claim whose prior probability is being estimated.
    pub claim: String,
    /// OpenRouter model ID, e.g. "anthropic/claude-3-5-haiku".
    pub model: String,
    /// Version tag of the probe template set (default: built-in catalog).
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
    /// Number of paraphrase slots K. Slots beyond the catalog size reuse
    /// earlier templates via wraparound.
    #[serde(default = "default_slots")]
    pub paraphrase_slots: usize,
    /// Replicates R per slot.
    #[serde(default = "default_replicates")]
    pub replicates: usize,
    /// Cap on distinct templates drawn from the catalog (default: all).
    #[serde(default)]
    pub template_cap: Option<usize>,
    /// Bootstrap replica count B.
    #[serde(default = "default_bootstrap_replicas")]
    pub bootstrap_replicas: u32,
    /// Explicit bootstrap seed. `None` falls back to the CREDENCE_SEED
    /// environment variable, then to a value derived from the run inputs.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Symmetric trim fraction for the template-mean center.
    #[serde(default = "default_trim_fraction")]
    pub trim_fraction: f64,
    /// Concurrent provider calls.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Max output tokens per probe call.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_prompt_version() -> String {
    CATALOG_VERSION.to_string()
}
fn default_slots() -> usize {
    8
}
fn default_replicates() -> usize {
    3
}
fn default_bootstrap_replicas() -> u32 {
    DEFAULT_BOOTSTRAP_REPLICAS
}
fn default_trim_fraction() -> f64 {
    DEFAULT_TRIM_FRACTION
}
fn default_concurrency() -> usize {
    8
}
fn default_max_output_tokens() -> u32 {
    128
}

impl RunConfig {
    pub fn new(claim: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
            model: model.into(),
            prompt_version: default_prompt_version(),
            paraphrase_slots: default_slots(),
            replicates: default_replicates(),
            template_cap: None,
            bootstrap_replicas: default_bootstrap_replicas(),
            seed: None,
            trim_fraction: default_trim_fraction(),
            concurrency: default_concurrency(),
            max_output_tokens: default_max_output_tokens(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim.trim().is_empty() {
            return Err(ConfigError::EmptyClaim);
        }
        if self.paraphrase_slots < 1 {
            return Err(ConfigError::InvalidSlots);
        }
        if self.replicates < 1 {
            return Err(ConfigError::InvalidReplicates);
        }
        if self.bootstrap_replicas < 1 {
            return Err(ConfigError::InvalidBootstrapReplicas);
        }
        if !(0.0..0.5).contains(&self.trim_fraction) {
            return Err(ConfigError::InvalidTrimFraction(self.trim_fraction));
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::InvalidConcurrency);
        }
        if matches!(self.template_cap, Some(0)) {
            return Err(ConfigError::EmptyCatalog);
        }
        Ok(())
    }

    /// Resolve the bootstrap seed: explicit config value, else environment
    /// override, else a value derived from the run inputs.
    ///
    /// The derived fallback hashes the fields that define the sampling plan,
    /// so two runs with identical configuration resample identically even
    /// when nobody chose a seed. blake3 is used (rather than the std hasher)
    /// because its output is specified and stable across platforms and
    /// releases.
    pub fn resolve_seed(&self) -> u64 {
        if let Some(seed) = self.seed {
            return seed;
        }
        if let Ok(raw) = std::env::var(SEED_ENV_VAR) {
            if let Ok(seed) = raw.trim().parse::<u64>() {
                return seed;
            }
        }
        self.derived_seed()
    }

    fn derived_seed(&self) -> u64 {
        let slots = self.paraphrase_slots.to_string();
        let replicates = self.replicates.to_string();
        let cap = self.template_cap.map_or_else(String::new, |c| c.to_string());
        let replicas = self.bootstrap_replicas.to_string();
        let fields: [&str; 7] = [
            &self.claim,
            &self.model,
            &self.prompt_version,
            &slots,
            &replicates,
            &cap,
            &replicas,
        ];

        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update(b"|");
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RunConfig {
        RunConfig::new("water is wet", "openai/gpt-5-mini")
    }

    #[test]
    fn defaults_validate() {
        base().validate().unwrap();
    }

    #[test]
    fn rejects_zero_slots_and_replicates() {
        let mut cfg = base();
        cfg.paraphrase_slots = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidSlots)));

        let mut cfg = base();
        cfg.replicates = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidReplicates)));
    }

    #[test]
    fn rejects_bad_trim_fraction() {
        let mut cfg = base();
        cfg.trim_fraction = 0.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidTrimFraction(_))
        ));
    }

    #[test]
    fn rejects_zero_template_cap() {
        let mut cfg = base();
        cfg.template_cap = Some(0);
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyCatalog)));
    }

    #[test]
    fn explicit_seed_wins() {
        let mut cfg = base();
        cfg.seed = Some(1337);
        assert_eq!(cfg.resolve_seed(), 1337);
    }

    #[test]
    fn derived_seed_is_stable_and_input_sensitive() {
        let cfg = base();
        let a = cfg.derived_seed();
        let b = cfg.derived_seed();
        assert_eq!(a, b);

        let mut other = base();
        other.claim = "water is dry".to_string();
        assert_ne!(a, other.derived_seed());
    }

    #[test]
    fn request_json_fills_defaults() {
        let cfg: RunConfig = serde_json::from_str(
            r#"{"claim": "the moon is tidally locked", "model": "openai/gpt-5-mini"}"#,
        )
        .unwrap();
        assert_eq!(cfg.paraphrase_slots, 8);
        assert_eq!(cfg.replicates, 3);
        assert_eq!(cfg.bootstrap_replicas, DEFAULT_BOOTSTRAP_REPLICAS);
        cfg.validate().unwrap();
    }
}
