//! Deterministic sampling plan construction.
//!
//! The worklist for a given (claim, prompt_version, K, R) is a pure function
//! of its inputs: no clock, no RNG, no I/O. Two runs with identical
//! configuration produce identical plans even if provider responses differ.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::templates::TemplateCatalog;

/// One planned provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleUnit {
    /// Global sequence index; canonical position in the plan. Trace output
    /// and the sample cache key replicates off this enumeration.
    pub sequence: usize,
    /// Paraphrase slot 0..K.
    pub slot: usize,
    /// Replicate index 0..R within the slot.
    pub replicate: usize,
    /// Ordinal of the resolved template in the catalog.
    pub template_ordinal: usize,
    /// Content hash of the resolved template.
    pub template_hash: String,
    pub template_slug: String,
}

/// Enumerate every (template, replicate) unit for a run.
///
/// Slot `i` resolves to `catalog[i mod len]`; when K exceeds the catalog
/// size, later slots intentionally repeat earlier templates. Units are
/// emitted slot-major, replicate-minor, and `sequence` follows that order.
pub fn build_worklist(
    slots: usize,
    replicates: usize,
    catalog: &TemplateCatalog,
) -> Result<Vec<SampleUnit>, ConfigError> {
    if slots < 1 {
        return Err(ConfigError::InvalidSlots);
    }
    if replicates < 1 {
        return Err(ConfigError::InvalidReplicates);
    }
    if catalog.is_empty() {
        return Err(ConfigError::EmptyCatalog);
    }

    let mut units = Vec::with_capacity(slots * replicates);
    for slot in 0..slots {
        let template = catalog.resolve(slot);
        for replicate in 0..replicates {
            units.push(SampleUnit {
                sequence: slot * replicates + replicate,
                slot,
                replicate,
                template_ordinal: template.ordinal,
                template_hash: template.hash.clone(),
                template_slug: template.slug.clone(),
            });
        }
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_major_replicate_minor_order() {
        let catalog = TemplateCatalog::builtin();
        let units = build_worklist(3, 2, &catalog).unwrap();
        assert_eq!(units.len(), 6);
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(unit.sequence, i);
            assert_eq!(unit.slot, i / 2);
            assert_eq!(unit.replicate, i % 2);
        }
    }

    #[test]
    fn rejects_degenerate_inputs() {
        let catalog = TemplateCatalog::builtin();
        assert!(matches!(
            build_worklist(0, 1, &catalog),
            Err(ConfigError::InvalidSlots)
        ));
        assert!(matches!(
            build_worklist(1, 0, &catalog),
            Err(ConfigError::InvalidReplicates)
        ));
    }
}
