//! Paraphrase probe templates for belief elicitation.
//!
//! Domain logic for rendering probability probes. Provider-agnostic.
//!
//! Each template is a different wording of the same question — "how likely is
//! this claim to be true?" — so that template-to-template variation in the
//! answers can be measured and resampled as its own source of uncertainty.

use serde::Serialize;

use crate::config::ConfigError;
use crate::gateway::Message;

/// Version tag for the built-in probe catalog. Bump when any template text
/// changes, so cached samples from older wordings are never reused.
pub const CATALOG_VERSION: &str = "probe_v2";

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered probe ready for the LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// A probe template with a `{claim}` placeholder.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl ProbeTemplate {
    pub fn render(&self, claim: &str) -> PromptInstance {
        // Escape user-provided input to prevent prompt injection via XML tag breaking
        let safe_claim = escape_xml_chars(claim);

        let system = self.system.replace("{claim}", &safe_claim);
        let user = self.user.replace("{claim}", &safe_claim);

        PromptInstance {
            template_slug: self.slug.to_string(),
            system: system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }

    /// Stable content identity of the template wording.
    pub fn content_hash(&self) -> String {
        blake3::hash(format!("{}\n{}", self.system, self.user).as_bytes())
            .to_hex()
            .to_string()
    }
}

// =============================================================================
// Standard probes
// =============================================================================

pub const PROBE_DIRECT: ProbeTemplate = ProbeTemplate {
    slug: "probe_direct",
    system: r#"You are a careful probability assessor. Given a claim, you report the probability that it is true as a number strictly between 0 and 1 — never exactly 0 or 1, because no empirical claim deserves absolute certainty.

Output only valid JSON. Example:
{"p_true": 0.73}"#,
    user: r#"What is the probability that the following claim is true?
<claim>
{claim}
</claim>

Return a JSON object with your probability.
json:"#,
};

pub const PROBE_FORECAST: ProbeTemplate = ProbeTemplate {
    slug: "probe_forecast",
    system: r#"You are a calibrated forecaster in the tradition of superforecasting: you decompose, consider base rates, and state your credence as a probability strictly inside (0, 1). A forecaster who says 0 or 1 has stopped forecasting.

Output only valid JSON `{"p_true": <probability>}`. If the question is unambiguously blocked by policy constraints, you may return `{"refused": true}` instead, but mere uncertainty is never a reason to refuse — express it in the number.
Example:
{"p_true": 0.42}"#,
    user: r#"Forecast whether this claim is true:
<claim>
{claim}
</claim>

json:"#,
};

pub const PROBE_WAGER: ProbeTemplate = ProbeTemplate {
    slug: "probe_wager",
    system: r#"You set fair betting odds. For a given claim, report the price (between 0 and 1, exclusive) at which you would be indifferent between buying and selling a contract that pays 1 if the claim is true and 0 otherwise.

Return only JSON: {"p_true": <price>}. If policy-blocked, return {"refused": true}."#,
    user: r#"Price this contract:
<claim>{claim}</claim>

json:"#,
};

pub const PROBE_SKEPTIC: ProbeTemplate = ProbeTemplate {
    slug: "probe_skeptic",
    system: r#"You are a skeptical fact-checker. Before assenting to any claim you look for reasons it could be false: sampling bias, survivorship, misattribution, outdated figures. After weighing the evidence for and against, you state the probability that the claim is true, strictly between 0 and 1.

Output only valid JSON. Example:
{"p_true": 0.18}"#,
    user: r#"Assess this claim:
<claim>
{claim}
</claim>

How probable is it that the claim is true? Return a JSON object.
json:"#,
};

pub const PROBE_EVIDENCE: ProbeTemplate = ProbeTemplate {
    slug: "probe_evidence",
    system: r#"You weigh evidence like a Bayesian. Start from a reasonable prior for claims of this kind, update on everything you know that bears on it, and report the posterior probability that the claim is true as a number strictly inside (0, 1).

Return only JSON: {"p_true": <posterior>}."#,
    user: r#"<claim>
{claim}
</claim>

Given everything you know, what is the probability that this claim is true?
json:"#,
};

pub const PROBE_JURY: ProbeTemplate = ProbeTemplate {
    slug: "probe_jury",
    system: r#"Imagine a panel of one hundred well-informed, independent experts each judged the claim below. You report the fraction you expect to conclude the claim is true, as a probability strictly between 0 and 1.

Output only valid JSON `{"p_true": <fraction>}`. If policy-blocked, return `{"refused": true}`."#,
    user: r#"<claim>{claim}</claim>

What fraction of the panel concludes this is true?
json:"#,
};

pub const PROBES: &[ProbeTemplate] = &[
    PROBE_DIRECT,
    PROBE_FORECAST,
    PROBE_WAGER,
    PROBE_SKEPTIC,
    PROBE_EVIDENCE,
    PROBE_JURY,
];

pub fn probe_by_slug(slug: &str) -> Option<ProbeTemplate> {
    PROBES.iter().find(|t| t.slug == slug).copied()
}

// =============================================================================
// Catalog
// =============================================================================

/// A template registered in a catalog: ordinal position plus content identity.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredTemplate {
    /// Ordinal index within the catalog.
    pub ordinal: usize,
    pub slug: String,
    /// blake3 hex digest of the template wording.
    pub hash: String,
    #[serde(skip)]
    template: ProbeTemplate,
}

impl RegisteredTemplate {
    pub fn render(&self, claim: &str) -> PromptInstance {
        self.template.render(claim)
    }
}

/// Ordered set of probe templates for one run.
///
/// Slots beyond the catalog size wrap around to earlier templates, so a run
/// can ask for more paraphrase slots than there are distinct wordings.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    version: String,
    templates: Vec<RegisteredTemplate>,
}

impl TemplateCatalog {
    /// The built-in probe catalog.
    pub fn builtin() -> Self {
        Self::from_templates(CATALOG_VERSION, PROBES)
    }

    pub fn from_templates(version: impl Into<String>, templates: &[ProbeTemplate]) -> Self {
        let templates = templates
            .iter()
            .enumerate()
            .map(|(ordinal, t)| RegisteredTemplate {
                ordinal,
                slug: t.slug.to_string(),
                hash: t.content_hash(),
                template: *t,
            })
            .collect();
        Self {
            version: version.into(),
            templates,
        }
    }

    /// Restrict the catalog to its first `cap` templates. Applied before
    /// wraparound, so K slots cycle over at most `cap` distinct wordings.
    pub fn with_cap(mut self, cap: usize) -> Result<Self, ConfigError> {
        if cap == 0 {
            return Err(ConfigError::EmptyCatalog);
        }
        self.templates.truncate(cap);
        Ok(self)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Template for a paraphrase slot, wrapping past the catalog size.
    pub fn resolve(&self, slot: usize) -> &RegisteredTemplate {
        &self.templates[slot % self.templates.len()]
    }

    pub fn get(&self, ordinal: usize) -> Option<&RegisteredTemplate> {
        self.templates.get(ordinal)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTemplate> {
        self.templates.iter()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_render_substitutes_claim() {
        let p = PROBE_DIRECT.render("The Atlantic is saltier than the Pacific.");
        assert!(p.system.contains("probability"));
        assert!(p.user.contains("The Atlantic is saltier than the Pacific."));
        assert!(!p.user.contains("{claim}"));
    }

    #[test]
    fn probe_lookup() {
        assert!(probe_by_slug("probe_direct").is_some());
        assert!(probe_by_slug("nonexistent").is_none());
    }

    #[test]
    fn xml_escaping() {
        let p = PROBE_DIRECT.render("<script>alert('xss')</script>");
        assert!(p.user.contains("&lt;script&gt;"));
        assert!(!p.user.contains("<script>"));
    }

    #[test]
    fn content_hashes_are_stable_and_distinct() {
        let a = PROBE_DIRECT.content_hash();
        let b = PROBE_DIRECT.content_hash();
        assert_eq!(a, b);

        let mut hashes: Vec<String> = PROBES.iter().map(|t| t.content_hash()).collect();
        hashes.sort();
        hashes.dedup();
        assert_eq!(hashes.len(), PROBES.len(), "probe wordings must be distinct");
    }

    #[test]
    fn catalog_wraps_past_its_size() {
        let catalog = TemplateCatalog::builtin();
        let n = catalog.len();
        assert_eq!(catalog.resolve(0).ordinal, 0);
        assert_eq!(catalog.resolve(n).ordinal, 0);
        assert_eq!(catalog.resolve(n + 2).ordinal, 2);
    }

    #[test]
    fn catalog_cap_truncates() {
        let catalog = TemplateCatalog::builtin().with_cap(2).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.resolve(5).ordinal, 1);
        assert!(TemplateCatalog::builtin().with_cap(0).is_err());
    }
}
