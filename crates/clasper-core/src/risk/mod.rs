//! Additive risk scoring for execution requests.
//!
//! The scorer maps request attributes to a numeric score in `[0, 100]` and a
//! bucket. Scoring is additive with fixed, documented weights; every
//! assessment carries its weighted breakdown so operators can audit exactly
//! how a score was reached, even after weights are retuned.
//!
//! The weights are tunable per deployment but constant within one: two
//! identical requests always score identically under the same
//! [`RiskWeights`].

use serde::{Deserialize, Serialize};

use crate::adapter::RiskClass;
use crate::execution::{
    ContextFlags, HIGH_IMPACT_CAPABILITIES, ProvenanceSource, SkillState,
};

/// Bucket cutoffs: scores below each bound fall into the preceding level.
pub const BUCKET_CUTOFFS: [u32; 3] = [25, 55, 80];

/// Risk bucket for a scored request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Score in `[0, 25)`.
    Low,
    /// Score in `[25, 55)`.
    Medium,
    /// Score in `[55, 80)`.
    High,
    /// Score in `[80, 100]`.
    Critical,
}

impl RiskLevel {
    /// The wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Buckets a clipped score.
    #[must_use]
    pub const fn from_score(score: u32) -> Self {
        if score < BUCKET_CUTOFFS[0] {
            Self::Low
        } else if score < BUCKET_CUTOFFS[1] {
            Self::Medium
        } else if score < BUCKET_CUTOFFS[2] {
            Self::High
        } else {
            Self::Critical
        }
    }

    /// True for the buckets that force asynchronous approval when policy
    /// does not decide otherwise.
    #[must_use]
    pub const fn forces_approval(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// Data sensitivity class declared for the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSensitivity {
    /// Personally identifiable information.
    Pii,
    /// Credentials or other secrets.
    Secrets,
}

/// Tunable scoring weights, fixed for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskWeights {
    /// Base points per adapter risk class: low, medium, high, critical.
    pub adapter_base: [i32; 4],
    /// Points per capability beyond the free allowance.
    pub per_extra_capability: i32,
    /// Capabilities included before breadth points accrue.
    pub capability_allowance: u32,
    /// Points when any requested capability is high-impact.
    pub high_impact_capability: i32,
    /// Points for declared external network access.
    pub external_network: i32,
    /// Points for declared privilege elevation.
    pub elevated_privileges: i32,
    /// Points for marketplace provenance.
    pub marketplace_provenance: i32,
    /// Points for unknown provenance.
    pub unknown_provenance: i32,
    /// Points for an untested skill.
    pub untested_skill: i32,
    /// Points (negative) for a pinned skill.
    pub pinned_skill: i32,
    /// Points when sampling temperature exceeds 1.0.
    pub high_temperature: i32,
    /// Points for PII-class data.
    pub pii_data: i32,
    /// Points for secrets-class data.
    pub secrets_data: i32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            adapter_base: [0, 15, 35, 60],
            per_extra_capability: 2,
            capability_allowance: 3,
            high_impact_capability: 10,
            external_network: 10,
            elevated_privileges: 15,
            marketplace_provenance: 10,
            unknown_provenance: 5,
            untested_skill: 10,
            pinned_skill: -5,
            high_temperature: 5,
            pii_data: 10,
            secrets_data: 20,
        }
    }
}

/// Everything the scorer looks at for one request.
#[derive(Debug, Clone)]
pub struct RiskInput<'a> {
    /// Risk class of the resolved adapter.
    pub adapter_risk_class: RiskClass,
    /// Requested capabilities.
    pub capabilities: &'a [String],
    /// Effective tool count (already defaulted by the caller).
    pub tool_count: u32,
    /// Skill maturity, when a skill is involved.
    pub skill_state: Option<SkillState>,
    /// Sampling temperature, when declared.
    pub temperature: Option<f64>,
    /// Declared data sensitivity, when declared.
    pub data_sensitivity: Option<DataSensitivity>,
    /// Declared context flags, when declared.
    pub context: Option<&'a ContextFlags>,
    /// Declared provenance source, when declared.
    pub provenance_source: Option<ProvenanceSource>,
}

/// One contributing factor in an assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactor {
    /// Stable factor label.
    pub factor: String,
    /// Signed points contributed.
    pub points: i32,
}

/// The scored outcome shipped with every decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Clipped score in `[0, 100]`.
    pub score: u32,
    /// Bucket for the score.
    pub level: RiskLevel,
    /// Weighted breakdown, in evaluation order.
    pub breakdown: Vec<RiskFactor>,
}

/// The deployment's scorer.
#[derive(Debug, Clone, Default)]
pub struct RiskScorer {
    weights: RiskWeights,
}

impl RiskScorer {
    /// Creates a scorer with custom weights.
    #[must_use]
    pub const fn new(weights: RiskWeights) -> Self {
        Self { weights }
    }

    /// The active weights.
    #[must_use]
    pub const fn weights(&self) -> &RiskWeights {
        &self.weights
    }

    /// Scores one request.
    #[must_use]
    pub fn score(&self, input: &RiskInput<'_>) -> RiskAssessment {
        let w = &self.weights;
        let mut breakdown = Vec::new();
        let push = |breakdown: &mut Vec<RiskFactor>, factor: &str, points: i32| {
            if points != 0 {
                breakdown.push(RiskFactor {
                    factor: factor.to_string(),
                    points,
                });
            }
        };

        let base = match input.adapter_risk_class {
            RiskClass::Low => w.adapter_base[0],
            RiskClass::Medium => w.adapter_base[1],
            RiskClass::High => w.adapter_base[2],
            RiskClass::Critical => w.adapter_base[3],
        };
        push(&mut breakdown, "adapter_risk_class", base);

        let breadth = input.tool_count.max(input.capabilities.len() as u32);
        if breadth > w.capability_allowance {
            push(
                &mut breakdown,
                "capability_breadth",
                w.per_extra_capability * (breadth - w.capability_allowance) as i32,
            );
        }

        if input
            .capabilities
            .iter()
            .any(|cap| HIGH_IMPACT_CAPABILITIES.contains(&cap.as_str()))
        {
            push(&mut breakdown, "high_impact_capability", w.high_impact_capability);
        }

        if let Some(ctx) = input.context {
            if ctx.external_network == Some(true) {
                push(&mut breakdown, "external_network", w.external_network);
            }
            if ctx.elevated_privileges == Some(true) {
                push(&mut breakdown, "elevated_privileges", w.elevated_privileges);
            }
        }

        match input.provenance_source {
            Some(ProvenanceSource::Marketplace) => {
                push(&mut breakdown, "marketplace_provenance", w.marketplace_provenance);
            },
            Some(ProvenanceSource::Unknown) => {
                push(&mut breakdown, "unknown_provenance", w.unknown_provenance);
            },
            _ => {},
        }

        match input.skill_state {
            Some(SkillState::Untested) => {
                push(&mut breakdown, "untested_skill", w.untested_skill);
            },
            Some(SkillState::Pinned) => {
                push(&mut breakdown, "pinned_skill", w.pinned_skill);
            },
            _ => {},
        }

        if input.temperature.is_some_and(|t| t > 1.0) {
            push(&mut breakdown, "high_temperature", w.high_temperature);
        }

        match input.data_sensitivity {
            Some(DataSensitivity::Pii) => push(&mut breakdown, "pii_data", w.pii_data),
            Some(DataSensitivity::Secrets) => push(&mut breakdown, "secrets_data", w.secrets_data),
            None => {},
        }

        let raw: i32 = breakdown.iter().map(|f| f.points).sum();
        let score = raw.clamp(0, 100) as u32;

        RiskAssessment {
            score,
            level: RiskLevel::from_score(score),
            breakdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn base_input<'a>(capabilities: &'a [String]) -> RiskInput<'a> {
        RiskInput {
            adapter_risk_class: RiskClass::Low,
            capabilities,
            tool_count: capabilities.len() as u32,
            skill_state: None,
            temperature: None,
            data_sensitivity: None,
            context: None,
            provenance_source: None,
        }
    }

    #[test]
    fn minimal_request_scores_low() {
        let capabilities = caps(&["llm"]);
        let assessment = RiskScorer::default().score(&base_input(&capabilities));
        assert_eq!(assessment.score, 0);
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(assessment.breakdown.is_empty());
    }

    #[test]
    fn adapter_class_sets_base() {
        let capabilities = caps(&["llm"]);
        let mut input = base_input(&capabilities);
        input.adapter_risk_class = RiskClass::High;
        let assessment = RiskScorer::default().score(&input);
        assert_eq!(assessment.score, 35);
        assert_eq!(assessment.level, RiskLevel::Medium);
    }

    #[test]
    fn capability_breadth_adds_two_per_extra() {
        let capabilities = caps(&["a", "b", "c", "d", "e"]);
        let assessment = RiskScorer::default().score(&base_input(&capabilities));
        // 5 capabilities, allowance 3 => +4.
        assert_eq!(assessment.score, 4);
    }

    #[test]
    fn high_impact_capability_flagged() {
        let capabilities = caps(&["shell.exec"]);
        let assessment = RiskScorer::default().score(&base_input(&capabilities));
        assert_eq!(assessment.score, 10);
        assert_eq!(assessment.breakdown[0].factor, "high_impact_capability");
    }

    #[test]
    fn context_flags_add_points_only_when_true() {
        let capabilities = caps(&["llm"]);
        let declared_false = ContextFlags {
            external_network: Some(false),
            elevated_privileges: Some(false),
            ..ContextFlags::default()
        };
        let mut input = base_input(&capabilities);
        input.context = Some(&declared_false);
        assert_eq!(RiskScorer::default().score(&input).score, 0);

        let declared_true = ContextFlags {
            external_network: Some(true),
            elevated_privileges: Some(true),
            ..ContextFlags::default()
        };
        input.context = Some(&declared_true);
        assert_eq!(RiskScorer::default().score(&input).score, 25);
    }

    #[test]
    fn pinned_skill_cannot_push_below_zero() {
        let capabilities = caps(&["llm"]);
        let mut input = base_input(&capabilities);
        input.skill_state = Some(SkillState::Pinned);
        let assessment = RiskScorer::default().score(&input);
        assert_eq!(assessment.score, 0);
        // The negative factor still appears in the breakdown.
        assert_eq!(assessment.breakdown[0].points, -5);
    }

    #[test]
    fn score_clips_at_one_hundred() {
        let capabilities = caps(&["shell.exec", "filesystem.write", "network.egress", "a", "b"]);
        let ctx = ContextFlags {
            external_network: Some(true),
            elevated_privileges: Some(true),
            ..ContextFlags::default()
        };
        let input = RiskInput {
            adapter_risk_class: RiskClass::Critical,
            capabilities: &capabilities,
            tool_count: 12,
            skill_state: Some(SkillState::Untested),
            temperature: Some(1.5),
            data_sensitivity: Some(DataSensitivity::Secrets),
            context: Some(&ctx),
            provenance_source: Some(ProvenanceSource::Marketplace),
        };
        let assessment = RiskScorer::default().score(&input);
        assert_eq!(assessment.score, 100);
        assert_eq!(assessment.level, RiskLevel::Critical);
        let sum: i32 = assessment.breakdown.iter().map(|f| f.points).sum();
        assert!(sum > 100, "raw sum {sum} should exceed the clip");
    }

    #[test]
    fn bucket_cutoffs_are_exact() {
        assert_eq!(RiskLevel::from_score(24), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(25), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(54), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(55), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(79), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(80), RiskLevel::Critical);
    }

    #[test]
    fn identical_inputs_score_identically() {
        let capabilities = caps(&["shell.exec", "llm"]);
        let input = base_input(&capabilities);
        let scorer = RiskScorer::default();
        assert_eq!(scorer.score(&input), scorer.score(&input));
    }
}
