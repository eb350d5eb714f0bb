//! Policy rule schema and evaluation context.

use serde::{Deserialize, Serialize};

use crate::adapter::RiskClass;
use crate::execution::{ContextFlags, Provenance, ProvenanceSource, SkillState};
use crate::risk::RiskLevel;

/// The effect a matched rule contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    /// Permit the request.
    Allow,
    /// Block the request outright.
    Deny,
    /// Defer the request to asynchronous approval.
    RequireApproval,
}

impl PolicyEffect {
    /// The wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireApproval => "require_approval",
        }
    }

    /// Parses the wire identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "require_approval" => Some(Self::RequireApproval),
            _ => None,
        }
    }

    /// Strictness rank for precedence: `deny` > `require_approval` >
    /// `allow`.
    #[must_use]
    pub const fn strictness(self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::RequireApproval => 1,
            Self::Deny => 2,
        }
    }
}

/// What kind of subject a rule governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    /// A sensitive tool invocation.
    Tool,
    /// An execution adapter.
    Adapter,
    /// A skill.
    Skill,
}

/// The subject selector of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySubject {
    /// Subject kind.
    #[serde(rename = "type")]
    pub subject_type: SubjectType,

    /// Specific subject name; absent matches any subject of the kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Where a rule applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyScope {
    /// Owning tenant.
    pub tenant_id: String,

    /// Restrict to one workspace; absent applies tenant-wide.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    /// Restrict to one environment; absent applies everywhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// Conditions on the declared context block.
///
/// Each specified field must equal the request's declared value; an
/// undeclared request field never matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConditions {
    /// Required value of `context.external_network`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_network: Option<bool>,

    /// Required value of `context.writes_files`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writes_files: Option<bool>,

    /// Required value of `context.elevated_privileges`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevated_privileges: Option<bool>,

    /// Required value of `context.package_manager`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<bool>,

    /// Required value of `context.targets`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
}

/// Conditions on the declared provenance block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvenanceConditions {
    /// Required provenance source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ProvenanceSource>,

    /// Required publisher.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    /// Required artifact hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
}

/// The condition block of a rule. Unspecified fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConditions {
    /// Required tool name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Required adapter risk class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_risk_class: Option<RiskClass>,

    /// Required skill maturity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_state: Option<SkillState>,

    /// Required risk bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,

    /// Estimated cost must be at least this many micro-USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cost_micros: Option<i64>,

    /// Estimated cost must be at most this many micro-USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_micros: Option<i64>,

    /// A capability that must appear in the requested set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,

    /// Conditions on the declared context block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextConditions>,

    /// Conditions on the declared provenance block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ProvenanceConditions>,
}

/// One tenant policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Unique id within the tenant.
    pub policy_id: String,

    /// Where the rule applies.
    pub scope: PolicyScope,

    /// Which subjects the rule governs.
    pub subject: PolicySubject,

    /// Conditions the request must satisfy.
    #[serde(default)]
    pub conditions: PolicyConditions,

    /// Effect when matched.
    pub effect: PolicyEffect,

    /// Role an approver must carry when the effect defers to approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,

    /// Disabled rules are skipped during evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// The enriched evaluation input the orchestrator assembles.
///
/// Optional fields model genuinely unknown attributes; the engine never
/// substitutes defaults for them.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    /// Authenticated tenant.
    pub tenant_id: String,
    /// Workspace sub-scope.
    pub workspace_id: Option<String>,
    /// Deployment environment.
    pub environment: Option<String>,
    /// Tool being authorized (tool-token path).
    pub tool: Option<String>,
    /// Resolved adapter id.
    pub adapter_id: Option<String>,
    /// Resolved adapter risk class.
    pub adapter_risk_class: Option<RiskClass>,
    /// Skill id, when a skill runs.
    pub skill_id: Option<String>,
    /// Skill maturity.
    pub skill_state: Option<SkillState>,
    /// Risk bucket from the scorer.
    pub risk_level: Option<RiskLevel>,
    /// Estimated cost, micro-USD.
    pub estimated_cost_micros: Option<i64>,
    /// Requested capabilities.
    pub requested_capabilities: Option<Vec<String>>,
    /// Declared intent phrase.
    pub intent: Option<String>,
    /// Declared context flags.
    pub context: Option<ContextFlags>,
    /// Declared provenance.
    pub provenance: Option<Provenance>,
}
