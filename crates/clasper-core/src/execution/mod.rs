//! Execution request and grant types.
//!
//! An [`ExecutionRequest`] is the transient input to the decision pipeline;
//! an [`ExecutionScope`] is the bounded permit a successful decision grants.
//! Neither is persisted on its own — requests are embedded whole inside
//! decision snapshots, scopes inside grants and traces.
//!
//! Missing declarations stay missing: the optional `context` and
//! `provenance` blocks are never coerced into defaults, because "unknown" is
//! a first-class condition for policy matching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GovernanceError, Result};

/// Capabilities with outsized blast radius; their presence raises risk.
pub const HIGH_IMPACT_CAPABILITIES: &[&str] = &[
    "shell.exec",
    "filesystem.write",
    "network.egress",
    "credentials.read",
];

/// Declared runtime context for an execution request.
///
/// Every field is tri-state: `Some(true)`, `Some(false)`, or undeclared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextFlags {
    /// Whether the execution reaches external networks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_network: Option<bool>,

    /// Whether the execution writes files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writes_files: Option<bool>,

    /// Whether the execution runs with elevated privileges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevated_privileges: Option<bool>,

    /// Whether the execution drives a package manager.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<bool>,

    /// Declared targets (hosts, paths) the execution touches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
}

/// Where the executing skill or artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvenanceSource {
    /// Installed from a public marketplace.
    Marketplace,
    /// Built and published inside the tenant.
    Internal,
    /// Fetched from a git remote.
    Git,
    /// Origin could not be established.
    Unknown,
}

impl ProvenanceSource {
    /// The wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Marketplace => "marketplace",
            Self::Internal => "internal",
            Self::Git => "git",
            Self::Unknown => "unknown",
        }
    }
}

/// Declared provenance of the executing artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Provenance {
    /// Origin class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ProvenanceSource>,

    /// Publisher identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    /// Content hash of the artifact, `sha256:<hex>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
}

/// Maturity of the skill behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillState {
    /// Never exercised by the evaluation harness.
    Untested,
    /// Passed the evaluation harness at least once.
    Tested,
    /// Pinned to a reviewed artifact hash.
    Pinned,
}

impl SkillState {
    /// The wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Untested => "untested",
            Self::Tested => "tested",
            Self::Pinned => "pinned",
        }
    }
}

/// A request to run one agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionRequest {
    /// Caller-chosen execution identifier.
    pub execution_id: String,

    /// The adapter that will perform the execution.
    pub adapter_id: String,

    /// Tenant the request claims; must match the authenticated identity.
    pub tenant_id: String,

    /// Workspace sub-scope.
    pub workspace_id: String,

    /// The skill being executed, when one is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,

    /// Capabilities the execution wants.
    pub requested_capabilities: Vec<String>,

    /// Short verb phrase describing intent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,

    /// Declared runtime context; undeclared means unknown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextFlags>,

    /// Declared provenance; undeclared means unknown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,

    /// Estimated cost in micro-USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost_micros: Option<i64>,

    /// Number of distinct tools the execution may call. Defaults to the
    /// number of requested capabilities when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<u32>,

    /// Deployment environment label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl ExecutionRequest {
    /// The effective tool count (see spec note on the optional field).
    #[must_use]
    pub fn effective_tool_count(&self) -> u32 {
        self.tool_count
            .unwrap_or(self.requested_capabilities.len() as u32)
    }
}

/// The bounded permit granted to an allowed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionScope {
    /// Granted capabilities; always a subset of the requested set.
    pub capabilities: Vec<String>,

    /// Maximum number of execution steps.
    pub max_steps: u32,

    /// Maximum spend in micro-USD.
    pub max_cost_micros: i64,

    /// When the grant lapses.
    pub expires_at: DateTime<Utc>,
}

impl ExecutionScope {
    /// Validates the containment and freshness invariants at issuance.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` if a granted capability was not requested or
    /// the expiry is not in the future.
    pub fn validate(&self, requested: &[String], now: DateTime<Utc>) -> Result<()> {
        for cap in &self.capabilities {
            if !requested.contains(cap) {
                return Err(GovernanceError::new(
                    ErrorKind::SchemaInvalid,
                    format!("granted capability '{cap}' was never requested"),
                ));
            }
        }
        if self.expires_at <= now {
            return Err(GovernanceError::new(
                ErrorKind::SchemaInvalid,
                "granted scope already expired",
            ));
        }
        Ok(())
    }
}

/// The orchestrator's verdict on an execution request.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionVerdict {
    /// Execution may proceed under the attached scope.
    Allowed {
        /// The bounded permit.
        granted_scope: ExecutionScope,
    },
    /// Execution is blocked outright.
    Blocked {
        /// Taxonomy code explaining the block.
        blocked_reason: String,
    },
    /// Execution is deferred pending asynchronous approval.
    PendingApproval {
        /// Identifier of the pending decision.
        decision_id: String,
        /// Single-use token the adapter later presents to consume the
        /// approved decision.
        decision_token: String,
    },
}

impl ExecutionVerdict {
    /// True only for the allowed variant.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

impl Serialize for ExecutionVerdict {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            Self::Allowed { granted_scope } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("allowed", &true)?;
                map.serialize_entry("granted_scope", granted_scope)?;
                map.end()
            },
            Self::Blocked { blocked_reason } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("allowed", &false)?;
                map.serialize_entry("blocked_reason", blocked_reason)?;
                map.end()
            },
            Self::PendingApproval {
                decision_id,
                decision_token,
            } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("allowed", &false)?;
                map.serialize_entry("requires_approval", &true)?;
                map.serialize_entry("decision_id", decision_id)?;
                map.serialize_entry("decision_token", decision_token)?;
                map.end()
            },
        }
    }
}
