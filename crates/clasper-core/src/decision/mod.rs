//! Pending decisions and the asynchronous approval queue.
//!
//! When the orchestrator defers an execution, a [`Decision`] row is
//! persisted with the full request snapshot (request, risk breakdown,
//! matched policies, proposed scope) so the verdict stays reproducible after
//! policies change. A signed, single-use decision token lets the adapter
//! consume the approved decision later without authenticating as the
//! approver.
//!
//! # State machine
//!
//! ```text
//! pending ──resolve(approve)──► approved ──consume──► consumed
//!    │ └────resolve(deny)─────► denied
//!    └───────sweeper──────────► expired
//! ```
//!
//! `denied`, `expired`, and `consumed` are terminal. Every transition is a
//! conditional update keyed on the predecessor state and writes one audit
//! entry.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::error::{ErrorKind, GovernanceError, Result};
use crate::execution::{ExecutionRequest, ExecutionScope};
use crate::identity::TenantContext;
use crate::identity::token as token_envelope;
use crate::policy::PolicyMatch;
use crate::risk::RiskAssessment;
use crate::storage::{Store, StoreError};
use crate::time;

/// Minimum characters a resolution justification must carry.
pub const MIN_JUSTIFICATION_LEN: usize = 10;

/// Default lifetime of a pending decision.
pub const DEFAULT_APPROVAL_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Lifecycle state of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionState {
    /// Awaiting an approver.
    Pending,
    /// Approved, not yet consumed by the adapter.
    Approved,
    /// Denied; terminal.
    Denied,
    /// Lapsed before resolution; terminal.
    Expired,
    /// Approved and spent by the adapter; terminal.
    Consumed,
}

impl DecisionState {
    /// The wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::Consumed => "consumed",
        }
    }

    /// Parses the wire identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "expired" => Some(Self::Expired),
            "consumed" => Some(Self::Consumed),
            _ => None,
        }
    }
}

/// Structured justification category for a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Operations override of a normal block.
    OpsOverride,
    /// A standing policy exception applies.
    PolicyException,
    /// Emergency unblock under incident procedures.
    EmergencyUnblock,
    /// Approval granted for test purposes.
    TestApproval,
}

impl ReasonCode {
    /// The wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpsOverride => "ops_override",
            Self::PolicyException => "policy_exception",
            Self::EmergencyUnblock => "emergency_unblock",
            Self::TestApproval => "test_approval",
        }
    }

    /// Parses the wire identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ops_override" => Some(Self::OpsOverride),
            "policy_exception" => Some(Self::PolicyException),
            "emergency_unblock" => Some(Self::EmergencyUnblock),
            "test_approval" => Some(Self::TestApproval),
            _ => None,
        }
    }
}

/// Which way an approver resolves a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    /// Approve the pending decision.
    Approve,
    /// Deny the pending decision.
    Deny,
}

/// Scope parameters frozen into the snapshot at deferral time.
///
/// The expiry is intentionally absent: it is stamped at consume time so an
/// approval granted hours later still yields a fresh grant window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedScope {
    /// Capabilities to grant; equals the requested set.
    pub capabilities: Vec<String>,
    /// Step ceiling.
    pub max_steps: u32,
    /// Spend ceiling, micro-USD.
    pub max_cost_micros: i64,
}

/// The reproducible snapshot persisted with every deferred decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSnapshot {
    /// The original request, unmodified.
    pub request: ExecutionRequest,
    /// Risk assessment with its weighted breakdown.
    pub risk: RiskAssessment,
    /// Every policy rule that matched.
    pub matched_policies: Vec<PolicyMatch>,
    /// The scope that will be granted on approval.
    pub proposed_scope: ProposedScope,
}

/// A persisted decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Server-chosen identifier.
    pub decision_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Execution awaiting the verdict.
    pub execution_id: String,
    /// Adapter that will perform the execution.
    pub adapter_id: String,
    /// Lifecycle state.
    pub state: DecisionState,
    /// Reproducible snapshot.
    pub request_snapshot: DecisionSnapshot,
    /// Role an approver must carry.
    pub required_role: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Pending-state deadline.
    pub expires_at: DateTime<Utc>,
    /// Resolution time, once resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Resolving principal, once resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Structured reason, once resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    /// Free-text justification, once resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

/// Claims inside a decision token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionTokenClaims {
    /// The referenced decision.
    pub decision_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Adapter allowed to consume.
    pub adapter_id: String,
    /// Execution the decision belongs to.
    pub execution_id: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds; matches the decision's own deadline.
    pub exp: i64,
}

impl token_envelope::Expiring for DecisionTokenClaims {
    fn expires_at_unix(&self) -> Option<i64> {
        Some(self.exp)
    }
}

/// Configuration for the queue.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// Pending-state lifetime.
    pub approval_ttl: Duration,
    /// Grant window stamped at consume time.
    pub grant_ttl: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            approval_ttl: Duration::seconds(DEFAULT_APPROVAL_TTL_SECONDS),
            grant_ttl: Duration::minutes(15),
        }
    }
}

/// The asynchronous approval queue.
pub struct ApprovalQueue {
    store: Store,
    audit: std::sync::Arc<AuditLog>,
    secret: Vec<u8>,
    config: ApprovalConfig,
}

impl std::fmt::Debug for ApprovalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalQueue").finish_non_exhaustive()
    }
}

impl ApprovalQueue {
    /// Creates the queue.
    #[must_use]
    pub fn new(
        store: Store,
        audit: std::sync::Arc<AuditLog>,
        secret: impl Into<Vec<u8>>,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            store,
            audit,
            secret: secret.into(),
            config,
        }
    }

    /// Persists a pending decision and mints its decision token.
    ///
    /// `ttl_override` lets tenant settings shorten or extend the default
    /// pending lifetime.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` for a snapshot outside the canonical
    /// profile, otherwise storage errors mapped into the taxonomy.
    pub fn create_pending(
        &self,
        snapshot: DecisionSnapshot,
        required_role: &str,
        ttl_override: Option<Duration>,
    ) -> Result<(Decision, String)> {
        let decision_id = Uuid::now_v7().to_string();
        let created_at = time::now();
        let expires_at = created_at + ttl_override.unwrap_or(self.config.approval_ttl);

        let snapshot_json = serde_json::to_value(&snapshot)
            .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, e.to_string()))?;
        let snapshot_canonical = crate::canonical::canonical_json_string(&snapshot_json)
            .map_err(GovernanceError::from)?;

        self.store
            .conn()
            .execute(
                "INSERT INTO decisions
                     (decision_id, tenant_id, execution_id, adapter_id, state,
                      request_snapshot, required_role, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8)",
                params![
                    decision_id,
                    snapshot.request.tenant_id,
                    snapshot.request.execution_id,
                    snapshot.request.adapter_id,
                    snapshot_canonical,
                    required_role,
                    time::to_rfc3339(created_at),
                    time::to_rfc3339(expires_at),
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let claims = DecisionTokenClaims {
            decision_id: decision_id.clone(),
            tenant_id: snapshot.request.tenant_id.clone(),
            adapter_id: snapshot.request.adapter_id.clone(),
            execution_id: snapshot.request.execution_id.clone(),
            iat: time::unix_seconds(created_at),
            exp: time::unix_seconds(expires_at),
        };
        let token = token_envelope::sign(&claims, &self.secret)?;

        self.audit.append(
            &snapshot.request.tenant_id,
            "approval_requested",
            serde_json::json!({
                "decision_id": decision_id,
                "execution_id": snapshot.request.execution_id,
                "required_role": required_role,
                "risk_level": snapshot.risk.level.as_str(),
            }),
            "system:orchestrator",
            Some(&decision_id),
        )?;

        let decision = Decision {
            decision_id,
            tenant_id: snapshot.request.tenant_id.clone(),
            execution_id: snapshot.request.execution_id.clone(),
            adapter_id: snapshot.request.adapter_id.clone(),
            state: DecisionState::Pending,
            request_snapshot: snapshot,
            required_role: required_role.to_string(),
            created_at,
            expires_at,
            resolved_at: None,
            resolved_by: None,
            reason_code: None,
            justification: None,
        };
        Ok((decision, token))
    }

    /// Loads a decision within the authenticated tenant.
    ///
    /// # Errors
    ///
    /// Returns `decision_not_found` for a missing or cross-tenant id.
    pub fn get(&self, tenant_id: &str, decision_id: &str) -> Result<Decision> {
        self.load(tenant_id, decision_id)?.ok_or_else(|| {
            GovernanceError::new(
                ErrorKind::DecisionNotFound,
                format!("decision '{decision_id}' not found"),
            )
        })
    }

    /// Resolves a pending decision.
    ///
    /// # Errors
    ///
    /// - `justification_too_short` below [`MIN_JUSTIFICATION_LEN`];
    /// - `decision_not_found` for a missing id;
    /// - `role_insufficient` when the approver lacks the required role;
    /// - `decision_expired` when the deadline passed first;
    /// - `already_resolved` when a concurrent or earlier call won.
    pub fn resolve(
        &self,
        approver: &TenantContext,
        decision_id: &str,
        action: ResolveAction,
        reason_code: ReasonCode,
        justification: &str,
    ) -> Result<Decision> {
        if justification.chars().count() < MIN_JUSTIFICATION_LEN {
            return Err(GovernanceError::new(
                ErrorKind::JustificationTooShort,
                format!("justification must be at least {MIN_JUSTIFICATION_LEN} characters"),
            ));
        }

        let tenant_id = approver.tenant_id().to_string();
        let decision = self.get(&tenant_id, decision_id)?;
        if !approver.has_role(&decision.required_role) {
            return Err(GovernanceError::new(
                ErrorKind::RoleInsufficient,
                format!("resolution requires role '{}'", decision.required_role),
            ));
        }

        let new_state = match action {
            ResolveAction::Approve => DecisionState::Approved,
            ResolveAction::Deny => DecisionState::Denied,
        };
        let resolved_by = approver
            .claims
            .user_id
            .clone()
            .map_or_else(|| "operator:unknown".to_string(), |u| format!("operator:{u}"));
        let now = time::now();

        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE decisions SET state = ?4, resolved_at = ?5, resolved_by = ?6,
                        reason_code = ?7, justification = ?8
                 WHERE decision_id = ?1 AND tenant_id = ?2 AND state = 'pending'
                   AND expires_at > ?3",
                params![
                    decision_id,
                    tenant_id,
                    time::to_rfc3339(now),
                    new_state.as_str(),
                    time::to_rfc3339(now),
                    resolved_by,
                    reason_code.as_str(),
                    justification,
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        if changed == 0 {
            return Err(self.transition_failure(&tenant_id, decision_id, now)?);
        }

        self.audit.append(
            &tenant_id,
            "decision_resolved",
            serde_json::json!({
                "decision_id": decision_id,
                "action": match action {
                    ResolveAction::Approve => "approve",
                    ResolveAction::Deny => "deny",
                },
                "reason_code": reason_code.as_str(),
            }),
            &resolved_by,
            Some(decision_id),
        )?;

        self.get(&tenant_id, decision_id)
    }

    /// Consumes an approved decision and returns the granted scope.
    ///
    /// The adapter presents the decision token minted at deferral; the
    /// transition `approved → consumed` is a conditional update, so a second
    /// consume fails.
    ///
    /// # Errors
    ///
    /// - `invalid_signature` for a bad or mismatched token;
    /// - `decision_not_found`, `decision_expired`;
    /// - `requires_approval` while still pending;
    /// - `already_resolved` for denied or previously consumed decisions.
    pub fn consume(
        &self,
        tenant_id: &str,
        decision_id: &str,
        decision_token: &str,
    ) -> Result<ExecutionScope> {
        let claims: DecisionTokenClaims = token_envelope::verify(decision_token, &self.secret)?;
        if claims.decision_id != decision_id || claims.tenant_id != tenant_id {
            return Err(GovernanceError::new(
                ErrorKind::InvalidSignature,
                "decision token does not reference this decision",
            ));
        }

        let decision = self.get(tenant_id, decision_id)?;
        let now = time::now();

        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE decisions SET state = 'consumed'
                 WHERE decision_id = ?1 AND tenant_id = ?2 AND state = 'approved'",
                params![decision_id, tenant_id],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        if changed == 0 {
            return Err(match decision.state {
                DecisionState::Pending => {
                    if decision.expires_at <= now {
                        GovernanceError::new(ErrorKind::DecisionExpired, "decision expired")
                    } else {
                        GovernanceError::new(
                            ErrorKind::RequiresApproval,
                            "decision is still pending",
                        )
                    }
                },
                DecisionState::Expired => {
                    GovernanceError::new(ErrorKind::DecisionExpired, "decision expired")
                },
                DecisionState::Denied | DecisionState::Consumed => GovernanceError::new(
                    ErrorKind::AlreadyResolved,
                    format!("decision is {}", decision.state.as_str()),
                ),
                // The conditional update lost a race it should have won;
                // surface as a retryable conflict.
                DecisionState::Approved => {
                    GovernanceError::new(ErrorKind::StoreConflict, "concurrent consume")
                },
            });
        }

        self.audit.append(
            tenant_id,
            "decision_consumed",
            serde_json::json!({
                "decision_id": decision_id,
                "execution_id": decision.execution_id,
            }),
            &format!("adapter:{}", decision.adapter_id),
            Some(decision_id),
        )?;

        let proposed = &decision.request_snapshot.proposed_scope;
        Ok(ExecutionScope {
            capabilities: proposed.capabilities.clone(),
            max_steps: proposed.max_steps,
            max_cost_micros: proposed.max_cost_micros,
            expires_at: now + self.config.grant_ttl,
        })
    }

    /// Expires pending decisions past their deadline.
    ///
    /// Called periodically by the sweeper. Each expiry is its own
    /// conditional update plus audit entry.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn sweep_expired(&self) -> Result<u64> {
        let now = time::to_rfc3339(time::now());
        let due: Vec<(String, String)> = {
            let conn = self.store.conn();
            let mut stmt = conn
                .prepare(
                    "SELECT tenant_id, decision_id FROM decisions
                     WHERE state = 'pending' AND expires_at <= ?1",
                )
                .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
            let rows = stmt
                .query_map(params![now], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| GovernanceError::from(StoreError::from(e)))?
        };

        let mut swept = 0;
        for (tenant_id, decision_id) in due {
            let changed = self
                .store
                .conn()
                .execute(
                    "UPDATE decisions SET state = 'expired'
                     WHERE decision_id = ?1 AND tenant_id = ?2 AND state = 'pending'
                       AND expires_at <= ?3",
                    params![decision_id, tenant_id, now],
                )
                .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
            if changed > 0 {
                swept += 1;
                self.audit.append(
                    &tenant_id,
                    "decision_expired",
                    serde_json::json!({"decision_id": decision_id}),
                    "system:sweeper",
                    Some(&decision_id),
                )?;
            }
        }
        Ok(swept)
    }

    /// Classifies why a conditional `pending → *` update matched nothing.
    fn transition_failure(
        &self,
        tenant_id: &str,
        decision_id: &str,
        now: DateTime<Utc>,
    ) -> Result<GovernanceError> {
        let decision = self.get(tenant_id, decision_id)?;
        Ok(match decision.state {
            DecisionState::Pending if decision.expires_at <= now => {
                GovernanceError::new(ErrorKind::DecisionExpired, "decision expired")
            },
            DecisionState::Pending => {
                GovernanceError::new(ErrorKind::StoreConflict, "concurrent transition")
            },
            _ => GovernanceError::new(
                ErrorKind::AlreadyResolved,
                format!("decision is {}", decision.state.as_str()),
            ),
        })
    }

    fn load(&self, tenant_id: &str, decision_id: &str) -> Result<Option<Decision>> {
        let conn = self.store.conn();
        let row = conn
            .query_row(
                "SELECT execution_id, adapter_id, state, request_snapshot, required_role,
                        created_at, expires_at, resolved_at, resolved_by, reason_code,
                        justification
                 FROM decisions WHERE decision_id = ?1 AND tenant_id = ?2",
                params![decision_id, tenant_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let Some((
            execution_id,
            adapter_id,
            state,
            snapshot,
            required_role,
            created_at,
            expires_at,
            resolved_at,
            resolved_by,
            reason_code,
            justification,
        )) = row
        else {
            return Ok(None);
        };

        let state = DecisionState::parse(&state).ok_or_else(|| {
            GovernanceError::new(
                ErrorKind::SchemaInvalid,
                format!("stored decision state '{state}' is unknown"),
            )
        })?;
        let reason_code = match reason_code {
            Some(code) => Some(ReasonCode::parse(&code).ok_or_else(|| {
                GovernanceError::new(
                    ErrorKind::SchemaInvalid,
                    format!("stored reason code '{code}' is unknown"),
                )
            })?),
            None => None,
        };
        let request_snapshot: DecisionSnapshot = serde_json::from_str(&snapshot).map_err(|e| {
            GovernanceError::new(ErrorKind::SchemaInvalid, format!("stored snapshot: {e}"))
        })?;

        Ok(Some(Decision {
            decision_id: decision_id.to_string(),
            tenant_id: tenant_id.to_string(),
            execution_id,
            adapter_id,
            state,
            request_snapshot,
            required_role,
            created_at: parse_ts(&created_at)?,
            expires_at: parse_ts(&expires_at)?,
            resolved_at: resolved_at.as_deref().map(parse_ts).transpose()?,
            resolved_by,
            reason_code,
            justification,
        }))
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    time::parse_rfc3339(raw)
        .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::identity::{IdentityClaims, Principal};
    use crate::risk::{RiskFactor, RiskLevel};

    const SECRET: &[u8] = b"decision-secret";

    fn queue() -> ApprovalQueue {
        let store = Store::in_memory().unwrap();
        let audit = Arc::new(AuditLog::new(store.clone()));
        ApprovalQueue::new(store, audit, SECRET.to_vec(), ApprovalConfig::default())
    }

    fn snapshot(tenant: &str) -> DecisionSnapshot {
        DecisionSnapshot {
            request: ExecutionRequest {
                execution_id: "exec-1".to_string(),
                adapter_id: "a1".to_string(),
                tenant_id: tenant.to_string(),
                workspace_id: "w1".to_string(),
                skill_id: None,
                requested_capabilities: vec!["shell.exec".to_string()],
                intent: None,
                context: None,
                provenance: None,
                estimated_cost_micros: Some(500_000),
                tool_count: None,
                environment: None,
            },
            risk: RiskAssessment {
                score: 60,
                level: RiskLevel::High,
                breakdown: vec![RiskFactor {
                    factor: "adapter_risk_class".to_string(),
                    points: 35,
                }],
            },
            matched_policies: vec![],
            proposed_scope: ProposedScope {
                capabilities: vec!["shell.exec".to_string()],
                max_steps: 16,
                max_cost_micros: 1_000_000,
            },
        }
    }

    fn approver(tenant: &str, roles: &[&str]) -> TenantContext {
        let mut claims = IdentityClaims::for_tenant(tenant);
        claims.user_id = Some("alice".to_string());
        claims.roles = Some(roles.iter().map(ToString::to_string).collect());
        TenantContext::from_claims(Principal::Operator, claims).unwrap()
    }

    // =========================================================================
    // Creation and lookup
    // =========================================================================

    #[test]
    fn create_pending_persists_and_mints_token() {
        let queue = queue();
        let (decision, token) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        assert_eq!(decision.state, DecisionState::Pending);
        assert!(!token.is_empty());

        let loaded = queue.get("t1", &decision.decision_id).unwrap();
        assert_eq!(loaded.request_snapshot.risk.level, RiskLevel::High);
        assert_eq!(loaded.required_role, "approver");
    }

    #[test]
    fn get_is_tenant_scoped() {
        let queue = queue();
        let (decision, _) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        let err = queue.get("t2", &decision.decision_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecisionNotFound);
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    #[test]
    fn approve_then_consume_returns_scope() {
        let queue = queue();
        let (decision, token) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();

        let resolved = queue
            .resolve(
                &approver("t1", &["approver"]),
                &decision.decision_id,
                ResolveAction::Approve,
                ReasonCode::OpsOverride,
                "unblocking the release pipeline",
            )
            .unwrap();
        assert_eq!(resolved.state, DecisionState::Approved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("operator:alice"));

        let scope = queue.consume("t1", &decision.decision_id, &token).unwrap();
        assert_eq!(scope.capabilities, vec!["shell.exec".to_string()]);
        assert_eq!(scope.max_steps, 16);
        assert!(scope.expires_at > time::now());

        let final_state = queue.get("t1", &decision.decision_id).unwrap().state;
        assert_eq!(final_state, DecisionState::Consumed);
    }

    #[test]
    fn short_justification_rejected() {
        let queue = queue();
        let (decision, _) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        let err = queue
            .resolve(
                &approver("t1", &["approver"]),
                &decision.decision_id,
                ResolveAction::Deny,
                ReasonCode::TestApproval,
                "too short",
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::JustificationTooShort);
    }

    #[test]
    fn missing_role_rejected() {
        let queue = queue();
        let (decision, _) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        let err = queue
            .resolve(
                &approver("t1", &["viewer"]),
                &decision.decision_id,
                ResolveAction::Approve,
                ReasonCode::OpsOverride,
                "I think this is fine",
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoleInsufficient);
    }

    #[test]
    fn second_resolve_is_already_resolved() {
        let queue = queue();
        let (decision, _) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        let alice = approver("t1", &["approver"]);
        queue
            .resolve(
                &alice,
                &decision.decision_id,
                ResolveAction::Deny,
                ReasonCode::PolicyException,
                "denied for cause",
            )
            .unwrap();
        let err = queue
            .resolve(
                &alice,
                &decision.decision_id,
                ResolveAction::Approve,
                ReasonCode::OpsOverride,
                "changed my mind",
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    }

    // =========================================================================
    // Consumption
    // =========================================================================

    #[test]
    fn consume_pending_decision_fails() {
        let queue = queue();
        let (decision, token) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        let err = queue
            .consume("t1", &decision.decision_id, &token)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequiresApproval);
    }

    #[test]
    fn consume_denied_decision_fails() {
        let queue = queue();
        let (decision, token) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        queue
            .resolve(
                &approver("t1", &["approver"]),
                &decision.decision_id,
                ResolveAction::Deny,
                ReasonCode::PolicyException,
                "denied for cause",
            )
            .unwrap();
        let err = queue
            .consume("t1", &decision.decision_id, &token)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    }

    #[test]
    fn second_consume_fails() {
        let queue = queue();
        let (decision, token) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        queue
            .resolve(
                &approver("t1", &["approver"]),
                &decision.decision_id,
                ResolveAction::Approve,
                ReasonCode::OpsOverride,
                "approved for release",
            )
            .unwrap();
        queue.consume("t1", &decision.decision_id, &token).unwrap();
        let err = queue
            .consume("t1", &decision.decision_id, &token)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    }

    #[test]
    fn consume_rejects_mismatched_token() {
        let queue = queue();
        let (first, _) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        let (_, other_token) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        let err = queue
            .consume("t1", &first.decision_id, &other_token)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    // =========================================================================
    // Expiry sweeping
    // =========================================================================

    #[test]
    fn sweeper_expires_due_decisions() {
        let store = Store::in_memory().unwrap();
        let audit = Arc::new(AuditLog::new(store.clone()));
        let queue = ApprovalQueue::new(
            store,
            audit,
            SECRET.to_vec(),
            ApprovalConfig {
                approval_ttl: Duration::seconds(-1),
                grant_ttl: Duration::minutes(15),
            },
        );
        let (decision, token) = queue.create_pending(snapshot("t1"), "approver", None).unwrap();

        assert_eq!(queue.sweep_expired().unwrap(), 1);
        assert_eq!(
            queue.get("t1", &decision.decision_id).unwrap().state,
            DecisionState::Expired
        );

        // Terminal: neither resolve nor consume can move it.
        let err = queue
            .resolve(
                &approver("t1", &["approver"]),
                &decision.decision_id,
                ResolveAction::Approve,
                ReasonCode::OpsOverride,
                "too late to matter",
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);

        let err = queue
            .consume("t1", &decision.decision_id, &token)
            .unwrap_err();
        // The decision token itself has also lapsed by then.
        assert!(matches!(
            err.kind(),
            ErrorKind::DecisionExpired | ErrorKind::TokenExpired
        ));
    }

    #[test]
    fn sweeper_ignores_fresh_decisions() {
        let queue = queue();
        queue.create_pending(snapshot("t1"), "approver", None).unwrap();
        assert_eq!(queue.sweep_expired().unwrap(), 0);
    }
}
