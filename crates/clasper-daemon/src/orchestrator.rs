//! Execution decision orchestration.
//!
//! `decide` composes the registry, risk scorer, policy engine, and approval
//! queue into the single entry point adapters call before running anything:
//!
//! ```text
//! ExecutionRequest
//!     │
//!     ├── tenant check ───────────────► permission_denied
//!     ├── adapter resolution ─────────► adapter_unknown / adapter_disabled
//!     │                                 / capability_not_declared
//!     ├── risk scoring (C5)
//!     ├── policy evaluation (C4)
//!     │
//!     ├── deny ───────────────────────► Blocked
//!     ├── require_approval, or
//!     │   allow + high/critical risk ─► PendingApproval (queued in C7)
//!     └── allow + low/medium risk ────► Allowed (bounded scope)
//! ```
//!
//! Past tenant validation, every branch writes one `execution_decision`
//! audit entry carrying the full request snapshot, the risk breakdown, and
//! the matched policy list, so the verdict is reproducible after policies
//! change. A tenant-mismatched request is the one rejection with no entry:
//! the request's tenant claim is untrusted, so there is no chain to
//! attribute it to.

use std::sync::Arc;

use clasper_core::adapter::AdapterRegistry;
use clasper_core::audit::AuditLog;
use clasper_core::decision::{ApprovalQueue, DecisionSnapshot, ProposedScope};
use clasper_core::error::{ErrorKind, GovernanceError, Result};
use clasper_core::execution::{ExecutionRequest, ExecutionScope, ExecutionVerdict};
use clasper_core::identity::TenantContext;
use clasper_core::policy::{PolicyContext, PolicyEffect, PolicyEvaluation, PolicyStore};
use clasper_core::risk::{RiskAssessment, RiskInput, RiskScorer};
use clasper_core::tenant::TenantStore;
use clasper_core::time;

use crate::config::{COST_SAFETY_FACTOR_PERCENT, Config, DEFAULT_MAX_COST_MICROS};

/// Role required when approval is forced by risk rather than by a rule.
pub const DEFAULT_APPROVER_ROLE: &str = "approver";

/// The execution decision orchestrator.
pub struct DecisionOrchestrator {
    registry: Arc<AdapterRegistry>,
    policies: Arc<PolicyStore>,
    scorer: RiskScorer,
    queue: Arc<ApprovalQueue>,
    audit: Arc<AuditLog>,
    tenants: Arc<TenantStore>,
    grant_ttl: chrono::Duration,
    max_steps: u32,
}

impl std::fmt::Debug for DecisionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionOrchestrator").finish_non_exhaustive()
    }
}

impl DecisionOrchestrator {
    /// Wires the orchestrator from shared services.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        registry: Arc<AdapterRegistry>,
        policies: Arc<PolicyStore>,
        scorer: RiskScorer,
        queue: Arc<ApprovalQueue>,
        audit: Arc<AuditLog>,
        tenants: Arc<TenantStore>,
    ) -> Self {
        Self {
            registry,
            policies,
            scorer,
            queue,
            audit,
            tenants,
            grant_ttl: chrono::Duration::from_std(config.grant_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
            max_steps: config.max_steps,
        }
    }

    /// Decides one execution request.
    ///
    /// Identical inputs under the same policy snapshot yield identical
    /// verdicts.
    ///
    /// # Errors
    ///
    /// Returns the decision-stage kinds (`permission_denied`,
    /// `adapter_unknown`, `adapter_disabled`, `capability_not_declared`,
    /// `budget_exceeded`) plus storage errors; policy denials and deferrals
    /// are verdicts, not errors.
    pub fn decide(
        &self,
        identity: &TenantContext,
        request: &ExecutionRequest,
    ) -> Result<ExecutionVerdict> {
        // 1. The request must belong to the authenticated tenant.
        if request.tenant_id != identity.tenant_id() {
            return Err(GovernanceError::new(
                ErrorKind::PermissionDenied,
                "request tenant does not match authenticated identity",
            ));
        }
        let tenant_id = identity.tenant_id();

        // 2. Resolve the adapter and its declared capability set.
        let adapter = match self.registry.get(tenant_id, &request.adapter_id, None) {
            Ok(adapter) => adapter,
            Err(err) if err.kind() == ErrorKind::AdapterUnknown => {
                self.audit_decision(request, None, None, "blocked", Some("adapter_unknown"))?;
                return Err(err);
            },
            Err(err) => return Err(err),
        };
        if !adapter.enabled {
            self.audit_decision(request, None, None, "blocked", Some("adapter_disabled"))?;
            return Err(GovernanceError::new(
                ErrorKind::AdapterDisabled,
                format!("adapter '{}' is disabled", request.adapter_id),
            ));
        }
        if !adapter.declares_all(&request.requested_capabilities) {
            self.audit_decision(
                request,
                None,
                None,
                "blocked",
                Some("capability_not_declared"),
            )?;
            return Err(GovernanceError::new(
                ErrorKind::CapabilityNotDeclared,
                "request exceeds the adapter's declared capability set",
            ));
        }

        // 3. Score risk.
        let risk = self.scorer.score(&RiskInput {
            adapter_risk_class: adapter.risk_class,
            capabilities: &request.requested_capabilities,
            tool_count: request.effective_tool_count(),
            skill_state: None,
            temperature: None,
            data_sensitivity: None,
            context: request.context.as_ref(),
            provenance_source: request.provenance.as_ref().and_then(|p| p.source),
        });

        // 4. Evaluate policy with the enriched context.
        let policy_ctx = PolicyContext {
            tenant_id: tenant_id.to_string(),
            workspace_id: Some(request.workspace_id.clone()),
            environment: request.environment.clone(),
            tool: None,
            adapter_id: Some(request.adapter_id.clone()),
            adapter_risk_class: Some(adapter.risk_class),
            skill_id: request.skill_id.clone(),
            skill_state: None,
            risk_level: Some(risk.level),
            estimated_cost_micros: request.estimated_cost_micros,
            requested_capabilities: Some(request.requested_capabilities.clone()),
            intent: request.intent.clone(),
            context: request.context.clone(),
            provenance: request.provenance.clone(),
        };
        let evaluation = self.policies.evaluate(&policy_ctx)?;

        // 5. Apply the decision rule.
        match evaluation.decision {
            PolicyEffect::Deny => {
                self.audit_decision(
                    request,
                    Some(&risk),
                    Some(&evaluation),
                    "blocked",
                    Some("blocked_by_policy"),
                )?;
                Ok(ExecutionVerdict::Blocked {
                    blocked_reason: ErrorKind::BlockedByPolicy.code().to_string(),
                })
            },
            PolicyEffect::RequireApproval => {
                self.defer(request, risk, evaluation)
            },
            PolicyEffect::Allow if risk.level.forces_approval() => {
                self.defer(request, risk, evaluation)
            },
            PolicyEffect::Allow => self.grant(request, risk, evaluation),
        }
    }

    /// Queues a pending decision and returns the deferral verdict.
    fn defer(
        &self,
        request: &ExecutionRequest,
        risk: RiskAssessment,
        evaluation: PolicyEvaluation,
    ) -> Result<ExecutionVerdict> {
        let required_role = evaluation
            .required_role()
            .unwrap_or(DEFAULT_APPROVER_ROLE)
            .to_string();
        let proposed_scope = ProposedScope {
            capabilities: request.requested_capabilities.clone(),
            max_steps: self.tenant_max_steps(&request.tenant_id)?,
            max_cost_micros: self.clamped_cost(request)?,
        };

        self.audit_decision(
            request,
            Some(&risk),
            Some(&evaluation),
            "requires_approval",
            None,
        )?;

        let snapshot = DecisionSnapshot {
            request: request.clone(),
            risk,
            matched_policies: evaluation.matched_policies,
            proposed_scope,
        };
        let ttl_override = self
            .tenants
            .settings(&request.tenant_id)?
            .approval_ttl_seconds
            .map(chrono::Duration::seconds);
        let (decision, decision_token) =
            self.queue.create_pending(snapshot, &required_role, ttl_override)?;

        Ok(ExecutionVerdict::PendingApproval {
            decision_id: decision.decision_id,
            decision_token,
        })
    }

    /// Mints a bounded scope for an allowed low/medium-risk request.
    fn grant(
        &self,
        request: &ExecutionRequest,
        risk: RiskAssessment,
        evaluation: PolicyEvaluation,
    ) -> Result<ExecutionVerdict> {
        let now = time::now();
        let ttl = self
            .tenants
            .settings(&request.tenant_id)?
            .grant_ttl_seconds
            .map_or(self.grant_ttl, chrono::Duration::seconds);
        let scope = ExecutionScope {
            capabilities: request.requested_capabilities.clone(),
            max_steps: self.tenant_max_steps(&request.tenant_id)?,
            max_cost_micros: self.clamped_cost(request)?,
            expires_at: now + ttl,
        };
        scope.validate(&request.requested_capabilities, now)?;

        self.audit_decision(request, Some(&risk), Some(&evaluation), "allowed", None)?;

        Ok(ExecutionVerdict::Allowed {
            granted_scope: scope,
        })
    }

    /// `min(estimate × safety factor, tenant budget remaining)`, with the
    /// deployment default standing in for an absent estimate.
    fn clamped_cost(&self, request: &ExecutionRequest) -> Result<i64> {
        let padded = request
            .estimated_cost_micros
            .map_or(DEFAULT_MAX_COST_MICROS, |estimate| {
                estimate.saturating_mul(COST_SAFETY_FACTOR_PERCENT) / 100
            });

        let remaining = self
            .tenants
            .remaining_budget_micros(&request.tenant_id, &request.workspace_id)?
            .or(self
                .tenants
                .remaining_budget_micros(&request.tenant_id, "")?);

        match remaining {
            Some(remaining) if remaining <= 0 => Err(GovernanceError::new(
                ErrorKind::BudgetExceeded,
                "tenant budget is exhausted",
            )),
            Some(remaining) => Ok(padded.min(remaining)),
            None => Ok(padded),
        }
    }

    fn tenant_max_steps(&self, tenant_id: &str) -> Result<u32> {
        Ok(self
            .tenants
            .settings(tenant_id)?
            .max_steps
            .unwrap_or(self.max_steps))
    }

    /// One `execution_decision` audit entry per branch.
    fn audit_decision(
        &self,
        request: &ExecutionRequest,
        risk: Option<&RiskAssessment>,
        evaluation: Option<&PolicyEvaluation>,
        outcome: &str,
        blocked_reason: Option<&str>,
    ) -> Result<()> {
        let event = serde_json::json!({
            "request": request,
            "risk": risk,
            "matched_policies": evaluation.map(|e| &e.matched_policies),
            "decision": outcome,
            "blocked_reason": blocked_reason,
        });
        self.audit.append(
            &request.tenant_id,
            "execution_decision",
            event,
            "system:orchestrator",
            Some(&request.execution_id),
        )?;
        Ok(())
    }
}
