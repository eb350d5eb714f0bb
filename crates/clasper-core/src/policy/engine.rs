//! Policy evaluation.

use super::schema::{
    ContextConditions, Policy, PolicyConditions, PolicyContext, PolicyEffect, PolicySubject,
    ProvenanceConditions, SubjectType,
};

/// A rule that matched during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PolicyMatch {
    /// The matched rule's id.
    pub policy_id: String,
    /// The matched rule's effect.
    pub effect: PolicyEffect,
    /// Role required by the rule, when it defers to approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
}

/// Outcome of evaluating a context against a tenant's rules.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PolicyEvaluation {
    /// The effective decision after precedence.
    pub decision: PolicyEffect,
    /// Every rule that matched, in rule order.
    pub matched_policies: Vec<PolicyMatch>,
}

impl PolicyEvaluation {
    /// The strictest required role among matched require-approval rules.
    #[must_use]
    pub fn required_role(&self) -> Option<&str> {
        self.matched_policies
            .iter()
            .filter(|m| m.effect == PolicyEffect::RequireApproval)
            .find_map(|m| m.required_role.as_deref())
    }
}

/// Stateless rule matcher.
///
/// The engine owns no rules; callers pass the tenant's rule slice (usually a
/// [`super::PolicySet`] snapshot) on every evaluation, so an in-flight
/// evaluation never observes a concurrent upsert.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    /// Evaluates `ctx` against `rules`.
    ///
    /// Rules outside the tenant are ignored defensively even though stores
    /// only hand the engine same-tenant rules. When no rule matches the
    /// decision is `allow` with an empty match list.
    #[must_use]
    pub fn evaluate(rules: &[Policy], ctx: &PolicyContext) -> PolicyEvaluation {
        let mut matched = Vec::new();

        for rule in rules {
            if !rule.enabled {
                continue;
            }
            if !scope_matches(rule, ctx) {
                continue;
            }
            if !subject_matches(&rule.subject, ctx) {
                continue;
            }
            if !conditions_match(&rule.conditions, ctx) {
                continue;
            }
            matched.push(PolicyMatch {
                policy_id: rule.policy_id.clone(),
                effect: rule.effect,
                required_role: rule.required_role.clone(),
            });
        }

        let decision = matched
            .iter()
            .map(|m| m.effect)
            .max_by_key(|e| e.strictness())
            .unwrap_or(PolicyEffect::Allow);

        PolicyEvaluation {
            decision,
            matched_policies: matched,
        }
    }
}

/// Scope filter: tenant must equal; workspace/environment must match when
/// the rule specifies them.
fn scope_matches(rule: &Policy, ctx: &PolicyContext) -> bool {
    if rule.scope.tenant_id != ctx.tenant_id {
        return false;
    }
    if let Some(ws) = &rule.scope.workspace_id {
        if ctx.workspace_id.as_deref() != Some(ws.as_str()) {
            return false;
        }
    }
    if let Some(env) = &rule.scope.environment {
        if ctx.environment.as_deref() != Some(env.as_str()) {
            return false;
        }
    }
    true
}

/// Subject filter: the named field must equal when a name is specified.
fn subject_matches(subject: &PolicySubject, ctx: &PolicyContext) -> bool {
    let ctx_field = match subject.subject_type {
        SubjectType::Tool => ctx.tool.as_deref(),
        SubjectType::Adapter => ctx.adapter_id.as_deref(),
        SubjectType::Skill => ctx.skill_id.as_deref(),
    };
    match &subject.name {
        Some(name) => ctx_field == Some(name.as_str()),
        None => true,
    }
}

/// Condition filter: every specified condition must be satisfied; unknown
/// context fields never satisfy a condition.
fn conditions_match(conditions: &PolicyConditions, ctx: &PolicyContext) -> bool {
    if let Some(tool) = &conditions.tool {
        if ctx.tool.as_deref() != Some(tool.as_str()) {
            return false;
        }
    }
    if let Some(class) = conditions.adapter_risk_class {
        if ctx.adapter_risk_class != Some(class) {
            return false;
        }
    }
    if let Some(state) = conditions.skill_state {
        if ctx.skill_state != Some(state) {
            return false;
        }
    }
    if let Some(level) = conditions.risk_level {
        if ctx.risk_level != Some(level) {
            return false;
        }
    }
    if let Some(min) = conditions.min_cost_micros {
        match ctx.estimated_cost_micros {
            Some(cost) if cost >= min => {},
            _ => return false,
        }
    }
    if let Some(max) = conditions.max_cost_micros {
        match ctx.estimated_cost_micros {
            Some(cost) if cost <= max => {},
            _ => return false,
        }
    }
    if let Some(capability) = &conditions.capability {
        match &ctx.requested_capabilities {
            Some(caps) if caps.contains(capability) => {},
            _ => return false,
        }
    }
    if let Some(context_conditions) = &conditions.context {
        let Some(declared) = &ctx.context else {
            return false;
        };
        if !context_block_matches(context_conditions, declared) {
            return false;
        }
    }
    if let Some(provenance_conditions) = &conditions.provenance {
        let Some(declared) = &ctx.provenance else {
            return false;
        };
        if !provenance_block_matches(provenance_conditions, declared) {
            return false;
        }
    }
    true
}

fn context_block_matches(
    conditions: &ContextConditions,
    declared: &crate::execution::ContextFlags,
) -> bool {
    fn field(required: Option<bool>, declared: Option<bool>) -> bool {
        match required {
            Some(v) => declared == Some(v),
            None => true,
        }
    }
    field(conditions.external_network, declared.external_network)
        && field(conditions.writes_files, declared.writes_files)
        && field(conditions.elevated_privileges, declared.elevated_privileges)
        && field(conditions.package_manager, declared.package_manager)
        && match &conditions.targets {
            Some(required) => declared.targets.as_ref() == Some(required),
            None => true,
        }
}

fn provenance_block_matches(
    conditions: &ProvenanceConditions,
    declared: &crate::execution::Provenance,
) -> bool {
    if let Some(source) = conditions.source {
        if declared.source != Some(source) {
            return false;
        }
    }
    if let Some(publisher) = &conditions.publisher {
        if declared.publisher.as_deref() != Some(publisher.as_str()) {
            return false;
        }
    }
    if let Some(hash) = &conditions.artifact_hash {
        if declared.artifact_hash.as_deref() != Some(hash.as_str()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::super::schema::PolicyScope;
    use super::*;
    use crate::execution::{ContextFlags, Provenance, ProvenanceSource};
    use crate::risk::RiskLevel;

    fn rule(policy_id: &str, effect: PolicyEffect) -> Policy {
        Policy {
            policy_id: policy_id.to_string(),
            scope: PolicyScope {
                tenant_id: "t1".to_string(),
                workspace_id: None,
                environment: None,
            },
            subject: PolicySubject {
                subject_type: SubjectType::Adapter,
                name: None,
            },
            conditions: PolicyConditions::default(),
            effect,
            required_role: None,
            enabled: true,
        }
    }

    fn ctx() -> PolicyContext {
        PolicyContext {
            tenant_id: "t1".to_string(),
            adapter_id: Some("mkt_adapter".to_string()),
            requested_capabilities: Some(vec!["shell.exec".to_string()]),
            ..PolicyContext::default()
        }
    }

    // =========================================================================
    // Defaults and precedence
    // =========================================================================

    #[test]
    fn no_rules_defaults_to_allow() {
        let eval = PolicyEngine::evaluate(&[], &ctx());
        assert_eq!(eval.decision, PolicyEffect::Allow);
        assert!(eval.matched_policies.is_empty());
    }

    #[test]
    fn deny_beats_require_approval_beats_allow() {
        let rules = vec![
            rule("allow", PolicyEffect::Allow),
            rule("approve", PolicyEffect::RequireApproval),
            rule("deny", PolicyEffect::Deny),
        ];
        let eval = PolicyEngine::evaluate(&rules, &ctx());
        assert_eq!(eval.decision, PolicyEffect::Deny);
        assert_eq!(eval.matched_policies.len(), 3);

        let eval = PolicyEngine::evaluate(&rules[..2], &ctx());
        assert_eq!(eval.decision, PolicyEffect::RequireApproval);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut denied = rule("deny", PolicyEffect::Deny);
        denied.enabled = false;
        let eval = PolicyEngine::evaluate(&[denied], &ctx());
        assert_eq!(eval.decision, PolicyEffect::Allow);
    }

    // =========================================================================
    // Scope and subject filters
    // =========================================================================

    #[test]
    fn wrong_tenant_never_matches() {
        let mut foreign = rule("deny", PolicyEffect::Deny);
        foreign.scope.tenant_id = "t2".to_string();
        let eval = PolicyEngine::evaluate(&[foreign], &ctx());
        assert_eq!(eval.decision, PolicyEffect::Allow);
    }

    #[test]
    fn workspace_scope_requires_matching_workspace() {
        let mut scoped = rule("deny", PolicyEffect::Deny);
        scoped.scope.workspace_id = Some("w1".to_string());

        // Context without a workspace: unknown never matches.
        let eval = PolicyEngine::evaluate(std::slice::from_ref(&scoped), &ctx());
        assert_eq!(eval.decision, PolicyEffect::Allow);

        let mut with_ws = ctx();
        with_ws.workspace_id = Some("w1".to_string());
        let eval = PolicyEngine::evaluate(&[scoped], &with_ws);
        assert_eq!(eval.decision, PolicyEffect::Deny);
    }

    #[test]
    fn named_subject_must_equal() {
        let mut named = rule("deny", PolicyEffect::Deny);
        named.subject.name = Some("other_adapter".to_string());
        let eval = PolicyEngine::evaluate(std::slice::from_ref(&named), &ctx());
        assert_eq!(eval.decision, PolicyEffect::Allow);

        named.subject.name = Some("mkt_adapter".to_string());
        let eval = PolicyEngine::evaluate(&[named], &ctx());
        assert_eq!(eval.decision, PolicyEffect::Deny);
    }

    #[test]
    fn tool_subject_with_no_tool_in_context_matches_without_name() {
        let mut tool_rule = rule("deny", PolicyEffect::Deny);
        tool_rule.subject.subject_type = SubjectType::Tool;
        tool_rule.subject.name = Some("shell.exec".to_string());
        // Context carries no tool: a named tool subject is unknown.
        let eval = PolicyEngine::evaluate(&[tool_rule], &ctx());
        assert_eq!(eval.decision, PolicyEffect::Allow);
    }

    // =========================================================================
    // Conditions
    // =========================================================================

    #[test]
    fn capability_condition_checks_membership() {
        let mut capability_rule = rule("deny", PolicyEffect::Deny);
        capability_rule.conditions.capability = Some("shell.exec".to_string());
        let eval = PolicyEngine::evaluate(std::slice::from_ref(&capability_rule), &ctx());
        assert_eq!(eval.decision, PolicyEffect::Deny);

        let mut no_caps = ctx();
        no_caps.requested_capabilities = None;
        let eval = PolicyEngine::evaluate(&[capability_rule], &no_caps);
        assert_eq!(eval.decision, PolicyEffect::Allow);
    }

    #[test]
    fn unknown_context_never_matches() {
        // The marketplace shell.exec deny rule from the product scenarios.
        let mut marketplace = rule("deny-mkt-shell", PolicyEffect::Deny);
        marketplace.conditions.capability = Some("shell.exec".to_string());
        marketplace.conditions.context = Some(ContextConditions {
            external_network: Some(true),
            ..ContextConditions::default()
        });
        marketplace.conditions.provenance = Some(ProvenanceConditions {
            source: Some(ProvenanceSource::Marketplace),
            ..ProvenanceConditions::default()
        });

        // Fully declared request matches.
        let mut declared = ctx();
        declared.context = Some(ContextFlags {
            external_network: Some(true),
            ..ContextFlags::default()
        });
        declared.provenance = Some(Provenance {
            source: Some(ProvenanceSource::Marketplace),
            ..Provenance::default()
        });
        let eval = PolicyEngine::evaluate(std::slice::from_ref(&marketplace), &declared);
        assert_eq!(eval.decision, PolicyEffect::Deny);

        // Omitting context leaves the condition unknown: no match.
        let mut omitted = declared.clone();
        omitted.context = None;
        let eval = PolicyEngine::evaluate(std::slice::from_ref(&marketplace), &omitted);
        assert_eq!(eval.decision, PolicyEffect::Allow);

        // Declaring the flag false does not match a true condition either.
        let mut declared_false = declared;
        declared_false.context = Some(ContextFlags {
            external_network: Some(false),
            ..ContextFlags::default()
        });
        let eval = PolicyEngine::evaluate(&[marketplace], &declared_false);
        assert_eq!(eval.decision, PolicyEffect::Allow);
    }

    #[test]
    fn cost_bounds_require_declared_cost() {
        let mut expensive = rule("approve-expensive", PolicyEffect::RequireApproval);
        expensive.conditions.min_cost_micros = Some(5_000_000);

        let mut cheap = ctx();
        cheap.estimated_cost_micros = Some(1_000_000);
        let eval = PolicyEngine::evaluate(std::slice::from_ref(&expensive), &cheap);
        assert_eq!(eval.decision, PolicyEffect::Allow);

        let mut costly = ctx();
        costly.estimated_cost_micros = Some(9_000_000);
        let eval = PolicyEngine::evaluate(std::slice::from_ref(&expensive), &costly);
        assert_eq!(eval.decision, PolicyEffect::RequireApproval);

        // Unknown cost never matches a cost bound.
        let eval = PolicyEngine::evaluate(&[expensive], &ctx());
        assert_eq!(eval.decision, PolicyEffect::Allow);
    }

    #[test]
    fn risk_level_condition_matches_bucket() {
        let mut high_risk = rule("approve-high", PolicyEffect::RequireApproval);
        high_risk.conditions.risk_level = Some(RiskLevel::High);
        high_risk.required_role = Some("security_lead".to_string());

        let mut scored = ctx();
        scored.risk_level = Some(RiskLevel::High);
        let eval = PolicyEngine::evaluate(&[high_risk], &scored);
        assert_eq!(eval.decision, PolicyEffect::RequireApproval);
        assert_eq!(eval.required_role(), Some("security_lead"));
    }

    #[test]
    fn matched_list_preserves_rule_order() {
        let rules = vec![
            rule("first", PolicyEffect::Allow),
            rule("second", PolicyEffect::Deny),
        ];
        let eval = PolicyEngine::evaluate(&rules, &ctx());
        let ids: Vec<&str> = eval
            .matched_policies
            .iter()
            .map(|m| m.policy_id.as_str())
            .collect();
        assert_eq!(ids, vec!["first", "second"]);
    }
}
