//! Identity and tenant context.
//!
//! Every inbound request carries exactly one credential: an adapter token, an
//! operator token, or a backend control-plane token. Verification produces a
//! [`TenantContext`] that travels with the request; downstream components
//! take it as an explicit argument and never re-parse the credential.
//!
//! Permission checks are pure predicates over the context plus the requested
//! value. Wildcards `*` and `namespace:*` match; a missing restriction list
//! means unrestricted.

pub mod jwks;
pub mod token;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GovernanceError, Result};

/// Which kind of principal presented the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    /// An execution adapter authenticating with the adapter secret.
    Adapter,
    /// A human operator authenticating through the external identity
    /// provider.
    Operator,
    /// The tenant backend authenticating with the backend secret.
    Backend,
}

/// Claims carried inside a verified identity credential.
///
/// `tenant_id` is the only required claim; everything else is optional and
/// absent restrictions are treated as unrestricted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Tenant the credential is scoped to.
    pub tenant_id: String,

    /// Optional workspace sub-scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    /// Optional end-user identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Optional agent role label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,

    /// Tools this identity may use; `None` means unrestricted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,

    /// Models this identity may use; `None` means unrestricted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,

    /// Skills this identity may run; `None` means unrestricted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_skills: Option<Vec<String>>,

    /// Hard per-request token ceiling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,

    /// Remaining budget in micro-USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_remaining_micros: Option<i64>,

    /// Operator roles (e.g. `approver`, `admin`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,

    /// Expiry, unix seconds. Validated when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Issued-at, unix seconds. Validated when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Issuer. Validated when the verifier is configured with one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Audience. Validated when the verifier is configured with one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl IdentityClaims {
    /// Minimal claims for the given tenant.
    #[must_use]
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workspace_id: None,
            user_id: None,
            agent_role: None,
            allowed_tools: None,
            allowed_models: None,
            allowed_skills: None,
            max_tokens: None,
            budget_remaining_micros: None,
            roles: None,
            exp: None,
            iat: None,
            iss: None,
            aud: None,
        }
    }
}

/// A verified identity attached to the request-scoped context.
///
/// Constructed only by credential verification (or the guarded development
/// bypass); components downstream receive it by argument.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantContext {
    /// Which principal kind authenticated.
    pub principal: Principal,
    /// The verified claims.
    pub claims: IdentityClaims,
}

impl TenantContext {
    /// Builds a context from verified claims.
    ///
    /// # Errors
    ///
    /// Returns `missing_tenant` if the tenant claim is empty.
    pub fn from_claims(principal: Principal, claims: IdentityClaims) -> Result<Self> {
        if claims.tenant_id.is_empty() {
            return Err(GovernanceError::new(
                ErrorKind::MissingTenant,
                "credential carries no tenant_id",
            ));
        }
        Ok(Self { principal, claims })
    }

    /// The tenant this request is scoped to.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.claims.tenant_id
    }

    /// The workspace sub-scope, when present.
    #[must_use]
    pub fn workspace_id(&self) -> Option<&str> {
        self.claims.workspace_id.as_deref()
    }

    /// True if the identity may invoke `tool`.
    #[must_use]
    pub fn can_use_tool(&self, tool: &str) -> bool {
        list_permits(self.claims.allowed_tools.as_deref(), tool)
    }

    /// True if the identity may call `model`.
    #[must_use]
    pub fn can_use_model(&self, model: &str) -> bool {
        list_permits(self.claims.allowed_models.as_deref(), model)
    }

    /// True if the identity may run `skill`.
    #[must_use]
    pub fn can_use_skill(&self, skill: &str) -> bool {
        list_permits(self.claims.allowed_skills.as_deref(), skill)
    }

    /// True if the remaining budget covers `cost_micros`.
    ///
    /// A missing budget claim means unrestricted.
    #[must_use]
    pub fn has_budget(&self, cost_micros: i64) -> bool {
        self.claims
            .budget_remaining_micros
            .is_none_or(|remaining| cost_micros <= remaining)
    }

    /// True if `tokens` is within the identity's token ceiling.
    #[must_use]
    pub fn within_token_limit(&self, tokens: i64) -> bool {
        self.claims.max_tokens.is_none_or(|max| tokens <= max)
    }

    /// True if the identity carries `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.claims
            .roles
            .as_deref()
            .is_some_and(|roles| roles.iter().any(|r| r == role))
    }
}

/// Matches `value` against a restriction list.
///
/// `None` means unrestricted. Within a list, `*` matches everything and
/// `namespace:*` matches any value under that namespace prefix.
fn list_permits(list: Option<&[String]>, value: &str) -> bool {
    let Some(patterns) = list else {
        return true;
    };
    patterns.iter().any(|p| pattern_matches(p, value))
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(ns) = pattern.strip_suffix(":*") {
        return value
            .strip_prefix(ns)
            .is_some_and(|rest| rest.starts_with(':'));
    }
    pattern == value
}

/// Development bypass preconditions.
///
/// The bypass is permitted only when the deployment is not production AND no
/// external identity provider is configured AND the explicit flag is set.
/// Anything else fails `missing_token` exactly as if no credential were
/// presented.
#[derive(Debug, Clone, Copy)]
pub struct DevBypass {
    /// True when the deployment is a production environment.
    pub production: bool,
    /// True when an external identity provider is configured.
    pub idp_configured: bool,
    /// True when the operator set the explicit bypass flag.
    pub flag_set: bool,
}

impl DevBypass {
    /// Fabricates a synthetic admin identity when all preconditions hold.
    ///
    /// # Errors
    ///
    /// Returns `missing_token` if any precondition is violated.
    pub fn synthesize(self, tenant_id: &str) -> Result<TenantContext> {
        if self.production || self.idp_configured || !self.flag_set {
            return Err(GovernanceError::new(
                ErrorKind::MissingToken,
                "no credential presented",
            ));
        }
        let mut claims = IdentityClaims::for_tenant(tenant_id);
        claims.user_id = Some("dev-bypass".to_string());
        claims.roles = Some(vec!["admin".to_string(), "approver".to_string()]);
        TenantContext::from_claims(Principal::Operator, claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(tools: Option<Vec<&str>>) -> TenantContext {
        let mut claims = IdentityClaims::for_tenant("t1");
        claims.allowed_tools = tools.map(|t| t.into_iter().map(String::from).collect());
        TenantContext::from_claims(Principal::Adapter, claims).unwrap()
    }

    // =========================================================================
    // Permission predicates
    // =========================================================================

    #[test]
    fn missing_restriction_means_unrestricted() {
        assert!(ctx_with(None).can_use_tool("anything"));
    }

    #[test]
    fn exact_match_permits() {
        let ctx = ctx_with(Some(vec!["shell.exec"]));
        assert!(ctx.can_use_tool("shell.exec"));
        assert!(!ctx.can_use_tool("filesystem.write"));
    }

    #[test]
    fn star_matches_everything() {
        assert!(ctx_with(Some(vec!["*"])).can_use_tool("anything"));
    }

    #[test]
    fn namespace_wildcard_matches_prefix_only() {
        let ctx = ctx_with(Some(vec!["fs:*"]));
        assert!(ctx.can_use_tool("fs:read"));
        assert!(ctx.can_use_tool("fs:write:deep"));
        assert!(!ctx.can_use_tool("fsx:read"));
        assert!(!ctx.can_use_tool("fs"));
    }

    #[test]
    fn empty_list_permits_nothing() {
        assert!(!ctx_with(Some(vec![])).can_use_tool("anything"));
    }

    #[test]
    fn budget_and_token_limits() {
        let mut claims = IdentityClaims::for_tenant("t1");
        claims.budget_remaining_micros = Some(2_000_000);
        claims.max_tokens = Some(4096);
        let ctx = TenantContext::from_claims(Principal::Backend, claims).unwrap();
        assert!(ctx.has_budget(2_000_000));
        assert!(!ctx.has_budget(2_000_001));
        assert!(ctx.within_token_limit(4096));
        assert!(!ctx.within_token_limit(4097));
    }

    #[test]
    fn roles_checked_exactly() {
        let mut claims = IdentityClaims::for_tenant("t1");
        claims.roles = Some(vec!["approver".to_string()]);
        let ctx = TenantContext::from_claims(Principal::Operator, claims).unwrap();
        assert!(ctx.has_role("approver"));
        assert!(!ctx.has_role("admin"));
    }

    // =========================================================================
    // Context construction
    // =========================================================================

    #[test]
    fn empty_tenant_rejected() {
        let claims = IdentityClaims::for_tenant("");
        let err = TenantContext::from_claims(Principal::Adapter, claims).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingTenant);
    }

    // =========================================================================
    // Development bypass
    // =========================================================================

    #[test]
    fn bypass_requires_all_three_preconditions() {
        let ok = DevBypass {
            production: false,
            idp_configured: false,
            flag_set: true,
        };
        let ctx = ok.synthesize("t1").unwrap();
        assert!(ctx.has_role("admin"));

        for bad in [
            DevBypass { production: true, ..ok },
            DevBypass { idp_configured: true, ..ok },
            DevBypass { flag_set: false, ..ok },
        ] {
            let err = bad.synthesize("t1").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MissingToken);
        }
    }
}
