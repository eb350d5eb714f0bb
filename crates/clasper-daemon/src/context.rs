//! Request-scoped context and credential authentication.
//!
//! A [`RequestContext`] carries the verified identity and an optional
//! deadline through every service call. There is no ambient tenant: every
//! downstream function takes the context (or the [`TenantContext`] inside
//! it) as an explicit argument.

use std::time::Instant;

use clasper_core::error::{ErrorKind, GovernanceError, Result};
use clasper_core::identity::jwks::{ClaimExpectations, verify_jws};
use clasper_core::identity::{DevBypass, IdentityClaims, Principal, TenantContext, token};

use crate::config::{Config, DeployEnv};

/// The per-request bundle handed to every service entry point.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The authenticated identity.
    pub identity: TenantContext,
    /// Absolute deadline; downstream I/O aborts with `timeout` past it.
    pub deadline: Option<Instant>,
}

impl RequestContext {
    /// Wraps an identity with no deadline.
    #[must_use]
    pub const fn new(identity: TenantContext) -> Self {
        Self {
            identity,
            deadline: None,
        }
    }

    /// Attaches a deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Fails with `timeout` once the deadline has passed.
    ///
    /// Long operations call this between suspension points so an expired
    /// request stops burning I/O.
    ///
    /// # Errors
    ///
    /// Returns `timeout` past the deadline.
    pub fn check_deadline(&self) -> Result<()> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(GovernanceError::new(
                ErrorKind::Timeout,
                "request deadline elapsed",
            ));
        }
        Ok(())
    }
}

/// Verifies inbound credentials into tenant contexts.
///
/// Each principal kind has its own trust root: adapters and the backend
/// authenticate with symmetric secrets, operators through the external
/// identity provider's JWKS.
pub struct Authenticator {
    adapter_secret: Vec<u8>,
    agent_secret: Vec<u8>,
    oidc: Option<(clasper_core::identity::jwks::JwkSet, ClaimExpectations)>,
    bypass: DevBypass,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("oidc", &self.oidc.is_some())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Builds the authenticator from daemon configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let oidc = config.oidc.as_ref().map(|oidc| {
            (
                oidc.jwks.clone(),
                ClaimExpectations {
                    issuer: oidc.issuer.clone(),
                    audience: oidc.audience.clone(),
                },
            )
        });
        Self {
            adapter_secret: config.adapter_jwt_secret.clone(),
            agent_secret: config.agent_jwt_secret.clone(),
            oidc,
            bypass: DevBypass {
                production: config.deploy_env == DeployEnv::Production,
                idp_configured: config.idp_configured(),
                flag_set: config.dev_no_auth,
            },
        }
    }

    /// Verifies an adapter credential.
    ///
    /// # Errors
    ///
    /// Returns the distinct authentication kinds from token verification.
    pub fn authenticate_adapter(&self, credential: &str) -> Result<TenantContext> {
        let claims: IdentityClaims = token::verify(credential, &self.adapter_secret)?;
        TenantContext::from_claims(Principal::Adapter, claims)
    }

    /// Verifies a backend control-plane credential.
    ///
    /// # Errors
    ///
    /// Returns the distinct authentication kinds from token verification.
    pub fn authenticate_backend(&self, credential: &str) -> Result<TenantContext> {
        let claims: IdentityClaims = token::verify(credential, &self.agent_secret)?;
        TenantContext::from_claims(Principal::Backend, claims)
    }

    /// Verifies an operator credential against the identity provider.
    ///
    /// # Errors
    ///
    /// Returns `missing_token` when no identity provider is configured,
    /// otherwise the JWS verification kinds.
    pub fn authenticate_operator(&self, credential: &str) -> Result<TenantContext> {
        let Some((jwks, expectations)) = &self.oidc else {
            return Err(GovernanceError::new(
                ErrorKind::MissingToken,
                "no operator identity provider configured",
            ));
        };
        let claims: IdentityClaims = verify_jws(credential, jwks, expectations)?;
        TenantContext::from_claims(Principal::Operator, claims)
    }

    /// The development bypass for unauthenticated local use.
    ///
    /// # Errors
    ///
    /// Returns `missing_token` unless all three bypass preconditions hold
    /// (non-production, no identity provider, explicit flag).
    pub fn dev_bypass(&self, tenant_id: &str) -> Result<TenantContext> {
        self.bypass.synthesize(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use clasper_core::identity::token::sign;

    use super::*;

    fn authenticator(dev_no_auth: bool) -> Authenticator {
        let mut config = Config::for_tests();
        config.dev_no_auth = dev_no_auth;
        Authenticator::new(&config)
    }

    #[test]
    fn adapter_and_backend_secrets_are_distinct_domains() {
        let auth = authenticator(false);
        let claims = IdentityClaims::for_tenant("t1");
        let adapter_token = sign(&claims, b"adapter-secret").unwrap();

        let ctx = auth.authenticate_adapter(&adapter_token).unwrap();
        assert_eq!(ctx.principal, Principal::Adapter);

        // The same token is not a valid backend credential.
        let err = auth.authenticate_backend(&adapter_token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn operator_auth_requires_configured_idp() {
        let auth = authenticator(false);
        let err = auth.authenticate_operator("anything").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingToken);
    }

    #[test]
    fn dev_bypass_honors_flag() {
        let err = authenticator(false).dev_bypass("t1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingToken);

        let ctx = authenticator(true).dev_bypass("t1").unwrap();
        assert!(ctx.has_role("admin"));
    }

    #[test]
    fn deadline_check_times_out() {
        let claims = IdentityClaims::for_tenant("t1");
        let identity = TenantContext::from_claims(Principal::Backend, claims).unwrap();
        let ctx = RequestContext::new(identity).with_deadline(Instant::now());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(ctx.check_deadline().unwrap_err().kind(), ErrorKind::Timeout);
    }
}
