//! Daemon configuration from the environment.
//!
//! Every knob the deployment exposes is enumerated here; nothing else in
//! the daemon reads the environment. Secrets arrive as raw strings and stay
//! inside [`Config`]; they are never logged.

use std::time::Duration;

use clasper_core::error::{ErrorKind, GovernanceError, Result};
use clasper_core::identity::jwks::JwkSet;
use clasper_core::telemetry::{DEFAULT_MAX_SKEW_SECONDS, EnforcementMode};

/// Default path of the authoritative database.
pub const DEFAULT_DB_PATH: &str = "clasper.db";

/// Default grant lifetime.
pub const DEFAULT_GRANT_TTL: Duration = Duration::from_secs(15 * 60);

/// Default step ceiling stamped into grants.
pub const DEFAULT_MAX_STEPS: u32 = 16;

/// Default spend ceiling when a request declares no estimate, micro-USD.
pub const DEFAULT_MAX_COST_MICROS: i64 = 1_000_000;

/// Safety margin applied to declared cost estimates, percent.
pub const COST_SAFETY_FACTOR_PERCENT: i64 = 150;

/// How often the expiry sweeper runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Deployment environment label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployEnv {
    /// Production; the development bypass is never permitted.
    Production,
    /// Anything else.
    Development,
}

/// Operator identity provider settings.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// Expected `iss` claim.
    pub issuer: Option<String>,
    /// Expected `aud` claim.
    pub audience: Option<String>,
    /// The provider's key set, loaded at startup.
    pub jwks: JwkSet,
}

/// Everything the daemon reads from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deployment environment.
    pub deploy_env: DeployEnv,
    /// Path of the authoritative database.
    pub db_path: String,
    /// Secret verifying backend control-plane tokens (`AGENT_JWT_SECRET`).
    pub agent_jwt_secret: Vec<u8>,
    /// Secret verifying adapter tokens (`ADAPTER_JWT_SECRET`).
    pub adapter_jwt_secret: Vec<u8>,
    /// Secret signing decision tokens (`DECISION_TOKEN_SECRET`).
    pub decision_token_secret: Vec<u8>,
    /// Secret signing tool tokens (`TOOL_TOKEN_SECRET`).
    pub tool_token_secret: Vec<u8>,
    /// Operator identity provider, when configured (`OPS_OIDC_*`).
    pub oidc: Option<OidcConfig>,
    /// Deployment-wide telemetry enforcement mode.
    pub telemetry_mode: EnforcementMode,
    /// Accepted envelope clock skew, seconds.
    pub telemetry_max_skew_seconds: i64,
    /// Deployment-wide tool authorization mode.
    pub tool_auth_mode: EnforcementMode,
    /// Optional policy seed file applied at startup (`POLICY_PATH`).
    pub policy_path: Option<String>,
    /// Explicit development bypass flag (`DEV_NO_AUTH`).
    pub dev_no_auth: bool,
    /// Grant lifetime.
    pub grant_ttl: Duration,
    /// Step ceiling stamped into grants.
    pub max_steps: u32,
    /// Sweeper period.
    pub sweep_interval: Duration,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` for unparsable values and `missing_token`
    /// when a required secret is absent.
    pub fn from_env() -> Result<Self> {
        let deploy_env = match std::env::var("CLASPER_ENV").ok().as_deref() {
            Some("production") => DeployEnv::Production,
            _ => DeployEnv::Development,
        };

        let oidc = match std::env::var("OPS_OIDC_JWKS").ok() {
            Some(raw) => {
                let raw = if raw.trim_start().starts_with('{') {
                    raw
                } else {
                    std::fs::read_to_string(&raw).map_err(|e| {
                        GovernanceError::new(
                            ErrorKind::StoreUnavailable,
                            format!("cannot read OPS_OIDC_JWKS file: {e}"),
                        )
                    })?
                };
                Some(OidcConfig {
                    issuer: std::env::var("OPS_OIDC_ISSUER").ok(),
                    audience: std::env::var("OPS_OIDC_AUDIENCE").ok(),
                    jwks: JwkSet::from_json(&raw)?,
                })
            },
            None => None,
        };

        Ok(Self {
            deploy_env,
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()),
            agent_jwt_secret: required_secret("AGENT_JWT_SECRET")?,
            adapter_jwt_secret: required_secret("ADAPTER_JWT_SECRET")?,
            decision_token_secret: required_secret("DECISION_TOKEN_SECRET")?,
            tool_token_secret: required_secret("TOOL_TOKEN_SECRET")?,
            oidc,
            telemetry_mode: mode_var("TELEMETRY_SIGNATURE_MODE", EnforcementMode::Enforce)?,
            telemetry_max_skew_seconds: int_var(
                "TELEMETRY_MAX_SKEW_SECONDS",
                DEFAULT_MAX_SKEW_SECONDS,
            )?,
            tool_auth_mode: mode_var("TOOL_AUTH_MODE", EnforcementMode::Enforce)?,
            policy_path: std::env::var("POLICY_PATH").ok(),
            dev_no_auth: std::env::var("DEV_NO_AUTH").is_ok_and(|v| v == "1" || v == "true"),
            grant_ttl: DEFAULT_GRANT_TTL,
            max_steps: DEFAULT_MAX_STEPS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        })
    }

    /// A fully in-memory configuration for tests.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            deploy_env: DeployEnv::Development,
            db_path: ":memory:".to_string(),
            agent_jwt_secret: b"agent-secret".to_vec(),
            adapter_jwt_secret: b"adapter-secret".to_vec(),
            decision_token_secret: b"decision-secret".to_vec(),
            tool_token_secret: b"tool-secret".to_vec(),
            oidc: None,
            telemetry_mode: EnforcementMode::Enforce,
            telemetry_max_skew_seconds: DEFAULT_MAX_SKEW_SECONDS,
            tool_auth_mode: EnforcementMode::Enforce,
            policy_path: None,
            dev_no_auth: false,
            grant_ttl: DEFAULT_GRANT_TTL,
            max_steps: DEFAULT_MAX_STEPS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// True when an external identity provider is configured.
    #[must_use]
    pub const fn idp_configured(&self) -> bool {
        self.oidc.is_some()
    }
}

fn required_secret(name: &str) -> Result<Vec<u8>> {
    std::env::var(name)
        .map(String::into_bytes)
        .map_err(|_| GovernanceError::new(ErrorKind::MissingToken, format!("{name} is not set")))
}

fn mode_var(name: &str, default: EnforcementMode) -> Result<EnforcementMode> {
    match std::env::var(name) {
        Ok(raw) => EnforcementMode::parse(&raw).ok_or_else(|| {
            GovernanceError::new(
                ErrorKind::SchemaInvalid,
                format!("{name} must be off, warn, or enforce"),
            )
        }),
        Err(_) => Ok(default),
    }
}

fn int_var(name: &str, default: i64) -> Result<i64> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            GovernanceError::new(ErrorKind::SchemaInvalid, format!("{name} must be an integer"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_development() {
        let config = Config::for_tests();
        assert_eq!(config.deploy_env, DeployEnv::Development);
        assert!(!config.idp_configured());
        assert_eq!(config.telemetry_mode, EnforcementMode::Enforce);
    }
}
