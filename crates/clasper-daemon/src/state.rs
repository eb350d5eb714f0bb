//! Daemon service wiring.
//!
//! All singletons from the source design are explicit here: one [`Daemon`]
//! owns every service, constructed once at startup and shared by `Arc`.
//! Nothing reaches for global state; handlers receive the daemon and a
//! request context.

use std::sync::Arc;

use clasper_core::adapter::AdapterRegistry;
use clasper_core::audit::AuditLog;
use clasper_core::decision::{ApprovalConfig, ApprovalQueue, DEFAULT_APPROVAL_TTL_SECONDS};
use clasper_core::error::Result;
use clasper_core::policy::PolicyStore;
use clasper_core::risk::RiskScorer;
use clasper_core::storage::Store;
use clasper_core::telemetry::{EnvelopeVerifier, TelemetrySinks, VerifierConfig};
use clasper_core::tenant::TenantStore;
use clasper_core::token::ToolTokenService;
use clasper_core::trace::TraceStore;

use crate::config::Config;
use crate::context::Authenticator;
use crate::ingest::TelemetryIngest;
use crate::orchestrator::DecisionOrchestrator;

/// The composed control plane.
pub struct Daemon {
    /// Runtime configuration.
    pub config: Config,
    /// Credential verification.
    pub authenticator: Authenticator,
    /// Hash-chained audit log.
    pub audit: Arc<AuditLog>,
    /// Adapter enrollment and telemetry keys.
    pub registry: Arc<AdapterRegistry>,
    /// Tenant policy rules.
    pub policies: Arc<PolicyStore>,
    /// Tenant settings and budgets.
    pub tenants: Arc<TenantStore>,
    /// Pending decisions.
    pub queue: Arc<ApprovalQueue>,
    /// One-shot tool authorizations.
    pub tool_tokens: Arc<ToolTokenService>,
    /// Execution traces.
    pub traces: Arc<TraceStore>,
    /// Cost, metric, and violation sinks.
    pub sinks: Arc<TelemetrySinks>,
    /// The decision pipeline.
    pub orchestrator: DecisionOrchestrator,
    /// The telemetry ingest pipeline.
    pub ingest: TelemetryIngest,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    /// Opens the store and wires every service.
    ///
    /// # Errors
    ///
    /// Returns storage errors when the database cannot be opened.
    pub fn new(config: Config) -> Result<Self> {
        let store = if config.db_path == ":memory:" {
            Store::in_memory()
        } else {
            Store::open(&config.db_path)
        }
        .map_err(clasper_core::error::GovernanceError::from)?;

        Self::with_store(config, store)
    }

    /// Wires every service over an existing store (tests use this with an
    /// in-memory database).
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for parity with [`Self::new`].
    pub fn with_store(config: Config, store: Store) -> Result<Self> {
        let audit = Arc::new(AuditLog::new(store.clone()));
        let registry = Arc::new(AdapterRegistry::new(store.clone()));
        let policies = Arc::new(PolicyStore::new(store.clone()));
        let tenants = Arc::new(TenantStore::new(store.clone()));
        let traces = Arc::new(TraceStore::new(store.clone()));
        let sinks = Arc::new(TelemetrySinks::new(store.clone()));
        let tool_tokens = Arc::new(ToolTokenService::new(
            store.clone(),
            config.tool_token_secret.clone(),
        ));
        let queue = Arc::new(ApprovalQueue::new(
            store,
            Arc::clone(&audit),
            config.decision_token_secret.clone(),
            ApprovalConfig {
                approval_ttl: chrono::Duration::seconds(DEFAULT_APPROVAL_TTL_SECONDS),
                grant_ttl: chrono::Duration::from_std(config.grant_ttl)
                    .unwrap_or_else(|_| chrono::Duration::minutes(15)),
            },
        ));

        let orchestrator = DecisionOrchestrator::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&policies),
            RiskScorer::default(),
            Arc::clone(&queue),
            Arc::clone(&audit),
            Arc::clone(&tenants),
        );

        let verifier = EnvelopeVerifier::new(Arc::clone(&registry), VerifierConfig {
            max_skew: chrono::Duration::seconds(config.telemetry_max_skew_seconds),
            ..VerifierConfig::default()
        });
        let ingest = TelemetryIngest::new(
            verifier,
            Arc::clone(&sinks),
            Arc::clone(&audit),
            Arc::clone(&traces),
            Arc::clone(&tenants),
            config.telemetry_mode,
        );

        let authenticator = Authenticator::new(&config);

        if let Some(path) = &config.policy_path {
            seed_policies(&policies, path)?;
        }

        Ok(Self {
            config,
            authenticator,
            audit,
            registry,
            policies,
            tenants,
            queue,
            tool_tokens,
            traces,
            sinks,
            orchestrator,
            ingest,
        })
    }
}

/// Applies a policy seed file (a JSON array of rules) at startup.
///
/// Seeding is an upsert, so restarting with the same file is idempotent.
fn seed_policies(policies: &PolicyStore, path: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        clasper_core::error::GovernanceError::new(
            clasper_core::error::ErrorKind::StoreUnavailable,
            format!("cannot read policy seed file {path}: {e}"),
        )
    })?;
    let seeded: Vec<clasper_core::policy::Policy> = serde_json::from_str(&raw).map_err(|e| {
        clasper_core::error::GovernanceError::new(
            clasper_core::error::ErrorKind::SchemaInvalid,
            format!("malformed policy seed file {path}: {e}"),
        )
    })?;
    let count = seeded.len();
    for policy in &seeded {
        policies.upsert(policy)?;
    }
    tracing::info!(count, path, "seeded policies");
    Ok(())
}
