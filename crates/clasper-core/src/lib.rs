//! # clasper-core
//!
//! Governance engine for Clasper — a control plane that decides whether an
//! AI agent execution is allowed, under what bounded scope, and records
//! tamper-evident evidence of what actually occurred.
//!
//! The crate provides the shared subsystems the daemon composes:
//!
//! - **Decision pipeline**: risk scoring, policy evaluation, and the
//!   asynchronous approval queue
//! - **Evidence layer**: per-tenant hash-chained audit log, trace store
//!   with step chains, signed telemetry envelope verification
//! - **Tool tokens**: short-lived, single-use, scope-bound authorizations
//! - **Tenant enforcement**: identity context, per-tenant isolation on
//!   every query path, budgets and settings
//!
//! # Example
//!
//! ```rust,no_run
//! use clasper_core::audit::AuditLog;
//! use clasper_core::storage::Store;
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::open("clasper.db")?;
//! let audit = AuditLog::new(store);
//! let (seq, hash) = audit.append(
//!     "tenant-1",
//!     "execution_decision",
//!     json!({"allowed": true}),
//!     "system:orchestrator",
//!     None,
//! )?;
//! assert_eq!(seq, 1);
//! assert!(hash.starts_with("sha256:"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// SQLite hands back i64 counts that are always non-negative here, and
// capability lists are far below u32 range.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

pub mod adapter;
pub mod audit;
pub mod canonical;
pub mod decision;
pub mod error;
pub mod execution;
pub mod identity;
pub mod policy;
pub mod risk;
pub mod storage;
pub mod telemetry;
pub mod tenant;
pub mod time;
pub mod token;
pub mod trace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::adapter::{AdapterRegistration, AdapterRegistry, RiskClass};
    pub use crate::audit::AuditLog;
    pub use crate::decision::{ApprovalQueue, Decision, DecisionState};
    pub use crate::error::{ErrorKind, GovernanceError};
    pub use crate::execution::{ExecutionRequest, ExecutionScope, ExecutionVerdict};
    pub use crate::identity::TenantContext;
    pub use crate::policy::{Policy, PolicyEffect, PolicyStore};
    pub use crate::risk::{RiskAssessment, RiskLevel, RiskScorer};
    pub use crate::storage::Store;
    pub use crate::telemetry::{EnvelopeVerifier, SignedTelemetryEnvelope};
    pub use crate::token::ToolTokenService;
    pub use crate::trace::TraceStore;
}

pub use error::{ErrorKind, GovernanceError};
pub use storage::Store;
