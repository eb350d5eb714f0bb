//! Tenant-scoped policy rules and their evaluation.
//!
//! Admins upsert [`Policy`] rules per tenant; the engine evaluates an
//! execution request's [`PolicyContext`] against the tenant's enabled rules
//! and yields allow / deny / require-approval together with the full matched
//! rule list for the audit snapshot.
//!
//! # Matching model
//!
//! A rule matches when its scope, subject, and every specified condition all
//! match. Missing context fields are *unknown* and never satisfy a
//! condition — a rule conditioned on `context.external_network: true` does
//! not match a request that omitted `context` entirely.
//!
//! # Precedence and default
//!
//! When several rules match, the strictest wins: `deny` >
//! `require_approval` > `allow`. When nothing matches the engine returns
//! `allow`; the default-deny posture for unmatched high-risk requests is
//! owned by the decision orchestrator, not by this engine.

mod engine;
mod schema;
mod store;

pub use engine::{PolicyEngine, PolicyEvaluation, PolicyMatch};
pub use schema::{
    ContextConditions, Policy, PolicyConditions, PolicyContext, PolicyEffect, PolicyScope,
    PolicySubject, ProvenanceConditions, SubjectType,
};
pub use store::{PolicySet, PolicyStore};
