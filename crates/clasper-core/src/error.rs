//! Closed error taxonomy shared by every Clasper component.
//!
//! Each failure a caller can observe is one [`ErrorKind`]. The taxonomy is a
//! deliberately closed sum: the HTTP adapter maps each kind to a status code
//! exactly once, and no component invents ad-hoc string errors. Per-module
//! infrastructure errors (storage, canonicalization) convert into the
//! taxonomy at the component boundary.
//!
//! # Propagation policy
//!
//! - Authentication and validation kinds surface directly as 4xx.
//! - Integrity kinds surface as 4xx under `enforce` mode and are recorded as
//!   violations under `warn` mode.
//! - `store_conflict` is the only kind callers may retry automatically.
//! - No handler may degrade a failed evaluation into an allow.

use thiserror::Error;

use crate::canonical::CanonicalError;

/// Every observable failure kind in the governance core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // -- Authentication ------------------------------------------------------
    /// No credential was presented.
    MissingToken,
    /// The credential is past its expiry.
    TokenExpired,
    /// The credential or envelope signature failed verification.
    InvalidSignature,
    /// The credential carries no tenant claim.
    MissingTenant,
    /// The identity lacks permission for the requested value.
    PermissionDenied,

    // -- Validation ----------------------------------------------------------
    /// The input failed schema validation.
    SchemaInvalid,
    /// The payload exceeds the configured size bound.
    PayloadTooLarge,
    /// The declared algorithm is not supported.
    UnsupportedAlgorithm,

    // -- Decision ------------------------------------------------------------
    /// The adapter is not registered for the tenant.
    AdapterUnknown,
    /// The adapter registration is disabled.
    AdapterDisabled,
    /// A requested capability is not in the adapter's declared set.
    CapabilityNotDeclared,
    /// A policy rule denied the request.
    BlockedByPolicy,
    /// The request needs asynchronous approval.
    RequiresApproval,
    /// The tenant's remaining budget cannot cover the request.
    BudgetExceeded,

    // -- Approval ------------------------------------------------------------
    /// No decision exists with that id in the tenant.
    DecisionNotFound,
    /// The decision already reached a terminal state.
    AlreadyResolved,
    /// The approver does not carry the required role.
    RoleInsufficient,
    /// The justification is shorter than the minimum.
    JustificationTooShort,
    /// The decision expired before resolution or consumption.
    DecisionExpired,

    // -- Tool token ----------------------------------------------------------
    /// The tool token failed signature or claim checks.
    InvalidToolToken,
    /// The tool token is past its expiry.
    ToolTokenExpired,
    /// The tool token was already consumed.
    ToolTokenUsed,

    // -- Integrity -----------------------------------------------------------
    /// Recomputed payload hash differs from the declared one.
    PayloadHashMismatch,
    /// The envelope's issuance time is outside the accepted skew.
    TimestampSkew,
    /// No active telemetry key exists for the adapter.
    MissingKey,
    /// The telemetry key was revoked.
    KeyRevoked,

    // -- Infrastructure ------------------------------------------------------
    /// Concurrent writers conflicted; safe to retry.
    StoreConflict,
    /// The request deadline elapsed.
    Timeout,
    /// The store is unreachable or corrupted.
    StoreUnavailable,
}

impl ErrorKind {
    /// The wire identifier for this kind.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::TokenExpired => "token_expired",
            Self::InvalidSignature => "invalid_signature",
            Self::MissingTenant => "missing_tenant",
            Self::PermissionDenied => "permission_denied",
            Self::SchemaInvalid => "schema_invalid",
            Self::PayloadTooLarge => "payload_too_large",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::AdapterUnknown => "adapter_unknown",
            Self::AdapterDisabled => "adapter_disabled",
            Self::CapabilityNotDeclared => "capability_not_declared",
            Self::BlockedByPolicy => "blocked_by_policy",
            Self::RequiresApproval => "requires_approval",
            Self::BudgetExceeded => "budget_exceeded",
            Self::DecisionNotFound => "decision_not_found",
            Self::AlreadyResolved => "already_resolved",
            Self::RoleInsufficient => "role_insufficient",
            Self::JustificationTooShort => "justification_too_short",
            Self::DecisionExpired => "decision_expired",
            Self::InvalidToolToken => "invalid_tool_token",
            Self::ToolTokenExpired => "tool_token_expired",
            Self::ToolTokenUsed => "tool_token_used",
            Self::PayloadHashMismatch => "payload_hash_mismatch",
            Self::TimestampSkew => "timestamp_skew",
            Self::MissingKey => "missing_key",
            Self::KeyRevoked => "key_revoked",
            Self::StoreConflict => "store_conflict",
            Self::Timeout => "timeout",
            Self::StoreUnavailable => "store_unavailable",
        }
    }

    /// The HTTP status an adapter maps this kind to.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::MissingToken | Self::TokenExpired | Self::InvalidSignature => 401,
            Self::MissingTenant | Self::SchemaInvalid | Self::JustificationTooShort => 400,
            Self::PermissionDenied
            | Self::AdapterDisabled
            | Self::BlockedByPolicy
            | Self::CapabilityNotDeclared
            | Self::RoleInsufficient
            | Self::KeyRevoked => 403,
            Self::AdapterUnknown | Self::DecisionNotFound | Self::MissingKey => 404,
            Self::RequiresApproval => 202,
            Self::AlreadyResolved | Self::StoreConflict => 409,
            Self::DecisionExpired
            | Self::ToolTokenExpired
            | Self::ToolTokenUsed
            | Self::InvalidToolToken => 410,
            Self::PayloadTooLarge => 413,
            Self::UnsupportedAlgorithm | Self::PayloadHashMismatch | Self::TimestampSkew => 422,
            Self::BudgetExceeded => 402,
            Self::Timeout => 504,
            Self::StoreUnavailable => 503,
        }
    }

    /// Whether the caller may retry the operation automatically.
    ///
    /// Only `store_conflict` is retryable; `timeout` in particular is never
    /// retried without an operator in the loop.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::StoreConflict)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// An error carrying its taxonomy kind plus human-readable context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct GovernanceError {
    /// The taxonomy kind.
    kind: ErrorKind,
    /// Context for operators; never parsed by machines.
    message: String,
}

impl GovernanceError {
    /// Creates an error of the given kind with context.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates an error whose message is just the kind's code.
    #[must_use]
    pub fn bare(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.code().to_string(),
        }
    }

    /// The taxonomy kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The context message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<CanonicalError> for GovernanceError {
    fn from(err: CanonicalError) -> Self {
        match err {
            CanonicalError::MaxDepthExceeded { .. } => {
                Self::new(ErrorKind::PayloadTooLarge, err.to_string())
            },
            _ => Self::new(ErrorKind::SchemaInvalid, err.to_string()),
        }
    }
}

/// Result alias used across the core.
pub type Result<T, E = GovernanceError> = std::result::Result<T, E>;
