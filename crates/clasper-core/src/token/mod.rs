//! One-shot tool authorization tokens.
//!
//! A tool token authorizes exactly one invocation of one sensitive tool
//! under a fixed scope. Issuance inserts the authoritative row before the
//! signed envelope is returned; consumption is a single conditional update
//! (`used_at IS NULL`), so two racing consumers see exactly one winner with
//! no read-then-write window.
//!
//! Tool tokens live in their own trust domain: revoking an adapter's
//! telemetry key has no effect on its outstanding tool tokens.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::canonical;
use crate::error::{ErrorKind, GovernanceError, Result};
use crate::identity::token as token_envelope;
use crate::storage::{Store, StoreError};
use crate::time;

/// Claims carried inside a tool token envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolTokenClaims {
    /// Unique, time-sorted token id.
    pub jti: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Workspace sub-scope.
    pub workspace_id: String,
    /// Adapter the token was minted for.
    pub adapter_id: String,
    /// Execution the invocation belongs to.
    pub execution_id: String,
    /// The tool being authorized.
    pub tool: String,
    /// Canonical hash of the scope parameters.
    pub scope_hash: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

impl token_envelope::Expiring for ToolTokenClaims {
    fn expires_at_unix(&self) -> Option<i64> {
        Some(self.exp)
    }
}

/// Everything needed to mint one token.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Workspace sub-scope.
    pub workspace_id: String,
    /// Adapter performing the invocation.
    pub adapter_id: String,
    /// Execution the invocation belongs to.
    pub execution_id: String,
    /// The tool to authorize.
    pub tool: String,
    /// Scope parameters; hashed canonically into the token.
    pub scope: Value,
    /// Token lifetime in seconds.
    pub ttl_seconds: i64,
}

/// The minted token returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToolToken {
    /// Signed envelope the adapter presents on invocation.
    pub token: String,
    /// The token's unique id.
    pub jti: String,
    /// When the token lapses.
    pub expires_at: DateTime<Utc>,
    /// Canonical hash of the scope parameters.
    pub scope_hash: String,
}

/// The tool token service.
pub struct ToolTokenService {
    store: Store,
    secret: Vec<u8>,
}

impl std::fmt::Debug for ToolTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolTokenService").finish_non_exhaustive()
    }
}

impl ToolTokenService {
    /// Creates the service with the signing secret.
    #[must_use]
    pub fn new(store: Store, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            secret: secret.into(),
        }
    }

    /// Mints a single-use token.
    ///
    /// The authoritative row is committed before the envelope is signed and
    /// returned, so a token in flight always has a row to consume against.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` for a non-canonical scope and storage errors
    /// mapped into the taxonomy.
    pub fn issue(&self, request: &IssueRequest) -> Result<IssuedToolToken> {
        let jti = Uuid::now_v7().to_string();
        let scope_digest = canonical::sha256_json(&request.scope).map_err(GovernanceError::from)?;
        let scope_hash = canonical::format_hash(&scope_digest);

        let issued_at = time::now();
        let expires_at = issued_at + Duration::seconds(request.ttl_seconds.max(1));

        self.store
            .conn()
            .execute(
                "INSERT INTO tool_tokens
                     (jti, tenant_id, adapter_id, execution_id, tool, scope_hash,
                      issued_at, expires_at, used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                params![
                    jti,
                    request.tenant_id,
                    request.adapter_id,
                    request.execution_id,
                    request.tool,
                    scope_hash,
                    time::to_rfc3339(issued_at),
                    time::to_rfc3339(expires_at),
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let claims = ToolTokenClaims {
            jti: jti.clone(),
            tenant_id: request.tenant_id.clone(),
            workspace_id: request.workspace_id.clone(),
            adapter_id: request.adapter_id.clone(),
            execution_id: request.execution_id.clone(),
            tool: request.tool.clone(),
            scope_hash: scope_hash.clone(),
            iat: time::unix_seconds(issued_at),
            exp: time::unix_seconds(expires_at),
        };
        let token = token_envelope::sign(&claims, &self.secret)?;

        Ok(IssuedToolToken {
            token,
            jti,
            expires_at,
            scope_hash,
        })
    }

    /// Verifies a token envelope against its authoritative row.
    ///
    /// An expired token fails even if it was never consumed, and a token
    /// whose row is missing (or belongs to another tenant) is invalid
    /// regardless of its signature.
    ///
    /// # Errors
    ///
    /// - `invalid_tool_token` for signature, row, or tenant mismatches;
    /// - `tool_token_expired` past expiry;
    /// - `tool_token_used` when already consumed.
    pub fn verify(&self, tenant_id: &str, token: &str) -> Result<ToolTokenClaims> {
        let claims: ToolTokenClaims =
            token_envelope::verify_raw(token, &self.secret).map_err(|e| {
                GovernanceError::new(
                    ErrorKind::InvalidToolToken,
                    format!("envelope rejected: {e}"),
                )
            })?;

        if claims.tenant_id != tenant_id {
            return Err(GovernanceError::new(
                ErrorKind::InvalidToolToken,
                "token belongs to another tenant",
            ));
        }
        if time::unix_seconds(time::now()) >= claims.exp {
            return Err(GovernanceError::new(
                ErrorKind::ToolTokenExpired,
                "tool token expired",
            ));
        }

        let used_at: Option<Option<String>> = self
            .store
            .conn()
            .query_row(
                "SELECT used_at FROM tool_tokens WHERE jti = ?1 AND tenant_id = ?2",
                params![claims.jti, tenant_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        match used_at {
            None => Err(GovernanceError::new(
                ErrorKind::InvalidToolToken,
                "no authoritative row for token",
            )),
            Some(Some(_)) => Err(GovernanceError::new(
                ErrorKind::ToolTokenUsed,
                "tool token already consumed",
            )),
            Some(None) => Ok(claims),
        }
    }

    /// Atomically consumes a token by `jti`.
    ///
    /// Exactly one concurrent caller observes `true`; everyone else
    /// (including later retries) observes `false`. The update is a single
    /// conditional statement so there is no read-then-write race.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn consume(&self, tenant_id: &str, jti: &str) -> Result<bool> {
        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE tool_tokens SET used_at = ?3
                 WHERE jti = ?1 AND tenant_id = ?2 AND used_at IS NULL",
                params![jti, tenant_id, time::to_rfc3339(time::now())],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        Ok(changed > 0)
    }

    /// Verifies and consumes in one call — the shape the tool invocation
    /// endpoint uses, where presenting the token is the act of spending it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::verify`], plus `tool_token_used` when a racing
    /// consumer spent the token between checks.
    pub fn verify_and_consume(&self, tenant_id: &str, token: &str) -> Result<ToolTokenClaims> {
        let claims = self.verify(tenant_id, token)?;
        if self.consume(tenant_id, &claims.jti)? {
            Ok(claims)
        } else {
            Err(GovernanceError::new(
                ErrorKind::ToolTokenUsed,
                "tool token already consumed",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn service() -> ToolTokenService {
        ToolTokenService::new(Store::in_memory().unwrap(), b"tool-secret".to_vec())
    }

    fn issue_request() -> IssueRequest {
        IssueRequest {
            tenant_id: "t1".to_string(),
            workspace_id: "w1".to_string(),
            adapter_id: "a1".to_string(),
            execution_id: "exec-1".to_string(),
            tool: "shell.exec".to_string(),
            scope: json!({"command_prefix": "git", "cwd": "/workspace"}),
            ttl_seconds: 300,
        }
    }

    #[test]
    fn issue_verify_consume_roundtrip() {
        let svc = service();
        let issued = svc.issue(&issue_request()).unwrap();
        assert!(issued.scope_hash.starts_with("sha256:"));

        let claims = svc.verify("t1", &issued.token).unwrap();
        assert_eq!(claims.tool, "shell.exec");
        assert_eq!(claims.scope_hash, issued.scope_hash);

        assert!(svc.consume("t1", &issued.jti).unwrap());
        assert!(!svc.consume("t1", &issued.jti).unwrap());
    }

    #[test]
    fn scope_hash_is_canonical() {
        let svc = service();
        let mut a = issue_request();
        a.scope = json!({"b": 2, "a": 1});
        let mut b = issue_request();
        b.scope = json!({"a": 1, "b": 2});
        assert_eq!(
            svc.issue(&a).unwrap().scope_hash,
            svc.issue(&b).unwrap().scope_hash
        );
    }

    #[test]
    fn jti_is_time_sorted() {
        let svc = service();
        let first = svc.issue(&issue_request()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = svc.issue(&issue_request()).unwrap();
        assert!(second.jti > first.jti, "UUIDv7 ids must sort by time");
    }

    #[test]
    fn verify_rejects_wrong_tenant() {
        let svc = service();
        let issued = svc.issue(&issue_request()).unwrap();
        let err = svc.verify("t2", &issued.token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidToolToken);
    }

    #[test]
    fn verify_rejects_forged_token() {
        let svc = service();
        let other = ToolTokenService::new(Store::in_memory().unwrap(), b"other".to_vec());
        let forged = other.issue(&issue_request()).unwrap();
        let err = svc.verify("t1", &forged.token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidToolToken);
    }

    #[test]
    fn verify_rejects_consumed_token() {
        let svc = service();
        let issued = svc.issue(&issue_request()).unwrap();
        svc.consume("t1", &issued.jti).unwrap();
        let err = svc.verify("t1", &issued.token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolTokenUsed);
    }

    #[test]
    fn expired_token_fails_even_if_unused() {
        let svc = service();
        let mut request = issue_request();
        request.ttl_seconds = 1;
        let issued = svc.issue(&request).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let err = svc.verify("t1", &issued.token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolTokenExpired);
    }

    #[test]
    fn concurrent_consumes_have_one_winner() {
        let svc = std::sync::Arc::new(service());
        let issued = svc.issue(&issue_request()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = std::sync::Arc::clone(&svc);
            let jti = issued.jti.clone();
            handles.push(std::thread::spawn(move || svc.consume("t1", &jti).unwrap()));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn verify_and_consume_spends_the_token() {
        let svc = service();
        let issued = svc.issue(&issue_request()).unwrap();
        svc.verify_and_consume("t1", &issued.token).unwrap();
        let err = svc.verify_and_consume("t1", &issued.token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolTokenUsed);
    }
}
