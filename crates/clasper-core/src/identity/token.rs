//! Symmetric signed bearer tokens.
//!
//! Backend- and adapter-minted credentials are compact three-part tokens
//! (`header.claims.signature`, base64url without padding) signed with
//! HMAC-SHA256 over the canonical serialization of each part. The same
//! envelope format backs decision tokens and tool tokens, which carry their
//! own claim types.
//!
//! Verification is constant-time on the MAC and produces distinct error
//! kinds for each failure: `missing_token`, `invalid_signature`,
//! `token_expired`, `schema_invalid`.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::canonical;
use crate::error::{ErrorKind, GovernanceError, Result};
use crate::time;

type HmacSha256 = Hmac<Sha256>;

/// Algorithm label embedded in the token header.
const TOKEN_ALG: &str = "HS256";

/// Hard cap on accepted token length; anything longer is rejected before
/// parsing.
pub const MAX_TOKEN_LEN: usize = 8192;

/// Signs `claims` into a compact token.
///
/// # Errors
///
/// Returns `schema_invalid` if the claims fail canonical serialization.
pub fn sign<T: Serialize>(claims: &T, secret: &[u8]) -> Result<String> {
    let header = canonical::canonical_json(&json!({"alg": TOKEN_ALG, "typ": "JWT"}))
        .map_err(GovernanceError::from)?;
    let body = canonical::canonical_bytes(claims).map_err(GovernanceError::from)?;

    let header_b64 = URL_SAFE_NO_PAD.encode(header);
    let body_b64 = URL_SAFE_NO_PAD.encode(body);
    let signing_input = format!("{header_b64}.{body_b64}");

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| GovernanceError::new(ErrorKind::InvalidSignature, e.to_string()))?;
    mac.update(signing_input.as_bytes());
    let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{tag}"))
}

/// Verifies a compact token and deserializes its claims.
///
/// Signature and structural checks run before expiry so a forged token never
/// learns whether its claims would have been acceptable. Expiry is validated
/// from the claims' `exp` field when the claim type exposes one through
/// [`Expiring`].
///
/// # Errors
///
/// - `missing_token` for an empty credential;
/// - `schema_invalid` for malformed structure or undecodable claims;
/// - `invalid_signature` when the MAC does not match;
/// - `token_expired` when `exp` is in the past.
pub fn verify<T: DeserializeOwned + Expiring>(token: &str, secret: &[u8]) -> Result<T> {
    let claims: T = verify_raw(token, secret)?;
    if let Some(exp) = claims.expires_at_unix() {
        if time::unix_seconds(time::now()) >= exp {
            return Err(GovernanceError::new(
                ErrorKind::TokenExpired,
                "credential expired",
            ));
        }
    }
    Ok(claims)
}

/// Verifies the MAC and decodes claims without expiry checks.
///
/// # Errors
///
/// Same as [`verify`] minus `token_expired`.
pub fn verify_raw<T: DeserializeOwned>(token: &str, secret: &[u8]) -> Result<T> {
    if token.is_empty() {
        return Err(GovernanceError::new(
            ErrorKind::MissingToken,
            "empty credential",
        ));
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(GovernanceError::new(
            ErrorKind::SchemaInvalid,
            "credential exceeds maximum length",
        ));
    }

    let mut parts = token.split('.');
    let (Some(header_b64), Some(body_b64), Some(tag_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(GovernanceError::new(
            ErrorKind::SchemaInvalid,
            "credential is not a three-part token",
        ));
    };

    let signing_input = format!("{header_b64}.{body_b64}");
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| GovernanceError::new(ErrorKind::InvalidSignature, e.to_string()))?;
    mac.update(signing_input.as_bytes());
    let expected = mac.finalize().into_bytes();

    let provided = URL_SAFE_NO_PAD
        .decode(tag_b64)
        .map_err(|_| GovernanceError::new(ErrorKind::InvalidSignature, "undecodable signature"))?;
    if provided.len() != expected.len() || !bool::from(provided.ct_eq(&expected)) {
        return Err(GovernanceError::new(
            ErrorKind::InvalidSignature,
            "signature mismatch",
        ));
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| GovernanceError::new(ErrorKind::SchemaInvalid, "undecodable header"))?;
    let header: serde_json::Value = serde_json::from_slice(&header_bytes)
        .map_err(|_| GovernanceError::new(ErrorKind::SchemaInvalid, "malformed header"))?;
    if header.get("alg").and_then(|a| a.as_str()) != Some(TOKEN_ALG) {
        return Err(GovernanceError::new(
            ErrorKind::UnsupportedAlgorithm,
            "unexpected token algorithm",
        ));
    }

    let body_bytes = URL_SAFE_NO_PAD
        .decode(body_b64)
        .map_err(|_| GovernanceError::new(ErrorKind::SchemaInvalid, "undecodable claims"))?;
    serde_json::from_slice(&body_bytes)
        .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, format!("malformed claims: {e}")))
}

/// Claim types that expose an expiry for [`verify`].
pub trait Expiring {
    /// Expiry as unix seconds; `None` disables the expiry check.
    fn expires_at_unix(&self) -> Option<i64>;
}

impl Expiring for super::IdentityClaims {
    fn expires_at_unix(&self) -> Option<i64> {
        self.exp
    }
}

#[cfg(test)]
mod tests {
    use super::super::IdentityClaims;
    use super::*;

    const SECRET: &[u8] = b"test-secret-0123456789abcdef0123";

    fn claims(exp_offset: i64) -> IdentityClaims {
        let mut c = IdentityClaims::for_tenant("t1");
        c.exp = Some(time::unix_seconds(time::now()) + exp_offset);
        c
    }

    #[test]
    fn sign_verify_roundtrip() {
        let token = sign(&claims(600), SECRET).unwrap();
        let back: IdentityClaims = verify(&token, SECRET).unwrap();
        assert_eq!(back.tenant_id, "t1");
    }

    #[test]
    fn empty_token_is_missing() {
        let err = verify::<IdentityClaims>("", SECRET).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingToken);
    }

    #[test]
    fn wrong_secret_fails_signature() {
        let token = sign(&claims(600), SECRET).unwrap();
        let err = verify::<IdentityClaims>(&token, b"other-secret").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn tampered_claims_fail_signature() {
        let token = sign(&claims(600), SECRET).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"tenant_id":"t2"}"#);
        parts[1] = &forged;
        let err = verify::<IdentityClaims>(&parts.join("."), SECRET).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn expired_token_rejected() {
        let token = sign(&claims(-10), SECRET).unwrap();
        let err = verify::<IdentityClaims>(&token, SECRET).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenExpired);
    }

    #[test]
    fn two_part_token_is_schema_invalid() {
        let err = verify::<IdentityClaims>("a.b", SECRET).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
    }

    #[test]
    fn oversized_token_rejected_before_parse() {
        let big = "x".repeat(MAX_TOKEN_LEN + 1);
        let err = verify::<IdentityClaims>(&big, SECRET).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
    }
}
