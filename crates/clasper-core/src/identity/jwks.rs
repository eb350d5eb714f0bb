//! Operator token verification against a JWKS.
//!
//! Operator credentials are JWS compact tokens minted by an external
//! identity provider. The provider's key set is fetched out-of-band (the
//! fetch itself is a collaborator concern); this module verifies signatures
//! against a [`JwkSet`] and validates standard claims.
//!
//! Supported algorithms: `EdDSA` (Ed25519) and `ES256` (ECDSA P-256 with
//! SHA-256, fixed-width `r || s` signatures as JWS requires).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::Verifier as _;
use ring::signature::{ECDSA_P256_SHA256_FIXED, UnparsedPublicKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::token::MAX_TOKEN_LEN;
use crate::error::{ErrorKind, GovernanceError, Result};
use crate::time;

/// A single JSON Web Key as published by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (`OKP` for Ed25519, `EC` for P-256).
    pub kty: String,

    /// Curve name (`Ed25519` or `P-256`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// Key id used for header matching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Declared algorithm (`EdDSA` or `ES256`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// Public key `x` coordinate, base64url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// Public key `y` coordinate (EC only), base64url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// A JWKS document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// The published keys.
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Parses a JWKS document from JSON.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` on malformed input.
    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input)
            .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, format!("bad JWKS: {e}")))
    }

    /// Keys eligible for the given header `kid`.
    fn candidates<'a>(&'a self, kid: Option<&str>) -> Vec<&'a Jwk> {
        match kid {
            Some(kid) => self
                .keys
                .iter()
                .filter(|k| k.kid.as_deref() == Some(kid))
                .collect(),
            None => self.keys.iter().collect(),
        }
    }
}

/// Issuer/audience expectations configured on the verifier.
#[derive(Debug, Clone, Default)]
pub struct ClaimExpectations {
    /// Expected `iss` value; checked when the token carries `iss`.
    pub issuer: Option<String>,
    /// Expected `aud` value; checked when the token carries `aud`.
    pub audience: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StandardClaims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<String>,
}

/// Verifies a JWS compact token against the key set and decodes its claims.
///
/// # Errors
///
/// - `missing_token` / `schema_invalid` for structural failures;
/// - `unsupported_algorithm` for an alg outside `EdDSA`/`ES256`;
/// - `invalid_signature` when no candidate key verifies;
/// - `token_expired` when `exp` has passed;
/// - `permission_denied` when `iss`/`aud` mismatch the expectations.
pub fn verify_jws<T: DeserializeOwned>(
    token: &str,
    keys: &JwkSet,
    expectations: &ClaimExpectations,
) -> Result<T> {
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
    let (Some(header_b64), Some(body_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(GovernanceError::new(
            ErrorKind::SchemaInvalid,
            "credential is not a three-part token",
        ));
    };

    let header_bytes = decode_b64(header_b64, "header")?;
    let header: JwsHeader = serde_json::from_slice(&header_bytes)
        .map_err(|_| GovernanceError::new(ErrorKind::SchemaInvalid, "malformed header"))?;

    let signature = decode_b64(sig_b64, "signature")?;
    let signing_input = format!("{header_b64}.{body_b64}");

    let candidates = keys.candidates(header.kid.as_deref());
    if candidates.is_empty() {
        return Err(GovernanceError::new(
            ErrorKind::InvalidSignature,
            "no key matches token kid",
        ));
    }

    let verified = candidates.iter().any(|key| {
        verify_with_key(key, &header.alg, signing_input.as_bytes(), &signature).unwrap_or(false)
    });
    if !verified {
        // Distinguish a bad algorithm from a bad signature for operators.
        if !matches!(header.alg.as_str(), "EdDSA" | "ES256") {
            return Err(GovernanceError::new(
                ErrorKind::UnsupportedAlgorithm,
                format!("unsupported JWS algorithm {}", header.alg),
            ));
        }
        return Err(GovernanceError::new(
            ErrorKind::InvalidSignature,
            "signature mismatch",
        ));
    }

    let body_bytes = decode_b64(body_b64, "claims")?;
    let standard: StandardClaims = serde_json::from_slice(&body_bytes)
        .map_err(|_| GovernanceError::new(ErrorKind::SchemaInvalid, "malformed claims"))?;
    validate_standard_claims(&standard, expectations)?;

    serde_json::from_slice(&body_bytes)
        .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, format!("malformed claims: {e}")))
}

fn decode_b64(part: &str, what: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| GovernanceError::new(ErrorKind::SchemaInvalid, format!("undecodable {what}")))
}

fn validate_standard_claims(
    claims: &StandardClaims,
    expectations: &ClaimExpectations,
) -> Result<()> {
    let now = time::unix_seconds(time::now());
    if let Some(exp) = claims.exp {
        if now >= exp {
            return Err(GovernanceError::new(
                ErrorKind::TokenExpired,
                "credential expired",
            ));
        }
    }
    if let Some(iat) = claims.iat {
        // Reject tokens issued in the future beyond small clock slack.
        if iat > now + 60 {
            return Err(GovernanceError::new(
                ErrorKind::InvalidSignature,
                "credential issued in the future",
            ));
        }
    }
    if let (Some(expected), Some(actual)) = (&expectations.issuer, &claims.iss) {
        if expected != actual {
            return Err(GovernanceError::new(
                ErrorKind::PermissionDenied,
                "issuer mismatch",
            ));
        }
    }
    if let (Some(expected), Some(actual)) = (&expectations.audience, &claims.aud) {
        if expected != actual {
            return Err(GovernanceError::new(
                ErrorKind::PermissionDenied,
                "audience mismatch",
            ));
        }
    }
    Ok(())
}

/// Verifies one signature with one key. `Ok(false)` means the key did not
/// verify; `Err` means the key material itself is unusable.
///
/// Shared with the telemetry envelope verifier, which names the same two
/// algorithms through its own enrollment labels.
pub(crate) fn verify_with_key(
    key: &Jwk,
    alg: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<bool> {
    match alg {
        "EdDSA" => {
            let x = key
                .x
                .as_deref()
                .ok_or_else(|| GovernanceError::new(ErrorKind::SchemaInvalid, "JWK missing x"))?;
            let raw = decode_b64(x, "JWK x")?;
            let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                GovernanceError::new(ErrorKind::SchemaInvalid, "Ed25519 key must be 32 bytes")
            })?;
            let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&bytes) else {
                return Ok(false);
            };
            let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
                return Ok(false);
            };
            Ok(vk.verify(message, &sig).is_ok())
        },
        "ES256" => {
            let (Some(x), Some(y)) = (key.x.as_deref(), key.y.as_deref()) else {
                return Err(GovernanceError::new(
                    ErrorKind::SchemaInvalid,
                    "EC JWK missing x or y",
                ));
            };
            let x = decode_b64(x, "JWK x")?;
            let y = decode_b64(y, "JWK y")?;
            if x.len() != 32 || y.len() != 32 {
                return Err(GovernanceError::new(
                    ErrorKind::SchemaInvalid,
                    "P-256 coordinates must be 32 bytes",
                ));
            }
            // Uncompressed SEC1 point: 0x04 || x || y.
            let mut point = Vec::with_capacity(65);
            point.push(0x04);
            point.extend_from_slice(&x);
            point.extend_from_slice(&y);
            let public = UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point);
            Ok(public.verify(message, signature).is_ok())
        },
        _ => Ok(false),
    }
}

/// Source of the identity provider's key set.
///
/// The network fetch lives behind this trait so the core never blocks on
/// HTTP; the daemon wires in whatever transport it has.
pub trait JwksProvider: Send + Sync {
    /// Returns the current key set.
    ///
    /// # Errors
    ///
    /// Returns `store_unavailable` if the key set cannot be produced.
    fn jwks(&self) -> Result<Arc<JwkSet>>;
}

/// A fixed key set, used for tests and file-based deployments.
#[derive(Debug, Clone)]
pub struct StaticJwks(Arc<JwkSet>);

impl StaticJwks {
    /// Wraps a key set.
    #[must_use]
    pub fn new(keys: JwkSet) -> Self {
        Self(Arc::new(keys))
    }
}

impl JwksProvider for StaticJwks {
    fn jwks(&self) -> Result<Arc<JwkSet>> {
        Ok(Arc::clone(&self.0))
    }
}

/// TTL cache over any provider, refreshed at most once per interval.
pub struct CachedJwks<P> {
    inner: P,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Arc<JwkSet>)>>,
}

impl<P: JwksProvider> CachedJwks<P> {
    /// Wraps `inner` with a cache of the given TTL.
    #[must_use]
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }
}

impl<P: JwksProvider> JwksProvider for CachedJwks<P> {
    fn jwks(&self) -> Result<Arc<JwkSet>> {
        let mut cached = self.cached.lock().expect("jwks cache lock poisoned");
        if let Some((fetched_at, keys)) = cached.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(Arc::clone(keys));
            }
        }
        let fresh = self.inner.jwks()?;
        *cached = Some((Instant::now(), Arc::clone(&fresh)));
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::Signer as _;
    use serde_json::json;

    use super::super::IdentityClaims;
    use super::*;

    fn ed25519_fixture() -> (ed25519_dalek::SigningKey, JwkSet) {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let jwk = Jwk {
            kty: "OKP".to_string(),
            crv: Some("Ed25519".to_string()),
            kid: Some("op-key-1".to_string()),
            alg: Some("EdDSA".to_string()),
            x: Some(URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes())),
            y: None,
        };
        (signing, JwkSet { keys: vec![jwk] })
    }

    fn mint(signing: &ed25519_dalek::SigningKey, claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"EdDSA","kid":"op-key-1"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        let input = format!("{header}.{body}");
        let sig = signing.sign(input.as_bytes());
        format!("{input}.{}", URL_SAFE_NO_PAD.encode(sig.to_bytes()))
    }

    #[test]
    fn eddsa_roundtrip() {
        let (signing, keys) = ed25519_fixture();
        let token = mint(&signing, &json!({"tenant_id": "t1", "roles": ["approver"]}));
        let claims: IdentityClaims =
            verify_jws(&token, &keys, &ClaimExpectations::default()).unwrap();
        assert_eq!(claims.tenant_id, "t1");
    }

    #[test]
    fn tampered_body_fails() {
        let (signing, keys) = ed25519_fixture();
        let token = mint(&signing, &json!({"tenant_id": "t1"}));
        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        parts[1] = URL_SAFE_NO_PAD.encode(br#"{"tenant_id":"t2"}"#);
        let err = verify_jws::<IdentityClaims>(
            &parts.join("."),
            &keys,
            &ClaimExpectations::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn expired_operator_token_rejected() {
        let (signing, keys) = ed25519_fixture();
        let token = mint(&signing, &json!({"tenant_id": "t1", "exp": 1}));
        let err =
            verify_jws::<IdentityClaims>(&token, &keys, &ClaimExpectations::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenExpired);
    }

    #[test]
    fn issuer_mismatch_rejected() {
        let (signing, keys) = ed25519_fixture();
        let token = mint(&signing, &json!({"tenant_id": "t1", "iss": "https://other"}));
        let expectations = ClaimExpectations {
            issuer: Some("https://idp.example".to_string()),
            audience: None,
        };
        let err = verify_jws::<IdentityClaims>(&token, &keys, &expectations).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn unknown_kid_fails_signature() {
        let (signing, _) = ed25519_fixture();
        let token = mint(&signing, &json!({"tenant_id": "t1"}));
        let keys = JwkSet { keys: vec![] };
        let err =
            verify_jws::<IdentityClaims>(&token, &keys, &ClaimExpectations::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn unsupported_alg_reported() {
        let (signing, keys) = ed25519_fixture();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","kid":"op-key-1"}"#);
        let body = URL_SAFE_NO_PAD.encode(br#"{"tenant_id":"t1"}"#);
        let input = format!("{header}.{body}");
        let sig = signing.sign(input.as_bytes());
        let token = format!("{input}.{}", URL_SAFE_NO_PAD.encode(sig.to_bytes()));
        let err =
            verify_jws::<IdentityClaims>(&token, &keys, &ClaimExpectations::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedAlgorithm);
    }

    #[test]
    fn cached_provider_serves_from_cache() {
        let (_, keys) = ed25519_fixture();
        let cached = CachedJwks::new(StaticJwks::new(keys), Duration::from_secs(300));
        let a = cached.jwks().unwrap();
        let b = cached.jwks().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
