//! Shared fixtures for the end-to-end control-plane tests.
#![allow(dead_code)]

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use clasper_core::adapter::{AdapterRegistration, KeyAlgorithm, RiskClass, TelemetryKey};
use clasper_core::execution::ExecutionRequest;
use clasper_core::identity::jwks::Jwk;
use clasper_core::identity::{IdentityClaims, Principal, TenantContext};
use clasper_core::telemetry::{ENVELOPE_VERSION, PayloadType, SignedTelemetryEnvelope};
use clasper_daemon::config::Config;
use clasper_daemon::state::Daemon;
use ed25519_dalek::Signer as _;

/// A daemon over an in-memory store.
pub fn daemon() -> Daemon {
    Daemon::new(Config::for_tests()).unwrap()
}

/// Registers an adapter for tenant `t1`.
pub fn register_adapter(
    daemon: &Daemon,
    adapter_id: &str,
    risk_class: RiskClass,
    capabilities: &[&str],
) {
    daemon
        .registry
        .upsert(&AdapterRegistration {
            tenant_id: "t1".to_string(),
            adapter_id: adapter_id.to_string(),
            version: "1.0".to_string(),
            display_name: adapter_id.to_string(),
            risk_class,
            capabilities: capabilities.iter().map(ToString::to_string).collect(),
            enabled: true,
        })
        .unwrap();
}

/// Enrolls a fresh Ed25519 telemetry key and returns the signing half.
pub fn enroll_telemetry_key(daemon: &Daemon, adapter_id: &str) -> ed25519_dalek::SigningKey {
    let signing = ed25519_dalek::SigningKey::from_bytes(&[21u8; 32]);
    daemon
        .registry
        .set_telemetry_key("t1", adapter_id, "1.0", &TelemetryKey {
            key_id: "k1".to_string(),
            algorithm: KeyAlgorithm::Ed25519,
            public_jwk: Jwk {
                kty: "OKP".to_string(),
                crv: Some("Ed25519".to_string()),
                kid: Some("k1".to_string()),
                alg: None,
                x: Some(URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes())),
                y: None,
            },
            created_at: clasper_core::time::now(),
            revoked_at: None,
        })
        .unwrap();
    signing
}

/// An authenticated adapter identity for tenant `t1`.
pub fn adapter_identity() -> TenantContext {
    TenantContext::from_claims(Principal::Adapter, IdentityClaims::for_tenant("t1")).unwrap()
}

/// An operator identity for tenant `t1` carrying the given roles.
pub fn operator_identity(roles: &[&str]) -> TenantContext {
    let mut claims = IdentityClaims::for_tenant("t1");
    claims.user_id = Some("alice".to_string());
    claims.roles = Some(roles.iter().map(ToString::to_string).collect());
    TenantContext::from_claims(Principal::Operator, claims).unwrap()
}

/// A minimal execution request for tenant `t1`.
pub fn execution_request(adapter_id: &str, capabilities: &[&str]) -> ExecutionRequest {
    ExecutionRequest {
        execution_id: "exec-1".to_string(),
        adapter_id: adapter_id.to_string(),
        tenant_id: "t1".to_string(),
        workspace_id: "w1".to_string(),
        skill_id: None,
        requested_capabilities: capabilities.iter().map(ToString::to_string).collect(),
        intent: None,
        context: None,
        provenance: None,
        estimated_cost_micros: None,
        tool_count: Some(0),
        environment: None,
    }
}

/// Seals a telemetry envelope with the given signing key.
pub fn sealed_envelope(
    signing: &ed25519_dalek::SigningKey,
    adapter_id: &str,
    payload_type: PayloadType,
    payload: serde_json::Value,
) -> SignedTelemetryEnvelope {
    let mut envelope = SignedTelemetryEnvelope {
        envelope_version: ENVELOPE_VERSION.to_string(),
        adapter_id: adapter_id.to_string(),
        adapter_version: "1.0".to_string(),
        issued_at: clasper_core::time::to_rfc3339(clasper_core::time::now()),
        execution_id: "exec-1".to_string(),
        trace_id: "tr-1".to_string(),
        payload_type,
        payload,
        payload_hash: String::new(),
        signature: String::new(),
    };
    envelope.payload_hash = envelope.compute_payload_hash().unwrap();
    let input = envelope.signing_input().unwrap();
    envelope.signature = URL_SAFE_NO_PAD.encode(signing.sign(&input).to_bytes());
    envelope
}

/// Arc-wraps a daemon for multi-threaded scenarios.
pub fn shared(daemon: Daemon) -> Arc<Daemon> {
    Arc::new(daemon)
}
