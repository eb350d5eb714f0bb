//! Telemetry ingest: verification, enforcement modes, and sink fan-out.
//!
//! One envelope comes in; depending on the tenant's enforcement mode it is
//! verified (or not), de-duplicated, and dispatched to the sink matching
//! its payload type: traces to the trace store, audit events to the audit
//! chain (as the adapter's actor), cost and metrics to their stores,
//! violations to the violation table plus the audit chain.
//!
//! A duplicate `(execution_id, payload_type, payload_hash)` triple is
//! accepted silently with no second side effect.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use clasper_core::audit::AuditLog;
use clasper_core::error::{GovernanceError, Result};
use clasper_core::identity::TenantContext;
use clasper_core::telemetry::{
    CostRecord, EnforcementMode, EnvelopeVerifier, MetricRecord, PayloadType,
    SignedTelemetryEnvelope, TelemetrySinks, ViolationRecord,
};
use clasper_core::tenant::TenantStore;
use clasper_core::trace::{Trace, TraceStore};

/// The receipt returned for every accepted or rejected envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Whether the envelope was accepted.
    pub accepted: bool,
    /// Violations recorded while handling it, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<String>>,
    /// The enforcement mode that applied.
    pub mode: EnforcementMode,
    /// Whether the signature pipeline fully verified.
    pub verified: bool,
}

/// One audit event reported inside an `audit` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReportedAuditEvent {
    event_type: String,
    event_data: Value,
    #[serde(default)]
    target_id: Option<String>,
}

/// Telemetry ingest pipeline.
pub struct TelemetryIngest {
    verifier: EnvelopeVerifier,
    sinks: Arc<TelemetrySinks>,
    audit: Arc<AuditLog>,
    traces: Arc<TraceStore>,
    tenants: Arc<TenantStore>,
    default_mode: EnforcementMode,
}

impl std::fmt::Debug for TelemetryIngest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryIngest")
            .field("default_mode", &self.default_mode)
            .finish_non_exhaustive()
    }
}

impl TelemetryIngest {
    /// Wires the pipeline from shared services.
    #[must_use]
    pub fn new(
        verifier: EnvelopeVerifier,
        sinks: Arc<TelemetrySinks>,
        audit: Arc<AuditLog>,
        traces: Arc<TraceStore>,
        tenants: Arc<TenantStore>,
        default_mode: EnforcementMode,
    ) -> Self {
        Self {
            verifier,
            sinks,
            audit,
            traces,
            tenants,
            default_mode,
        }
    }

    /// Ingests one envelope under the tenant's enforcement mode.
    ///
    /// # Errors
    ///
    /// In `enforce` mode, verification failures surface as their integrity
    /// kinds after a violation is recorded. In `warn` mode they are
    /// recorded and ingest proceeds. Dispatch failures surface in every
    /// mode — a payload that cannot be stored was not ingested.
    pub fn ingest(
        &self,
        identity: &TenantContext,
        envelope: &SignedTelemetryEnvelope,
    ) -> Result<IngestReceipt> {
        let tenant_id = identity.tenant_id();
        let mode = self
            .tenants
            .settings(tenant_id)?
            .telemetry_mode
            .unwrap_or(self.default_mode);

        let mut violations = Vec::new();
        let verified = match mode {
            EnforcementMode::Off => false,
            EnforcementMode::Warn | EnforcementMode::Enforce => {
                match self.verifier.verify(tenant_id, envelope) {
                    Ok(()) => true,
                    Err(err) => {
                        self.record_violation(tenant_id, envelope, &err)?;
                        violations.push(err.kind().code().to_string());
                        if mode == EnforcementMode::Enforce {
                            return Err(err);
                        }
                        tracing::warn!(
                            tenant = %tenant_id,
                            adapter = %envelope.adapter_id,
                            kind = %err.kind(),
                            "accepting telemetry envelope despite failed verification"
                        );
                        false
                    },
                }
            },
        };

        // De-dup before side effects; a replayed envelope is acknowledged
        // without dispatching twice.
        let fresh = self.sinks.record_receipt(
            tenant_id,
            &envelope.execution_id,
            envelope.payload_type,
            &envelope.payload_hash,
        )?;
        if fresh {
            self.dispatch(tenant_id, envelope)?;
        }

        Ok(IngestReceipt {
            accepted: true,
            violations: if violations.is_empty() {
                None
            } else {
                Some(violations)
            },
            mode,
            verified,
        })
    }

    /// Fans the payload out to its sink.
    fn dispatch(&self, tenant_id: &str, envelope: &SignedTelemetryEnvelope) -> Result<()> {
        let actor = format!("adapter:{}", envelope.adapter_id);
        match envelope.payload_type {
            PayloadType::Trace => {
                let mut trace: Trace =
                    clasper_core::telemetry::decode_payload(envelope.payload_type, &envelope.payload)?;
                // The authenticated tenant is authoritative, whatever the
                // payload claims.
                trace.tenant_id = tenant_id.to_string();
                trace.adapter_id.get_or_insert_with(|| envelope.adapter_id.clone());
                self.traces.insert(&trace)?;
            },
            PayloadType::Audit => {
                let events: Vec<ReportedAuditEvent> =
                    clasper_core::telemetry::decode_payload(envelope.payload_type, &envelope.payload)?;
                for event in events {
                    self.audit.append(
                        tenant_id,
                        &event.event_type,
                        event.event_data,
                        &actor,
                        event.target_id.as_deref(),
                    )?;
                }
            },
            PayloadType::Cost => {
                let records: Vec<CostRecord> =
                    clasper_core::telemetry::decode_payload(envelope.payload_type, &envelope.payload)?;
                self.sinks.record_costs(tenant_id, &records)?;
                for record in &records {
                    self.tenants.record_spend(tenant_id, "", record.amount_micros)?;
                }
            },
            PayloadType::Metrics => {
                let records: Vec<MetricRecord> =
                    clasper_core::telemetry::decode_payload(envelope.payload_type, &envelope.payload)?;
                self.sinks.record_metrics(tenant_id, &records)?;
            },
            PayloadType::Violations => {
                let records: Vec<ViolationRecord> =
                    clasper_core::telemetry::decode_payload(envelope.payload_type, &envelope.payload)?;
                for record in &records {
                    self.sinks.record_violation(tenant_id, record)?;
                    self.audit.append(
                        tenant_id,
                        "violation_reported",
                        serde_json::json!({
                            "kind": record.kind,
                            "detail": record.detail,
                            "execution_id": record.execution_id,
                        }),
                        &actor,
                        record.execution_id.as_deref(),
                    )?;
                }
            },
        }
        Ok(())
    }

    fn record_violation(
        &self,
        tenant_id: &str,
        envelope: &SignedTelemetryEnvelope,
        err: &GovernanceError,
    ) -> Result<()> {
        self.sinks.record_violation(tenant_id, &ViolationRecord {
            adapter_id: envelope.adapter_id.clone(),
            kind: err.kind().code().to_string(),
            detail: err.message().to_string(),
            execution_id: Some(envelope.execution_id.clone()),
            trace_id: Some(envelope.trace_id.clone()),
        })
    }
}
