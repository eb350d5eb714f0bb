//! Cost, metric, and violation sinks plus ingest de-duplication.
//!
//! These are the terminal stores telemetry dispatch fans out to. They are
//! deliberately dumb: tenant-scoped inserts and reads, no aggregation. The
//! de-dup receipt table makes ingest idempotent on
//! `(execution_id, payload_type, payload_hash)`.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical;
use crate::error::{ErrorKind, GovernanceError, Result};
use crate::storage::{Store, StoreError};
use crate::time;

use super::PayloadType;

/// One cost accounting record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostRecord {
    /// Execution the spend belongs to.
    pub execution_id: String,
    /// Trace the spend belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Spend in micro-USD.
    pub amount_micros: i64,
    /// Model billed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider billed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// One operational metric sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricRecord {
    /// Metric name.
    pub name: String,
    /// Integer sample value.
    pub value: i64,
    /// Label set.
    #[serde(default)]
    pub labels: Value,
}

/// One recorded violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Adapter the violation concerns.
    pub adapter_id: String,
    /// Violation kind, e.g. `payload_hash_mismatch`.
    pub kind: String,
    /// Human-readable detail.
    pub detail: String,
    /// Execution involved, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Trace involved, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// The terminal telemetry stores.
pub struct TelemetrySinks {
    store: Store,
}

impl std::fmt::Debug for TelemetrySinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySinks").finish_non_exhaustive()
    }
}

impl TelemetrySinks {
    /// Creates the sinks over the shared store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Records an ingest receipt.
    ///
    /// Returns `false` when the `(execution_id, payload_type,
    /// payload_hash)` triple was already accepted for the tenant — the
    /// caller must then skip side effects.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn record_receipt(
        &self,
        tenant_id: &str,
        execution_id: &str,
        payload_type: PayloadType,
        payload_hash: &str,
    ) -> Result<bool> {
        let inserted = self
            .store
            .conn()
            .execute(
                "INSERT OR IGNORE INTO ingest_receipts
                     (tenant_id, execution_id, payload_type, payload_hash, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    execution_id,
                    payload_type.as_str(),
                    payload_hash,
                    time::to_rfc3339(time::now()),
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        Ok(inserted > 0)
    }

    /// Persists cost records.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn record_costs(&self, tenant_id: &str, records: &[CostRecord]) -> Result<()> {
        let now = time::to_rfc3339(time::now());
        let conn = self.store.conn();
        for record in records {
            conn.execute(
                "INSERT INTO cost_records
                     (tenant_id, execution_id, trace_id, amount_micros, model,
                      provider, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tenant_id,
                    record.execution_id,
                    record.trace_id,
                    record.amount_micros,
                    record.model,
                    record.provider,
                    now,
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        }
        Ok(())
    }

    /// Persists metric samples.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` for non-canonical labels, otherwise storage
    /// errors mapped into the taxonomy.
    pub fn record_metrics(&self, tenant_id: &str, records: &[MetricRecord]) -> Result<()> {
        let now = time::to_rfc3339(time::now());
        let conn = self.store.conn();
        for record in records {
            let labels =
                canonical::canonical_json_string(&record.labels).map_err(GovernanceError::from)?;
            conn.execute(
                "INSERT INTO metric_records (tenant_id, name, value, labels, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    record.name,
                    record.value,
                    labels,
                    now,
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        }
        Ok(())
    }

    /// Persists one violation.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn record_violation(&self, tenant_id: &str, violation: &ViolationRecord) -> Result<()> {
        self.store
            .conn()
            .execute(
                "INSERT INTO violation_records
                     (tenant_id, adapter_id, kind, detail, execution_id, trace_id, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tenant_id,
                    violation.adapter_id,
                    violation.kind,
                    violation.detail,
                    violation.execution_id,
                    violation.trace_id,
                    time::to_rfc3339(time::now()),
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        Ok(())
    }

    /// Lists violations for a tenant, newest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn list_violations(&self, tenant_id: &str, limit: u32) -> Result<Vec<ViolationRecord>> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(
                "SELECT adapter_id, kind, detail, execution_id, trace_id
                 FROM violation_records WHERE tenant_id = ?1
                 ORDER BY recorded_at DESC LIMIT ?2",
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        let rows = stmt
            .query_map(params![tenant_id, limit], |row| {
                Ok(ViolationRecord {
                    adapter_id: row.get(0)?,
                    kind: row.get(1)?,
                    detail: row.get(2)?,
                    execution_id: row.get(3)?,
                    trace_id: row.get(4)?,
                })
            })
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))
    }

    /// Total recorded spend for a tenant, micro-USD.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn total_cost_micros(&self, tenant_id: &str) -> Result<i64> {
        self.store
            .conn()
            .query_row(
                "SELECT COALESCE(SUM(amount_micros), 0) FROM cost_records
                 WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))
    }
}

/// Decodes a typed sink payload from an envelope's opaque JSON.
///
/// # Errors
///
/// Returns `schema_invalid` when the payload does not match the expected
/// shape for its declared type.
pub fn decode_payload<T: serde::de::DeserializeOwned>(
    payload_type: PayloadType,
    payload: &Value,
) -> Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        GovernanceError::new(
            ErrorKind::SchemaInvalid,
            format!("{} payload: {e}", payload_type.as_str()),
        )
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sinks() -> TelemetrySinks {
        TelemetrySinks::new(Store::in_memory().unwrap())
    }

    #[test]
    fn receipts_dedup_on_triple() {
        let sinks = sinks();
        assert!(
            sinks
                .record_receipt("t1", "exec-1", PayloadType::Cost, "sha256:aa")
                .unwrap()
        );
        assert!(
            !sinks
                .record_receipt("t1", "exec-1", PayloadType::Cost, "sha256:aa")
                .unwrap()
        );
        // Any element of the triple differing is a fresh receipt.
        assert!(
            sinks
                .record_receipt("t1", "exec-1", PayloadType::Cost, "sha256:bb")
                .unwrap()
        );
        assert!(
            sinks
                .record_receipt("t1", "exec-1", PayloadType::Metrics, "sha256:aa")
                .unwrap()
        );
        // A different tenant is a different receipt space.
        assert!(
            sinks
                .record_receipt("t2", "exec-1", PayloadType::Cost, "sha256:aa")
                .unwrap()
        );
    }

    #[test]
    fn costs_accumulate_per_tenant() {
        let sinks = sinks();
        sinks
            .record_costs("t1", &[
                CostRecord {
                    execution_id: "exec-1".to_string(),
                    trace_id: None,
                    amount_micros: 250_000,
                    model: Some("sonnet-x".to_string()),
                    provider: None,
                },
                CostRecord {
                    execution_id: "exec-2".to_string(),
                    trace_id: None,
                    amount_micros: 150_000,
                    model: None,
                    provider: None,
                },
            ])
            .unwrap();
        assert_eq!(sinks.total_cost_micros("t1").unwrap(), 400_000);
        assert_eq!(sinks.total_cost_micros("t2").unwrap(), 0);
    }

    #[test]
    fn violations_roundtrip() {
        let sinks = sinks();
        sinks
            .record_violation("t1", &ViolationRecord {
                adapter_id: "a1".to_string(),
                kind: "payload_hash_mismatch".to_string(),
                detail: "recomputed hash differs".to_string(),
                execution_id: Some("exec-1".to_string()),
                trace_id: None,
            })
            .unwrap();
        let listed = sinks.list_violations("t1", 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, "payload_hash_mismatch");
        assert!(sinks.list_violations("t2", 10).unwrap().is_empty());
    }

    #[test]
    fn decode_payload_enforces_shape() {
        let good: Vec<CostRecord> = decode_payload(
            PayloadType::Cost,
            &json!([{"execution_id": "e", "amount_micros": 5}]),
        )
        .unwrap();
        assert_eq!(good[0].amount_micros, 5);

        let err = decode_payload::<Vec<CostRecord>>(
            PayloadType::Cost,
            &json!([{"amount_micros": "not-a-number"}]),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
    }
}
