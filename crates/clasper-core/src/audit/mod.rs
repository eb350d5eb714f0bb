//! Per-tenant hash-chained audit log.
//!
//! Every decision, token issuance, approval transition, and telemetry ingest
//! appends one entry here. Entries for a tenant form a dense, strictly
//! increasing sequence whose hashes chain: entry *n* commits to entry *n−1*,
//! so modifying any historical byte is detectable by re-hashing offline.
//!
//! # Chain record
//!
//! `entry_hash = sha256:hex(SHA-256(canonical({seq, tenant_id, event_type,
//! occurred_at, actor, target_id, event_data, prev_hash})))` with
//! `prev_hash` null only at `seq = 1`.
//!
//! # Concurrency
//!
//! Two concurrent appenders for the same tenant serialize on a per-tenant
//! mutex; the append transaction re-reads the chain head so the in-process
//! lock is a fast path, not a correctness dependency. Appends for different
//! tenants run in parallel.
//!
//! # Retention
//!
//! The chain is append-only: no updates, no deletes. Retention copies a
//! leading range to cold storage, appends a `chain_sealed` marker recording
//! the truncated tip hash, and only then deletes that whole leading range.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::canonical;
use crate::error::{ErrorKind, GovernanceError, Result};
use crate::storage::{Store, StoreError};
use crate::time;

/// Event type of the retention sealing marker.
pub const CHAIN_SEALED_EVENT: &str = "chain_sealed";

/// One entry of a tenant's audit chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Owning tenant.
    pub tenant_id: String,
    /// 1-based dense sequence number.
    pub seq: u64,
    /// Event type label, e.g. `execution_decision`.
    pub event_type: String,
    /// When the event occurred.
    pub occurred_at: String,
    /// Acting principal, e.g. `adapter:runtime-1` or `operator:alice`.
    pub actor: String,
    /// Entity the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Canonical event payload.
    pub event_data: Value,
    /// Hash of the previous entry; `None` only at `seq = 1`.
    pub prev_hash: Option<String>,
    /// Hash of this entry.
    pub entry_hash: String,
}

impl AuditEntry {
    /// Recomputes this entry's hash from its own fields.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` if the event data is outside the canonical
    /// profile.
    pub fn compute_hash(&self) -> Result<String> {
        hash_record(
            self.seq,
            &self.tenant_id,
            &self.event_type,
            &self.occurred_at,
            &self.actor,
            self.target_id.as_deref(),
            &self.event_data,
            self.prev_hash.as_deref(),
        )
    }
}

/// The canonical record every hash commits to.
#[allow(clippy::too_many_arguments)]
fn hash_record(
    seq: u64,
    tenant_id: &str,
    event_type: &str,
    occurred_at: &str,
    actor: &str,
    target_id: Option<&str>,
    event_data: &Value,
    prev_hash: Option<&str>,
) -> Result<String> {
    let record = json!({
        "seq": seq,
        "tenant_id": tenant_id,
        "event_type": event_type,
        "occurred_at": occurred_at,
        "actor": actor,
        "target_id": target_id,
        "event_data": event_data,
        "prev_hash": prev_hash,
    });
    let digest = canonical::sha256_json(&record).map_err(GovernanceError::from)?;
    Ok(canonical::format_hash(&digest))
}

/// Verification outcome for one tenant's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// True iff no entry failed.
    pub ok: bool,
    /// Sequence numbers whose hash or link failed; never short-circuited.
    pub failures: Vec<u64>,
    /// Number of entries inspected.
    pub entries_checked: u64,
}

/// Query filters for the audit listing surface.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Only entries of this event type.
    pub event_type: Option<String>,
    /// Only entries by this actor.
    pub actor: Option<String>,
    /// Only entries at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Only entries at or before this time.
    pub until: Option<DateTime<Utc>>,
    /// Only entries with `seq` greater than this cursor.
    pub after_seq: Option<u64>,
    /// Page size; defaults to 100.
    pub limit: Option<u32>,
}

/// The append-only audit log service.
pub struct AuditLog {
    store: Store,
    /// Per-tenant append serialization.
    tenant_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Creates the audit log over the shared store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            tenant_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Appends one entry and returns `(seq, entry_hash)`.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` for non-canonical event data, otherwise
    /// storage errors mapped into the taxonomy.
    pub fn append(
        &self,
        tenant_id: &str,
        event_type: &str,
        event_data: Value,
        actor: &str,
        target_id: Option<&str>,
    ) -> Result<(u64, String)> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().expect("tenant audit lock poisoned");

        let occurred_at = time::to_rfc3339(time::now());
        let result = self.store.with_tx(|tx| {
            let head: Option<(u64, String)> = tx
                .query_row(
                    "SELECT seq, entry_hash FROM audit_chain
                     WHERE tenant_id = ?1 ORDER BY seq DESC LIMIT 1",
                    params![tenant_id],
                    |row| Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            let (seq, prev_hash) = match head {
                Some((max_seq, last_hash)) => (max_seq + 1, Some(last_hash)),
                None => (1, None),
            };

            let entry_hash = hash_record(
                seq,
                tenant_id,
                event_type,
                &occurred_at,
                actor,
                target_id,
                &event_data,
                prev_hash.as_deref(),
            )
            .map_err(|e| StoreError::CorruptRow {
                table: "audit_chain",
                reason: e.to_string(),
            })?;

            let event_canonical =
                canonical::canonical_json_string(&event_data).map_err(|e| StoreError::CorruptRow {
                    table: "audit_chain",
                    reason: e.to_string(),
                })?;

            tx.execute(
                "INSERT INTO audit_chain
                     (tenant_id, seq, event_type, occurred_at, actor, target_id,
                      event_data, prev_hash, entry_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    tenant_id,
                    seq,
                    event_type,
                    occurred_at,
                    actor,
                    target_id,
                    event_canonical,
                    prev_hash,
                    entry_hash,
                ],
            )?;

            Ok((seq, entry_hash))
        });

        result.map_err(|e| match e {
            StoreError::CorruptRow { reason, .. } => {
                GovernanceError::new(ErrorKind::SchemaInvalid, reason)
            },
            other => GovernanceError::from(other),
        })
    }

    /// Re-hashes the whole chain for a tenant, reporting every failure.
    ///
    /// The first retained entry after a sealing truncation has no
    /// predecessor in the store; its link is attested by the sealing marker
    /// and only its own hash is recomputed here.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn verify_chain(&self, tenant_id: &str) -> Result<ChainVerification> {
        let entries = self.load_entries(tenant_id, &AuditQuery {
            limit: Some(u32::MAX),
            ..AuditQuery::default()
        })?;

        let mut failures = Vec::new();
        let mut prev: Option<(u64, String)> = None;

        for entry in &entries {
            let mut bad = false;

            match entry.compute_hash() {
                Ok(computed) if computed == entry.entry_hash => {},
                _ => bad = true,
            }

            match (&prev, &entry.prev_hash) {
                // Chain link must equal the previous entry's stored hash.
                (Some((prev_seq, prev_entry_hash)), Some(linked)) => {
                    if entry.seq != prev_seq + 1 || linked != prev_entry_hash {
                        bad = true;
                    }
                },
                // Genesis must have no prev_hash.
                (None, Some(_)) if entry.seq == 1 => bad = true,
                // A truncated chain's first entry may carry a prev_hash the
                // store can no longer resolve.
                (None, _) => {},
                // Every non-genesis entry needs a link.
                (Some(_), None) => bad = true,
            }

            if bad {
                failures.push(entry.seq);
            }
            prev = Some((entry.seq, entry.entry_hash.clone()));
        }

        Ok(ChainVerification {
            ok: failures.is_empty(),
            entries_checked: entries.len() as u64,
            failures,
        })
    }

    /// Lists entries with filters and seq-cursor pagination.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn query(&self, tenant_id: &str, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.load_entries(tenant_id, query)
    }

    /// Exports the full chain plus its verification verdict.
    ///
    /// The export carries exactly the hashed field set, so any offline
    /// verifier can re-run the same computation.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn export(&self, tenant_id: &str) -> Result<(Vec<AuditEntry>, ChainVerification)> {
        let entries = self.load_entries(tenant_id, &AuditQuery {
            limit: Some(u32::MAX),
            ..AuditQuery::default()
        })?;
        let verification = self.verify_chain(tenant_id)?;
        Ok((entries, verification))
    }

    /// Applies retention: seals and deletes the leading range up to
    /// `through_seq` inclusive.
    ///
    /// The caller is responsible for having copied the range to cold
    /// storage first. A `chain_sealed` marker recording the truncated tip
    /// hash is appended before anything is deleted.
    ///
    /// # Errors
    ///
    /// Returns `decision_not_found`-free storage errors; sealing an empty
    /// range is a `schema_invalid`.
    pub fn seal_and_truncate(&self, tenant_id: &str, through_seq: u64) -> Result<u64> {
        let tip: Option<String> = self
            .store
            .conn()
            .query_row(
                "SELECT entry_hash FROM audit_chain WHERE tenant_id = ?1 AND seq = ?2",
                params![tenant_id, through_seq],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        let Some(tip) = tip else {
            return Err(GovernanceError::new(
                ErrorKind::SchemaInvalid,
                format!("no entry at seq {through_seq} to seal"),
            ));
        };

        self.append(
            tenant_id,
            CHAIN_SEALED_EVENT,
            json!({"sealed_through_seq": through_seq, "sealed_tip_hash": tip}),
            "system:retention",
            None,
        )?;

        let deleted = self
            .store
            .conn()
            .execute(
                "DELETE FROM audit_chain WHERE tenant_id = ?1 AND seq <= ?2",
                params![tenant_id, through_seq],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        tracing::info!(
            tenant = %tenant_id,
            through_seq,
            deleted,
            "sealed and truncated audit chain"
        );
        Ok(deleted as u64)
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.tenant_locks.lock().expect("audit lock map poisoned");
        Arc::clone(
            locks
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn load_entries(&self, tenant_id: &str, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut sql = String::from(
            "SELECT seq, event_type, occurred_at, actor, target_id, event_data,
                    prev_hash, entry_hash
             FROM audit_chain WHERE tenant_id = ?1",
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant_id.to_string())];

        if let Some(event_type) = &query.event_type {
            binds.push(Box::new(event_type.clone()));
            sql.push_str(&format!(" AND event_type = ?{}", binds.len()));
        }
        if let Some(actor) = &query.actor {
            binds.push(Box::new(actor.clone()));
            sql.push_str(&format!(" AND actor = ?{}", binds.len()));
        }
        if let Some(since) = query.since {
            binds.push(Box::new(time::to_rfc3339(since)));
            sql.push_str(&format!(" AND occurred_at >= ?{}", binds.len()));
        }
        if let Some(until) = query.until {
            binds.push(Box::new(time::to_rfc3339(until)));
            sql.push_str(&format!(" AND occurred_at <= ?{}", binds.len()));
        }
        if let Some(after_seq) = query.after_seq {
            binds.push(Box::new(after_seq));
            sql.push_str(&format!(" AND seq > ?{}", binds.len()));
        }

        let limit = query.limit.unwrap_or(100);
        sql.push_str(" ORDER BY seq ASC");
        binds.push(Box::new(i64::from(limit)));
        sql.push_str(&format!(" LIMIT ?{}", binds.len()));

        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        let params = rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref()));
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, event_type, occurred_at, actor, target_id, event_data, prev_hash, entry_hash) =
                row.map_err(|e| GovernanceError::from(StoreError::from(e)))?;
            let event_data: Value = serde_json::from_str(&event_data).map_err(|e| {
                GovernanceError::new(ErrorKind::SchemaInvalid, format!("stored event data: {e}"))
            })?;
            entries.push(AuditEntry {
                tenant_id: tenant_id.to_string(),
                seq,
                event_type,
                occurred_at,
                actor,
                target_id,
                event_data,
                prev_hash,
                entry_hash,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit_log() -> AuditLog {
        AuditLog::new(Store::in_memory().unwrap())
    }

    fn append_n(log: &AuditLog, tenant: &str, n: u64) {
        for i in 1..=n {
            log.append(
                tenant,
                "execution_decision",
                json!({"i": i}),
                "system:test",
                None,
            )
            .unwrap();
        }
    }

    // =========================================================================
    // Chain construction
    // =========================================================================

    #[test]
    fn sequences_are_dense_and_one_based() {
        let log = audit_log();
        let (seq1, hash1) = log
            .append("t1", "execution_decision", json!({}), "system:test", None)
            .unwrap();
        let (seq2, _) = log
            .append("t1", "execution_decision", json!({}), "system:test", None)
            .unwrap();
        assert_eq!((seq1, seq2), (1, 2));

        let entries = log.query("t1", &AuditQuery::default()).unwrap();
        assert_eq!(entries[0].prev_hash, None);
        assert_eq!(entries[1].prev_hash.as_deref(), Some(hash1.as_str()));
    }

    #[test]
    fn tenants_have_independent_chains() {
        let log = audit_log();
        append_n(&log, "t1", 3);
        append_n(&log, "t2", 2);
        let t1 = log.query("t1", &AuditQuery::default()).unwrap();
        let t2 = log.query("t2", &AuditQuery::default()).unwrap();
        assert_eq!(t1.len(), 3);
        assert_eq!(t2.len(), 2);
        assert!(t2.iter().all(|e| e.tenant_id == "t2"));
    }

    #[test]
    fn entry_hash_has_expected_form() {
        let log = audit_log();
        let (_, hash) = log
            .append("t1", "execution_decision", json!({}), "system:test", None)
            .unwrap();
        assert!(hash.starts_with("sha256:"));
        assert_eq!(hash.len(), "sha256:".len() + 64);
    }

    #[test]
    fn concurrent_appends_serialize_per_tenant() {
        let log = Arc::new(AuditLog::new(Store::in_memory().unwrap()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let log = Arc::clone(&log);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    log.append("t1", "execution_decision", json!({}), "system:test", None)
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = log
            .query("t1", &AuditQuery {
                limit: Some(100),
                ..AuditQuery::default()
            })
            .unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
        assert!(log.verify_chain("t1").unwrap().ok);
    }

    // =========================================================================
    // Verification
    // =========================================================================

    #[test]
    fn pristine_chain_verifies() {
        let log = audit_log();
        append_n(&log, "t1", 5);
        let verdict = log.verify_chain("t1").unwrap();
        assert!(verdict.ok);
        assert_eq!(verdict.entries_checked, 5);
    }

    #[test]
    fn tampered_event_data_detected() {
        let log = audit_log();
        append_n(&log, "t1", 3);
        // Tamper with seq 2 directly in storage.
        log.store
            .conn()
            .execute(
                "UPDATE audit_chain SET event_data = '{\"i\":99}'
                 WHERE tenant_id = 't1' AND seq = 2",
                [],
            )
            .unwrap();
        let verdict = log.verify_chain("t1").unwrap();
        assert!(!verdict.ok);
        assert_eq!(verdict.failures, vec![2]);
    }

    #[test]
    fn broken_link_reports_all_failures() {
        let log = audit_log();
        append_n(&log, "t1", 4);
        // Rewriting entry 2's hash breaks 2 (self) and 3 (link).
        log.store
            .conn()
            .execute(
                "UPDATE audit_chain SET entry_hash = 'sha256:beef'
                 WHERE tenant_id = 't1' AND seq = 2",
                [],
            )
            .unwrap();
        let verdict = log.verify_chain("t1").unwrap();
        assert_eq!(verdict.failures, vec![2, 3]);
    }

    #[test]
    fn empty_chain_verifies_vacuously() {
        let verdict = audit_log().verify_chain("t1").unwrap();
        assert!(verdict.ok);
        assert_eq!(verdict.entries_checked, 0);
    }

    // =========================================================================
    // Query surface
    // =========================================================================

    #[test]
    fn filters_and_cursor_pagination() {
        let log = audit_log();
        append_n(&log, "t1", 5);
        log.append("t1", "policy_upserted", json!({}), "operator:alice", None)
            .unwrap();

        let decisions = log
            .query("t1", &AuditQuery {
                event_type: Some("execution_decision".to_string()),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(decisions.len(), 5);

        let page = log
            .query("t1", &AuditQuery {
                after_seq: Some(3),
                limit: Some(2),
                ..AuditQuery::default()
            })
            .unwrap();
        let seqs: Vec<u64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    // =========================================================================
    // Export and retention
    // =========================================================================

    #[test]
    fn export_is_offline_verifiable() {
        let log = audit_log();
        append_n(&log, "t1", 3);
        let (entries, verdict) = log.export("t1").unwrap();
        assert!(verdict.ok);
        // An offline verifier recomputes each hash from exported fields only.
        for entry in &entries {
            assert_eq!(entry.compute_hash().unwrap(), entry.entry_hash);
        }
    }

    #[test]
    fn seal_and_truncate_keeps_tail_verifiable() {
        let log = audit_log();
        append_n(&log, "t1", 5);
        let deleted = log.seal_and_truncate("t1", 3).unwrap();
        assert_eq!(deleted, 3);

        let entries = log.query("t1", &AuditQuery::default()).unwrap();
        assert_eq!(entries.first().map(|e| e.seq), Some(4));
        assert_eq!(
            entries.last().map(|e| e.event_type.as_str()),
            Some(CHAIN_SEALED_EVENT)
        );
        assert!(log.verify_chain("t1").unwrap().ok);
    }

    #[test]
    fn sealing_nonexistent_range_fails() {
        let log = audit_log();
        append_n(&log, "t1", 2);
        assert!(log.seal_and_truncate("t1", 9).is_err());
    }
}
