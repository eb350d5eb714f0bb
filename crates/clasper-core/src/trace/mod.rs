//! Execution trace store with hash-chained steps.
//!
//! Adapters report a trace per execution: model, provider, input/output,
//! usage, and an ordered list of steps. Steps signed by the adapter carry a
//! hash chain mirroring the audit chain, so any post-hoc edit of step data
//! is detectable on read.
//!
//! Traces are persisted whole and never mutated; retention deletes whole
//! traces only. The integrity verdict is always derived at read time by
//! re-hashing — storage order is never trusted beyond the
//! `(trace_id, idx)` index.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::canonical;
use crate::error::{ErrorKind, GovernanceError, Result};
use crate::execution::ExecutionScope;
use crate::storage::{Store, StoreError};
use crate::time;

/// One step of an execution trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceStep {
    /// Step identifier, unique within the trace.
    pub step_id: String,
    /// Step kind, e.g. `llm_call`, `tool_call`.
    #[serde(rename = "type")]
    pub step_type: String,
    /// When the step started.
    pub timestamp: String,
    /// Step duration in milliseconds.
    pub duration_ms: i64,
    /// Step payload.
    pub data: Value,
    /// Hash of the previous step; `None` at index 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_step_hash: Option<String>,
    /// Hash of this step; `None` for unsigned traces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_hash: Option<String>,
}

impl TraceStep {
    /// Recomputes this step's chain hash.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` if the step data is outside the canonical
    /// profile.
    pub fn compute_hash(&self) -> Result<String> {
        let record = json!({
            "step_id": self.step_id,
            "prev_step_hash": self.prev_step_hash,
            "type": self.step_type,
            "timestamp": self.timestamp,
            "duration_ms": self.duration_ms,
            "data": self.data,
        });
        let digest = canonical::sha256_json(&record).map_err(GovernanceError::from)?;
        Ok(canonical::format_hash(&digest))
    }
}

/// Token and cost usage reported with a trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceUsage {
    /// Prompt tokens consumed.
    pub input_tokens: i64,
    /// Completion tokens produced.
    pub output_tokens: i64,
    /// Cost in micro-USD, when the provider reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_micros: Option<i64>,
}

/// A full execution trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Trace identifier.
    pub trace_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Workspace the execution ran in.
    pub workspace_id: String,
    /// Reporting adapter, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
    /// Execution start.
    pub started_at: DateTime<Utc>,
    /// Execution end; `None` while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Model used.
    pub model: String,
    /// Provider used.
    pub provider: String,
    /// Prompt input.
    pub input: String,
    /// Final output; `None` while running or on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Ordered steps.
    pub steps: Vec<TraceStep>,
    /// Usage accounting.
    pub usage: TraceUsage,
    /// Scope granted by the decision, when one was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_scope: Option<ExecutionScope>,
    /// Scope actually exercised, as reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_scope: Option<ExecutionScope>,
    /// Redacted prompt for low-clearance viewers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacted_prompt: Option<String>,
    /// Failure description when the execution errored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Trace {
    /// Derived lifecycle status used for filtering.
    #[must_use]
    pub fn status(&self) -> TraceStatus {
        if self.error.is_some() {
            TraceStatus::Failed
        } else if self.completed_at.is_some() {
            TraceStatus::Completed
        } else {
            TraceStatus::Running
        }
    }
}

/// Lifecycle status of a stored trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    /// No completion reported yet.
    Running,
    /// Completed without error.
    Completed,
    /// Completed with an error.
    Failed,
}

impl TraceStatus {
    /// The wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the wire identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Integrity verdict derived on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceIntegrity {
    /// Every step hashed and the chain reconciles.
    Verified,
    /// A step hash or link failed.
    Compromised,
    /// No step carries a hash.
    Unsigned,
    /// The trace has no steps to judge.
    Unverified,
}

/// Computes the integrity verdict for a step list.
#[must_use]
pub fn verify_steps(steps: &[TraceStep]) -> TraceIntegrity {
    if steps.is_empty() {
        return TraceIntegrity::Unverified;
    }
    if steps.iter().all(|s| s.step_hash.is_none()) {
        return TraceIntegrity::Unsigned;
    }

    let mut prev_hash: Option<&str> = None;
    for (idx, step) in steps.iter().enumerate() {
        let Some(stored) = step.step_hash.as_deref() else {
            // A partially signed chain cannot be verified.
            return TraceIntegrity::Compromised;
        };
        match step.compute_hash() {
            Ok(computed) if computed == stored => {},
            _ => return TraceIntegrity::Compromised,
        }
        let expected_prev = if idx == 0 { None } else { prev_hash };
        if step.prev_step_hash.as_deref() != expected_prev {
            return TraceIntegrity::Compromised;
        }
        prev_hash = Some(stored);
    }
    TraceIntegrity::Verified
}

/// Filters for the trace listing surface.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    /// Only traces in this workspace.
    pub workspace_id: Option<String>,
    /// Only traces with this status.
    pub status: Option<TraceStatus>,
    /// Only traces started at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Only traces started at or before this time.
    pub until: Option<DateTime<Utc>>,
    /// Page size; defaults to 50.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// The trace store.
pub struct TraceStore {
    store: Store,
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore").finish_non_exhaustive()
    }
}

impl TraceStore {
    /// Creates the trace store over the shared store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persists a trace whole, steps included, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `store_conflict` if the trace id already exists, otherwise
    /// storage errors mapped into the taxonomy.
    pub fn insert(&self, trace: &Trace) -> Result<()> {
        let usage = to_canonical_string(&trace.usage)?;
        let granted = trace
            .granted_scope
            .as_ref()
            .map(to_canonical_string)
            .transpose()?;
        let used = trace
            .used_scope
            .as_ref()
            .map(to_canonical_string)
            .transpose()?;

        let step_rows: Vec<(usize, &TraceStep, String)> = {
            let mut rows = Vec::with_capacity(trace.steps.len());
            for (idx, step) in trace.steps.iter().enumerate() {
                rows.push((idx, step, to_canonical_string(&step.data)?));
            }
            rows
        };

        let result = self.store.with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO traces
                     (trace_id, tenant_id, workspace_id, adapter_id, started_at,
                      completed_at, model, provider, input, output, usage,
                      granted_scope, used_scope, redacted_prompt, error, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    trace.trace_id,
                    trace.tenant_id,
                    trace.workspace_id,
                    trace.adapter_id,
                    time::to_rfc3339(trace.started_at),
                    trace.completed_at.map(time::to_rfc3339),
                    trace.model,
                    trace.provider,
                    trace.input,
                    trace.output,
                    usage,
                    granted,
                    used,
                    trace.redacted_prompt,
                    trace.error,
                    trace.status().as_str(),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict { attempts: 1 });
            }

            for (idx, step, data) in &step_rows {
                tx.execute(
                    "INSERT INTO trace_steps
                         (trace_id, idx, step_id, step_type, timestamp, duration_ms,
                          data, prev_step_hash, step_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        trace.trace_id,
                        *idx as i64,
                        step.step_id,
                        step.step_type,
                        step.timestamp,
                        step.duration_ms,
                        data,
                        step.prev_step_hash,
                        step.step_hash,
                    ],
                )?;
            }
            Ok(())
        });

        result.map_err(GovernanceError::from)
    }

    /// Loads a trace by id within the tenant, with its integrity verdict.
    ///
    /// # Errors
    ///
    /// Returns `decision_not_found`-style `schema_invalid` on corrupt rows
    /// and `store_unavailable` on database failures; a missing trace is
    /// `Ok(None)`.
    pub fn get(&self, tenant_id: &str, trace_id: &str) -> Result<Option<(Trace, TraceIntegrity)>> {
        let conn = self.store.conn();
        let header = conn
            .query_row(
                "SELECT workspace_id, adapter_id, started_at, completed_at, model,
                        provider, input, output, usage, granted_scope, used_scope,
                        redacted_prompt, error
                 FROM traces WHERE tenant_id = ?1 AND trace_id = ?2",
                params![tenant_id, trace_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, Option<String>>(12)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let Some((
            workspace_id,
            adapter_id,
            started_at,
            completed_at,
            model,
            provider,
            input,
            output,
            usage,
            granted_scope,
            used_scope,
            redacted_prompt,
            error,
        )) = header
        else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT step_id, step_type, timestamp, duration_ms, data,
                        prev_step_hash, step_hash
                 FROM trace_steps WHERE trace_id = ?1 ORDER BY idx ASC",
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        let rows = stmt
            .query_map(params![trace_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let mut steps = Vec::new();
        for row in rows {
            let (step_id, step_type, timestamp, duration_ms, data, prev_step_hash, step_hash) =
                row.map_err(|e| GovernanceError::from(StoreError::from(e)))?;
            steps.push(TraceStep {
                step_id,
                step_type,
                timestamp,
                duration_ms,
                data: parse_json(&data, "trace_steps.data")?,
                prev_step_hash,
                step_hash,
            });
        }

        let trace = Trace {
            trace_id: trace_id.to_string(),
            tenant_id: tenant_id.to_string(),
            workspace_id,
            adapter_id,
            started_at: parse_ts(&started_at)?,
            completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
            model,
            provider,
            input,
            output,
            usage: parse_typed(&usage, "traces.usage")?,
            granted_scope: granted_scope
                .as_deref()
                .map(|s| parse_typed(s, "traces.granted_scope"))
                .transpose()?,
            used_scope: used_scope
                .as_deref()
                .map(|s| parse_typed(s, "traces.used_scope"))
                .transpose()?,
            redacted_prompt,
            error,
            steps,
        };

        let integrity = verify_steps(&trace.steps);
        if integrity == TraceIntegrity::Compromised {
            tracing::warn!(tenant = %tenant_id, trace = %trace_id, "trace step chain is compromised");
        }
        Ok(Some((trace, integrity)))
    }

    /// Lists trace headers for a tenant, newest first.
    ///
    /// Each row carries the derived status; step payloads are not loaded.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn list(&self, tenant_id: &str, query: &TraceQuery) -> Result<Vec<TraceSummary>> {
        let mut sql = String::from(
            "SELECT trace_id, workspace_id, adapter_id, started_at, completed_at,
                    model, provider, status
             FROM traces WHERE tenant_id = ?1",
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant_id.to_string())];

        if let Some(workspace_id) = &query.workspace_id {
            binds.push(Box::new(workspace_id.clone()));
            sql.push_str(&format!(" AND workspace_id = ?{}", binds.len()));
        }
        if let Some(status) = query.status {
            binds.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", binds.len()));
        }
        if let Some(since) = query.since {
            binds.push(Box::new(time::to_rfc3339(since)));
            sql.push_str(&format!(" AND started_at >= ?{}", binds.len()));
        }
        if let Some(until) = query.until {
            binds.push(Box::new(time::to_rfc3339(until)));
            sql.push_str(&format!(" AND started_at <= ?{}", binds.len()));
        }

        sql.push_str(" ORDER BY started_at DESC");
        binds.push(Box::new(i64::from(query.limit.unwrap_or(50))));
        sql.push_str(&format!(" LIMIT ?{}", binds.len()));
        binds.push(Box::new(i64::from(query.offset.unwrap_or(0))));
        sql.push_str(&format!(" OFFSET ?{}", binds.len()));

        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())),
                |row| {
                    Ok(TraceSummary {
                        trace_id: row.get(0)?,
                        workspace_id: row.get(1)?,
                        adapter_id: row.get(2)?,
                        started_at: row.get(3)?,
                        completed_at: row.get(4)?,
                        model: row.get(5)?,
                        provider: row.get(6)?,
                        status: row.get(7)?,
                    })
                },
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))
    }

    /// Deletes whole traces older than `cutoff`, steps included.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn delete_older_than(&self, tenant_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = time::to_rfc3339(cutoff);
        let deleted = self
            .store
            .with_tx(|tx| {
                tx.execute(
                    "DELETE FROM trace_steps WHERE trace_id IN
                         (SELECT trace_id FROM traces
                          WHERE tenant_id = ?1 AND started_at < ?2)",
                    params![tenant_id, cutoff],
                )?;
                let deleted = tx.execute(
                    "DELETE FROM traces WHERE tenant_id = ?1 AND started_at < ?2",
                    params![tenant_id, cutoff],
                )?;
                Ok(deleted as u64)
            })
            .map_err(GovernanceError::from)?;
        Ok(deleted)
    }
}

/// Listing row without step payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Trace identifier.
    pub trace_id: String,
    /// Workspace the execution ran in.
    pub workspace_id: String,
    /// Reporting adapter, when known.
    pub adapter_id: Option<String>,
    /// Execution start, RFC 3339.
    pub started_at: String,
    /// Execution end, RFC 3339.
    pub completed_at: Option<String>,
    /// Model used.
    pub model: String,
    /// Provider used.
    pub provider: String,
    /// Derived lifecycle status.
    pub status: String,
}

fn to_canonical_string<T: Serialize>(value: &T) -> Result<String> {
    canonical::canonical_string(value).map_err(GovernanceError::from)
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, format!("corrupt {what}: {e}")))
}

fn parse_typed<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, format!("corrupt {what}: {e}")))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    time::parse_rfc3339(raw)
        .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, e.to_string()))
}
