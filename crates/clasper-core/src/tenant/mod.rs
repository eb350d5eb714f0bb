//! Per-tenant settings and budget accounting.
//!
//! Tenant settings overlay the daemon's deployment defaults: enforcement
//! modes, step ceilings, and TTLs can all be tightened or relaxed per
//! tenant. Budgets track committed spend against a ceiling; the decision
//! orchestrator clamps every grant by the remaining budget.

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GovernanceError, Result};
use crate::storage::{Store, StoreError};
use crate::telemetry::EnforcementMode;

/// Per-tenant overrides; `None` falls back to deployment defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Telemetry envelope enforcement mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_mode: Option<EnforcementMode>,

    /// Tool authorization enforcement mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_auth_mode: Option<EnforcementMode>,

    /// Step ceiling stamped into grants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,

    /// Grant lifetime, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_ttl_seconds: Option<i64>,

    /// Pending-approval lifetime, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_ttl_seconds: Option<i64>,
}

/// Settings and budget store.
pub struct TenantStore {
    store: Store,
}

impl std::fmt::Debug for TenantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantStore").finish_non_exhaustive()
    }
}

impl TenantStore {
    /// Creates the store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Loads a tenant's settings; absent rows mean all defaults.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn settings(&self, tenant_id: &str) -> Result<TenantSettings> {
        let row = self
            .store
            .conn()
            .query_row(
                "SELECT telemetry_mode, tool_auth_mode, max_steps, grant_ttl_seconds,
                        approval_ttl_seconds
                 FROM tenant_settings WHERE tenant_id = ?1",
                params![tenant_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<u32>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let Some((telemetry_mode, tool_auth_mode, max_steps, grant_ttl, approval_ttl)) = row else {
            return Ok(TenantSettings::default());
        };

        let parse_mode = |label: Option<String>| -> Result<Option<EnforcementMode>> {
            label
                .map(|m| {
                    EnforcementMode::parse(&m).ok_or_else(|| {
                        GovernanceError::new(
                            ErrorKind::SchemaInvalid,
                            format!("stored enforcement mode '{m}' is unknown"),
                        )
                    })
                })
                .transpose()
        };

        Ok(TenantSettings {
            telemetry_mode: parse_mode(telemetry_mode)?,
            tool_auth_mode: parse_mode(tool_auth_mode)?,
            max_steps,
            grant_ttl_seconds: grant_ttl,
            approval_ttl_seconds: approval_ttl,
        })
    }

    /// Upserts a tenant's settings.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn upsert_settings(&self, tenant_id: &str, settings: &TenantSettings) -> Result<()> {
        let mode_str = |m: Option<EnforcementMode>| {
            m.map(|m| match m {
                EnforcementMode::Off => "off",
                EnforcementMode::Warn => "warn",
                EnforcementMode::Enforce => "enforce",
            })
        };
        self.store
            .conn()
            .execute(
                "INSERT INTO tenant_settings
                     (tenant_id, telemetry_mode, tool_auth_mode, max_steps,
                      grant_ttl_seconds, approval_ttl_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (tenant_id) DO UPDATE SET
                     telemetry_mode = excluded.telemetry_mode,
                     tool_auth_mode = excluded.tool_auth_mode,
                     max_steps = excluded.max_steps,
                     grant_ttl_seconds = excluded.grant_ttl_seconds,
                     approval_ttl_seconds = excluded.approval_ttl_seconds",
                params![
                    tenant_id,
                    mode_str(settings.telemetry_mode),
                    mode_str(settings.tool_auth_mode),
                    settings.max_steps,
                    settings.grant_ttl_seconds,
                    settings.approval_ttl_seconds,
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        Ok(())
    }

    /// Registers a workspace sub-scope.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn upsert_workspace(
        &self,
        tenant_id: &str,
        workspace_id: &str,
        display_name: &str,
    ) -> Result<()> {
        self.store
            .conn()
            .execute(
                "INSERT INTO workspaces (tenant_id, workspace_id, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (tenant_id, workspace_id) DO UPDATE SET
                     display_name = excluded.display_name",
                params![
                    tenant_id,
                    workspace_id,
                    display_name,
                    crate::time::to_rfc3339(crate::time::now())
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        Ok(())
    }

    /// Lists a tenant's workspaces as `(workspace_id, display_name)` pairs.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn list_workspaces(&self, tenant_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(
                "SELECT workspace_id, display_name FROM workspaces
                 WHERE tenant_id = ?1 ORDER BY workspace_id ASC",
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        let rows = stmt
            .query_map(params![tenant_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))
    }

    /// Sets a budget ceiling for `(tenant, workspace)`.
    ///
    /// The empty workspace id holds the tenant-wide budget.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn set_budget(&self, tenant_id: &str, workspace_id: &str, budget_micros: i64) -> Result<()> {
        self.store
            .conn()
            .execute(
                "INSERT INTO tenant_budgets (tenant_id, workspace_id, budget_micros, spent_micros)
                 VALUES (?1, ?2, ?3, 0)
                 ON CONFLICT (tenant_id, workspace_id) DO UPDATE SET
                     budget_micros = excluded.budget_micros",
                params![tenant_id, workspace_id, budget_micros],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        Ok(())
    }

    /// Remaining budget; `None` means no budget row, i.e. unlimited.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn remaining_budget_micros(
        &self,
        tenant_id: &str,
        workspace_id: &str,
    ) -> Result<Option<i64>> {
        self.store
            .conn()
            .query_row(
                "SELECT budget_micros - spent_micros FROM tenant_budgets
                 WHERE tenant_id = ?1 AND workspace_id = ?2",
                params![tenant_id, workspace_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))
    }

    /// Commits spend against a budget, refusing to overdraw.
    ///
    /// The subtraction is a single conditional update so concurrent
    /// spenders cannot jointly exceed the ceiling.
    ///
    /// # Errors
    ///
    /// Returns `budget_exceeded` when the remaining budget cannot cover
    /// `amount_micros`; no row means unlimited and records nothing.
    pub fn record_spend(
        &self,
        tenant_id: &str,
        workspace_id: &str,
        amount_micros: i64,
    ) -> Result<()> {
        let exists: Option<i64> = self
            .store
            .conn()
            .query_row(
                "SELECT 1 FROM tenant_budgets WHERE tenant_id = ?1 AND workspace_id = ?2",
                params![tenant_id, workspace_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        if exists.is_none() {
            return Ok(());
        }

        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE tenant_budgets SET spent_micros = spent_micros + ?3
                 WHERE tenant_id = ?1 AND workspace_id = ?2
                   AND spent_micros + ?3 <= budget_micros",
                params![tenant_id, workspace_id, amount_micros],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        if changed == 0 {
            return Err(GovernanceError::new(
                ErrorKind::BudgetExceeded,
                "remaining budget cannot cover this spend",
            ));
        }
        Ok(())
    }
}
