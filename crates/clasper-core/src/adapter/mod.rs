//! Adapter registry and telemetry key management.
//!
//! Adapters are the untrusted runtimes that actually execute agent work.
//! Each tenant enrolls the adapters it trusts, declaring a risk class, a
//! capability set, and (optionally) a telemetry public key used to verify
//! signed envelopes. The registry is the authority consulted by the decision
//! orchestrator (is this adapter enabled? does it declare these
//! capabilities?) and by telemetry ingest (which key verifies this
//! envelope?).
//!
//! Reads are served from an immutable per-tenant snapshot behind an atomic
//! swap; any write rebuilds the tenant's snapshot from the store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::error::{ErrorKind, GovernanceError, Result};
use crate::identity::jwks::Jwk;
use crate::storage::{Store, StoreError};
use crate::time;

/// Blast-radius class assigned to an adapter at enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    /// Read-only or fully sandboxed runtimes.
    Low,
    /// Runtimes with bounded side effects.
    Medium,
    /// Runtimes with shell or filesystem reach.
    High,
    /// Runtimes that can touch credentials or production systems.
    Critical,
}

impl RiskClass {
    /// The wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parses the wire identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Signature algorithm of a telemetry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Pure Ed25519.
    #[serde(rename = "ed25519")]
    Ed25519,
    /// ECDSA P-256 with SHA-256, fixed-width signatures.
    #[serde(rename = "ES256")]
    Es256,
}

impl KeyAlgorithm {
    /// The wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::Es256 => "ES256",
        }
    }

    /// Parses the wire identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ed25519" => Some(Self::Ed25519),
            "ES256" => Some(Self::Es256),
            _ => None,
        }
    }
}

/// A telemetry verification key enrolled for an adapter version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryKey {
    /// Stable key identifier.
    pub key_id: String,
    /// Signature algorithm.
    pub algorithm: KeyAlgorithm,
    /// Public key material.
    pub public_jwk: Jwk,
    /// Enrollment time.
    pub created_at: DateTime<Utc>,
    /// Revocation time; `None` while active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// One enrolled adapter version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterRegistration {
    /// Owning tenant.
    pub tenant_id: String,
    /// Adapter identifier.
    pub adapter_id: String,
    /// Adapter version string.
    pub version: String,
    /// Human-readable name.
    pub display_name: String,
    /// Blast-radius class.
    pub risk_class: RiskClass,
    /// Capabilities the adapter declares it can exercise.
    pub capabilities: Vec<String>,
    /// Whether the registration is currently enabled.
    pub enabled: bool,
}

impl AdapterRegistration {
    /// True if every entry of `requested` is declared by this adapter.
    #[must_use]
    pub fn declares_all(&self, requested: &[String]) -> bool {
        requested.iter().all(|cap| self.capabilities.contains(cap))
    }
}

/// Immutable per-tenant snapshot served to readers.
#[derive(Debug, Default)]
struct TenantSnapshot {
    /// Registrations keyed by `(adapter_id, version)`.
    registrations: Vec<AdapterRegistration>,
}

/// Tenant-scoped adapter registry backed by the store.
pub struct AdapterRegistry {
    store: Store,
    cache: RwLock<HashMap<String, Arc<TenantSnapshot>>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").finish_non_exhaustive()
    }
}

impl AdapterRegistry {
    /// Creates a registry over the shared store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or updates a registration.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn upsert(&self, registration: &AdapterRegistration) -> Result<()> {
        let capabilities = canonical::canonical_string(&registration.capabilities)
            .map_err(GovernanceError::from)?;
        let now = time::to_rfc3339(time::now());
        self.store
            .conn()
            .execute(
                "INSERT INTO adapter_registry
                     (tenant_id, adapter_id, version, display_name, risk_class,
                      capabilities, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT (tenant_id, adapter_id, version) DO UPDATE SET
                     display_name = excluded.display_name,
                     risk_class = excluded.risk_class,
                     capabilities = excluded.capabilities,
                     enabled = excluded.enabled,
                     updated_at = excluded.updated_at",
                params![
                    registration.tenant_id,
                    registration.adapter_id,
                    registration.version,
                    registration.display_name,
                    registration.risk_class.as_str(),
                    capabilities,
                    registration.enabled,
                    now,
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        self.invalidate(&registration.tenant_id);
        Ok(())
    }

    /// Returns the registration for a pinned version, or the most recently
    /// enrolled version when `version` is `None`.
    ///
    /// # Errors
    ///
    /// Returns `adapter_unknown` when nothing matches.
    pub fn get(
        &self,
        tenant_id: &str,
        adapter_id: &str,
        version: Option<&str>,
    ) -> Result<AdapterRegistration> {
        let snapshot = self.snapshot(tenant_id)?;
        let found = match version {
            Some(v) => snapshot
                .registrations
                .iter()
                .find(|r| r.adapter_id == adapter_id && r.version == v),
            None => snapshot
                .registrations
                .iter()
                .filter(|r| r.adapter_id == adapter_id)
                .next_back(),
        };
        found.cloned().ok_or_else(|| {
            GovernanceError::new(
                ErrorKind::AdapterUnknown,
                format!("adapter '{adapter_id}' is not registered for tenant '{tenant_id}'"),
            )
        })
    }

    /// Lists every registration for the tenant.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn list(&self, tenant_id: &str) -> Result<Vec<AdapterRegistration>> {
        Ok(self.snapshot(tenant_id)?.registrations.clone())
    }

    /// Disables a registration without deleting it.
    ///
    /// # Errors
    ///
    /// Returns `adapter_unknown` when nothing matches.
    pub fn disable(&self, tenant_id: &str, adapter_id: &str, version: &str) -> Result<()> {
        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE adapter_registry SET enabled = 0, updated_at = ?4
                 WHERE tenant_id = ?1 AND adapter_id = ?2 AND version = ?3",
                params![tenant_id, adapter_id, version, time::to_rfc3339(time::now())],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        if changed == 0 {
            return Err(GovernanceError::new(
                ErrorKind::AdapterUnknown,
                format!("adapter '{adapter_id}' version '{version}' not registered"),
            ));
        }
        self.invalidate(tenant_id);
        Ok(())
    }

    /// Enrolls a telemetry key for `(tenant, adapter, version)`.
    ///
    /// Setting a key does not revoke a prior key, but the store enforces at
    /// most one active key per `(tenant, adapter, version)`: enrolling a
    /// second active key fails with `store_conflict` until the first is
    /// revoked.
    ///
    /// # Errors
    ///
    /// Returns `adapter_unknown` for an unregistered adapter and
    /// `store_conflict` when an active key already exists.
    pub fn set_telemetry_key(
        &self,
        tenant_id: &str,
        adapter_id: &str,
        version: &str,
        key: &TelemetryKey,
    ) -> Result<()> {
        // The registration must exist before a key can be bound to it.
        self.get(tenant_id, adapter_id, Some(version))?;

        let jwk = canonical::canonical_string(&key.public_jwk).map_err(GovernanceError::from)?;
        let result = self.store.conn().execute(
            "INSERT INTO adapter_keys
                 (tenant_id, adapter_id, version, key_id, algorithm, public_jwk, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tenant_id,
                adapter_id,
                version,
                key.key_id,
                key.algorithm.as_str(),
                jwk,
                time::to_rfc3339(key.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(GovernanceError::new(
                    ErrorKind::StoreConflict,
                    "an active telemetry key already exists for this adapter version",
                ))
            },
            Err(e) => Err(GovernanceError::from(StoreError::from(e))),
        }
    }

    /// Marks a key revoked; the active-key lookup skips it thereafter.
    ///
    /// # Errors
    ///
    /// Returns `missing_key` when no such active key exists.
    pub fn revoke_telemetry_key(
        &self,
        tenant_id: &str,
        adapter_id: &str,
        version: &str,
        key_id: &str,
    ) -> Result<()> {
        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE adapter_keys SET revoked_at = ?5
                 WHERE tenant_id = ?1 AND adapter_id = ?2 AND version = ?3
                   AND key_id = ?4 AND revoked_at IS NULL",
                params![
                    tenant_id,
                    adapter_id,
                    version,
                    key_id,
                    time::to_rfc3339(time::now())
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;
        if changed == 0 {
            return Err(GovernanceError::new(
                ErrorKind::MissingKey,
                format!("no active key '{key_id}' for adapter '{adapter_id}'"),
            ));
        }
        tracing::info!(
            tenant = %tenant_id,
            adapter = %adapter_id,
            key = %key_id,
            "telemetry key revoked"
        );
        Ok(())
    }

    /// Looks up the active telemetry key for an adapter.
    ///
    /// With `version = None` the most recently created active key across
    /// versions is returned.
    ///
    /// # Errors
    ///
    /// Returns `missing_key` when no active key exists.
    pub fn active_telemetry_key(
        &self,
        tenant_id: &str,
        adapter_id: &str,
        version: Option<&str>,
    ) -> Result<TelemetryKey> {
        let conn = self.store.conn();
        let row = match version {
            Some(v) => conn
                .query_row(
                    "SELECT key_id, algorithm, public_jwk, created_at
                     FROM adapter_keys
                     WHERE tenant_id = ?1 AND adapter_id = ?2 AND version = ?3
                       AND revoked_at IS NULL",
                    params![tenant_id, adapter_id, v],
                    decode_key_row,
                )
                .optional(),
            None => conn
                .query_row(
                    "SELECT key_id, algorithm, public_jwk, created_at
                     FROM adapter_keys
                     WHERE tenant_id = ?1 AND adapter_id = ?2 AND revoked_at IS NULL
                     ORDER BY created_at DESC LIMIT 1",
                    params![tenant_id, adapter_id],
                    decode_key_row,
                )
                .optional(),
        }
        .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let (key_id, algorithm, jwk_json, created_at) = row.ok_or_else(|| {
            GovernanceError::new(
                ErrorKind::MissingKey,
                format!("no active telemetry key for adapter '{adapter_id}'"),
            )
        })?;

        let algorithm = KeyAlgorithm::parse(&algorithm).ok_or_else(|| {
            GovernanceError::new(
                ErrorKind::UnsupportedAlgorithm,
                format!("stored key declares unknown algorithm '{algorithm}'"),
            )
        })?;
        let public_jwk: Jwk = serde_json::from_str(&jwk_json)
            .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, format!("stored JWK: {e}")))?;
        let created_at = time::parse_rfc3339(&created_at)
            .map_err(|e| GovernanceError::new(ErrorKind::SchemaInvalid, e.to_string()))?;

        Ok(TelemetryKey {
            key_id,
            algorithm,
            public_jwk,
            created_at,
            revoked_at: None,
        })
    }

    /// Loads (and caches) the tenant snapshot.
    fn snapshot(&self, tenant_id: &str) -> Result<Arc<TenantSnapshot>> {
        if let Some(snapshot) = self
            .cache
            .read()
            .expect("adapter cache lock poisoned")
            .get(tenant_id)
        {
            return Ok(Arc::clone(snapshot));
        }

        let registrations = self.load_tenant(tenant_id)?;
        let snapshot = Arc::new(TenantSnapshot { registrations });
        self.cache
            .write()
            .expect("adapter cache lock poisoned")
            .insert(tenant_id.to_string(), Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn load_tenant(&self, tenant_id: &str) -> Result<Vec<AdapterRegistration>> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(
                "SELECT adapter_id, version, display_name, risk_class, capabilities, enabled
                 FROM adapter_registry WHERE tenant_id = ?1
                 ORDER BY created_at ASC, adapter_id ASC, version ASC",
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let rows = stmt
            .query_map(params![tenant_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let mut registrations = Vec::new();
        for row in rows {
            let (adapter_id, version, display_name, risk_class, capabilities, enabled) =
                row.map_err(|e| GovernanceError::from(StoreError::from(e)))?;
            let risk_class = RiskClass::parse(&risk_class).ok_or_else(|| {
                GovernanceError::new(
                    ErrorKind::SchemaInvalid,
                    format!("stored risk class '{risk_class}' is unknown"),
                )
            })?;
            let capabilities: Vec<String> = serde_json::from_str(&capabilities).map_err(|e| {
                GovernanceError::new(ErrorKind::SchemaInvalid, format!("stored capabilities: {e}"))
            })?;
            registrations.push(AdapterRegistration {
                tenant_id: tenant_id.to_string(),
                adapter_id,
                version,
                display_name,
                risk_class,
                capabilities,
                enabled,
            });
        }
        Ok(registrations)
    }

    fn invalidate(&self, tenant_id: &str) {
        self.cache
            .write()
            .expect("adapter cache lock poisoned")
            .remove(tenant_id);
    }
}

#[allow(clippy::type_complexity)]
fn decode_key_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
    ))
}
