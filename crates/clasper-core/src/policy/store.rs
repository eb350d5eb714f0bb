//! Policy persistence and the versioned in-memory cache.
//!
//! Rules live in the `policies` table; evaluation reads an immutable
//! [`PolicySet`] snapshot cached per tenant behind a version counter. An
//! upsert bumps the version and replaces the snapshot wholesale, so readers
//! holding an older `Arc` finish their evaluation against a consistent rule
//! set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rusqlite::params;

use crate::canonical;
use crate::error::{ErrorKind, GovernanceError, Result};
use crate::storage::{Store, StoreError};
use crate::time;

use super::engine::{PolicyEngine, PolicyEvaluation};
use super::schema::{
    Policy, PolicyConditions, PolicyContext, PolicyEffect, PolicyScope, PolicySubject, SubjectType,
};

/// An immutable snapshot of one tenant's rules.
#[derive(Debug, Clone)]
pub struct PolicySet {
    /// Cache version the snapshot was built at.
    pub version: u64,
    /// Enabled and disabled rules, in creation order.
    pub policies: Vec<Policy>,
}

/// Tenant-scoped policy store with snapshot cache.
pub struct PolicyStore {
    store: Store,
    version: AtomicU64,
    cache: RwLock<HashMap<String, Arc<PolicySet>>>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PolicyStore {
    /// Creates a policy store over the shared store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            version: AtomicU64::new(1),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or replaces a rule.
    ///
    /// # Errors
    ///
    /// Returns `schema_invalid` for rules that cannot serialize
    /// canonically, otherwise storage errors mapped into the taxonomy.
    pub fn upsert(&self, policy: &Policy) -> Result<()> {
        if policy.effect == PolicyEffect::RequireApproval && policy.required_role.is_none() {
            return Err(GovernanceError::new(
                ErrorKind::SchemaInvalid,
                "require_approval rules must name a required_role",
            ));
        }
        let conditions =
            canonical::canonical_string(&policy.conditions).map_err(GovernanceError::from)?;
        let now = time::to_rfc3339(time::now());
        self.store
            .conn()
            .execute(
                "INSERT INTO policies
                     (tenant_id, policy_id, workspace_id, environment, subject_type,
                      subject_name, conditions, effect, required_role, enabled,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 ON CONFLICT (tenant_id, policy_id) DO UPDATE SET
                     workspace_id = excluded.workspace_id,
                     environment = excluded.environment,
                     subject_type = excluded.subject_type,
                     subject_name = excluded.subject_name,
                     conditions = excluded.conditions,
                     effect = excluded.effect,
                     required_role = excluded.required_role,
                     enabled = excluded.enabled,
                     updated_at = excluded.updated_at",
                params![
                    policy.scope.tenant_id,
                    policy.policy_id,
                    policy.scope.workspace_id,
                    policy.scope.environment,
                    subject_type_str(policy.subject.subject_type),
                    policy.subject.name,
                    conditions,
                    policy.effect.as_str(),
                    policy.required_role,
                    policy.enabled,
                    now,
                ],
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        self.version.fetch_add(1, Ordering::SeqCst);
        self.cache
            .write()
            .expect("policy cache lock poisoned")
            .remove(&policy.scope.tenant_id);
        Ok(())
    }

    /// Lists every rule for a tenant, newest snapshot.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn list(&self, tenant_id: &str) -> Result<Vec<Policy>> {
        Ok(self.snapshot(tenant_id)?.policies.clone())
    }

    /// The cached snapshot for a tenant, loading it on first touch.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn snapshot(&self, tenant_id: &str) -> Result<Arc<PolicySet>> {
        if let Some(set) = self
            .cache
            .read()
            .expect("policy cache lock poisoned")
            .get(tenant_id)
        {
            return Ok(Arc::clone(set));
        }

        let policies = self.load_tenant(tenant_id)?;
        let set = Arc::new(PolicySet {
            version: self.version.load(Ordering::SeqCst),
            policies,
        });
        self.cache
            .write()
            .expect("policy cache lock poisoned")
            .insert(tenant_id.to_string(), Arc::clone(&set));
        Ok(set)
    }

    /// Evaluates a context against the tenant's enabled rules.
    ///
    /// This is the side-effect-free path shared by live decisions and the
    /// debug/dry-run surface.
    ///
    /// # Errors
    ///
    /// Returns storage errors mapped into the taxonomy.
    pub fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyEvaluation> {
        let snapshot = self.snapshot(&ctx.tenant_id)?;
        Ok(PolicyEngine::evaluate(&snapshot.policies, ctx))
    }

    fn load_tenant(&self, tenant_id: &str) -> Result<Vec<Policy>> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(
                "SELECT policy_id, workspace_id, environment, subject_type, subject_name,
                        conditions, effect, required_role, enabled
                 FROM policies WHERE tenant_id = ?1
                 ORDER BY created_at ASC, policy_id ASC",
            )
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let rows = stmt
            .query_map(params![tenant_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, bool>(8)?,
                ))
            })
            .map_err(|e| GovernanceError::from(StoreError::from(e)))?;

        let mut policies = Vec::new();
        for row in rows {
            let (
                policy_id,
                workspace_id,
                environment,
                subject_type,
                subject_name,
                conditions,
                effect,
                required_role,
                enabled,
            ) = row.map_err(|e| GovernanceError::from(StoreError::from(e)))?;

            let subject_type = parse_subject_type(&subject_type).ok_or_else(|| {
                GovernanceError::new(
                    ErrorKind::SchemaInvalid,
                    format!("stored subject type '{subject_type}' is unknown"),
                )
            })?;
            let effect = PolicyEffect::parse(&effect).ok_or_else(|| {
                GovernanceError::new(
                    ErrorKind::SchemaInvalid,
                    format!("stored effect '{effect}' is unknown"),
                )
            })?;
            let conditions: PolicyConditions = serde_json::from_str(&conditions).map_err(|e| {
                GovernanceError::new(ErrorKind::SchemaInvalid, format!("stored conditions: {e}"))
            })?;

            policies.push(Policy {
                policy_id,
                scope: PolicyScope {
                    tenant_id: tenant_id.to_string(),
                    workspace_id,
                    environment,
                },
                subject: PolicySubject {
                    subject_type,
                    name: subject_name,
                },
                conditions,
                effect,
                required_role,
                enabled,
            });
        }
        Ok(policies)
    }
}

const fn subject_type_str(subject_type: SubjectType) -> &'static str {
    match subject_type {
        SubjectType::Tool => "tool",
        SubjectType::Adapter => "adapter",
        SubjectType::Skill => "skill",
    }
}

fn parse_subject_type(s: &str) -> Option<SubjectType> {
    match s {
        "tool" => Some(SubjectType::Tool),
        "adapter" => Some(SubjectType::Adapter),
        "skill" => Some(SubjectType::Skill),
        _ => None,
    }
}
