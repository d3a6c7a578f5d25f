use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::permission::Permission;
use crate::role::{RoleAssignment, RoleDomain, RoleSource};
use crate::types::{ActorId, RoleName, TenantId};

/// In-memory role source for tests and demos.
#[derive(Debug, Default, Clone)]
pub struct MemoryRoleSource {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    assignments: RwLock<HashMap<ActorId, Vec<RoleAssignment>>>,
    role_permissions: RwLock<HashMap<(RoleDomain, RoleName), HashSet<Permission>>>,
    role_inherits: RwLock<HashMap<(RoleDomain, RoleName), HashSet<RoleName>>>,
}

impl MemoryRoleSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a role to an actor, replacing an existing assignment of the same role.
    pub fn assign(&self, assignment: RoleAssignment) {
        let mut guard = self.inner.assignments.write().expect("poisoned lock");
        let entries = guard.entry(assignment.actor_id.clone()).or_default();
        entries.retain(|existing| {
            existing.role != assignment.role || existing.domain != assignment.domain
        });
        entries.push(assignment);
    }

    /// Assigns a tenant role without expiry.
    pub fn assign_tenant_role(&self, tenant: TenantId, actor: ActorId, role: RoleName) {
        let granted_by = actor.clone();
        self.assign(RoleAssignment::new(
            actor,
            role,
            RoleDomain::Tenant(tenant),
            granted_by,
        ));
    }

    /// Assigns a platform role without expiry.
    pub fn assign_platform_role(&self, actor: ActorId, role: RoleName) {
        let granted_by = actor.clone();
        self.assign(RoleAssignment::new(
            actor,
            role,
            RoleDomain::Platform,
            granted_by,
        ));
    }

    /// Removes an assignment. Returns true when one existed.
    pub fn revoke(&self, actor: &ActorId, domain: &RoleDomain, role: &RoleName) -> bool {
        let mut guard = self.inner.assignments.write().expect("poisoned lock");
        let Some(entries) = guard.get_mut(actor) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|existing| &existing.role != role || &existing.domain != domain);
        before != entries.len()
    }

    /// Sets the expiry of an existing assignment.
    pub fn set_expiry(
        &self,
        actor: &ActorId,
        domain: &RoleDomain,
        role: &RoleName,
        expires_at: DateTime<Utc>,
    ) {
        let mut guard = self.inner.assignments.write().expect("poisoned lock");
        if let Some(entries) = guard.get_mut(actor) {
            for entry in entries
                .iter_mut()
                .filter(|entry| &entry.role == role && &entry.domain == domain)
            {
                entry.expires_at = Some(expires_at);
            }
        }
    }

    /// Adds a permission to a role.
    pub fn add_role_permission(&self, domain: RoleDomain, role: RoleName, permission: Permission) {
        let mut guard = self.inner.role_permissions.write().expect("poisoned lock");
        guard.entry((domain, role)).or_default().insert(permission);
    }

    /// Removes a permission from a role.
    pub fn remove_role_permission(
        &self,
        domain: RoleDomain,
        role: RoleName,
        permission: &Permission,
    ) {
        let mut guard = self.inner.role_permissions.write().expect("poisoned lock");
        if let Some(perms) = guard.get_mut(&(domain, role)) {
            perms.remove(permission);
        }
    }

    /// Adds an inheritance edge for a role.
    pub fn add_role_inherit(&self, domain: RoleDomain, role: RoleName, parent: RoleName) {
        let mut guard = self.inner.role_inherits.write().expect("poisoned lock");
        guard.entry((domain, role)).or_default().insert(parent);
    }
}

#[async_trait]
impl RoleSource for MemoryRoleSource {
    async fn role_assignments(
        &self,
        actor: ActorId,
        tenant: Option<TenantId>,
    ) -> std::result::Result<Vec<RoleAssignment>, crate::StoreError> {
        let guard = self.inner.assignments.read().expect("poisoned lock");
        Ok(guard
            .get(&actor)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.domain.applies_to(tenant.as_ref()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn role_permissions(
        &self,
        domain: RoleDomain,
        role: RoleName,
    ) -> std::result::Result<Vec<Permission>, crate::StoreError> {
        let guard = self.inner.role_permissions.read().expect("poisoned lock");
        Ok(guard
            .get(&(domain, role))
            .map(|perms| perms.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn role_inherits(
        &self,
        domain: RoleDomain,
        role: RoleName,
    ) -> std::result::Result<Vec<RoleName>, crate::StoreError> {
        let guard = self.inner.role_inherits.read().expect("poisoned lock");
        Ok(guard
            .get(&(domain, role))
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default())
    }
}
