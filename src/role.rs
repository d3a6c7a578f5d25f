use crate::error::{Error, Result, StoreError};
use crate::permission::Permission;
use crate::types::{ActorId, RoleName, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Where a role is defined: inside one tenant, or platform-wide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleDomain {
    /// Platform roles apply to the actor in every tenant.
    Platform,
    /// Tenant roles apply only inside their tenant.
    Tenant(TenantId),
}

impl RoleDomain {
    /// Returns true when roles of this domain count for a request in `tenant`.
    pub fn applies_to(&self, tenant: Option<&TenantId>) -> bool {
        match self {
            RoleDomain::Platform => true,
            RoleDomain::Tenant(own) => tenant == Some(own),
        }
    }
}

impl fmt::Display for RoleDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleDomain::Platform => f.write_str("platform"),
            RoleDomain::Tenant(tenant) => write!(f, "tenant {tenant}"),
        }
    }
}

/// Grant of a role to an actor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub actor_id: ActorId,
    pub role: RoleName,
    pub domain: RoleDomain,
    pub granted_by: ActorId,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RoleAssignment {
    /// Creates a non-expiring assignment.
    pub fn new(actor_id: ActorId, role: RoleName, domain: RoleDomain, granted_by: ActorId) -> Self {
        Self {
            actor_id,
            role,
            domain,
            granted_by,
            expires_at: None,
        }
    }

    /// Sets the instant after which the assignment no longer counts.
    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// Role together with the domain that defines it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleRef {
    pub domain: RoleDomain,
    pub name: RoleName,
}

/// Flattened grants of one actor within one tenant.
///
/// Read-only once built: a change to any underlying assignment or role
/// replaces the bundle through invalidation, never by editing it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionBundle {
    pub actor_id: ActorId,
    pub tenant_id: Option<TenantId>,
    /// Active roles, including inherited ones, sorted.
    pub roles: Vec<RoleRef>,
    /// Union of role permissions, deduplicated and sorted.
    pub permissions: Vec<Permission>,
}

impl PermissionBundle {
    /// Names of every role in the bundle.
    pub fn role_names(&self) -> impl Iterator<Item = &RoleName> {
        self.roles.iter().map(|role| &role.name)
    }
}

/// Source-of-truth access to role assignments and role grants.
#[async_trait]
pub trait RoleSource: Send + Sync {
    /// Returns the actor's assignments in `tenant` plus platform assignments.
    ///
    /// Expired assignments may be included; the aggregator filters them.
    async fn role_assignments(
        &self,
        actor: ActorId,
        tenant: Option<TenantId>,
    ) -> std::result::Result<Vec<RoleAssignment>, StoreError>;

    /// Returns permissions granted by a role.
    async fn role_permissions(
        &self,
        domain: RoleDomain,
        role: RoleName,
    ) -> std::result::Result<Vec<Permission>, StoreError>;

    /// Returns direct parent roles for inheritance traversal.
    async fn role_inherits(
        &self,
        _domain: RoleDomain,
        _role: RoleName,
    ) -> std::result::Result<Vec<RoleName>, StoreError> {
        Ok(Vec::new())
    }
}

/// Loads an actor's roles and flattens them into a [`PermissionBundle`].
///
/// The aggregator never caches; see [`crate::PermissionCache`].
#[derive(Debug)]
pub struct RoleAggregator<S> {
    source: S,
    enable_role_hierarchy: bool,
    max_inherit_depth: usize,
}

impl<S> RoleAggregator<S> {
    /// Creates an aggregator with role inheritance disabled.
    pub fn new(source: S) -> Self {
        Self {
            source,
            enable_role_hierarchy: false,
            max_inherit_depth: 16,
        }
    }

    /// Enables or disables role inheritance.
    pub fn enable_role_hierarchy(mut self, on: bool) -> Self {
        self.enable_role_hierarchy = on;
        self
    }

    /// Sets maximum inheritance depth.
    pub fn max_inherit_depth(mut self, depth: usize) -> Self {
        self.max_inherit_depth = depth;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S> RoleAggregator<S>
where
    S: RoleSource,
{
    /// Aggregates every active assignment of `actor` into a bundle.
    pub async fn load_permission_bundle(
        &self,
        actor: &ActorId,
        tenant: Option<&TenantId>,
    ) -> Result<PermissionBundle> {
        let now = Utc::now();
        let assignments = self
            .source
            .role_assignments(actor.clone(), tenant.cloned())
            .await
            .map_err(Error::from)?;

        let mut direct: BTreeMap<RoleDomain, Vec<RoleName>> = BTreeMap::new();
        for assignment in assignments {
            if &assignment.actor_id != actor
                || !assignment.is_active_at(now)
                || !assignment.domain.applies_to(tenant)
            {
                continue;
            }
            direct
                .entry(assignment.domain)
                .or_default()
                .push(assignment.role);
        }

        let mut roles = BTreeSet::new();
        let mut permissions = BTreeSet::new();
        for (domain, names) in direct {
            let names = if self.enable_role_hierarchy {
                self.expand_roles(&domain, names).await?
            } else {
                names
            };
            for name in names {
                let role = RoleRef {
                    domain: domain.clone(),
                    name,
                };
                if !roles.insert(role.clone()) {
                    continue;
                }
                let granted = self
                    .source
                    .role_permissions(role.domain, role.name)
                    .await
                    .map_err(Error::from)?;
                permissions.extend(granted);
            }
        }

        Ok(PermissionBundle {
            actor_id: actor.clone(),
            tenant_id: tenant.cloned(),
            roles: roles.into_iter().collect(),
            permissions: permissions.into_iter().collect(),
        })
    }

    async fn expand_roles(&self, domain: &RoleDomain, roles: Vec<RoleName>) -> Result<Vec<RoleName>> {
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();
        let mut output = Vec::new();

        for role in roles {
            if visited.contains(&role) {
                continue;
            }
            self.expand_from_role(domain, role, &mut visited, &mut visiting, &mut output)
                .await?;
        }

        Ok(output)
    }

    async fn expand_from_role(
        &self,
        domain: &RoleDomain,
        role: RoleName,
        visited: &mut HashSet<RoleName>,
        visiting: &mut HashSet<RoleName>,
        output: &mut Vec<RoleName>,
    ) -> Result<()> {
        let parents = self
            .source
            .role_inherits(domain.clone(), role.clone())
            .await
            .map_err(Error::from)?;
        visiting.insert(role.clone());
        output.push(role.clone());

        let mut stack: Vec<(RoleName, usize, std::vec::IntoIter<RoleName>)> =
            vec![(role, 0, parents.into_iter())];

        while let Some((current, depth, mut iter)) = stack.pop() {
            if let Some(parent) = iter.next() {
                stack.push((current.clone(), depth, iter));

                let next_depth = depth + 1;
                if next_depth > self.max_inherit_depth {
                    return Err(Error::RoleDepthExceeded {
                        domain: domain.clone(),
                        role: parent,
                        max_depth: self.max_inherit_depth,
                    });
                }
                if visiting.contains(&parent) {
                    return Err(Error::RoleCycleDetected {
                        domain: domain.clone(),
                        role: parent,
                    });
                }
                if visited.contains(&parent) {
                    continue;
                }

                let parents = self
                    .source
                    .role_inherits(domain.clone(), parent.clone())
                    .await
                    .map_err(Error::from)?;
                visiting.insert(parent.clone());
                output.push(parent.clone());
                stack.push((parent, next_depth, parents.into_iter()));
                continue;
            }

            visiting.remove(&current);
            visited.insert(current);
        }

        Ok(())
    }
}
