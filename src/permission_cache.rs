use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::{CacheMiddleware, CacheOptions};
use crate::error::Result;
use crate::kv::{KeyValueStore, key};
use crate::role::{PermissionBundle, RoleAggregator, RoleDomain, RoleSource};
use crate::types::{ActorId, RoleName, TenantId};

// Contains `$`, which ids never do, so it cannot collide with a tenant id.
const PLATFORM_SEGMENT: &str = "$platform";
const PLATFORM_ROLES_TAG: &str = "roles:platform";

/// Permission cache configuration.
#[derive(Debug, Clone)]
pub struct PermissionCacheConfig {
    /// Lifetime of a cached bundle. Explicit invalidation is the consistency
    /// mechanism; the TTL only bounds how long a missed invalidation lingers.
    pub ttl: Duration,
}

impl Default for PermissionCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Memoizes [`RoleAggregator`] output per actor and tenant.
///
/// Bundles are never patched: every role or assignment change must call one
/// of the `invalidate_*` methods, after which the next read reloads.
pub struct PermissionCache<K, S> {
    cache: CacheMiddleware<K>,
    aggregator: Arc<RoleAggregator<S>>,
    config: PermissionCacheConfig,
}

impl<K, S> Clone for PermissionCache<K, S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            aggregator: Arc::clone(&self.aggregator),
            config: self.config.clone(),
        }
    }
}

impl<K, S> PermissionCache<K, S>
where
    K: KeyValueStore + 'static,
    S: RoleSource + 'static,
{
    pub fn new(
        cache: CacheMiddleware<K>,
        aggregator: Arc<RoleAggregator<S>>,
        config: PermissionCacheConfig,
    ) -> Self {
        Self {
            cache,
            aggregator,
            config,
        }
    }

    /// Returns the actor's bundle, aggregating it on a miss.
    pub async fn get_bundle(
        &self,
        actor: &ActorId,
        tenant: Option<&TenantId>,
    ) -> Result<PermissionBundle> {
        let options = CacheOptions::new()
            .ttl(self.config.ttl)
            .tag(actor_tag(actor))
            .tag(tenant_tag(tenant))
            .tag(PLATFORM_ROLES_TAG);

        let aggregator = Arc::clone(&self.aggregator);
        let load_actor = actor.clone();
        let load_tenant = tenant.cloned();
        self.cache
            .get_or_load(&bundle_key(actor, tenant), options, move || async move {
                aggregator
                    .load_permission_bundle(&load_actor, load_tenant.as_ref())
                    .await
            })
            .await
    }

    /// Drops every cached bundle of `actor`, in all tenants.
    pub async fn invalidate_actor(&self, actor: &ActorId) -> Result<usize> {
        let removed = self.cache.invalidate_by_tag(&actor_tag(actor)).await?;
        debug!(actor = %actor, removed, "invalidated actor permissions");
        Ok(removed)
    }

    /// Drops every cached bundle computed inside `tenant`.
    pub async fn invalidate_tenant_roles(&self, tenant: &TenantId) -> Result<usize> {
        let removed = self.cache.invalidate_by_tag(&tenant_tag(Some(tenant))).await?;
        debug!(tenant = %tenant, removed, "invalidated tenant role permissions");
        Ok(removed)
    }

    /// Drops every bundle that may contain `role`.
    ///
    /// Role membership is not indexed, so a tenant role clears its tenant and
    /// a platform role clears every bundle.
    pub async fn invalidate_role(&self, domain: &RoleDomain, role: &RoleName) -> Result<usize> {
        let removed = match domain {
            RoleDomain::Tenant(tenant) => self.invalidate_tenant_roles(tenant).await?,
            RoleDomain::Platform => self.cache.invalidate_by_tag(PLATFORM_ROLES_TAG).await?,
        };
        debug!(domain = %domain, role = %role, removed, "invalidated role permissions");
        Ok(removed)
    }
}

fn tenant_segment(tenant: Option<&TenantId>) -> &str {
    tenant.map_or(PLATFORM_SEGMENT, TenantId::as_str)
}

fn bundle_key(actor: &ActorId, tenant: Option<&TenantId>) -> String {
    key(&["perm", tenant_segment(tenant), actor.as_str()])
}

fn actor_tag(actor: &ActorId) -> String {
    key(&["actor", actor.as_str()])
}

fn tenant_tag(tenant: Option<&TenantId>) -> String {
    key(&["tenant", tenant_segment(tenant)])
}
