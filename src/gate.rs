use std::panic::{AssertUnwindSafe, resume_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::warn;

use crate::cache::{CacheConfig, CacheMiddleware};
use crate::error::{Error, Result};
use crate::evaluator::{AccessCheck, Decision, DenyReason, PermissionEvaluator};
use crate::kv::KeyValueStore;
use crate::lock::{Acquisition, LockConfig, LockKey, LockManager, LockRecord, Release};
use crate::permission::Permission;
use crate::permission_cache::{PermissionCache, PermissionCacheConfig};
use crate::role::{RoleAggregator, RoleDomain, RoleSource};
use crate::types::{ActorContext, ActorId, RoleName, TenantId};

/// Builder for [`AccessGate`].
pub struct GateBuilder<K, S> {
    store: Arc<K>,
    source: S,
    cache: CacheConfig,
    permissions: PermissionCacheConfig,
    locks: LockConfig,
    enable_role_hierarchy: bool,
    max_inherit_depth: usize,
}

impl<K, S> GateBuilder<K, S> {
    /// Creates a builder with default configuration.
    pub fn new(store: Arc<K>, source: S) -> Self {
        Self {
            store,
            source,
            cache: CacheConfig::default(),
            permissions: PermissionCacheConfig::default(),
            locks: LockConfig::default(),
            enable_role_hierarchy: false,
            max_inherit_depth: 16,
        }
    }

    /// Sets the cache middleware configuration.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Sets how long permission bundles stay cached.
    pub fn permission_ttl(mut self, ttl: Duration) -> Self {
        self.permissions.ttl = ttl;
        self
    }

    /// Sets the lock manager configuration.
    pub fn lock_config(mut self, config: LockConfig) -> Self {
        self.locks = config;
        self
    }

    /// Bounds every key-value store call made by the cache and the locks.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.cache.store_timeout = timeout;
        self.locks.store_timeout = timeout;
        self
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
}

impl<K, S> GateBuilder<K, S>
where
    K: KeyValueStore + 'static,
    S: RoleSource + 'static,
{
    /// Builds the gate. Cache and locks share the one store handle.
    pub fn build(self) -> AccessGate<K, S> {
        let cache = CacheMiddleware::new(Arc::clone(&self.store), self.cache);
        let aggregator = RoleAggregator::new(self.source)
            .enable_role_hierarchy(self.enable_role_hierarchy)
            .max_inherit_depth(self.max_inherit_depth);
        let permissions =
            PermissionCache::new(cache.clone(), Arc::new(aggregator), self.permissions);

        AccessGate {
            cache,
            evaluator: PermissionEvaluator::new(permissions),
            locks: LockManager::new(self.store, self.locks),
        }
    }
}

/// Request-boundary facade over permission evaluation and entity locks.
///
/// Cheap to clone; clones share the cache, in-flight loads and store.
pub struct AccessGate<K, S> {
    cache: CacheMiddleware<K>,
    evaluator: PermissionEvaluator<K, S>,
    locks: LockManager<K>,
}

impl<K, S> Clone for AccessGate<K, S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            evaluator: self.evaluator.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<K, S> AccessGate<K, S>
where
    K: KeyValueStore + 'static,
    S: RoleSource + 'static,
{
    pub fn builder(store: Arc<K>, source: S) -> GateBuilder<K, S> {
        GateBuilder::new(store, source)
    }

    /// The shared cache middleware, for collaborators caching their own data.
    pub fn cache(&self) -> &CacheMiddleware<K> {
        &self.cache
    }

    pub fn evaluator(&self) -> &PermissionEvaluator<K, S> {
        &self.evaluator
    }

    pub fn locks(&self) -> &LockManager<K> {
        &self.locks
    }

    /// Evaluates `check` for `actor`.
    pub async fn authorize(&self, actor: &ActorContext, check: &AccessCheck) -> Result<Decision> {
        self.evaluator.evaluate(actor, check).await
    }

    /// Like [`authorize`](Self::authorize), but a deny becomes an error.
    ///
    /// Returns the permission that allowed the check.
    pub async fn require(&self, actor: &ActorContext, check: &AccessCheck) -> Result<Permission> {
        match self.authorize(actor, check).await? {
            Decision::Allow { matched } => Ok(matched),
            Decision::Deny {
                reason: DenyReason::Unauthenticated,
            } => Err(Error::Unauthenticated),
            Decision::Deny { reason } => Err(Error::PermissionDenied { reason }),
        }
    }

    pub async fn acquire_lock(
        &self,
        key: &LockKey,
        actor: &ActorId,
        ttl: Duration,
        reason: Option<&str>,
    ) -> Result<Acquisition> {
        self.locks.try_acquire(key, actor, ttl, reason).await
    }

    pub async fn release_lock(&self, key: &LockKey, actor: &ActorId) -> Result<Release> {
        self.locks.release(key, actor).await
    }

    pub async fn is_locked(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        self.locks.is_locked(key).await
    }

    /// Call after any change to `actor`'s role assignments.
    pub async fn invalidate_actor_permissions(&self, actor: &ActorId) -> Result<usize> {
        self.evaluator.permission_cache().invalidate_actor(actor).await
    }

    /// Call after a tenant-wide role definition change.
    pub async fn invalidate_tenant_role_permissions(&self, tenant: &TenantId) -> Result<usize> {
        self.evaluator
            .permission_cache()
            .invalidate_tenant_roles(tenant)
            .await
    }

    /// Call after the permission set or parents of one role change.
    pub async fn invalidate_role_permissions(
        &self,
        domain: &RoleDomain,
        role: &RoleName,
    ) -> Result<usize> {
        self.evaluator
            .permission_cache()
            .invalidate_role(domain, role)
            .await
    }

    /// Runs `operation` while holding the lock on `key`. `reason` is stored
    /// on the lock record and shown to anyone who conflicts with it.
    ///
    /// Fails with [`Error::LockConflict`] when someone else holds the lock;
    /// `operation` is then never started. The lock is released when the
    /// operation returns or panics, and also when the returned future is
    /// dropped early, in which case the release is spawned on the current
    /// tokio runtime. A failed release is logged and left to the TTL.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &LockKey,
        actor: &ActorId,
        ttl: Duration,
        reason: Option<&str>,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Acquisition::Held(holder) = self.locks.try_acquire(key, actor, ttl, reason).await? {
            return Err(Error::LockConflict {
                holder: holder.map(Box::new),
            });
        }

        let mut guard = ReleaseOnDrop {
            locks: self.locks.clone(),
            key: key.clone(),
            actor: actor.clone(),
            armed: true,
        };
        let outcome = AssertUnwindSafe(operation()).catch_unwind().await;
        let released = self.locks.release(key, actor).await;
        guard.armed = false;

        match released {
            Ok(Release::Released) => {}
            Ok(other) => warn!(lock = %key, actor = %actor, outcome = ?other, "lock lost before release"),
            Err(err) => warn!(lock = %key, actor = %actor, error = %err, "lock release failed"),
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => resume_unwind(panic),
        }
    }
}

/// Releases a scoped lock whose owner never reached the explicit release.
struct ReleaseOnDrop<K>
where
    K: KeyValueStore + 'static,
{
    locks: LockManager<K>,
    key: LockKey,
    actor: ActorId,
    armed: bool,
}

impl<K> Drop for ReleaseOnDrop<K>
where
    K: KeyValueStore + 'static,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.key, actor = %self.actor, "no runtime to release lock; left to expire");
            return;
        };
        let locks = self.locks.clone();
        let key = self.key.clone();
        let actor = self.actor.clone();
        handle.spawn(async move {
            if let Err(err) = locks.release(&key, &actor).await {
                warn!(lock = %key, actor = %actor, error = %err, "deferred lock release failed");
            }
        });
    }
}
