//! TTL-bounded, ownership-checked entity locks on the shared store.
//!
//! A lock is one key, `{namespace}:{tenant}:{entity_type}:{entity_id}`,
//! written with an atomic set-if-absent and the store's native TTL. An
//! abandoned lock therefore disappears on its own; nothing sweeps.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::kv::{KeyValueStore, bounded, key};
use crate::types::{ActorId, EntityId, EntityType, TenantId};

/// Lock manager configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Prefix for every lock key.
    pub namespace: String,
    /// Upper bound on each backing store call.
    pub store_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            namespace: "lock".to_string(),
            store_timeout: Duration::from_millis(250),
        }
    }
}

/// Identity of a lockable entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl LockKey {
    pub fn new(tenant_id: TenantId, entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            tenant_id,
            entity_type,
            entity_id,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.tenant_id, self.entity_type, self.entity_id
        )
    }
}

/// A live lock as stored in the shared store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub locked_by: ActorId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl LockRecord {
    pub fn key(&self) -> LockKey {
        LockKey::new(
            self.tenant_id.clone(),
            self.entity_type.clone(),
            self.entity_id.clone(),
        )
    }
}

/// Result of an acquisition attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acquisition {
    /// The caller now holds the lock.
    Acquired(LockRecord),
    /// Someone already holds it. `None` when the holder released it between
    /// our attempt and the follow-up read.
    Held(Option<LockRecord>),
}

impl Acquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquisition::Acquired(_))
    }
}

/// Result of a release attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Release {
    Released,
    NotLocked,
    /// The lock exists but belongs to someone else; it stays held.
    NotOwner { holder: LockRecord },
}

impl Release {
    pub fn is_released(&self) -> bool {
        matches!(self, Release::Released)
    }

    /// Converts a non-release into the matching error.
    pub fn into_result(self) -> Result<()> {
        match self {
            Release::Released => Ok(()),
            Release::NotLocked => Err(Error::NotLocked),
            Release::NotOwner { holder } => Err(Error::NotLockOwner {
                holder: holder.locked_by,
            }),
        }
    }
}

/// Distributed lock manager. Cheap to clone.
pub struct LockManager<K> {
    store: Arc<K>,
    config: LockConfig,
}

impl<K> Clone for LockManager<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<K> LockManager<K>
where
    K: KeyValueStore,
{
    pub fn new(store: Arc<K>, config: LockConfig) -> Self {
        Self { store, config }
    }

    fn store_key(&self, lock: &LockKey) -> String {
        key(&[
            &self.config.namespace,
            lock.tenant_id.as_str(),
            lock.entity_type.as_str(),
            lock.entity_id.as_str(),
        ])
    }

    /// Attempts to take the lock for `ttl`. Returns true on success.
    ///
    /// A store error or timeout is returned as an error, never as success.
    pub async fn acquire(
        &self,
        lock: &LockKey,
        locked_by: &ActorId,
        ttl: Duration,
        reason: Option<&str>,
    ) -> Result<bool> {
        Ok(self
            .try_acquire(lock, locked_by, ttl, reason)
            .await?
            .is_acquired())
    }

    /// Attempts to take the lock, reporting the current holder on conflict.
    ///
    /// The attempt is a single atomic set-if-absent; it is never retried.
    pub async fn try_acquire(
        &self,
        lock: &LockKey,
        locked_by: &ActorId,
        ttl: Duration,
        reason: Option<&str>,
    ) -> Result<Acquisition> {
        if ttl.is_zero() {
            return Err(Error::InvalidTtl("lock ttl must be positive".to_string()));
        }
        let lifetime = TimeDelta::from_std(ttl)
            .map_err(|_| Error::InvalidTtl(format!("lock ttl {ttl:?} is out of range")))?;
        let acquired_at = Utc::now();
        let expires_at = acquired_at
            .checked_add_signed(lifetime)
            .ok_or_else(|| Error::InvalidTtl(format!("lock ttl {ttl:?} is out of range")))?;

        let record = LockRecord {
            tenant_id: lock.tenant_id.clone(),
            entity_type: lock.entity_type.clone(),
            entity_id: lock.entity_id.clone(),
            locked_by: locked_by.clone(),
            acquired_at,
            expires_at,
            reason: reason.map(str::to_string),
        };
        let raw = serde_json::to_vec(&record)?;

        let written = bounded(
            "set_if_absent",
            self.config.store_timeout,
            self.store.set_if_absent(&self.store_key(lock), raw, Some(ttl)),
        )
        .await?;

        if written {
            debug!(lock = %lock, actor = %locked_by, ?ttl, "lock acquired");
            return Ok(Acquisition::Acquired(record));
        }

        let holder = self.is_locked(lock).await?;
        debug!(
            lock = %lock,
            actor = %locked_by,
            holder = ?holder.as_ref().map(|record| &record.locked_by),
            "lock conflict"
        );
        Ok(Acquisition::Held(holder))
    }

    /// Returns the live lock on `lock`, if any.
    pub async fn is_locked(&self, lock: &LockKey) -> Result<Option<LockRecord>> {
        let raw = bounded(
            "get",
            self.config.store_timeout,
            self.store.get(&self.store_key(lock)),
        )
        .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Releases the lock if `requested_by` holds it.
    ///
    /// The delete is conditional on the stored record being unchanged, so a
    /// lock that expired and was re-taken in between is left alone.
    pub async fn release(&self, lock: &LockKey, requested_by: &ActorId) -> Result<Release> {
        let store_key = self.store_key(lock);
        let timeout = self.config.store_timeout;

        let Some(raw) = bounded("get", timeout, self.store.get(&store_key)).await? else {
            return Ok(Release::NotLocked);
        };
        let record: LockRecord = serde_json::from_slice(&raw)?;
        if &record.locked_by != requested_by {
            debug!(lock = %lock, actor = %requested_by, holder = %record.locked_by, "release rejected");
            return Ok(Release::NotOwner { holder: record });
        }

        let deleted = bounded(
            "delete_if_equals",
            timeout,
            self.store.delete_if_equals(&store_key, &raw),
        )
        .await?;
        if deleted {
            debug!(lock = %lock, actor = %requested_by, "lock released");
            return Ok(Release::Released);
        }

        match self.is_locked(lock).await? {
            Some(holder) if &holder.locked_by != requested_by => Ok(Release::NotOwner { holder }),
            _ => Ok(Release::NotLocked),
        }
    }
}
