//! Tag-indexed cache over a shared [`KeyValueStore`].
//!
//! Values are stored as JSON under `{namespace}:entry:{key}`; every tag owns
//! a set at `{namespace}:tag:{tag}` listing the keys that carry it. Writers
//! link the key to its tags both before and after storing the entry, and
//! removal unlinks before it deletes, so a live entry is always reachable
//! from each of its tags. A tag index may briefly name a key whose entry has
//! already expired; invalidation unlinks such members and moves on.
//!
//! Within one process, concurrent misses on the same key share a single
//! fallback invocation through a map of in-flight [`Shared`] futures.
//!
//! Invalidation also writes a fresh token to `{namespace}:epoch:tag:{tag}`
//! (or `{namespace}:epoch:key:{key}`). Writers read these epochs before they
//! load or store and again after the entry is written; if any changed, the
//! write raced an invalidation in some process and the entry is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::kv::{KeyValueStore, bounded, key};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix for every key this cache writes.
    pub namespace: String,
    /// Upper bound on each backing store call.
    pub store_timeout: Duration,
    /// TTL used when [`CacheOptions`] does not name one.
    pub default_ttl: Duration,
    /// Lifetime of an invalidation epoch. Must exceed the longest fallback.
    pub epoch_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "cache".to_string(),
            store_timeout: Duration::from_millis(250),
            default_ttl: Duration::from_secs(300),
            epoch_ttl: Duration::from_secs(3600),
        }
    }
}

/// Per-call TTL and tags.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    ttl: Option<Duration>,
    tags: Vec<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the entry TTL. A zero TTL means "do not cache".
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Adds a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds several tags.
    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    value: serde_json::Value,
    tags: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// Invalidation epochs observed before a write.
struct Epochs {
    keys: Vec<String>,
    seen: Vec<Option<Vec<u8>>>,
}

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<serde_json::Value>>>>;

struct InFlight {
    id: u64,
    tags: Vec<String>,
    load: SharedLoad,
}

/// Multi-tier cache: in-flight dedup, shared store, caller-supplied source.
///
/// Cheap to clone; clones share the in-flight map and the store handle.
pub struct CacheMiddleware<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for CacheMiddleware<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K> {
    store: Arc<K>,
    config: CacheConfig,
    in_flight: DashMap<String, InFlight>,
    // Bumped on every invalidation; loads that started under an older
    // generation never write their result back.
    generation: AtomicU64,
    next_load_id: AtomicU64,
}

impl<K> CacheMiddleware<K>
where
    K: KeyValueStore + 'static,
{
    /// Creates a cache over `store`.
    pub fn new(store: Arc<K>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                in_flight: DashMap::new(),
                generation: AtomicU64::new(0),
                next_load_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns the cached value for `key`, if present and decodable.
    ///
    /// Store failures and undecodable entries are logged and read as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.inner.read_entry(key).await {
            Ok(Some(entry)) => decode_logged(key, &entry.value),
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Returns the cached value for `key`, loading it through `fallback` on a miss.
    ///
    /// Concurrent callers missing the same key in this process share one
    /// fallback invocation and all receive its result or its error. A failed
    /// fallback caches nothing. When the store read itself fails the loaded
    /// value is returned without being written back; an undecodable entry
    /// counts as a miss and is overwritten.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        options: CacheOptions,
        fallback: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let write_back = match self.inner.read_entry(key).await {
            Ok(Some(entry)) => {
                if let Some(value) = decode_logged(key, &entry.value) {
                    return Ok(value);
                }
                true
            }
            Ok(None) => true,
            Err(Error::Codec(err)) => {
                warn!(key = %key, error = %err, "undecodable cache entry; reloading");
                true
            }
            Err(err) => {
                warn!(key = %key, error = %err, "cache read failed; loading without write-back");
                false
            }
        };

        let load = self.join_or_start(key, options, write_back, fallback);
        let value = load.await?;
        Ok(T::deserialize(&*value)?)
    }

    /// Stores `value` under `key`. Returns false when nothing was stored.
    ///
    /// Store failures are logged and swallowed.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, options: CacheOptions) -> bool {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %key, error = %err, "cache value not serializable; skipping set");
                return false;
            }
        };
        let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
        if ttl.is_zero() {
            return false;
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let before = match self.inner.snapshot_epochs(key, &options.tags).await {
            Ok(before) => before,
            Err(err) => {
                warn!(key = %key, error = %err, "cache set failed; continuing uncached");
                return false;
            }
        };
        self.inner
            .write_checked(key, value, ttl, &options.tags, &before, generation)
            .await
    }

    /// Removes `key`. Returns true when a live entry was removed.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.in_flight.remove(key);
        inner.bump_epoch(&inner.key_epoch(key)).await?;
        inner.remove_entry(key, None).await
    }

    /// Removes every entry carrying `tag` from the store and from the indices
    /// of its other tags. Returns the number of entries removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<usize> {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner
            .in_flight
            .retain(|_, flight| !flight.tags.iter().any(|t| t == tag));

        inner.bump_epoch(&inner.tag_epoch(tag)).await?;

        let tag_key = inner.tag_key(tag);
        let timeout = inner.config.store_timeout;
        let members = bounded("set_members", timeout, inner.store.set_members(&tag_key)).await?;

        // Members are unlinked one by one; the set itself is never deleted,
        // so keys indexed by concurrent writers stay reachable.
        let mut removed = 0;
        for member in members {
            if inner.remove_entry(&member, Some(tag)).await? {
                removed += 1;
            }
        }

        debug!(tag = %tag, removed, "invalidated cache tag");
        Ok(removed)
    }

    fn join_or_start<T, F, Fut>(
        &self,
        key: &str,
        options: CacheOptions,
        write_back: bool,
        fallback: F,
    ) -> SharedLoad
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(flight) => flight.get().load.clone(),
            Entry::Vacant(slot) => {
                let id = self.inner.next_load_id.fetch_add(1, Ordering::Relaxed);
                let generation = self.inner.generation.load(Ordering::SeqCst);
                let tags = options.tags.clone();
                let inner = Arc::clone(&self.inner);
                let key = key.to_string();

                let load = async move {
                    let outcome = inner
                        .load(&key, generation, options, write_back, fallback)
                        .await;
                    inner.in_flight.remove_if(&key, |_, flight| flight.id == id);
                    outcome
                }
                .boxed()
                .shared();

                slot.insert(InFlight {
                    id,
                    tags,
                    load: load.clone(),
                });
                load
            }
        }
    }
}

impl<K> Inner<K>
where
    K: KeyValueStore,
{
    fn entry_key(&self, cache_key: &str) -> String {
        key(&[&self.config.namespace, "entry", cache_key])
    }

    fn tag_key(&self, tag: &str) -> String {
        key(&[&self.config.namespace, "tag", tag])
    }

    fn tag_epoch(&self, tag: &str) -> String {
        key(&[&self.config.namespace, "epoch", "tag", tag])
    }

    fn key_epoch(&self, cache_key: &str) -> String {
        key(&[&self.config.namespace, "epoch", "key", cache_key])
    }

    async fn bump_epoch(&self, epoch_key: &str) -> Result<()> {
        let token = Uuid::new_v4().to_string().into_bytes();
        bounded(
            "set",
            self.config.store_timeout,
            self.store.set(epoch_key, token, Some(self.config.epoch_ttl)),
        )
        .await
    }

    async fn read_epochs(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut seen = Vec::with_capacity(keys.len());
        for epoch_key in keys {
            seen.push(bounded("get", self.config.store_timeout, self.store.get(epoch_key)).await?);
        }
        Ok(seen)
    }

    async fn snapshot_epochs(&self, cache_key: &str, tags: &[String]) -> Result<Epochs> {
        let keys: Vec<String> = std::iter::once(self.key_epoch(cache_key))
            .chain(tags.iter().map(|tag| self.tag_epoch(tag)))
            .collect();
        let seen = self.read_epochs(&keys).await?;
        Ok(Epochs { keys, seen })
    }

    async fn read_entry(&self, cache_key: &str) -> Result<Option<CacheEntry>> {
        let raw = bounded(
            "get",
            self.config.store_timeout,
            self.store.get(&self.entry_key(cache_key)),
        )
        .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_slice(&raw)?;
        Ok(entry.is_live(Utc::now()).then_some(entry))
    }

    async fn load<T, F, Fut>(
        &self,
        cache_key: &str,
        generation: u64,
        options: CacheOptions,
        write_back: bool,
        fallback: F,
    ) -> Result<Arc<serde_json::Value>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Another leader may have filled the key between our miss and now.
        if write_back && let Ok(Some(entry)) = self.read_entry(cache_key).await {
            return Ok(Arc::new(entry.value));
        }

        let before = if write_back {
            match self.snapshot_epochs(cache_key, &options.tags).await {
                Ok(before) => Some(before),
                Err(err) => {
                    warn!(key = %cache_key, error = %err, "cache epochs unreadable; loading without write-back");
                    None
                }
            }
        } else {
            None
        };

        debug!(key = %cache_key, "cache miss; invoking fallback");
        let value = serde_json::to_value(fallback().await?)?;

        if let Some(before) = before {
            let ttl = options.ttl.unwrap_or(self.config.default_ttl);
            self.write_checked(cache_key, value.clone(), ttl, &options.tags, &before, generation)
                .await;
        }
        Ok(Arc::new(value))
    }

    /// Writes the entry unless an invalidation happened since `before` was
    /// taken, in this process or any other. Returns true when the entry stays.
    async fn write_checked(
        &self,
        cache_key: &str,
        value: serde_json::Value,
        ttl: Duration,
        tags: &[String],
        before: &Epochs,
        generation: u64,
    ) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        if !self.write_entry(cache_key, value, ttl, tags).await {
            return false;
        }

        let invalidated = self.generation.load(Ordering::SeqCst) != generation
            || match self.read_epochs(&before.keys).await {
                Ok(after) => after != before.seen,
                Err(err) => {
                    warn!(key = %cache_key, error = %err, "cannot confirm cache write; dropping entry");
                    true
                }
            };
        if !invalidated {
            return true;
        }

        debug!(key = %cache_key, "invalidated while writing; dropping entry");
        if let Err(err) = self.remove_entry(cache_key, None).await {
            warn!(key = %cache_key, error = %err, "failed to drop stale cache entry");
        }
        false
    }

    async fn write_entry(
        &self,
        cache_key: &str,
        value: serde_json::Value,
        ttl: Duration,
        tags: &[String],
    ) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let entry = CacheEntry {
            value,
            tags: tags.to_vec(),
            expires_at: TimeDelta::from_std(ttl)
                .ok()
                .and_then(|delta| Utc::now().checked_add_signed(delta)),
        };
        let raw = match serde_json::to_vec(&entry) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key = %cache_key, error = %err, "cache entry not serializable; skipping set");
                return false;
            }
        };

        match self.index_and_store(cache_key, raw, ttl, tags).await {
            Ok(()) => true,
            Err(err) => {
                warn!(key = %cache_key, error = %err, "cache set failed; continuing uncached");
                false
            }
        }
    }

    async fn index_and_store(
        &self,
        cache_key: &str,
        raw: Vec<u8>,
        ttl: Duration,
        tags: &[String],
    ) -> Result<()> {
        let timeout = self.config.store_timeout;

        // Unlink from tags a previous version carried but this one does not.
        if let Ok(Some(previous)) = self.read_entry(cache_key).await {
            for stale in previous.tags.iter().filter(|tag| !tags.contains(tag)) {
                bounded(
                    "set_remove",
                    timeout,
                    self.store.set_remove(&self.tag_key(stale), cache_key),
                )
                .await?;
            }
        }

        for tag in tags {
            bounded("set_add", timeout, self.store.set_add(&self.tag_key(tag), cache_key)).await?;
        }

        bounded(
            "set",
            timeout,
            self.store.set(&self.entry_key(cache_key), raw, Some(ttl)),
        )
        .await?;

        // Link again once the entry exists: a remover unlinks before it
        // deletes, so either it deletes this entry or the link survives.
        for tag in tags {
            let tag_key = self.tag_key(tag);
            bounded("set_add", timeout, self.store.set_add(&tag_key, cache_key)).await?;
            let remaining = bounded("ttl", timeout, self.store.ttl(&tag_key)).await?;
            if remaining.is_none_or(|remaining| remaining < ttl) {
                bounded("expire", timeout, self.store.expire(&tag_key, ttl)).await?;
            }
        }
        Ok(())
    }

    /// Unlinks `cache_key` from its tags (and from `also_unlink`), then
    /// deletes the entry. Returns true when an entry was deleted.
    async fn remove_entry(&self, cache_key: &str, also_unlink: Option<&str>) -> Result<bool> {
        let timeout = self.config.store_timeout;
        let entry_key = self.entry_key(cache_key);

        let mut tags = match bounded("get", timeout, self.store.get(&entry_key)).await? {
            Some(raw) => serde_json::from_slice::<CacheEntry>(&raw)
                .map(|entry| entry.tags)
                .unwrap_or_default(),
            None => Vec::new(),
        };
        if let Some(tag) = also_unlink
            && !tags.iter().any(|t| t == tag)
        {
            tags.push(tag.to_string());
        }

        for tag in &tags {
            bounded(
                "set_remove",
                timeout,
                self.store.set_remove(&self.tag_key(tag), cache_key),
            )
            .await?;
        }
        bounded("delete", timeout, self.store.delete(&entry_key)).await
    }
}

fn decode_logged<T: DeserializeOwned>(key: &str, value: &serde_json::Value) -> Option<T> {
    match T::deserialize(value) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(key = %key, error = %err, "cached value has unexpected shape; treating as miss");
            None
        }
    }
}
