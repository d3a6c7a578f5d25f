use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::kv::KeyValueStore;

/// In-process key-value store with per-key TTL.
///
/// Intended for tests, demos and single-process deployments. Expired keys are
/// evicted lazily on access, so no sweeper task is needed. Time is measured
/// with `tokio::time::Instant`, which lets paused-clock tests advance it.
#[derive(Debug, Default, Clone)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<HashMap<String, Slot>>>,
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
enum Value {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.inner.lock().expect("poisoned lock");
        guard.values().filter(|slot| slot.is_live(now)).count()
    }

    /// Returns true when no live key exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_slot<'a>(map: &'a mut HashMap<String, Slot>, key: &str) -> Option<&'a mut Slot> {
        let now = Instant::now();
        if map.get(key).is_some_and(|slot| !slot.is_live(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn deadline(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }
}

fn wrong_type(key: &str) -> StoreError {
    format!("WRONGTYPE operation against key `{key}` holding the wrong kind of value").into()
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        match Self::live_slot(&mut guard, key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        guard.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value),
                expires_at: Self::deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        if Self::live_slot(&mut guard, key).is_some() {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value),
                expires_at: Self::deadline(ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        let existed = Self::live_slot(&mut guard, key).is_some();
        guard.remove(key);
        Ok(existed)
    }

    async fn delete_if_equals(
        &self,
        key: &str,
        expected: &[u8],
    ) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        let matches = matches!(
            Self::live_slot(&mut guard, key),
            Some(Slot { value: Value::Bytes(bytes), .. }) if bytes.as_slice() == expected
        );
        if matches {
            guard.remove(key);
        }
        Ok(matches)
    }

    async fn ttl(&self, key: &str) -> std::result::Result<Option<Duration>, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        let now = Instant::now();
        Ok(Self::live_slot(&mut guard, key)
            .and_then(|slot| slot.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<bool, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        match Self::live_slot(&mut guard, key) {
            Some(slot) => {
                slot.expires_at = Self::deadline(Some(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        if Self::live_slot(&mut guard, key).is_none() {
            guard.insert(
                key.to_string(),
                Slot {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match guard.get_mut(key) {
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => {
                members.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        let now_empty = match Self::live_slot(&mut guard, key) {
            None => return Ok(()),
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => {
                members.remove(member);
                members.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            guard.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> std::result::Result<Vec<String>, StoreError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        match Self::live_slot(&mut guard, key) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
