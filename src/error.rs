use crate::evaluator::DenyReason;
use crate::lock::LockRecord;
use crate::role::RoleDomain;
use crate::types::{ActorId, RoleName};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type returned by collaborator stores.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Shared form of [`StoreError`] kept inside [`Error`] so the error is cloneable.
pub type SharedStoreError = Arc<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
///
/// `Error` is `Clone` so one failed in-flight load can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Role/permission data-access failure.
    #[error("store error: {0}")]
    Store(#[source] SharedStoreError),
    /// Key-value backend returned an error.
    #[error("key-value store unavailable during {operation}: {source}")]
    StoreUnavailable {
        operation: &'static str,
        #[source]
        source: SharedStoreError,
    },
    /// Key-value backend did not answer within the configured timeout.
    #[error("key-value store timed out during {operation} after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },
    /// Stored value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[source] Arc<serde_json::Error>),
    /// Caller has no authenticated actor context.
    #[error("unauthenticated")]
    Unauthenticated,
    /// Permission evaluated and denied.
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: DenyReason },
    /// Entity is locked by someone else.
    #[error("entity is locked{}", holder_suffix(.holder))]
    LockConflict { holder: Option<Box<LockRecord>> },
    /// Release attempted by an actor that does not hold the lock.
    #[error("not lock owner; lock held by {holder}")]
    NotLockOwner { holder: ActorId },
    /// Release attempted on an entity that is not locked.
    #[error("no lock exists")]
    NotLocked,
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid permission input.
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
    /// Lock or cache TTL is not usable.
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
    /// Role inheritance cycle detected.
    #[error("role cycle detected in {domain} at role {role}")]
    RoleCycleDetected { domain: RoleDomain, role: RoleName },
    /// Role inheritance depth exceeded.
    #[error(
        "role inheritance depth exceeded in {domain} at role {role}; max depth {max_depth}"
    )]
    RoleDepthExceeded {
        domain: RoleDomain,
        role: RoleName,
        max_depth: usize,
    },
}

impl Error {
    pub(crate) fn unavailable(operation: &'static str, source: StoreError) -> Self {
        Self::StoreUnavailable {
            operation,
            source: Arc::from(source),
        }
    }

    /// Returns true for backend errors and timeouts.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::StoreTimeout { .. })
    }
}

fn holder_suffix(holder: &Option<Box<LockRecord>>) -> String {
    holder
        .as_ref()
        .map(|record| format!(" by {} until {}", record.locked_by, record.expires_at))
        .unwrap_or_default()
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Store(Arc::from(error))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec(Arc::new(error))
    }
}
