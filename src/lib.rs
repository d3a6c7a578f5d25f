//! Multi-tenant access control: cached permission evaluation and entity locks.
//!
//! The crate resolves an actor's roles into a [`PermissionBundle`], caches it
//! in a shared key-value store through [`CacheMiddleware`], and evaluates
//! scoped checks (`own < account < tenant < global`) against it. Evaluation is
//! deny-by-default. [`LockManager`] provides TTL-bounded, ownership-checked
//! entity locks on the same store. [`AccessGate`] combines both for request
//! handlers.
//!
//! Storage is pluggable: implement [`KeyValueStore`] for the shared cache and
//! [`RoleSource`] for role data.
//!
//! # Examples
//!
//! Authorization with the in-memory adapters (enable `memory-store`):
//! ```no_run
//! # #[cfg(feature = "memory-store")]
//! # async fn demo() -> tenant_gate::Result<()> {
//! use std::sync::Arc;
//! use tenant_gate::{
//!     AccessCheck, AccessGate, ActorContext, ActorId, EntityId, MemoryKvStore,
//!     MemoryRoleSource, Permission, RoleDomain, RoleName, Scope, TenantId,
//! };
//!
//! let roles = MemoryRoleSource::new();
//! let tenant = TenantId::try_from("3")?;
//! let actor = ActorId::try_from("7")?;
//! let editor = RoleName::try_from("editor")?;
//! roles.assign_tenant_role(tenant.clone(), actor.clone(), editor.clone());
//! roles.add_role_permission(
//!     RoleDomain::Tenant(tenant.clone()),
//!     editor,
//!     Permission::parse("profile:update:own")?,
//! );
//!
//! let gate = AccessGate::builder(Arc::new(MemoryKvStore::new()), roles).build();
//! let context = ActorContext::authenticated(actor, Some(tenant));
//! let check = AccessCheck::new("profile", "update", Scope::Own)
//!     .on_target(EntityId::try_from("7")?);
//! assert!(gate.authorize(&context, &check).await?.is_allowed());
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

mod cache;
mod error;
mod evaluator;
mod gate;
mod kv;
mod lock;
mod permission;
mod permission_cache;
mod role;
mod types;

#[cfg(feature = "memory-store")]
mod memory_kv;
#[cfg(feature = "memory-store")]
mod memory_store;

pub use crate::cache::{CacheConfig, CacheMiddleware, CacheOptions};
pub use crate::error::{Error, Result, SharedStoreError, StoreError};
pub use crate::evaluator::{AccessCheck, Decision, DenyReason, PermissionEvaluator, decide};
pub use crate::gate::{AccessGate, GateBuilder};
pub use crate::kv::KeyValueStore;
pub use crate::lock::{Acquisition, LockConfig, LockKey, LockManager, LockRecord, Release};
pub use crate::permission::{Permission, Scope, ScopePattern, WILDCARD};
pub use crate::permission_cache::{PermissionCache, PermissionCacheConfig};
pub use crate::role::{
    PermissionBundle, RoleAggregator, RoleAssignment, RoleDomain, RoleRef, RoleSource,
};
pub use crate::types::{
    AccountId, ActorContext, ActorId, EntityId, EntityType, RoleName, TenantId,
};

#[cfg(feature = "memory-store")]
pub use crate::memory_kv::MemoryKvStore;
#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryRoleSource;
