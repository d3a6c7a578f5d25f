#![cfg(feature = "memory-store")]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tenant_gate::{
    AccessCheck, AccessGate, AccountId, ActorContext, ActorId, Decision, DenyReason, EntityType,
    Error, LockKey, MemoryKvStore, MemoryRoleSource, Permission, Release, RoleDomain,
    RoleName, Scope, TenantId,
};

type Gate = AccessGate<MemoryKvStore, MemoryRoleSource>;

fn id<T: TryFrom<&'static str>>(value: &'static str) -> T
where
    T::Error: std::fmt::Debug,
{
    T::try_from(value).unwrap()
}

fn grant(source: &MemoryRoleSource, tenant: &TenantId, role: &str, permission: &str) {
    source.add_role_permission(
        RoleDomain::Tenant(tenant.clone()),
        RoleName::try_from(role).unwrap(),
        Permission::parse(permission).unwrap(),
    );
}

fn gate_with(source: MemoryRoleSource) -> Gate {
    AccessGate::builder(Arc::new(MemoryKvStore::new()), source).build()
}

fn listing(entity: &'static str) -> LockKey {
    LockKey::new(id("3"), id::<EntityType>("listing"), id(entity))
}

#[tokio::test]
async fn editor_should_update_only_own_profile() {
    let source = MemoryRoleSource::new();
    let tenant: TenantId = id("3");
    let actor: ActorId = id("7");
    source.assign_tenant_role(tenant.clone(), actor.clone(), id("editor"));
    grant(&source, &tenant, "editor", "profile:update:own");
    let gate = gate_with(source);

    let context = ActorContext::authenticated(actor, Some(tenant)).with_roles([id("editor")]);
    let own = AccessCheck::new("profile", "update", Scope::Own).on_target(id("7"));
    let foreign = AccessCheck::new("profile", "update", Scope::Own).on_target(id("9"));

    let allowed = gate.authorize(&context, &own).await.unwrap();
    assert!(allowed.is_allowed());
    assert_eq!(
        allowed.matched_permission().map(ToString::to_string).as_deref(),
        Some("profile:update:own")
    );

    let denied = gate.authorize(&context, &foreign).await.unwrap();
    assert!(!denied.is_allowed());
    assert_eq!(denied.reason(), "no matching permission");
}

#[tokio::test]
async fn tenant_admin_should_be_allowed_anything_in_own_tenant() {
    let source = MemoryRoleSource::new();
    let tenant: TenantId = id("3");
    let admin: ActorId = id("1");
    source.assign_tenant_role(tenant.clone(), admin.clone(), id("admin"));
    grant(&source, &tenant, "admin", "*:*:tenant");
    let gate = gate_with(source);
    let context = ActorContext::authenticated(admin, Some(tenant.clone()));

    for (resource, action) in [("invoice", "delete"), ("user", "invite"), ("listing", "publish")] {
        let check = AccessCheck::new(resource, action, Scope::Tenant).in_tenant(tenant.clone());
        assert!(
            gate.authorize(&context, &check).await.unwrap().is_allowed(),
            "{resource}:{action}"
        );
    }

    let other_tenant = AccessCheck::new("invoice", "read", Scope::Tenant).in_tenant(id("4"));
    assert!(!gate.authorize(&context, &other_tenant).await.unwrap().is_allowed());

    let global = AccessCheck::new("invoice", "read", Scope::Global);
    assert!(!gate.authorize(&context, &global).await.unwrap().is_allowed());
}

#[tokio::test]
async fn account_scope_should_require_matching_account() {
    let source = MemoryRoleSource::new();
    let tenant: TenantId = id("3");
    let actor: ActorId = id("7");
    source.assign_tenant_role(tenant.clone(), actor.clone(), id("agent"));
    grant(&source, &tenant, "agent", "customer:read:account");
    let gate = gate_with(source);

    let context = ActorContext::authenticated(actor, Some(tenant)).with_account(id("acme"));
    let same = AccessCheck::new("customer", "read", Scope::Account).in_account(id("acme"));
    let other = AccessCheck::new("customer", "read", Scope::Account)
        .in_account(AccountId::try_from("globex").unwrap());

    assert!(gate.authorize(&context, &same).await.unwrap().is_allowed());
    assert!(!gate.authorize(&context, &other).await.unwrap().is_allowed());
}

#[tokio::test]
async fn role_change_should_apply_after_invalidation() {
    let source = MemoryRoleSource::new();
    let tenant: TenantId = id("3");
    let actor: ActorId = id("7");
    let gate = gate_with(source.clone());
    let context = ActorContext::authenticated(actor.clone(), Some(tenant.clone()));
    let check = AccessCheck::new("invoice", "approve", Scope::Tenant).in_tenant(tenant.clone());

    assert!(!gate.authorize(&context, &check).await.unwrap().is_allowed());

    source.assign_tenant_role(tenant.clone(), actor.clone(), id("approver"));
    grant(&source, &tenant, "approver", "invoice:approve:tenant");
    assert!(!gate.authorize(&context, &check).await.unwrap().is_allowed());

    assert_eq!(gate.invalidate_actor_permissions(&actor).await.unwrap(), 1);
    assert!(gate.authorize(&context, &check).await.unwrap().is_allowed());

    source.remove_role_permission(
        RoleDomain::Tenant(tenant.clone()),
        id("approver"),
        &Permission::parse("invoice:approve:tenant").unwrap(),
    );
    gate.invalidate_role_permissions(&RoleDomain::Tenant(tenant.clone()), &id("approver"))
        .await
        .unwrap();
    assert!(!gate.authorize(&context, &check).await.unwrap().is_allowed());
}

#[tokio::test]
async fn platform_role_should_apply_in_every_tenant() {
    let source = MemoryRoleSource::new();
    let support: ActorId = id("42");
    source.assign_platform_role(support.clone(), id("support"));
    source.add_role_permission(
        RoleDomain::Platform,
        id("support"),
        Permission::parse("ticket:read:global").unwrap(),
    );
    let gate = gate_with(source);

    for tenant in ["3", "4"] {
        let context = ActorContext::authenticated(support.clone(), Some(id(tenant)));
        let check = AccessCheck::new("ticket", "read", Scope::Tenant).in_tenant(id(tenant));
        assert!(gate.authorize(&context, &check).await.unwrap().is_allowed());
    }
}

#[tokio::test]
async fn anonymous_actor_should_always_be_denied() {
    let source = MemoryRoleSource::new();
    let gate = gate_with(source);
    let check = AccessCheck::new("profile", "read", Scope::Global);

    let decision = gate.authorize(&ActorContext::anonymous(), &check).await.unwrap();
    assert_eq!(
        decision,
        Decision::Deny {
            reason: DenyReason::Unauthenticated
        }
    );
    assert!(matches!(
        gate.require(&ActorContext::anonymous(), &check).await,
        Err(Error::Unauthenticated)
    ));
}

#[tokio::test]
async fn with_lock_conflict_should_carry_holder() {
    let gate = gate_with(MemoryRoleSource::new());
    let holder: ActorId = id("1");
    let ttl = Duration::from_secs(60);
    gate.acquire_lock(&listing("42"), &holder, ttl, Some("editing price"))
        .await
        .unwrap();

    let result = gate
        .with_lock(&listing("42"), &id("7"), ttl, None, || async { "unreachable" })
        .await;

    let Err(Error::LockConflict { holder: Some(record) }) = result else {
        panic!("expected lock conflict with holder");
    };
    assert_eq!(record.locked_by, holder);
    assert_eq!(record.reason.as_deref(), Some("editing price"));
    assert!(record.expires_at > record.acquired_at);
}

#[tokio::test]
async fn with_lock_reason_should_reach_conflicting_actors() {
    let gate = gate_with(MemoryRoleSource::new());
    let ttl = Duration::from_secs(60);
    let other = gate.clone();

    let conflict = gate
        .with_lock(&listing("42"), &id("1"), ttl, Some("bulk price update"), || async move {
            other
                .with_lock(&listing("42"), &id("7"), ttl, None, || async {})
                .await
        })
        .await
        .unwrap();

    let Err(Error::LockConflict { holder: Some(record) }) = conflict else {
        panic!("expected lock conflict with holder");
    };
    assert_eq!(record.locked_by, id::<ActorId>("1"));
    assert_eq!(record.reason.as_deref(), Some("bulk price update"));
    assert!(gate.is_locked(&listing("42")).await.unwrap().is_none());
}

#[tokio::test]
async fn with_lock_should_release_when_operation_fails() {
    let gate = gate_with(MemoryRoleSource::new());
    let actor: ActorId = id("7");

    let result: Result<(), &str> = gate
        .with_lock(&listing("42"), &actor, Duration::from_secs(60), None, || async {
            Err("validation failed")
        })
        .await
        .unwrap();

    assert_eq!(result, Err("validation failed"));
    assert!(gate.is_locked(&listing("42")).await.unwrap().is_none());
}

#[tokio::test]
async fn with_lock_should_release_when_operation_panics() {
    let gate = gate_with(MemoryRoleSource::new());
    let actor: ActorId = id("7");

    let outcome = AssertUnwindSafe(gate.with_lock(
        &listing("42"),
        &actor,
        Duration::from_secs(60),
        None,
        || async { panic!("boom") },
    ))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert!(gate.is_locked(&listing("42")).await.unwrap().is_none());
}

#[tokio::test]
async fn locks_should_be_independent_per_entity() {
    let gate = gate_with(MemoryRoleSource::new());
    let ttl = Duration::from_secs(60);

    let first = gate.acquire_lock(&listing("1"), &id("7"), ttl, None).await.unwrap();
    let second = gate.acquire_lock(&listing("2"), &id("8"), ttl, None).await.unwrap();
    assert!(first.is_acquired());
    assert!(second.is_acquired());

    assert!(matches!(
        gate.release_lock(&listing("1"), &id("8")).await.unwrap(),
        Release::NotOwner { .. }
    ));
    assert!(gate.release_lock(&listing("1"), &id("7")).await.unwrap().is_released());
    assert_eq!(
        gate.release_lock(&listing("1"), &id("7")).await.unwrap(),
        Release::NotLocked
    );
}

#[tokio::test(start_paused = true)]
async fn expired_lock_should_be_acquirable_again() {
    let gate = gate_with(MemoryRoleSource::new());
    let ttl = Duration::from_secs(5);

    assert!(gate.acquire_lock(&listing("42"), &id("7"), ttl, None).await.unwrap().is_acquired());
    assert!(!gate.acquire_lock(&listing("42"), &id("8"), ttl, None).await.unwrap().is_acquired());

    tokio::time::advance(Duration::from_secs(6)).await;

    assert!(gate.is_locked(&listing("42")).await.unwrap().is_none());
    assert!(gate.acquire_lock(&listing("42"), &id("8"), ttl, None).await.unwrap().is_acquired());
}

#[tokio::test]
async fn shared_cache_should_serve_collaborator_values() {
    let gate = gate_with(MemoryRoleSource::new());
    let cache = gate.cache();

    let value: Vec<String> = cache
        .get_or_load(
            "listing:42:summary",
            tenant_gate::CacheOptions::new().tag("listing:42"),
            || async { Ok(vec!["draft".to_string()]) },
        )
        .await
        .unwrap();
    assert_eq!(value, vec!["draft".to_string()]);

    assert_eq!(cache.invalidate_by_tag("listing:42").await.unwrap(), 1);
    assert_eq!(cache.get::<Vec<String>>("listing:42:summary").await, None);
}
