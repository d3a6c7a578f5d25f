use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::permission::{Permission, Scope, ScopePattern};
use crate::permission_cache::PermissionCache;
use crate::role::RoleSource;
use crate::types::{AccountId, ActorContext, EntityId, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// A requested operation: `(resource, action, scope)` plus the identities the
/// scope constraints are checked against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessCheck {
    resource: String,
    action: String,
    scope: Scope,
    tenant_id: Option<TenantId>,
    account_id: Option<AccountId>,
    target_id: Option<EntityId>,
}

impl AccessCheck {
    /// Creates a check. Resource and action are trimmed and lowercased.
    pub fn new(resource: impl AsRef<str>, action: impl AsRef<str>, scope: Scope) -> Self {
        Self {
            resource: resource.as_ref().trim().to_ascii_lowercase(),
            action: action.as_ref().trim().to_ascii_lowercase(),
            scope,
            tenant_id: None,
            account_id: None,
            target_id: None,
        }
    }

    /// Tenant owning the resource.
    pub fn in_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Account owning the resource.
    pub fn in_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Specific entity the action applies to.
    pub fn on_target(mut self, target_id: EntityId) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    pub fn account_id(&self) -> Option<&AccountId> {
        self.account_id.as_ref()
    }

    pub fn target_id(&self) -> Option<&EntityId> {
        self.target_id.as_ref()
    }
}

/// Machine-readable reason for a denial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The actor context is not authenticated.
    Unauthenticated,
    /// No permission in the actor's bundle satisfies the check.
    NoMatchingPermission,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "unauthenticated",
            DenyReason::NoMatchingPermission => "no matching permission",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Permission is granted by `matched`.
    Allow { matched: Permission },
    /// Permission is denied.
    Deny { reason: DenyReason },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// Human-readable reason, suitable for audit logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Decision::Allow { .. } => "matched permission",
            Decision::Deny { reason } => reason.as_str(),
        }
    }

    pub fn matched_permission(&self) -> Option<&Permission> {
        match self {
            Decision::Allow { matched } => Some(matched),
            Decision::Deny { .. } => None,
        }
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Decision::Allow { .. } => None,
            Decision::Deny { reason } => Some(*reason),
        }
    }
}

/// Decides whether an actor may perform a check. Fail-closed.
///
/// The only I/O is the bundle lookup through [`PermissionCache`].
pub struct PermissionEvaluator<K, S> {
    permissions: PermissionCache<K, S>,
}

impl<K, S> Clone for PermissionEvaluator<K, S> {
    fn clone(&self) -> Self {
        Self {
            permissions: self.permissions.clone(),
        }
    }
}

impl<K, S> PermissionEvaluator<K, S>
where
    K: KeyValueStore + 'static,
    S: RoleSource + 'static,
{
    pub fn new(permissions: PermissionCache<K, S>) -> Self {
        Self { permissions }
    }

    pub fn permission_cache(&self) -> &PermissionCache<K, S> {
        &self.permissions
    }

    /// Evaluates `check` for `actor`.
    ///
    /// A failed bundle lookup is returned as an error, never as a decision.
    pub async fn evaluate(&self, actor: &ActorContext, check: &AccessCheck) -> Result<Decision> {
        if !actor.is_authenticated() {
            debug!(resource = %check.resource, action = %check.action, "denied unauthenticated actor");
            return Ok(Decision::Deny {
                reason: DenyReason::Unauthenticated,
            });
        }

        let bundle = self
            .permissions
            .get_bundle(actor.actor_id(), actor.tenant_id())
            .await?;
        let decision = decide(actor, &bundle.permissions, check);
        debug!(
            actor = %actor.actor_id(),
            resource = %check.resource,
            action = %check.action,
            scope = %check.scope,
            allowed = decision.is_allowed(),
            reason = decision.reason(),
            "evaluated access check"
        );
        Ok(decision)
    }
}

/// Pure evaluation of `check` against a fixed set of granted permissions.
///
/// Any matching permission allows, so the outcome does not depend on the
/// order of `granted`.
pub fn decide(actor: &ActorContext, granted: &[Permission], check: &AccessCheck) -> Decision {
    if !actor.is_authenticated() {
        return Decision::Deny {
            reason: DenyReason::Unauthenticated,
        };
    }
    granted
        .iter()
        .find(|permission| permission_satisfies(permission, actor, check))
        .map_or(
            Decision::Deny {
                reason: DenyReason::NoMatchingPermission,
            },
            |matched| Decision::Allow {
                matched: matched.clone(),
            },
        )
}

fn permission_satisfies(permission: &Permission, actor: &ActorContext, check: &AccessCheck) -> bool {
    permission.matches_operation(&check.resource, &check.action)
        && permission.matches_target(check.target_id.as_ref())
        && scope_admits(permission.scope(), actor, check)
}

/// A grant reaches the check when its scope is at least as broad as the
/// requested one and the identity constraint of the grant's scope holds.
/// A `*` scope carries the requested scope's constraint.
fn scope_admits(granted: ScopePattern, actor: &ActorContext, check: &AccessCheck) -> bool {
    if !granted.covers(check.scope) {
        return false;
    }
    let effective = match granted {
        ScopePattern::Any => check.scope,
        ScopePattern::Exact(scope) => scope,
    };
    identity_holds(effective, actor, check)
}

fn identity_holds(scope: Scope, actor: &ActorContext, check: &AccessCheck) -> bool {
    match scope {
        Scope::Own => check
            .target_id
            .as_ref()
            .is_some_and(|target| target.refers_to(actor.actor_id())),
        Scope::Account => actor
            .account_id()
            .is_some_and(|account| check.account_id.as_ref() == Some(account)),
        Scope::Tenant => actor
            .tenant_id()
            .is_some_and(|tenant| check.tenant_id.as_ref() == Some(tenant)),
        Scope::Global => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorId;

    fn perm(value: &str) -> Permission {
        Permission::parse(value).unwrap()
    }

    fn tenant(value: &str) -> TenantId {
        TenantId::try_from(value).unwrap()
    }

    fn target(value: &str) -> EntityId {
        EntityId::try_from(value).unwrap()
    }

    fn actor() -> ActorContext {
        ActorContext::authenticated(ActorId::try_from("7").unwrap(), Some(tenant("3")))
            .with_account(AccountId::try_from("acme").unwrap())
    }

    #[test]
    fn identical_components_should_allow() {
        let granted = [perm("profile:update:own")];
        let check = AccessCheck::new("profile", "update", Scope::Own).on_target(target("7"));

        let decision = decide(&actor(), &granted, &check);
        assert!(decision.is_allowed());
        assert_eq!(decision.matched_permission(), Some(&granted[0]));
    }

    #[test]
    fn own_scope_should_require_actor_as_target() {
        let granted = [perm("profile:update:own")];
        let check = AccessCheck::new("profile", "update", Scope::Own).on_target(target("9"));

        let decision = decide(&actor(), &granted, &check);
        assert_eq!(decision.deny_reason(), Some(DenyReason::NoMatchingPermission));
        assert_eq!(decision.reason(), "no matching permission");
    }

    #[test]
    fn own_scope_without_target_should_deny() {
        let granted = [perm("profile:update:own")];
        let check = AccessCheck::new("profile", "update", Scope::Own);

        assert!(!decide(&actor(), &granted, &check).is_allowed());
    }

    #[test]
    fn wildcard_components_should_allow_matching_checks() {
        let granted = [perm("*:read:tenant"), perm("invoice:*:tenant")];
        let read = AccessCheck::new("customer", "read", Scope::Tenant).in_tenant(tenant("3"));
        let pay = AccessCheck::new("invoice", "pay", Scope::Tenant).in_tenant(tenant("3"));
        let delete = AccessCheck::new("customer", "delete", Scope::Tenant).in_tenant(tenant("3"));

        assert!(decide(&actor(), &granted, &read).is_allowed());
        assert!(decide(&actor(), &granted, &pay).is_allowed());
        assert!(!decide(&actor(), &granted, &delete).is_allowed());
    }

    #[test]
    fn global_scope_should_satisfy_every_narrower_scope() {
        let granted = [perm("report:view:global")];
        for scope in Scope::ALL {
            let check = AccessCheck::new("report", "view", scope);
            assert!(decide(&actor(), &granted, &check).is_allowed(), "scope {scope}");
        }
    }

    #[test]
    fn narrower_grant_should_not_satisfy_broader_check() {
        let granted = [perm("report:view:own")];
        for scope in [Scope::Account, Scope::Tenant, Scope::Global] {
            let check = AccessCheck::new("report", "view", scope)
                .in_tenant(tenant("3"))
                .in_account(AccountId::try_from("acme").unwrap())
                .on_target(target("7"));
            assert!(!decide(&actor(), &granted, &check).is_allowed(), "scope {scope}");
        }
    }

    #[test]
    fn account_scope_should_require_same_account() {
        let granted = [perm("order:read:account")];
        let same = AccessCheck::new("order", "read", Scope::Account)
            .in_account(AccountId::try_from("acme").unwrap());
        let other = AccessCheck::new("order", "read", Scope::Account)
            .in_account(AccountId::try_from("globex").unwrap());

        assert!(decide(&actor(), &granted, &same).is_allowed());
        assert!(!decide(&actor(), &granted, &other).is_allowed());
    }

    #[test]
    fn tenant_scope_should_require_same_tenant() {
        let granted = [perm("*:*:tenant")];
        let same = AccessCheck::new("listing", "delete", Scope::Own)
            .in_tenant(tenant("3"))
            .on_target(target("99"));
        let other = AccessCheck::new("listing", "delete", Scope::Tenant).in_tenant(tenant("4"));

        assert!(decide(&actor(), &granted, &same).is_allowed());
        assert!(!decide(&actor(), &granted, &other).is_allowed());
    }

    #[test]
    fn wildcard_scope_should_carry_requested_constraint() {
        let granted = [perm("listing:edit:*")];
        let own_target = AccessCheck::new("listing", "edit", Scope::Own).on_target(target("7"));
        let foreign_tenant = AccessCheck::new("listing", "edit", Scope::Tenant).in_tenant(tenant("4"));
        let global = AccessCheck::new("listing", "edit", Scope::Global);

        assert!(decide(&actor(), &granted, &own_target).is_allowed());
        assert!(!decide(&actor(), &granted, &foreign_tenant).is_allowed());
        assert!(decide(&actor(), &granted, &global).is_allowed());
    }

    #[test]
    fn target_bound_grant_should_only_match_its_target() {
        let granted = [perm("listing:edit:tenant#42")];
        let bound = AccessCheck::new("listing", "edit", Scope::Tenant)
            .in_tenant(tenant("3"))
            .on_target(target("42"));
        let other = AccessCheck::new("listing", "edit", Scope::Tenant)
            .in_tenant(tenant("3"))
            .on_target(target("43"));

        assert!(decide(&actor(), &granted, &bound).is_allowed());
        assert!(!decide(&actor(), &granted, &other).is_allowed());
    }

    #[test]
    fn outcome_should_not_depend_on_permission_order() {
        let mut granted = vec![
            perm("invoice:read:own"),
            perm("customer:*:account"),
            perm("*:export:tenant"),
            perm("report:view:global"),
        ];
        let checks = [
            AccessCheck::new("customer", "edit", Scope::Account)
                .in_account(AccountId::try_from("acme").unwrap()),
            AccessCheck::new("invoice", "export", Scope::Tenant).in_tenant(tenant("3")),
            AccessCheck::new("invoice", "delete", Scope::Tenant).in_tenant(tenant("3")),
        ];
        let expected: Vec<bool> = checks
            .iter()
            .map(|check| decide(&actor(), &granted, check).is_allowed())
            .collect();

        for _ in 0..granted.len() {
            granted.rotate_left(1);
            let outcome: Vec<bool> = checks
                .iter()
                .map(|check| decide(&actor(), &granted, check).is_allowed())
                .collect();
            assert_eq!(outcome, expected);
        }
        granted.reverse();
        let outcome: Vec<bool> = checks
            .iter()
            .map(|check| decide(&actor(), &granted, check).is_allowed())
            .collect();
        assert_eq!(outcome, vec![true, true, false]);
        assert_eq!(outcome, expected);
    }

    #[test]
    fn unauthenticated_actor_should_be_denied() {
        let granted = [perm("*:*:global")];
        let check = AccessCheck::new("profile", "read", Scope::Global);

        let decision = decide(&ActorContext::anonymous(), &granted, &check);
        assert_eq!(decision.deny_reason(), Some(DenyReason::Unauthenticated));
    }

    #[test]
    fn empty_bundle_should_deny() {
        let check = AccessCheck::new("profile", "read", Scope::Own).on_target(target("7"));
        assert_eq!(
            decide(&actor(), &[], &check).deny_reason(),
            Some(DenyReason::NoMatchingPermission)
        );
    }
}
