use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

const MAX_NAME_LEN: usize = 128;

fn validate_simple_name(value: &str, kind: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::InvalidId(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if !trimmed.chars().all(is_allowed_name_char) {
        return Err(Error::InvalidId(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}

// `:` separates key segments in the shared store, so it never appears in ids.
fn is_allowed_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '@')
}

macro_rules! define_id_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a validated identifier.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                validate_simple_name(value.as_ref(), $kind).map(Self)
            }

            /// Creates an identifier from a trusted string without validation.
            pub fn from_string(value: String) -> Self {
                Self(value)
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from_string(value)
            }
        }
    };
}

define_id_type!(
    /// Tenant identifier.
    TenantId,
    "tenant id"
);
define_id_type!(
    /// Account identifier (a sub-unit of a tenant).
    AccountId,
    "account id"
);
define_id_type!(
    /// Actor (user or service) identifier.
    ActorId,
    "actor id"
);
define_id_type!(
    /// Role name, unique within its tenant or within the platform.
    RoleName,
    "role name"
);
define_id_type!(
    /// Kind of lockable entity, e.g. `listing`.
    EntityType,
    "entity type"
);
define_id_type!(
    /// Identifier of an entity or permission target.
    EntityId,
    "entity id"
);

impl EntityId {
    /// Returns true when this target id names the given actor.
    pub fn refers_to(&self, actor: &ActorId) -> bool {
        self.as_str() == actor.as_str()
    }
}

/// Identity of the caller for one request.
///
/// Built once at the request boundary by the authentication collaborator and
/// passed by value through the core. Role names are informational; effective
/// grants always come from the role data store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActorContext {
    actor_id: ActorId,
    tenant_id: Option<TenantId>,
    account_id: Option<AccountId>,
    roles: Vec<RoleName>,
    authenticated: bool,
}

impl ActorContext {
    /// Creates an authenticated actor, optionally bound to a tenant.
    pub fn authenticated(actor_id: ActorId, tenant_id: Option<TenantId>) -> Self {
        Self {
            actor_id,
            tenant_id,
            account_id: None,
            roles: Vec::new(),
            authenticated: true,
        }
    }

    /// Creates an unauthenticated context. Every check against it is denied.
    pub fn anonymous() -> Self {
        Self {
            actor_id: ActorId::from_string("anonymous".to_string()),
            tenant_id: None,
            account_id: None,
            roles: Vec::new(),
            authenticated: false,
        }
    }

    /// Sets the account the actor belongs to.
    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Sets the role names reported by the authentication collaborator.
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = RoleName>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    pub fn account_id(&self) -> Option<&AccountId> {
        self.account_id.as_ref()
    }

    pub fn roles(&self) -> &[RoleName] {
        &self.roles
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_should_trim_input() {
        let tenant = TenantId::try_from("  tenant_1 ").unwrap();
        assert_eq!(tenant.as_str(), "tenant_1");
    }

    #[test]
    fn ids_should_reject_key_separator() {
        let err = ActorId::try_from("admin:7").expect_err("must reject");
        assert!(err.to_string().contains("actor id"));
    }

    #[test]
    fn ids_should_reject_empty_input() {
        let err = EntityType::try_from("   ").expect_err("must reject");
        assert!(err.to_string().contains("entity type"));
    }

    #[test]
    fn entity_id_should_refer_to_matching_actor() {
        let actor = ActorId::try_from("7").unwrap();
        assert!(EntityId::try_from("7").unwrap().refers_to(&actor));
        assert!(!EntityId::try_from("9").unwrap().refers_to(&actor));
    }

    #[test]
    fn anonymous_context_should_not_be_authenticated() {
        let actor = ActorContext::anonymous();
        assert!(!actor.is_authenticated());
        assert!(actor.tenant_id().is_none());
    }
}
