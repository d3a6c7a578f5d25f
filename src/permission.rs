use crate::error::{Error, Result};
use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wildcard token accepted in any permission component.
pub const WILDCARD: &str = "*";

const TARGET_SEPARATOR: char = '#';

/// Permission scope, ordered from narrowest to broadest.
///
/// A grant at scope `S` satisfies any request at a scope `<= S`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Only entities owned by the actor.
    Own,
    /// Entities of the actor's account.
    Account,
    /// Entities of the actor's tenant.
    Tenant,
    /// Everything on the platform.
    Global,
}

impl Scope {
    /// All scopes in ascending order.
    pub const ALL: [Scope; 4] = [Scope::Own, Scope::Account, Scope::Tenant, Scope::Global];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Own => "own",
            Scope::Account => "account",
            Scope::Tenant => "tenant",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "own" => Ok(Scope::Own),
            "account" => Ok(Scope::Account),
            "tenant" => Ok(Scope::Tenant),
            "global" => Ok(Scope::Global),
            other => Err(Error::InvalidPermission(format!("unknown scope `{other}`"))),
        }
    }
}

/// Scope component of a granted permission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopePattern {
    /// `*`: matches any requested scope.
    Any,
    /// A concrete scope and everything narrower.
    Exact(Scope),
}

impl ScopePattern {
    /// Returns true when a grant with this pattern reaches the requested scope.
    pub fn covers(self, requested: Scope) -> bool {
        match self {
            ScopePattern::Any => true,
            ScopePattern::Exact(granted) => requested <= granted,
        }
    }
}

impl fmt::Display for ScopePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopePattern::Any => f.write_str(WILDCARD),
            ScopePattern::Exact(scope) => scope.fmt(f),
        }
    }
}

impl FromStr for ScopePattern {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        if value.trim() == WILDCARD {
            return Ok(ScopePattern::Any);
        }
        value.parse().map(ScopePattern::Exact)
    }
}

impl From<Scope> for ScopePattern {
    fn from(scope: Scope) -> Self {
        ScopePattern::Exact(scope)
    }
}

/// A granted permission: `(resource, action, scope)` plus an optional target.
///
/// The textual form is `resource:action:scope[#target]`, e.g.
/// `profile:update:own` or `listing:edit:tenant#42`. Any of the three
/// components may be `*`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission {
    resource: String,
    action: String,
    scope: ScopePattern,
    target_id: Option<EntityId>,
}

impl Permission {
    /// Builds a validated permission from its components.
    ///
    /// Resource and action are trimmed and lowercased.
    pub fn new(
        resource: impl AsRef<str>,
        action: impl AsRef<str>,
        scope: impl Into<ScopePattern>,
    ) -> Result<Self> {
        Ok(Self {
            resource: normalize_segment(resource.as_ref(), "resource")?,
            action: normalize_segment(action.as_ref(), "action")?,
            scope: scope.into(),
            target_id: None,
        })
    }

    /// Parses the `resource:action:scope[#target]` form.
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidPermission(
                "permission must not be empty".to_string(),
            ));
        }
        let (body, target) = match trimmed.split_once(TARGET_SEPARATOR) {
            Some((body, target)) => (body, Some(EntityId::new(target)?)),
            None => (trimmed, None),
        };
        let mut parts = body.split(':');
        let (Some(resource), Some(action), Some(scope), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidPermission(
                "permission must be in resource:action:scope format".to_string(),
            ));
        };
        let mut permission = Self::new(resource, action, scope.parse::<ScopePattern>()?)?;
        permission.target_id = target;
        Ok(permission)
    }

    /// Binds the permission to a single target entity.
    pub fn with_target(mut self, target_id: EntityId) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn scope(&self) -> ScopePattern {
        self.scope
    }

    pub fn target_id(&self) -> Option<&EntityId> {
        self.target_id.as_ref()
    }

    /// Returns true when any component is a wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.resource == WILDCARD || self.action == WILDCARD || self.scope == ScopePattern::Any
    }

    /// Structural match of resource and action (wildcards honoured).
    pub(crate) fn matches_operation(&self, resource: &str, action: &str) -> bool {
        component_matches(&self.resource, resource) && component_matches(&self.action, action)
    }

    /// A target-bound grant only matches checks naming the same target.
    pub(crate) fn matches_target(&self, target: Option<&EntityId>) -> bool {
        match &self.target_id {
            None => true,
            Some(bound) => target == Some(bound),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.resource, self.action, self.scope)?;
        if let Some(target) = &self.target_id {
            write!(f, "{TARGET_SEPARATOR}{target}")?;
        }
        Ok(())
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for Permission {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Permission {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Permission> for String {
    fn from(permission: Permission) -> Self {
        permission.to_string()
    }
}

fn normalize_segment(value: &str, kind: &str) -> Result<String> {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(Error::InvalidPermission(format!(
            "{kind} segment must not be empty"
        )));
    }
    if !is_valid_segment(&normalized) {
        return Err(Error::InvalidPermission(format!(
            "{kind} segment contains invalid characters"
        )));
    }
    Ok(normalized)
}

fn is_valid_segment(segment: &str) -> bool {
    if segment == WILDCARD {
        return true;
    }
    segment
        .chars()
        .all(|ch| matches!(ch, 'a'..='z' | '0'..='9' | '_' | '-' | '.'))
}

fn component_matches(granted: &str, requested: &str) -> bool {
    granted == WILDCARD || granted == requested
}
