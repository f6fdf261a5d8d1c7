//! Authorization roles

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown role {0:?}")]
pub struct UnknownRole(pub String);

/// Coarse grained authorization level
///
/// Ordered from the least to the most privileged, so `Role::Admin > Role::Operator` holds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only access, also the fail-safe default
    #[default]
    Viewer,
    /// Can record operations on the work orders
    Operator,
    /// Full access including role management
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Viewer, Role::Operator, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            _ => Err(UnknownRole(s.to_owned())),
        }
    }
}

/// Role predicate attached to a guarded view or operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleRequirement {
    /// Any authenticated user
    #[default]
    Any,
    OperatorOrAdmin,
    AdminOnly,
}

impl RoleRequirement {
    /// Checks if the role satisfies this requirement
    pub fn allows(self, role: Role) -> bool {
        match self {
            RoleRequirement::Any => true,
            RoleRequirement::OperatorOrAdmin => matches!(role, Role::Operator | Role::Admin),
            RoleRequirement::AdminOnly => role == Role::Admin,
        }
    }
}
