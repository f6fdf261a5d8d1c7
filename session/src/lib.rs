//! Session establishment and role resolution for the RTG operations client
//!
//! [`SessionController`] recovers the persisted session on start, follows the identity service
//! session changes and resolves the user role through [`RoleResolver`]. Views and operations are
//! gated on its state with [`RouteGuard`].

pub mod config;
pub mod controller;
pub mod guard;
pub mod identity;
pub mod remote;
pub mod resolver;
pub mod role;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{ColdStartRoleFailure, ConfigError, GuardConfig, SessionConfig};
pub use controller::{SessionController, SessionState, SignInError};
pub use guard::{GuardDecision, RouteGuard};
pub use identity::{
    AuthEvent, AuthEventKind, AuthEvents, AuthUser, Credentials, IdentityError, IdentityService,
    RoleRow, UserId,
};
pub use remote::RemoteIdentity;
pub use resolver::{RoleError, RoleResolver};
pub use role::{Role, RoleRequirement, UnknownRole};
pub use store::{CredentialRecord, FileStorage, MemoryStorage, Storage, StorageError, TokenStore};
