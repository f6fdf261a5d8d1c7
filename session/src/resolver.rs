//! Role resolution
//!
//! The authorization table may lag behind the identity provider (new accounts have no row yet)
//! and may be slow or unreachable. Resolution never blocks longer than the configured timeout and
//! settles on the low privileged `viewer` role whenever the real one can't be determined.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::identity::{AuthUser, IdentityError, IdentityService};
use crate::role::Role;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoleError {
    /// Role lookup was refused or answered with garbage
    #[error("Role lookup rejected: {0}")]
    Rejected(#[source] IdentityError),
}

/// Maps users to their roles
#[derive(Clone)]
pub struct RoleResolver {
    identity: Arc<dyn IdentityService>,
    timeout: Duration,
}

impl RoleResolver {
    pub fn new(identity: Arc<dyn IdentityService>, timeout: Duration) -> Self {
        Self { identity, timeout }
    }

    /// Resolves the user role, always producing one
    pub async fn resolve(&self, user: &AuthUser) -> Role {
        match self.try_resolve(user).await {
            Ok(role) => role,
            Err(err) => {
                warn!(user = %user.id, %err, "Role lookup failed, falling back to viewer");
                Role::Viewer
            }
        }
    }

    /// Resolves the user role, reporting hard lookup failures
    ///
    /// Missing rows are bootstrapped, transient failures and timeouts resolve to `viewer`. Only
    /// failures that retrying wouldn't fix are returned as errors. The read and the bootstrap
    /// share a single deadline.
    #[instrument(skip(self, user), fields(user = %user.id))]
    pub async fn try_resolve(&self, user: &AuthUser) -> Result<Role, RoleError> {
        match tokio::time::timeout(self.timeout, self.lookup(user)).await {
            Ok(role) => role,
            Err(_) => {
                warn!(timeout = ?self.timeout, "Role lookup timed out, using viewer");
                Ok(Role::Viewer)
            }
        }
    }

    async fn lookup(&self, user: &AuthUser) -> Result<Role, RoleError> {
        match self.identity.fetch_role(user.id).await {
            Ok(Some(row)) => Ok(row.role.unwrap_or_default()),
            Ok(None) => {
                self.bootstrap(user).await;
                Ok(Role::Viewer)
            }
            Err(err) if err.is_transient() => {
                warn!(%err, "Role lookup failed, using viewer");
                Ok(Role::Viewer)
            }
            Err(err) => Err(RoleError::Rejected(err)),
        }
    }

    /// Best effort creation of the default row for a user seen for the first time
    async fn bootstrap(&self, user: &AuthUser) {
        match self.identity.bootstrap_role(user).await {
            Ok(()) => info!("Bootstrapped viewer role row"),
            Err(err) => warn!(%err, "Cannot bootstrap role row"),
        }
    }
}
