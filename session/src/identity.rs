//! Identity and data service abstraction
//!
//! The session flow only needs four things from the backend: a password grant, a way to install a
//! token pair as the active session, read/bootstrap access to the role table and a push
//! notification whenever the active session changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::role::Role;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Error reported by the identity provider, carrying its message verbatim
    #[error("{0}")]
    Auth(String),
    /// The caller is not allowed to perform the operation
    #[error("Unauthorized")]
    Unauthorized,
    /// Service could not be reached or failed internally
    #[error("Identity service unavailable: {0}")]
    Unavailable(String),
    /// Service answered with something that can't be interpreted
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl IdentityError {
    /// Transient failures are expected to go away on their own - network trouble, timeouts and
    /// server side errors.
    pub fn is_transient(&self) -> bool {
        matches!(self, IdentityError::Unavailable(_))
    }
}

/// Newtype for the identity provider user id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Authenticated user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: UserId,
    pub email: String,
}

/// Result of a successful credential exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: AuthUser,
    pub access_token: String,
    pub refresh_token: String,
}

/// Row of the authorization table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRow {
    pub user_id: UserId,
    pub email: String,
    /// Role can be unset in the table, consumers default it to `viewer`
    pub role: Option<Role>,
}

/// Kind of the session change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    /// Session known at the moment of subscribing
    InitialSession,
    SignedIn,
    TokenRefreshed,
    SignedOut,
}

/// Session change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    /// User owning the session after the change, `None` if there is no session
    pub user: Option<AuthUser>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, user: Option<AuthUser>) -> Self {
        Self { kind, user }
    }
}

/// Stream of session changes
pub type AuthEvents = mpsc::UnboundedReceiver<AuthEvent>;

/// Backend the session flow is talking to
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Exchanges email and password for a token pair
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Credentials, IdentityError>;

    /// Makes the token pair the active authority for subsequent calls
    ///
    /// Returns the installed credentials. Implementations may transparently refresh the pair if
    /// the access token is no longer accepted, in which case the returned tokens differ from the
    /// passed ones.
    async fn set_session(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<Credentials, IdentityError>;

    /// Closes the active session
    async fn sign_out(&self) -> Result<(), IdentityError>;

    /// Reads the role row of the user, `Ok(None)` if there is no such row
    async fn fetch_role(&self, user_id: UserId) -> Result<Option<RoleRow>, IdentityError>;

    /// Creates the default `viewer` row for the user, doing nothing if the row already exists
    async fn bootstrap_role(&self, user: &AuthUser) -> Result<(), IdentityError>;

    /// Subscribes to session changes
    ///
    /// Implementations should deliver `InitialSession` with the session known at the time of
    /// subscribing as the first event.
    fn subscribe(&self) -> AuthEvents;
}
