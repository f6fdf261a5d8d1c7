//! Scripted in-memory identity service for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::identity::{
    AuthEvent, AuthEventKind, AuthEvents, AuthUser, Credentials, IdentityError, IdentityService,
    RoleRow, UserId,
};
use crate::role::Role;

/// Builds a user with a random id
pub fn user(email: &str) -> AuthUser {
    AuthUser {
        id: UserId::random(),
        email: email.to_owned(),
    }
}

/// How role reads misbehave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleFailure {
    #[default]
    None,
    Unavailable,
    Rejected,
    /// Never answers
    Hang,
}

struct Account {
    user: AuthUser,
    password: String,
    confirmed: bool,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    tokens: HashMap<String, AuthUser>,
    active: Option<Credentials>,
    roles: HashMap<UserId, RoleRow>,
    subscribers: Vec<mpsc::UnboundedSender<AuthEvent>>,
    /// Senders of listeners that never get any event
    muted: Vec<mpsc::UnboundedSender<AuthEvent>>,
    role_failure: RoleFailure,
    role_delay: Option<Duration>,
    session_delay: Option<Duration>,
    fail_bootstrap: bool,
    hang_bootstrap: bool,
    fail_set_session: bool,
    fail_sign_out: bool,
    silent_listener: bool,
    revoked: HashSet<String>,
}

#[derive(Default)]
pub struct FakeIdentity {
    state: Mutex<State>,
    bootstrap_calls: AtomicUsize,
    role_reads: AtomicUsize,
}

impl FakeIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account able to sign in with the password
    pub fn register(&self, email: &str, password: &str) -> AuthUser {
        self.register_with(email, password, true)
    }

    pub fn register_with(&self, email: &str, password: &str, confirmed: bool) -> AuthUser {
        let account = Account {
            user: user(email),
            password: password.to_owned(),
            confirmed,
        };
        let user = account.user.clone();
        self.state.lock().accounts.insert(email.to_owned(), account);
        user
    }

    /// Issues a token pair accepted by `set_session`
    pub fn issue(&self, user: &AuthUser) -> Credentials {
        let credentials = Credentials {
            user: user.clone(),
            access_token: format!("access-{}", Uuid::new_v4()),
            refresh_token: format!("refresh-{}", Uuid::new_v4()),
        };
        self.state
            .lock()
            .tokens
            .insert(credentials.access_token.clone(), user.clone());
        credentials
    }

    /// Makes the access token unacceptable
    pub fn revoke(&self, access_token: &str) {
        self.state.lock().revoked.insert(access_token.to_owned());
    }

    pub fn insert_role(&self, user: &AuthUser, role: Option<Role>) {
        self.state.lock().roles.insert(
            user.id,
            RoleRow {
                user_id: user.id,
                email: user.email.clone(),
                role,
            },
        );
    }

    /// Role row of the user, `None` if there is no row
    pub fn role_of(&self, user: &AuthUser) -> Option<Option<Role>> {
        self.state.lock().roles.get(&user.id).map(|row| row.role)
    }

    pub fn role_rows(&self) -> usize {
        self.state.lock().roles.len()
    }

    pub fn bootstrap_calls(&self) -> usize {
        self.bootstrap_calls.load(Ordering::SeqCst)
    }

    pub fn role_reads(&self) -> usize {
        self.role_reads.load(Ordering::SeqCst)
    }

    pub fn fail_roles(&self, failure: RoleFailure) {
        self.state.lock().role_failure = failure;
    }

    pub fn delay_roles(&self, delay: Duration) {
        self.state.lock().role_delay = Some(delay);
    }

    pub fn delay_set_session(&self, delay: Duration) {
        self.state.lock().session_delay = Some(delay);
    }

    pub fn fail_bootstrap(&self, fail: bool) {
        self.state.lock().fail_bootstrap = fail;
    }

    /// Bootstrap writes never finish
    pub fn hang_bootstrap(&self, hang: bool) {
        self.state.lock().hang_bootstrap = hang;
    }

    pub fn fail_set_session(&self, fail: bool) {
        self.state.lock().fail_set_session = fail;
    }

    pub fn fail_sign_out(&self, fail: bool) {
        self.state.lock().fail_sign_out = fail;
    }

    /// Subscriptions never receive anything, not even the initial session
    pub fn silent_listener(&self, silent: bool) {
        self.state.lock().silent_listener = silent;
    }

    /// Access token of the active session
    pub fn active_access_token(&self) -> Option<String> {
        self.state
            .lock()
            .active
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    /// Pushes the event to all subscribers
    pub fn emit(&self, event: AuthEvent) {
        let mut state = self.state.lock();
        state
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl IdentityService for FakeIdentity {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Credentials, IdentityError> {
        let user = {
            let state = self.state.lock();
            match state.accounts.get(email) {
                Some(account) if account.password == password && !account.confirmed => {
                    return Err(IdentityError::Auth("Email not confirmed".to_owned()));
                }
                Some(account) if account.password == password => account.user.clone(),
                _ => return Err(IdentityError::Auth("Invalid login credentials".to_owned())),
            }
        };

        Ok(self.issue(&user))
    }

    async fn set_session(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<Credentials, IdentityError> {
        let delay = self.state.lock().session_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let credentials = {
            let mut state = self.state.lock();
            if state.fail_set_session {
                return Err(IdentityError::Unavailable("connection reset".to_owned()));
            }
            if state.revoked.contains(access_token) {
                return Err(IdentityError::Auth("Invalid Refresh Token".to_owned()));
            }

            let user = state
                .tokens
                .get(access_token)
                .cloned()
                .ok_or(IdentityError::Unauthorized)?;
            let credentials = Credentials {
                user,
                access_token: access_token.to_owned(),
                refresh_token: refresh_token.to_owned(),
            };
            state.active = Some(credentials.clone());
            credentials
        };

        self.emit(AuthEvent::new(
            AuthEventKind::SignedIn,
            Some(credentials.user.clone()),
        ));
        Ok(credentials)
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        {
            let mut state = self.state.lock();
            if state.fail_sign_out {
                return Err(IdentityError::Unavailable("connection reset".to_owned()));
            }
            state.active = None;
        }

        self.emit(AuthEvent::new(AuthEventKind::SignedOut, None));
        Ok(())
    }

    async fn fetch_role(&self, user_id: UserId) -> Result<Option<RoleRow>, IdentityError> {
        self.role_reads.fetch_add(1, Ordering::SeqCst);
        let (failure, delay) = {
            let state = self.state.lock();
            (state.role_failure, state.role_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            RoleFailure::None => Ok(self.state.lock().roles.get(&user_id).cloned()),
            RoleFailure::Unavailable => Err(IdentityError::Unavailable("timeout".to_owned())),
            RoleFailure::Rejected => Err(IdentityError::Unauthorized),
            RoleFailure::Hang => std::future::pending().await,
        }
    }

    async fn bootstrap_role(&self, user: &AuthUser) -> Result<(), IdentityError> {
        self.bootstrap_calls.fetch_add(1, Ordering::SeqCst);
        let hang = self.state.lock().hang_bootstrap;
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if state.fail_bootstrap {
            return Err(IdentityError::Unavailable("insert failed".to_owned()));
        }

        state.roles.entry(user.id).or_insert_with(|| RoleRow {
            user_id: user.id,
            email: user.email.clone(),
            role: Some(Role::Viewer),
        });
        Ok(())
    }

    fn subscribe(&self) -> AuthEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if state.silent_listener {
            state.muted.push(tx);
            return rx;
        }

        let current = state.active.as_ref().map(|c| c.user.clone());
        let _ = tx.send(AuthEvent::new(AuthEventKind::InitialSession, current));
        state.subscribers.push(tx);
        rx
    }
}
