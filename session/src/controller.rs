//! Session state machine
//!
//! The controller reconciles two independent credential sources: the persisted credential record
//! recovered at start and the identity service session change stream. Every producer (recovery,
//! listener, sign in, sign out and the recovery timer) publishes into a single update channel. The
//! only consumer is the driver task owning the state, which exposes it through a `watch`
//! channel.
//!
//! Each producer takes a ticket (epoch) from a shared counter when it starts. The driver applies
//! an update only if no update with a newer epoch has been applied before, so the most recently
//! started producer wins regardless of the order in which the producers finish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::config::{ColdStartRoleFailure, ConfigError, SessionConfig};
use crate::identity::{AuthUser, IdentityError, IdentityService};
use crate::resolver::RoleResolver;
use crate::role::Role;
use crate::store::{CredentialRecord, Storage, TokenStore};

/// Shown instead of the identity provider message for rejected credentials
pub const INVALID_CREDENTIALS_MESSAGE: &str = "Incorrect email or password. Please try again.";

/// Shown instead of the identity provider message for unconfirmed accounts
pub const EMAIL_NOT_CONFIRMED_MESSAGE: &str =
    "Please confirm your email address using the link we sent you before signing in.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignInError {
    #[error("Sign in failed: {0}")]
    Credentials(#[source] IdentityError),
    #[error("Cannot establish session: {0}")]
    Session(#[source] IdentityError),
}

impl SignInError {
    /// Message suitable for the sign in form
    pub fn user_message(&self) -> String {
        let (SignInError::Credentials(err) | SignInError::Session(err)) = self;
        friendly_message(&err.to_string())
    }
}

/// Replaces known identity provider messages with friendlier copy
pub fn friendly_message(raw: &str) -> String {
    if raw.contains("Invalid login credentials") {
        INVALID_CREDENTIALS_MESSAGE.to_owned()
    } else if raw.contains("Email not confirmed") {
        EMAIL_NOT_CONFIRMED_MESSAGE.to_owned()
    } else {
        raw.to_owned()
    }
}

/// Who is the current user and what can they do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Controller not started yet
    Uninitialized,
    /// Waiting for the session to be recovered or established
    Recovering,
    Anonymous,
    Authenticated { user: AuthUser, role: Role },
}

impl SessionState {
    /// Definitive states, the ones the UI may act on
    pub fn is_settled(&self) -> bool {
        match self {
            SessionState::Uninitialized | SessionState::Recovering => false,
            SessionState::Anonymous | SessionState::Authenticated { .. } => true,
        }
    }

    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            SessionState::Authenticated { user, .. } => Some(user),
            SessionState::Uninitialized | SessionState::Recovering | SessionState::Anonymous => {
                None
            }
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            SessionState::Authenticated { role, .. } => Some(*role),
            SessionState::Uninitialized | SessionState::Recovering | SessionState::Anonymous => {
                None
            }
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Uninitialized => f.write_str("uninitialized"),
            SessionState::Recovering => f.write_str("recovering"),
            SessionState::Anonymous => f.write_str("anonymous"),
            SessionState::Authenticated { user, role } => {
                write!(f, "authenticated({role}) as {}", user.email)
            }
        }
    }
}

/// Definitive outcome of a producer
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Anonymous,
    Authenticated(AuthUser, Role),
}

impl From<Outcome> for SessionState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Anonymous => SessionState::Anonymous,
            Outcome::Authenticated(user, role) => SessionState::Authenticated { user, role },
        }
    }
}

#[derive(Debug)]
enum Update {
    /// Producer started establishing a session
    Begin,
    Settle(Outcome),
    /// Recovery started with the epoch took too long
    RecoveryDeadline,
}

struct Envelope {
    epoch: u64,
    update: Update,
    /// Notified once the update is processed
    ack: Option<oneshot::Sender<()>>,
}

/// State shared between the controller and its tasks
struct Shared {
    identity: Arc<dyn IdentityService>,
    store: TokenStore,
    resolver: RoleResolver,
    config: SessionConfig,
    epoch: AtomicU64,
    alive: AtomicBool,
    updates: mpsc::UnboundedSender<Envelope>,
}

impl Shared {
    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Publishes the update without waiting for it to be applied
    fn publish(&self, epoch: u64, update: Update) {
        if !self.is_alive() {
            debug!(epoch, ?update, "Controller shut down, dropping update");
            return;
        }

        let _ = self.updates.send(Envelope {
            epoch,
            update,
            ack: None,
        });
    }

    /// Publishes the update and waits until the driver processes it
    async fn apply(&self, epoch: u64, update: Update) {
        if !self.is_alive() {
            debug!(epoch, ?update, "Controller shut down, dropping update");
            return;
        }

        let (ack, processed) = oneshot::channel();
        let envelope = Envelope {
            epoch,
            update,
            ack: Some(ack),
        };

        if self.updates.send(envelope).is_ok() {
            let _ = processed.await;
        }
    }

    /// Cold start: recover the persisted session or fall back to the session change stream
    async fn recover(self: Arc<Self>, epoch: u64) {
        match self.store.load() {
            Some(record) if self.store.is_expired(&record) => {
                info!(user = %record.user.id, "Persisted session expired, purging");
                self.store.clear();
            }
            Some(record) => {
                let outcome = self.install(record).await;
                self.publish(epoch, Update::Settle(outcome));
                return;
            }
            None => debug!("No persisted session"),
        }

        self.listen().await;
    }

    /// Installs the persisted record as the active session and resolves the role
    #[instrument(skip_all, fields(user = %record.user.id))]
    async fn install(&self, record: CredentialRecord) -> Outcome {
        let installed = self
            .identity
            .set_session(&record.access_token, &record.refresh_token)
            .await;

        let credentials = match installed {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(%err, "Cannot install persisted session, purging");
                self.store.clear();
                return Outcome::Anonymous;
            }
        };

        if credentials.access_token != record.access_token
            || credentials.refresh_token != record.refresh_token
        {
            // Refreshed tokens keep the original login time, the ceiling is absolute
            let refreshed = CredentialRecord::issued_at(credentials.clone(), record.login_timestamp);
            if let Err(err) = self.store.save(&refreshed) {
                warn!(%err, "Cannot persist refreshed tokens");
            }
        }

        let user = credentials.user;
        match self.resolver.try_resolve(&user).await {
            Ok(role) => Outcome::Authenticated(user, role),
            Err(err) => match self.config.cold_start_role_failure {
                ColdStartRoleFailure::Purge => {
                    warn!(%err, "Role lookup failed on recovered session, purging");
                    self.store.clear();
                    Outcome::Anonymous
                }
                ColdStartRoleFailure::Fallback => {
                    warn!(%err, "Role lookup failed on recovered session, using viewer");
                    Outcome::Authenticated(user, Role::Viewer)
                }
            },
        }
    }

    /// Follows the session change stream until it closes
    async fn listen(self: Arc<Self>) {
        let mut events = self.identity.subscribe();
        let mut resolutions = JoinSet::new();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };

                    let epoch = self.next_epoch();
                    debug!(epoch, kind = ?event.kind, "Session change");
                    match event.user {
                        None => self.publish(epoch, Update::Settle(Outcome::Anonymous)),
                        Some(user) => {
                            let shared = self.clone();
                            resolutions.spawn(async move {
                                let role = shared.resolver.resolve(&user).await;
                                shared.publish(epoch, Update::Settle(Outcome::Authenticated(user, role)));
                            });
                        }
                    }
                }
                Some(_) = resolutions.join_next(), if !resolutions.is_empty() => {}
            }
        }

        debug!("Session change stream closed");
        while resolutions.join_next().await.is_some() {}
    }

    /// Forces the anonymous state if the recovery didn't settle in time
    async fn recovery_deadline(self: Arc<Self>, mut state: watch::Receiver<SessionState>, epoch: u64) {
        let timeout = self.config.recovery_timeout();
        let settled = tokio::time::timeout(timeout, async move {
            let _ = state.wait_for(SessionState::is_settled).await;
        })
        .await;

        if settled.is_err() {
            self.publish(epoch, Update::RecoveryDeadline);
        }
    }
}

/// Owns the state, the only place where it changes
async fn drive(
    shared: Arc<Shared>,
    mut updates: mpsc::UnboundedReceiver<Envelope>,
    state: watch::Sender<SessionState>,
) {
    // Newest epoch applied so far
    let mut applied = 0;
    // Epoch of the producer which moved the state to `Recovering`
    let mut begun_by = 0;

    while let Some(Envelope { epoch, update, ack }) = updates.recv().await {
        if !shared.is_alive() {
            break;
        }

        match update {
            Update::RecoveryDeadline => {
                let recovering = matches!(
                    *state.borrow(),
                    SessionState::Uninitialized | SessionState::Recovering
                );
                if recovering && begun_by == epoch {
                    // Whatever is still in flight is late now
                    applied = shared.next_epoch();
                    warn!("Session recovery timed out, continuing anonymously");
                    state.send_replace(SessionState::Anonymous);
                }
            }
            update if epoch < applied => {
                debug!(epoch, applied, ?update, "Discarding stale session update");
            }
            Update::Begin => {
                applied = epoch;
                begun_by = epoch;
                state.send_replace(SessionState::Recovering);
            }
            Update::Settle(outcome) => {
                applied = epoch;
                let next = SessionState::from(outcome);
                if *state.borrow() != next {
                    info!(state = %next, "Session state changed");
                }
                state.send_replace(next);
            }
        }

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}

/// The single source of truth about the current user
///
/// Must be created within a Tokio runtime. Dropping the controller stops all its tasks, results
/// arriving later are discarded.
pub struct SessionController {
    shared: Arc<Shared>,
    state: watch::Receiver<SessionState>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        storage: Arc<dyn Storage>,
        config: SessionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let store = TokenStore::with_ttl(storage, config.session_ttl());
        let resolver = RoleResolver::new(identity.clone(), config.role_fetch_timeout());
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Uninitialized);

        let shared = Arc::new(Shared {
            identity,
            store,
            resolver,
            config,
            epoch: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            updates,
        });

        let driver = tokio::spawn(drive(shared.clone(), updates_rx, state_tx));

        Ok(Self {
            shared,
            state,
            started: AtomicBool::new(false),
            tasks: Mutex::new(vec![driver]),
        })
    }

    /// Current state snapshot
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.shared.store
    }

    /// Starts the session recovery, only the first call has any effect
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let epoch = self.shared.next_epoch();
        info!(epoch, "Starting session recovery");
        self.shared.publish(epoch, Update::Begin);

        let deadline = tokio::spawn(
            self.shared
                .clone()
                .recovery_deadline(self.state.clone(), epoch),
        );
        let recovery = tokio::spawn(self.shared.clone().recover(epoch));

        let mut tasks = self.tasks.lock();
        tasks.push(deadline);
        tasks.push(recovery);
    }

    /// Waits until the state is definitive
    pub async fn settled(&self) -> SessionState {
        let mut state = self.state.clone();
        let _ = state.wait_for(SessionState::is_settled).await;
        let settled = state.borrow().clone();
        settled
    }

    /// Interactive sign in
    ///
    /// The state is `Authenticated` by the time this returns successfully, without waiting for the
    /// session change stream.
    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Role, SignInError> {
        let shared = &self.shared;
        let epoch = shared.next_epoch();
        shared.apply(epoch, Update::Begin).await;

        let credentials = match shared.identity.sign_in_with_password(email, password).await {
            Ok(credentials) => credentials,
            Err(err) => {
                info!(%err, "Sign in rejected");
                shared.apply(epoch, Update::Settle(Outcome::Anonymous)).await;
                return Err(SignInError::Credentials(err));
            }
        };

        if let Err(err) = shared.store.save(&CredentialRecord::new(credentials.clone())) {
            warn!(%err, "Cannot persist credentials, the session won't survive a restart");
        }

        let installed = shared
            .identity
            .set_session(&credentials.access_token, &credentials.refresh_token)
            .await;
        let credentials = match installed {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(%err, "Cannot install new session");
                shared.store.clear();
                shared.apply(epoch, Update::Settle(Outcome::Anonymous)).await;
                return Err(SignInError::Session(err));
            }
        };

        let role = shared.resolver.resolve(&credentials.user).await;
        shared
            .apply(
                epoch,
                Update::Settle(Outcome::Authenticated(credentials.user, role)),
            )
            .await;

        Ok(role)
    }

    /// Signs out, locally first
    ///
    /// The local state is anonymous and the credential record is gone no matter how the remote
    /// sign out ends.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) {
        let shared = &self.shared;
        let epoch = shared.next_epoch();
        shared.apply(epoch, Update::Settle(Outcome::Anonymous)).await;
        shared.store.clear();

        if let Err(err) = shared.identity.sign_out().await {
            warn!(%err, "Remote sign out failed, local session already cleared");
        }
    }

    /// Stops all the tasks, further results are discarded
    pub fn shutdown(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &*self.state.borrow())
            .finish()
    }
}
