//! Session store: the single source of truth for "can we authenticate".
//!
//! Owns the current credential and its resolution state, persists it across
//! restarts, and fans state transitions out to subscribers. The store never
//! talks to the network itself; identity confirmation goes through an
//! attached [`IdentityConfirmer`] (the transport client), and concurrent
//! confirmation attempts are coalesced so exactly one request goes out.
//!
//! State machine:
//!
//! ```text
//! SignedOut ──initialize(credential)──► Pending ──confirm──► SignedIn
//!     ▲                                    │                     │
//!     └────────────── invalidate ──────────┴─────────────────────┘
//! ```
//!
//! A failed confirmation leaves the state `Pending`: the confirmation
//! endpoint rejects brand-new accounts with a client error, so failure
//! there proves nothing about the credential. Only an authoritative
//! unauthenticated response (or explicit sign-out) reaches `SignedOut`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::storage::{keys, KeyValueStore};

/// Placeholder written where an identity is expected but the real one has
/// not resolved yet. A tombstone, never a normal value: the claim protocol
/// treats it as "unset" and the reconciliation pass repairs it.
pub const PENDING_IDENTITY: &str = "_pending_";

/// Opaque bearer credential proving the session to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token(pub String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stable caller id, distinct from the credential that proves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_placeholder(&self) -> bool {
        self.0 == PENDING_IDENTITY
    }
}

/// Current session state. `Pending` means a credential exists and is
/// provisionally trusted but the store has not yet confirmed who it
/// belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    SignedOut,
    Pending { credential: Token },
    SignedIn { credential: Token, identity: Identity },
}

impl SessionState {
    pub fn credential(&self) -> Option<&Token> {
        match self {
            SessionState::SignedOut => None,
            SessionState::Pending { credential } => Some(credential),
            SessionState::SignedIn { credential, .. } => Some(credential),
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::SignedIn { identity, .. } => Some(identity),
            _ => None,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self, SessionState::SignedIn { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, SessionState::Pending { .. })
    }
}

/// Confirms which identity the current credential belongs to.
///
/// `Ok(None)` means the store could not confirm the account yet; the
/// session stays pending. Implemented by the transport client.
#[async_trait]
pub trait IdentityConfirmer: Send + Sync {
    async fn confirm_identity(&self, credential: &Token) -> Result<Option<Identity>, StoreError>;
}

type Listener = Arc<dyn Fn(&SessionState) + Send + Sync>;

struct SessionInner {
    state: RwLock<SessionState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    store: Arc<dyn KeyValueStore>,
    confirmer: Mutex<Option<Weak<dyn IdentityConfirmer>>>,
    /// Coalesces concurrent confirmation attempts: while `Some`, a request
    /// is in flight and later callers subscribe instead of issuing another.
    confirm_in_flight: tokio::sync::RwLock<Option<broadcast::Sender<Option<Identity>>>>,
}

/// Cheap cloneable handle to the one session per running client.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

/// Subscription handle. Dropping it (or calling [`Subscription::unsubscribe`])
/// removes the listener.
pub struct Subscription {
    id: u64,
    inner: Weak<SessionInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut listeners = inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: RwLock::new(SessionState::SignedOut),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                store,
                confirmer: Mutex::new(None),
                confirm_in_flight: tokio::sync::RwLock::new(None),
            }),
        }
    }

    /// Adopt a credential at startup.
    ///
    /// A redirect-delivered credential (the caller has already stripped it
    /// from the visible navigation context) wins over a persisted one.
    /// Either way the session becomes `Pending`: confirmation is deferred,
    /// not blocking, because the confirmation endpoint is unreliable for
    /// never-before-seen accounts.
    pub fn initialize(&self, navigation_credential: Option<Token>) {
        if let Some(credential) = navigation_credential {
            info!("adopting redirect-delivered credential");
            self.inner.store.set(keys::CREDENTIAL, credential.as_str());
            self.ensure_session_id();
            self.set_state(SessionState::Pending { credential });
            return;
        }

        if let Some(saved) = self.inner.store.get(keys::CREDENTIAL) {
            debug!("restoring persisted credential");
            self.ensure_session_id();
            self.set_state(SessionState::Pending { credential: Token(saved) });
        }
    }

    fn ensure_session_id(&self) {
        if self.inner.store.get(keys::SESSION_ID).is_none() {
            self.inner
                .store
                .set(keys::SESSION_ID, &uuid::Uuid::new_v4().to_string());
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn credential(&self) -> Option<Token> {
        self.state().credential().cloned()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state().identity().cloned()
    }

    /// Auxiliary id persisted alongside the credential, stamped into claim
    /// writes so the reconciliation pass can find its own partial work.
    pub fn session_id(&self) -> Option<String> {
        self.inner.store.get(keys::SESSION_ID)
    }

    pub fn is_signed_in(&self) -> bool {
        self.state().is_signed_in()
    }

    pub fn is_pending(&self) -> bool {
        self.state().is_pending()
    }

    /// Register a listener for state transitions. Listeners run on the
    /// transitioning task and must not synchronously re-trigger the same
    /// transition.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SessionState) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        listeners.push((id, Arc::new(listener)));
        Subscription { id, inner: Arc::downgrade(&self.inner) }
    }

    /// Wire up the component that can confirm identities. Held weakly so
    /// the transport and session do not keep each other alive.
    pub fn attach_confirmer(&self, confirmer: Weak<dyn IdentityConfirmer>) {
        let mut slot = self.inner.confirmer.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(confirmer);
    }

    /// Drop the session entirely: state to `SignedOut`, persisted credential
    /// cleared, listeners notified. Called only on an authoritative
    /// unauthenticated response or explicit sign-out.
    pub fn invalidate(&self) {
        info!("invalidating session");
        self.inner.store.remove(keys::CREDENTIAL);
        self.inner.store.remove(keys::SESSION_ID);
        self.set_state(SessionState::SignedOut);
    }

    pub fn sign_out(&self) {
        info!("explicit sign-out");
        self.invalidate();
    }

    /// Confirm `Pending -> SignedIn` now, sharing one in-flight request
    /// among concurrent callers. Idempotent: returns immediately when the
    /// session is already resolved or signed out. A failed confirmation
    /// leaves the state `Pending`.
    pub async fn resolve_identity_now(&self) -> SessionState {
        let credential = match self.state() {
            SessionState::SignedIn { .. } | SessionState::SignedOut => return self.state(),
            SessionState::Pending { credential } => credential,
        };

        enum Role {
            Leader(broadcast::Sender<Option<Identity>>),
            Follower(broadcast::Receiver<Option<Identity>>),
        }

        let role = {
            let mut slot = self.inner.confirm_in_flight.write().await;
            match slot.as_ref() {
                Some(tx) => Role::Follower(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    *slot = Some(tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                let _ = rx.recv().await;
            }
            Role::Leader(tx) => {
                let outcome = self.run_confirmation(&credential).await;
                let mut slot = self.inner.confirm_in_flight.write().await;
                *slot = None;
                drop(slot);
                let _ = tx.send(outcome);
            }
        }

        self.state()
    }

    async fn run_confirmation(&self, credential: &Token) -> Option<Identity> {
        let confirmer = {
            let slot = self.inner.confirmer.lock().unwrap_or_else(|e| e.into_inner());
            slot.as_ref().and_then(Weak::upgrade)
        };
        let Some(confirmer) = confirmer else {
            debug!("no identity confirmer attached, leaving session pending");
            return None;
        };

        match confirmer.confirm_identity(credential).await {
            Ok(Some(identity)) => {
                info!(identity = %identity.0, "identity confirmed");
                self.confirm_succeeded(identity.clone());
                Some(identity)
            }
            Ok(None) => {
                debug!("identity not confirmable yet, staying pending");
                None
            }
            Err(StoreError::SessionExpired) => {
                // Transport already invalidated the session.
                None
            }
            Err(e) => {
                warn!("identity confirmation failed, staying pending: {}", e);
                None
            }
        }
    }

    fn confirm_succeeded(&self, identity: Identity) {
        // Compare-and-set under one write lock: an invalidation that lands
        // while the confirmation request is in flight must not be
        // resurrected by this transition.
        let transitioned = {
            let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
            match &*state {
                SessionState::Pending { credential } => {
                    *state = SessionState::SignedIn {
                        credential: credential.clone(),
                        identity,
                    };
                    true
                }
                // Invalidated (or already confirmed) while the request was
                // in flight: the later transition wins.
                _ => false,
            }
        };
        if transitioned {
            self.notify();
        }
    }

    fn set_state(&self, next: SessionState) {
        {
            let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                return;
            }
            *state = next;
        }
        self.notify();
    }

    fn notify(&self) {
        let state = self.state();
        // Listeners are invoked outside the lock so one may subscribe or
        // unsubscribe without deadlocking.
        let listeners: Vec<Listener> = {
            let guard = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(&state);
        }
    }
}
