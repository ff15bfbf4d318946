//! Usage: Token pair shared by every outbound call of one authenticated client.

mod persist;

use crate::infra::token_store::{StoreError, StoredTokens, TokenStore};
use crate::shared::error::AuthFailureReason;
use crate::shared::lock_ext::{MutexExt, RwLockExt};
use crate::shared::security::mask_optional_token;
use crate::shared::time::now_unix_seconds;
use persist::{PendingWrite, StoreMirror};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

const INVALIDATION_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

impl TokenSet {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: None,
        }
    }

    pub fn with_expires_at(mut self, expires_at: Option<i64>) -> Self {
        self.expires_at = expires_at;
        self
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &mask_optional_token(Some(&self.access_token)))
            .field(
                "refresh_token",
                &mask_optional_token(self.refresh_token.as_deref()),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    /// Bumped by every set/clear; lets a refresh detect that the session moved on.
    pub generation: u64,
}

impl fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("access_token", &mask_optional_token(self.access_token.as_deref()))
            .field(
                "refresh_token",
                &mask_optional_token(self.refresh_token.as_deref()),
            )
            .field("expires_at", &self.expires_at)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    Logout,
    AuthenticationFailed(AuthFailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub reason: InvalidationReason,
    pub generation: u64,
    pub at_unix: i64,
}

type InvalidationListener = Arc<dyn Fn(&InvalidationEvent) + Send + Sync>;

#[derive(Default)]
struct SessionState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<i64>,
    generation: u64,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
            generation: self.generation,
        }
    }

    fn apply(&mut self, tokens: &TokenSet) {
        self.access_token = normalize_token(Some(&tokens.access_token));
        self.refresh_token = normalize_token(tokens.refresh_token.as_deref());
        self.expires_at = tokens.expires_at;
        self.generation = self.generation.wrapping_add(1);
    }
}

fn normalize_token(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub struct Session {
    state: RwLock<SessionState>,
    invalidation_tx: broadcast::Sender<InvalidationEvent>,
    listeners: Mutex<Vec<InvalidationListener>>,
    mirror: Option<Arc<StoreMirror>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.snapshot())
            .field("mirror", &self.mirror)
            .finish()
    }
}

impl Session {
    pub fn new() -> Self {
        let (invalidation_tx, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(SessionState::default()),
            invalidation_tx,
            listeners: Mutex::new(Vec::new()),
            mirror: None,
        }
    }

    /// Session whose every mutation is mirrored into `store`.
    ///
    /// Writes run on the tokio blocking pool (inline outside a runtime) after the
    /// session lock is released; a write superseded by a newer generation is dropped.
    pub fn with_store(store: Arc<dyn TokenStore>) -> Self {
        Self {
            mirror: Some(StoreMirror::new(store)),
            ..Self::new()
        }
    }

    /// Seed the session from the attached store. Returns whether tokens were found.
    pub fn restore_from_store(&self) -> Result<bool, StoreError> {
        let Some(mirror) = self.mirror.as_ref() else {
            return Ok(false);
        };
        let Some(stored) = mirror.store().load()? else {
            return Ok(false);
        };

        let tokens = TokenSet {
            access_token: stored.access_token,
            refresh_token: stored.refresh_token,
            expires_at: stored.expires_at,
        };
        let (generation, authenticated) = {
            let mut state = self.state.write_or_recover();
            state.apply(&tokens);
            (state.generation, state.access_token.is_some())
        };
        mirror.mark_synced(generation);
        tracing::info!(generation, "session restored from token store");
        Ok(authenticated)
    }

    /// Seed the session after a successful credential exchange.
    pub fn set_tokens(&self, access_token: &str, refresh_token: Option<&str>) -> u64 {
        self.set_token_set(&TokenSet::new(
            access_token,
            refresh_token.map(str::to_string),
        ))
    }

    pub fn set_token_set(&self, tokens: &TokenSet) -> u64 {
        let (generation, write) = {
            let mut state = self.state.write_or_recover();
            state.apply(tokens);
            (state.generation, self.pending_write(&state))
        };
        self.persist(write);
        tracing::debug!(generation, "session tokens replaced");
        generation
    }

    /// Replace the tokens only if nothing else touched the session since `expected_generation`.
    ///
    /// On mismatch the current snapshot is returned untouched.
    pub fn replace_if_generation(
        &self,
        expected_generation: u64,
        tokens: &TokenSet,
    ) -> Result<u64, SessionSnapshot> {
        let (generation, write) = {
            let mut state = self.state.write_or_recover();
            if state.generation != expected_generation {
                return Err(state.snapshot());
            }
            state.apply(tokens);
            (state.generation, self.pending_write(&state))
        };
        self.persist(write);
        Ok(generation)
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.read_or_recover().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.read_or_recover().refresh_token.clone()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.state.read_or_recover().refresh_token.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read_or_recover().access_token.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.state.read_or_recover().generation
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.read_or_recover().snapshot()
    }

    pub fn clear(&self) -> InvalidationEvent {
        self.invalidate(InvalidationReason::Logout)
    }

    /// Drop both tokens and emit exactly one [`InvalidationEvent`].
    pub fn invalidate(&self, reason: InvalidationReason) -> InvalidationEvent {
        let (event, write) = {
            let mut state = self.state.write_or_recover();
            let event = clear_locked(&mut state, reason);
            (event, self.pending_write(&state))
        };
        self.persist(write);
        self.notify(&event);
        event
    }

    /// Conditional form of [`Session::invalidate`]; a session re-seeded since
    /// `expected_generation` is left alone and `None` is returned.
    pub fn invalidate_if_generation(
        &self,
        expected_generation: u64,
        reason: InvalidationReason,
    ) -> Option<InvalidationEvent> {
        let (event, write) = {
            let mut state = self.state.write_or_recover();
            if state.generation != expected_generation {
                return None;
            }
            let event = clear_locked(&mut state, reason);
            (event, self.pending_write(&state))
        };
        self.persist(write);
        self.notify(&event);
        Some(event)
    }

    /// Resolves once the attached store reflects the current generation (or a later one).
    pub async fn store_synced(&self) {
        if let Some(mirror) = self.mirror.as_ref() {
            mirror.wait_synced(self.generation()).await;
        }
    }

    pub fn subscribe_invalidation(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.invalidation_tx.subscribe()
    }

    pub fn on_invalidated(&self, listener: impl Fn(&InvalidationEvent) + Send + Sync + 'static) {
        self.listeners.lock_or_recover().push(Arc::new(listener));
    }

    fn notify(&self, event: &InvalidationEvent) {
        tracing::info!(reason = ?event.reason, generation = event.generation, "session invalidated");

        // No receivers is fine; the event is still delivered to callbacks.
        let _ = self.invalidation_tx.send(event.clone());

        let listeners: Vec<InvalidationListener> = self.listeners.lock_or_recover().clone();
        for listener in listeners {
            listener(event);
        }
    }

    fn pending_write(&self, state: &SessionState) -> Option<PendingWrite> {
        self.mirror.as_ref()?;
        let tokens = state.access_token.clone().map(|access_token| StoredTokens {
            access_token,
            refresh_token: state.refresh_token.clone(),
            expires_at: state.expires_at,
            saved_at: now_unix_seconds(),
        });
        Some(PendingWrite {
            generation: state.generation,
            tokens,
        })
    }

    fn persist(&self, write: Option<PendingWrite>) {
        if let (Some(mirror), Some(write)) = (self.mirror.as_ref(), write) {
            mirror.schedule(write);
        }
    }
}

fn clear_locked(state: &mut SessionState, reason: InvalidationReason) -> InvalidationEvent {
    let cleared_generation = state.generation;
    state.access_token = None;
    state.refresh_token = None;
    state.expires_at = None;
    state.generation = state.generation.wrapping_add(1);
    InvalidationEvent {
        reason,
        generation: cleared_generation,
        at_unix: now_unix_seconds(),
    }
}
