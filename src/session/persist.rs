//! Usage: Mirrors session changes into a [`TokenStore`] off the session lock.

use crate::infra::token_store::{StoredTokens, TokenStore};
use crate::shared::blocking;
use crate::shared::lock_ext::MutexExt;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Tokens to write for one session generation; `None` removes the stored pair.
pub(super) struct PendingWrite {
    pub(super) generation: u64,
    pub(super) tokens: Option<StoredTokens>,
}

pub(super) struct StoreMirror {
    store: Arc<dyn TokenStore>,
    // Held across the store call: writes are serialized and never go backwards.
    last_written: Mutex<u64>,
    synced_tx: watch::Sender<u64>,
}

impl fmt::Debug for StoreMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreMirror")
            .field("store", &self.store)
            .field("synced_generation", &*self.synced_tx.borrow())
            .finish()
    }
}

impl StoreMirror {
    pub(super) fn new(store: Arc<dyn TokenStore>) -> Arc<Self> {
        let (synced_tx, _) = watch::channel(0);
        Arc::new(Self {
            store,
            last_written: Mutex::new(0),
            synced_tx,
        })
    }

    pub(super) fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// The store already holds `generation` (it was just loaded from it).
    pub(super) fn mark_synced(&self, generation: u64) {
        let mut last = self.last_written.lock_or_recover();
        *last = (*last).max(generation);
        self.synced_tx.send_replace(*last);
    }

    pub(super) fn schedule(self: &Arc<Self>, write: PendingWrite) {
        let mirror = Arc::clone(self);
        blocking::spawn_detached("token_store_write", move || mirror.write(write));
    }

    fn write(&self, write: PendingWrite) {
        let mut last = self.last_written.lock_or_recover();
        if write.generation <= *last {
            tracing::debug!(
                generation = write.generation,
                last_written = *last,
                "skipping superseded token store write"
            );
            return;
        }

        let result = match write.tokens.as_ref() {
            Some(tokens) => self.store.save(tokens),
            None => self.store.clear(),
        };
        if let Err(err) = result {
            tracing::warn!(generation = write.generation, "token store write failed: {}", err);
        }

        *last = write.generation;
        self.synced_tx.send_replace(write.generation);
    }

    pub(super) async fn wait_synced(&self, generation: u64) {
        let mut rx = self.synced_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once synced.
        let _ = rx.wait_for(|synced| *synced >= generation).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::token_store::MemoryTokenStore;

    fn tokens(access: &str) -> Option<StoredTokens> {
        Some(StoredTokens {
            access_token: access.to_string(),
            refresh_token: None,
            expires_at: None,
            saved_at: 0,
        })
    }

    #[test]
    fn older_generation_never_overwrites_newer() {
        let store = Arc::new(MemoryTokenStore::new());
        let mirror = StoreMirror::new(store.clone());

        mirror.write(PendingWrite {
            generation: 3,
            tokens: tokens("third"),
        });
        mirror.write(PendingWrite {
            generation: 2,
            tokens: tokens("second"),
        });

        assert_eq!(store.current().map(|t| t.access_token).as_deref(), Some("third"));
        assert_eq!(*mirror.synced_tx.borrow(), 3);
    }

    #[test]
    fn mark_synced_skips_rewriting_loaded_generation() {
        let store = Arc::new(MemoryTokenStore::new());
        let mirror = StoreMirror::new(store.clone());
        mirror.mark_synced(1);

        mirror.write(PendingWrite {
            generation: 1,
            tokens: tokens("loaded"),
        });
        assert_eq!(store.current(), None);

        mirror.write(PendingWrite {
            generation: 2,
            tokens: None,
        });
        assert_eq!(*mirror.synced_tx.borrow(), 2);
    }
}
