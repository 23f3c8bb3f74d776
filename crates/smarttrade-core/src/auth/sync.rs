//! Cross-context session synchronization.
//!
//! [`TabSyncBroadcaster`] watches the storage origin for credential
//! mutations made by *other* contexts and tells local subscribers whether
//! the session is now signed in or signed out. Mutations made through this
//! context's own store are ignored, so a subscriber that reacts to
//! `SignedOut` by clearing local state cannot trigger a feedback loop.
//!
//! A store opened with [`CredentialStore::detached`] has no notification
//! channel. Subscribing to it succeeds but the callback will never be
//! invoked; [`TabSyncBroadcaster::is_available`] reports this.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::credentials::Credentials;
use super::lock;
use super::store::{CredentialStore, StorageEvent};

/// Ephemeral notification that the authentication state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionSignal {
    SignedIn,
    SignedOut,
}

impl SessionSignal {
    pub fn from_credentials(credentials: Option<&Credentials>) -> Self {
        match credentials {
            Some(_) => SessionSignal::SignedIn,
            None => SessionSignal::SignedOut,
        }
    }
}

type Callback = Arc<dyn Fn(SessionSignal) + Send + Sync>;
type Subscribers = Mutex<HashMap<u64, Callback>>;

/// Relays other contexts' credential changes to local subscribers.
pub struct TabSyncBroadcaster {
    store: CredentialStore,
    subscribers: Arc<Subscribers>,
    next_id: AtomicU64,
    relay: Option<JoinHandle<()>>,
}

impl TabSyncBroadcaster {
    /// Start relaying for `store`'s context.
    ///
    /// For an attached store this spawns the relay task, so it must be called
    /// from within a Tokio runtime.
    pub fn new(store: CredentialStore) -> Self {
        let subscribers: Arc<Subscribers> = Arc::new(Mutex::new(HashMap::new()));

        let relay = match store.subscribe() {
            Some(events) => Some(tokio::spawn(relay_events(
                events,
                store.clone(),
                Arc::downgrade(&subscribers),
            ))),
            None => {
                warn!(
                    context = ?store.context(),
                    "Credential store has no notification channel; session sync subscribers will never fire"
                );
                None
            }
        };

        Self {
            store,
            subscribers,
            next_id: AtomicU64::new(1),
            relay,
        }
    }

    /// Whether subscribers can ever be notified
    pub fn is_available(&self) -> bool {
        self.relay.is_some()
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Register `callback` for session changes made by other contexts.
    ///
    /// The callback runs on the relay task and should not block.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(SessionSignal) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl Drop for TabSyncBroadcaster {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

/// Handle returned by [`TabSyncBroadcaster::subscribe`]. Dropping it
/// unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock(&subscribers).remove(&self.id);
        }
    }
}

async fn relay_events(
    mut events: broadcast::Receiver<StorageEvent>,
    store: CredentialStore,
    subscribers: Weak<Subscribers>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if event.context == store.context() || event.key != store.key() {
                    continue;
                }
                debug!(from = ?event.context, "Credentials changed in another context");
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Session sync lagged, re-reading credentials");
            }
            Err(RecvError::Closed) => break,
        }

        let Some(subscribers) = subscribers.upgrade() else {
            break;
        };

        // Re-read rather than trusting the event
        let signal = SessionSignal::from_credentials(store.get().as_ref());
        let callbacks: Vec<Callback> = lock(&subscribers).values().cloned().collect();
        for callback in callbacks {
            callback(signal);
        }
    }
}
