//! Credential storage with change notification.
//!
//! A [`StorageOrigin`] is the analogue of a browser storage origin: one
//! durable backend plus a notification channel shared by every client
//! context that opens it. Each [`CredentialStore`] handed out by
//! [`StorageOrigin::open_context`] carries its own [`ContextId`], so
//! listeners can tell their own mutations apart from other contexts'.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::credentials::Credentials;
use super::lock;
use super::storage::StorageBackend;

/// Default storage key holding the serialized credential pair
pub const DEFAULT_CREDENTIALS_KEY: &str = "smarttrade_credentials";

/// Capacity of the storage event channel.
/// Credential mutations are rare; listeners that lag simply re-read the store.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Identifies one client context sharing a storage origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Mutations detected on the backend that no local context made
    /// (another process writing the shared credential file).
    pub const EXTERNAL: ContextId = ContextId(0);

    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A storage-level change notification. The payload is deliberately opaque:
/// listeners re-read the store instead of trusting the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub context: ContextId,
}

struct OriginShared {
    events: broadcast::Sender<StorageEvent>,
    /// Last raw value each key was set to by any local context, `None` for a clear
    last_local_write: Mutex<HashMap<String, Option<String>>>,
}

/// Shared backend and notification channel for a group of client contexts.
#[derive(Clone)]
pub struct StorageOrigin {
    backend: Arc<dyn StorageBackend>,
    shared: Arc<OriginShared>,
    write_guard: Arc<Mutex<()>>,
}

impl StorageOrigin {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            shared: Arc::new(OriginShared {
                events,
                last_local_write: Mutex::new(HashMap::new()),
            }),
            write_guard: Arc::new(Mutex::new(())),
        }
    }

    /// Open a new client context on this origin.
    pub fn open_context(&self, key: impl Into<String>) -> CredentialStore {
        let store = CredentialStore {
            backend: Arc::clone(&self.backend),
            key: key.into(),
            context: ContextId::next(),
            origin: Some(Arc::clone(&self.shared)),
            write_guard: Arc::clone(&self.write_guard),
        };
        debug!(context = ?store.context, backend = self.backend.name(), "Opened credential context");
        store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.shared.events.subscribe()
    }

    /// Poll the backend for changes made outside this process.
    ///
    /// When the stored value for `key` changes to something no local context
    /// wrote, a [`StorageEvent`] from [`ContextId::EXTERNAL`] is emitted.
    /// Must be called from within a Tokio runtime; abort the handle to stop.
    pub fn spawn_external_watcher(&self, key: impl Into<String>, interval: Duration) -> JoinHandle<()> {
        let key = key.into();
        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&self.shared);
        let mut last_seen = read_raw(backend.as_ref(), &key);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let current = read_raw(backend.as_ref(), &key);
                if current == last_seen {
                    continue;
                }
                last_seen = current.clone();

                let written_locally = lock(&shared.last_local_write)
                    .get(&key)
                    .is_some_and(|local| *local == current);
                if written_locally {
                    continue;
                }

                debug!(key = %key, "External credential change detected");
                let _ = shared.events.send(StorageEvent {
                    key: key.clone(),
                    context: ContextId::EXTERNAL,
                });
            }
        })
    }
}

fn read_raw(backend: &dyn StorageBackend, key: &str) -> Option<String> {
    match backend.read(key) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, backend = backend.name(), "Failed to read credential storage");
            None
        }
    }
}

/// Durable storage of the current [`Credentials`] for one client context.
///
/// Operations never fail from the caller's point of view: backend errors
/// are logged and absence is `None`. Cloning yields a handle to the same
/// context.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
    key: String,
    context: ContextId,
    origin: Option<Arc<OriginShared>>,
    write_guard: Arc<Mutex<()>>,
}

impl CredentialStore {
    /// A store with no notification channel. Tab sync on a detached store
    /// never fires.
    pub fn detached(backend: Arc<dyn StorageBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            context: ContextId::next(),
            origin: None,
            write_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Whether mutations are broadcast to other contexts
    pub fn is_attached(&self) -> bool {
        self.origin.is_some()
    }

    pub(crate) fn subscribe(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        self.origin.as_ref().map(|o| o.events.subscribe())
    }

    pub fn get(&self) -> Option<Credentials> {
        let raw = read_raw(self.backend.as_ref(), &self.key)?;
        match serde_json::from_str(&raw) {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!(error = %e, key = %self.key, "Stored credentials are malformed, ignoring");
                None
            }
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.get().map(|c| c.access_token)
    }

    pub fn set(&self, credentials: Credentials) {
        if let Some(raw) = serialize(&credentials) {
            let _guard = lock(&self.write_guard);
            self.replace_locked(Some(raw));
        }
    }

    /// Idempotent; clearing an empty store emits no notification.
    /// Returns whether credentials were removed.
    pub fn clear(&self) -> bool {
        let _guard = lock(&self.write_guard);
        self.replace_locked(None)
    }

    /// Replace (or with `None`, remove) the stored pair only while it still
    /// carries `refresh_token`. Returns whether the stored pair matched.
    ///
    /// A refresh that settles after a logout, or after another context
    /// signed in with a different pair, must not overwrite the newer state.
    pub(crate) fn replace_if_refresh_token(
        &self,
        refresh_token: &str,
        credentials: Option<&Credentials>,
    ) -> bool {
        let value = match credentials {
            Some(credentials) => match serialize(credentials) {
                Some(raw) => Some(raw),
                None => return false,
            },
            None => None,
        };

        let _guard = lock(&self.write_guard);
        let matches = self
            .get()
            .and_then(|c| c.refresh_token)
            .is_some_and(|current| current == refresh_token);
        if !matches {
            debug!(context = ?self.context, "Stored credentials changed, leaving them alone");
            return false;
        }
        self.replace_locked(value);
        true
    }

    /// Write (or remove) the raw value and notify, skipping no-op mutations
    /// the way browser storage does. Caller holds the write guard. Returns
    /// whether the stored value changed.
    fn replace_locked(&self, value: Option<String>) -> bool {
        let previous = read_raw(self.backend.as_ref(), &self.key);
        if previous == value {
            return false;
        }

        let result = match &value {
            Some(raw) => self.backend.write(&self.key, raw),
            None => self.backend.remove(&self.key),
        };
        if let Err(e) = result {
            warn!(error = %e, backend = self.backend.name(), "Failed to update credential storage");
            return false;
        }

        debug!(context = ?self.context, present = value.is_some(), "Credentials updated");

        if let Some(origin) = &self.origin {
            lock(&origin.last_local_write).insert(self.key.clone(), value);
            // No receivers is fine
            let _ = origin.events.send(StorageEvent {
                key: self.key.clone(),
                context: self.context,
            });
        }
        true
    }
}

fn serialize(credentials: &Credentials) -> Option<String> {
    match serde_json::to_string(credentials) {
        Ok(raw) => Some(raw),
        Err(e) => {
            warn!(error = %e, "Failed to serialize credentials");
            None
        }
    }
}
