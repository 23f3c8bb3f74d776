//! Token lifecycle: storage, refresh and cross-context session sync.
//!
//! This module provides:
//! - `Credentials`: the access/refresh token pair with expiry helpers
//! - `CredentialStore` / `StorageOrigin`: durable storage shared by client contexts
//! - `RefreshCoordinator`: single-flight token refresh
//! - `TabSyncBroadcaster`: relays other contexts' login/logout as `SessionSignal`s

pub mod credentials;
pub mod refresh;
pub mod storage;
pub mod store;
pub mod sync;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use credentials::Credentials;
pub use refresh::{RefreshCoordinator, RefreshError};
pub use storage::{FileBackend, KeyringBackend, MemoryBackend, StorageBackend};
pub use store::{ContextId, CredentialStore, StorageEvent, StorageOrigin, DEFAULT_CREDENTIALS_KEY};
pub use sync::{SessionSignal, Subscription, TabSyncBroadcaster};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
