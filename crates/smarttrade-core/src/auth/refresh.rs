//! Single-flight token refresh.
//!
//! However many requests observe an expired token at once, at most one
//! refresh call is outstanding. The first caller spawns the exchange as its
//! own task and parks a shared handle to it in the in-flight slot; everyone
//! arriving before it settles awaits that same handle. The task runs to
//! completion even if every waiter is dropped, because the credential store
//! must end up either holding the new pair or cleared. The task only touches
//! the store while it still holds the pair that was exchanged, so a logout
//! during the exchange stays a logout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::credentials::Credentials;
use super::lock;
use super::store::CredentialStore;
use crate::api::error::{classify, server_message, truncate_body, ErrorKind, TransportOutcome};

/// Why a refresh did not produce new credentials. Shared by every waiter,
/// hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    RefreshImpossible,

    #[error("Refresh rejected ({kind}): {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("Refresh request failed: {0}")]
    Network(String),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Refresh task was aborted")]
    Aborted,

    /// The stored pair changed while the exchange was running (logout, or
    /// another context signed in); the refreshed pair was discarded.
    #[error("Credentials changed while refreshing")]
    Superseded,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Credentials, RefreshError>>>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(alias = "token")]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct Inner {
    http: Client,
    refresh_url: Url,
    store: CredentialStore,
    in_flight: Mutex<Option<SharedRefresh>>,
    /// Number of refresh network calls issued, for diagnostics
    calls: AtomicUsize,
}

/// Owns the refresh protocol for one client context.
/// Clone is cheap and every clone shares the same in-flight slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(http: Client, refresh_url: Url, store: CredentialStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                refresh_url,
                store,
                in_flight: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn refresh_url(&self) -> &Url {
        &self.inner.refresh_url
    }

    /// Number of refresh network calls made so far
    pub fn refresh_count(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.inner.in_flight).is_some()
    }

    /// Exchange the stored refresh token for a new credential pair, joining
    /// the in-flight exchange if there is one.
    ///
    /// On failure the store has been cleared. Must be called from within a
    /// Tokio runtime.
    pub async fn refresh(&self) -> Result<Credentials, RefreshError> {
        let pending = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight token refresh");
                    existing.clone()
                }
                None => {
                    let refresh_token = self
                        .inner
                        .store
                        .get()
                        .and_then(|c| c.refresh_token)
                        .filter(|t| !t.is_empty());

                    let Some(refresh_token) = refresh_token else {
                        warn!("Access token rejected and no refresh token is stored");
                        self.inner.store.clear();
                        return Err(RefreshError::RefreshImpossible);
                    };

                    let pending = Self::start(Arc::clone(&self.inner), refresh_token);
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Clear the store if it still holds `access_token`.
    ///
    /// Used when a freshly refreshed token is rejected again. A newer pair
    /// written meanwhile (another context signing in) is left alone.
    pub fn invalidate(&self, access_token: &str) {
        let _slot = lock(&self.inner.in_flight);
        let still_current = self
            .inner
            .store
            .get()
            .is_some_and(|c| c.access_token == access_token);
        if still_current {
            warn!("Refreshed token was rejected, clearing credentials");
            self.inner.store.clear();
        }
    }

    // The caller holds the slot lock, so the task cannot empty the slot
    // before the caller has filled it.
    fn start(inner: Arc<Inner>, refresh_token: String) -> SharedRefresh {
        let handle = tokio::spawn(async move {
            inner.calls.fetch_add(1, Ordering::SeqCst);
            info!(url = %inner.refresh_url, "Refreshing access token");

            // Only the pair that was exchanged may be replaced or cleared
            let result = match inner.exchange(&refresh_token).await {
                Ok(credentials) => {
                    if inner.store.replace_if_refresh_token(&refresh_token, Some(&credentials)) {
                        info!(expires_at = ?credentials.expires_at, "Access token refreshed");
                        Ok(credentials)
                    } else {
                        info!("Credentials changed during refresh, discarding refreshed token");
                        Err(RefreshError::Superseded)
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Token refresh failed, clearing credentials");
                    inner.store.replace_if_refresh_token(&refresh_token, None);
                    Err(e)
                }
            };

            *lock(&inner.in_flight) = None;
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Token refresh task did not complete");
                    Err(RefreshError::Aborted)
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    async fn exchange(&self, refresh_token: &str) -> Result<Credentials, RefreshError> {
        let response = self
            .http
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        let kind = classify(TransportOutcome::from(status));
        if !kind.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %truncate_body(&body), "Refresh endpoint rejected the request");
            let message = server_message(&body).unwrap_or_else(|| kind.default_message().to_string());
            return Err(RefreshError::Rejected { kind, message });
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        // No rotation: keep using the refresh token we already have
        let refresh_token = parsed
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(Credentials::new(parsed.access_token, Some(refresh_token)).with_expires_in(parsed.expires_in))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryBackend;

    fn coordinator(store: CredentialStore) -> RefreshCoordinator {
        let url = Url::parse("http://127.0.0.1:9/auth/refresh").unwrap();
        RefreshCoordinator::new(Client::new(), url, store)
    }

    #[test]
    fn test_refresh_response_accepts_token_alias() {
        let parsed: RefreshResponse = serde_json::from_str(r#"{"token":"tok2"}"#).unwrap();
        assert_eq!(parsed.access_token, "tok2");
        assert!(parsed.refresh_token.is_none());

        let parsed: RefreshResponse =
            serde_json::from_str(r#"{"accessToken":"tok3","refreshToken":"ref3","expiresIn":900}"#)
                .unwrap();
        assert_eq!(parsed.access_token, "tok3");
        assert_eq!(parsed.refresh_token.as_deref(), Some("ref3"));
        assert_eq!(parsed.expires_in, Some(900));
    }

    #[test]
    fn test_refresh_request_body() {
        let body = serde_json::to_value(RefreshRequest { refresh_token: "ref1" }).unwrap();
        assert_eq!(body, serde_json::json!({ "refreshToken": "ref1" }));
    }

    #[tokio::test]
    async fn test_refresh_without_token_is_impossible() {
        let store = CredentialStore::detached(Arc::new(MemoryBackend::new()), "k");
        store.set(Credentials::new("tok1", None));
        let coordinator = coordinator(store.clone());

        let result = coordinator.refresh().await;
        assert_eq!(result, Err(RefreshError::RefreshImpossible));
        assert_eq!(coordinator.refresh_count(), 0);
        assert!(store.get().is_none());
        assert!(!coordinator.is_refreshing());
    }

    #[test]
    fn test_invalidate_only_clears_matching_token() {
        let store = CredentialStore::detached(Arc::new(MemoryBackend::new()), "k");
        let coordinator = coordinator(store.clone());

        store.set(Credentials::new("newer", Some("ref".to_string())));
        coordinator.invalidate("older");
        assert!(store.get().is_some());

        coordinator.invalidate("newer");
        assert!(store.get().is_none());
    }
}
