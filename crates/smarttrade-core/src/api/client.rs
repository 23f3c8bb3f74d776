//! API client for the SmartTrade gateway.
//!
//! Every request goes through [`ApiClient::send`], which attaches the stored
//! bearer token, classifies the response, and on an expired token joins the
//! single-flight refresh before replaying the request exactly once.

use anyhow::Result;
use reqwest::{header, Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use super::error::{classify, truncate_body, ApiError, ErrorKind, TransportOutcome};
use super::request::RequestDescriptor;
use crate::auth::{CredentialStore, RefreshCoordinator, RefreshError, SessionSignal};
use crate::config::ClientConfig;

/// Capacity of the local session signal channel
const SIGNAL_CHANNEL_CAPACITY: usize = 16;

/// API client for one client context.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling,
/// and clones share the credential store and the refresh slot.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    store: CredentialStore,
    refresher: RefreshCoordinator,
    signals: broadcast::Sender<SessionSignal>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, store: CredentialStore) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()?;

        let refresher = RefreshCoordinator::new(http.clone(), config.refresh_url()?, store.clone());
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);

        Ok(Self {
            http,
            base_url: config.base_url()?,
            store,
            refresher,
            signals,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.get().is_some()
    }

    /// Session changes caused by this context (login, logout, expiry).
    /// Changes made by other contexts arrive through `TabSyncBroadcaster`.
    pub fn local_signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub(crate) fn emit(&self, signal: SessionSignal) {
        // No receivers is fine
        let _ = self.signals.send(signal);
    }

    /// Send one logical request, refreshing and retrying once on an
    /// expired token. Returns the raw successful response.
    pub async fn send(&self, mut descriptor: RequestDescriptor) -> Result<Response, ApiError> {
        let url = descriptor.build_url(&self.base_url)?;
        let mut next_token: Option<String> = None;

        loop {
            let token = if descriptor.authenticated {
                next_token.take().or_else(|| self.store.access_token())
            } else {
                None
            };

            let response = self.execute(&descriptor, &url, token.as_deref()).await?;
            let status = response.status();
            let kind = classify(TransportOutcome::from(status));
            debug!(
                method = %descriptor.method,
                url = %url,
                status = status.as_u16(),
                retried = descriptor.is_retried(),
                "API response"
            );

            match kind {
                ErrorKind::Success => return Ok(response),
                ErrorKind::AuthExpired if descriptor.authenticated => {
                    if descriptor.is_retried() {
                        warn!(url = %url, "Token rejected again after refresh");
                        if let Some(ref rejected) = token {
                            self.refresher.invalidate(rejected);
                        }
                        return Err(self.session_expired(kind.default_message().to_string()));
                    }
                    descriptor.mark_retried();

                    // A sibling request already refreshed (or another context
                    // signed in) after this one was sent.
                    let current = self.store.access_token();
                    if current.is_some() && current != token {
                        debug!(url = %url, "Retrying with newer stored token");
                        next_token = current;
                        continue;
                    }

                    match self.refresher.refresh().await {
                        Ok(credentials) => {
                            next_token = Some(credentials.access_token);
                        }
                        Err(e) => {
                            // Another context signed in while the refresh ran
                            let current = self.store.access_token();
                            if current.is_some() && current != token {
                                debug!(url = %url, "Retrying with credentials stored during refresh");
                                next_token = current;
                                continue;
                            }
                            if matches!(e, RefreshError::Superseded) {
                                // Signed out locally meanwhile; that path already signalled
                                return Err(ApiError::SessionExpired { message: e.to_string() });
                            }
                            return Err(self.session_expired(e.to_string()));
                        }
                    }
                }
                _ => return Err(Self::error_from_response(response, &descriptor).await),
            }
        }
    }

    /// Send a request and parse the JSON body. An empty body (204) parses as
    /// `null`, so `()` and `Option<T>` targets work.
    pub async fn request<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Result<T, ApiError> {
        let endpoint = descriptor.endpoint.clone();
        let response = self.send(descriptor).await?;

        let no_content = response.status() == StatusCode::NO_CONTENT;
        let bytes = response.bytes().await.map_err(ApiError::Network)?;

        let parsed = if no_content || bytes.iter().all(u8::is_ascii_whitespace) {
            serde_json::from_value(serde_json::Value::Null)
        } else {
            serde_json::from_slice(&bytes)
        };
        parsed.map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", endpoint, e))
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.request(RequestDescriptor::get(endpoint)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestDescriptor::post(endpoint).json(body)?).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestDescriptor::put(endpoint).json(body)?).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestDescriptor::patch(endpoint).json(body)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.request(RequestDescriptor::delete(endpoint)).await
    }

    async fn execute(
        &self,
        descriptor: &RequestDescriptor,
        url: &Url,
        token: Option<&str>,
    ) -> Result<Response, ApiError> {
        let mut builder = self
            .http
            .request(descriptor.method.clone(), url.clone())
            .headers(descriptor.headers().clone());
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = descriptor.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(|e| {
            debug!(url = %url, error = %e, "Request failed before a response arrived");
            ApiError::Network(e)
        })
    }

    async fn error_from_response(response: Response, descriptor: &RequestDescriptor) -> ApiError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(
            endpoint = %descriptor.endpoint,
            status = status.as_u16(),
            body = %truncate_body(&body),
            "API error response"
        );
        ApiError::from_response(status, &body, &descriptor.endpoint)
    }

    fn session_expired(&self, message: String) -> ApiError {
        info!(reason = %message, "Session expired");
        self.emit(SessionSignal::SignedOut);
        ApiError::SessionExpired { message }
    }
}
