use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::ApiError;

/// Replayable description of one logical API call.
///
/// Never carries an `Authorization` header: the client attaches the current
/// bearer token on every attempt, so a retry after refresh uses the new one.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path relative to the gateway (`/services/...`) or an absolute URL
    pub endpoint: String,
    pub params: Vec<(String, String)>,
    /// Extra headers; only settable through [`RequestDescriptor::header`]
    headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    /// Attach credentials and refresh on auth failure
    pub authenticated: bool,
    retried: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            params: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            authenticated: true,
            retried: false,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn patch(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PATCH, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Add a query parameter only when a value is present
    pub fn param_opt<V: ToString>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.param(key, v),
            None => self,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if name == AUTHORIZATION {
            debug!(endpoint = %self.endpoint, "Ignoring explicit Authorization header");
            return self;
        }
        self.headers.insert(name, value);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn json_value(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Send without credentials and never refresh (login, registration, ...)
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    /// Whether the one permitted retry has been used
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    pub fn build_url(&self, base: &Url) -> Result<Url, ApiError> {
        let mut url = if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            Url::parse(&self.endpoint).map_err(|e| {
                ApiError::InvalidRequest(format!("Invalid endpoint '{}': {}", self.endpoint, e))
            })?
        } else {
            join_endpoint(base, &self.endpoint)
        };

        if !self.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Append `endpoint` (with or without a leading slash, optionally carrying
/// a query) to the base URL, keeping any path prefix the base has.
/// `https://host/gateway` + `/services/x` is `https://host/gateway/services/x`.
pub(crate) fn join_endpoint(base: &Url, endpoint: &str) -> Url {
    let (path, query) = match endpoint.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (endpoint, None),
    };

    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{}/{}", prefix, path.trim_start_matches('/')));
    url.set_query(query);
    url.set_fragment(None);
    url
}
