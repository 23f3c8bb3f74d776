//! Account and device-session endpoints of the user service.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::client::ApiClient;
use super::endpoints;
use super::request::RequestDescriptor;
use super::ApiError;
use crate::auth::{Credentials, SessionSignal};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    username: String,
    password: &'a str,
    remember_me: bool,
}

/// Successful login as returned by the user service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub authorities: Vec<String>,
}

impl LoginResponse {
    /// Name to show in the UI, falling back to the login
    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().filter(|n| !n.is_empty()).unwrap_or(self.login.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub success: Option<bool>,
}

/// One signed-in device as listed by the session management endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub browser_name: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub login_time: Option<String>,
    #[serde(default)]
    pub last_active: Option<String>,
    #[serde(default)]
    pub current: bool,
}

impl SessionInfo {
    pub fn display_name(&self) -> String {
        if let Some(name) = self.device_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        let browser = self.browser_name.as_deref().unwrap_or("Browser");
        let os = self.os_name.as_deref().unwrap_or("Unknown");
        format!("{} on {}", browser, os)
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self.device_type.as_deref(), Some("MOBILE_IOS") | Some("MOBILE_ANDROID"))
    }
}

impl ApiClient {
    /// Sign in and store the issued credential pair
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<LoginResponse, ApiError> {
        let request = LoginRequest {
            username: username.to_lowercase(),
            password,
            remember_me,
        };
        let descriptor = RequestDescriptor::post(endpoints::auth::LOGIN)
            .unauthenticated()
            .json(&request)?;
        let response: LoginResponse = self.request(descriptor).await?;

        let credentials = Credentials::new(response.access_token.clone(), response.refresh_token.clone())
            .with_expires_in(response.expires_in);
        self.store().set(credentials);
        self.emit(SessionSignal::SignedIn);

        info!(login = %response.login, "Login successful");
        Ok(response)
    }

    /// Sign out on the server if possible; local credentials are cleared
    /// regardless of the outcome. `SignedOut` is emitted only if this call
    /// removed the credentials (an expiry during the call has its own).
    pub async fn logout(&self) {
        if self.is_authenticated() {
            let descriptor = RequestDescriptor::post(endpoints::auth::LOGOUT);
            if let Err(e) = self.request::<serde_json::Value>(descriptor).await {
                warn!(error = %e, "Logout API call failed, clearing local credentials anyway");
            }
        }
        if self.store().clear() {
            self.emit(SessionSignal::SignedOut);
        }
        info!("Logged out");
    }

    /// Fetch the signed-in user, or `None` when there is no usable session
    pub async fn current_user(&self) -> Result<Option<serde_json::Value>, ApiError> {
        if !self.is_authenticated() {
            return Ok(None);
        }
        match self.get(endpoints::auth::ME).await {
            Ok(user) => Ok(Some(user)),
            Err(e) if e.is_session_expired() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, ApiError> {
        self.get(endpoints::auth::SESSIONS).await
    }

    pub async fn revoke_session(&self, session_id: &str) -> Result<MessageResponse, ApiError> {
        self.delete(&endpoints::auth::revoke_session(session_id)).await
    }

    pub async fn logout_all_other_devices(&self) -> Result<MessageResponse, ApiError> {
        self.delete(endpoints::auth::LOGOUT_ALL_DEVICES).await
    }

    pub async fn session_count(&self) -> Result<u64, ApiError> {
        self.get(endpoints::auth::SESSIONS_COUNT).await
    }
}
