use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Buffer time before expiry at which a token is considered due for refresh (5 minutes)
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// The bearer/refresh token pair currently held by this client.
///
/// Serialized as camelCase JSON so the stored value matches what the
/// gateway hands out (`accessToken`, `refreshToken`).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: None,
        }
    }

    /// Set the expiry from a server-provided `expiresIn` (seconds from now)
    pub fn with_expires_in(mut self, expires_in: Option<i64>) -> Self {
        self.expires_at = expires_in.map(|secs| Utc::now() + Duration::seconds(secs));
        self
    }

    /// Whether a refresh token is held; without one every auth failure is terminal
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// A token without a known expiry is never considered expired locally.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expiry| Utc::now() > expiry)
    }

    /// Check if the token will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        self.expires_at.is_some_and(|expiry| {
            Utc::now() > expiry - Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES)
        })
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at.map(|expiry| expiry - Utc::now())
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.time_until_expiry().map(|d| d.num_minutes().max(0))
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
