use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Maximum length for error response bodies in log messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Generic message some services send instead of a real explanation
const GENERIC_SERVER_MESSAGE: &str = "Request failed";

/// Closed classification of a transport outcome.
///
/// Everything above the classifier branches on this, never on raw status
/// codes. Only `AuthExpired` is ever recovered locally (refresh and retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Success,
    AuthExpired,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    ClientInvalid,
    ServerUnavailable,
    NetworkFailure,
    Unknown,
}

impl ErrorKind {
    pub fn is_success(self) -> bool {
        self == ErrorKind::Success
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorKind::Success => "OK",
            ErrorKind::AuthExpired => "Your session has expired. Please sign in again.",
            ErrorKind::Forbidden => "You do not have permission to perform this action.",
            ErrorKind::NotFound => "The requested data could not be found.",
            ErrorKind::Conflict => "The data conflicts with its current state. Please try again.",
            ErrorKind::RateLimited => "Too many requests. Please wait a moment and try again.",
            ErrorKind::ClientInvalid => "The request was invalid. Please check the information provided.",
            ErrorKind::ServerUnavailable => "The service is busy. Please try again later.",
            ErrorKind::NetworkFailure => "Unable to reach the server. Check your connection.",
            ErrorKind::Unknown => "Something went wrong. Please try again later.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Success => "success",
            ErrorKind::AuthExpired => "auth expired",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::ClientInvalid => "invalid request",
            ErrorKind::ServerUnavailable => "server unavailable",
            ErrorKind::NetworkFailure => "network failure",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// What came back from the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOutcome {
    Status(u16),
    NetworkFailure,
}

impl From<reqwest::StatusCode> for TransportOutcome {
    fn from(status: reqwest::StatusCode) -> Self {
        TransportOutcome::Status(status.as_u16())
    }
}

/// Map a transport outcome to its [`ErrorKind`]. Total over all inputs.
pub fn classify(outcome: TransportOutcome) -> ErrorKind {
    match outcome {
        TransportOutcome::NetworkFailure => ErrorKind::NetworkFailure,
        TransportOutcome::Status(code) => match code {
            200..=299 => ErrorKind::Success,
            400 => ErrorKind::ClientInvalid,
            401 => ErrorKind::AuthExpired,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::ServerUnavailable,
            _ => ErrorKind::Unknown,
        },
    }
}

/// Message shown when the server gives none, specialised for the
/// account endpoints where a bare status is ambiguous.
pub fn fallback_message(outcome: TransportOutcome, endpoint: &str) -> &'static str {
    let is_login = endpoint.contains("/auth/login");
    let is_register = endpoint.contains("/auth/register");
    let is_password_reset =
        endpoint.contains("/reset-password") || endpoint.contains("/forgot-password");

    match outcome {
        TransportOutcome::Status(400) if is_register => {
            "Registration details are invalid. Please check and try again."
        }
        TransportOutcome::Status(400) if is_password_reset => {
            "The password reset link has expired or is invalid."
        }
        TransportOutcome::Status(401) if is_login => {
            "Incorrect username or password. Please try again."
        }
        TransportOutcome::Status(403) if is_login => {
            "This account has not been activated. Check your email for the activation link."
        }
        TransportOutcome::Status(409) if is_register => {
            "This email address is already in use."
        }
        TransportOutcome::Status(423) => {
            "The account is locked after too many failed sign-in attempts. Try again in 30 minutes."
        }
        other => classify(other).default_message(),
    }
}

/// Extract a server-supplied `message` field from a JSON error body.
pub fn server_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value.get("message")?.as_str()?.trim();
    if message.is_empty() || message == GENERIC_SERVER_MESSAGE {
        return None;
    }
    Some(message.to_string())
}

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

/// Terminal error surfaced to callers of the API client.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The server answered with a non-success status.
    #[error("{message}")]
    Status {
        kind: ErrorKind,
        status: u16,
        message: String,
    },

    /// Credentials could not be renewed; they have been cleared.
    #[error("Session expired: {message}")]
    SessionExpired { message: String },

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Status { kind, .. } => *kind,
            ApiError::SessionExpired { .. } => ErrorKind::AuthExpired,
            ApiError::Network(_) => ErrorKind::NetworkFailure,
            ApiError::InvalidResponse(_) | ApiError::InvalidRequest(_) => ErrorKind::Unknown,
        }
    }

    /// Human-readable message suitable for display
    pub fn message(&self) -> String {
        match self {
            ApiError::Status { message, .. } | ApiError::SessionExpired { message } => {
                message.clone()
            }
            ApiError::Network(_) => ErrorKind::NetworkFailure.default_message().to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::SessionExpired { .. })
    }

    /// HTTP status, when the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn from_response(status: reqwest::StatusCode, body: &str, endpoint: &str) -> Self {
        let outcome = TransportOutcome::from(status);
        let message = server_message(body)
            .unwrap_or_else(|| fallback_message(outcome, endpoint).to_string());
        ApiError::Status {
            kind: classify(outcome),
            status: status.as_u16(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_table() {
        let cases = [
            (200, ErrorKind::Success),
            (201, ErrorKind::Success),
            (204, ErrorKind::Success),
            (400, ErrorKind::ClientInvalid),
            (401, ErrorKind::AuthExpired),
            (403, ErrorKind::Forbidden),
            (404, ErrorKind::NotFound),
            (409, ErrorKind::Conflict),
            (429, ErrorKind::RateLimited),
            (500, ErrorKind::ServerUnavailable),
            (503, ErrorKind::ServerUnavailable),
            (599, ErrorKind::ServerUnavailable),
        ];
        for (code, expected) in cases {
            assert_eq!(classify(TransportOutcome::Status(code)), expected, "status {}", code);
        }
    }

    #[test]
    fn test_classify_is_total() {
        assert_eq!(classify(TransportOutcome::NetworkFailure), ErrorKind::NetworkFailure);
        for code in [0, 100, 302, 405, 418, 423, 499, 600, u16::MAX] {
            assert_eq!(classify(TransportOutcome::Status(code)), ErrorKind::Unknown, "status {}", code);
        }
    }

    #[test]
    fn test_server_message() {
        assert_eq!(
            server_message(r#"{"message":"Stock not found"}"#).as_deref(),
            Some("Stock not found")
        );
        assert_eq!(server_message(r#"{"message":"Request failed"}"#), None);
        assert_eq!(server_message(r#"{"message":""}"#), None);
        assert_eq!(server_message(r#"{"message":42}"#), None);
        assert_eq!(server_message("<html>Bad Gateway</html>"), None);
        assert_eq!(server_message(""), None);
    }

    #[test]
    fn test_fallback_message_by_endpoint() {
        let login = "/services/userservice/api/auth/login";
        assert!(fallback_message(TransportOutcome::Status(401), login).contains("username or password"));
        assert_eq!(
            fallback_message(TransportOutcome::Status(401), "/api/stocks"),
            ErrorKind::AuthExpired.default_message()
        );
        assert!(fallback_message(TransportOutcome::Status(423), login).contains("locked"));
    }

    #[test]
    fn test_from_response_prefers_server_message() {
        let err = ApiError::from_response(
            reqwest::StatusCode::CONFLICT,
            r#"{"message":"Symbol already in watchlist"}"#,
            "/api/watchlist",
        );
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.status(), Some(409));
        assert_eq!(err.message(), "Symbol already in watchlist");

        let err = ApiError::from_response(reqwest::StatusCode::BAD_GATEWAY, "", "/api/stocks");
        assert_eq!(err.kind(), ErrorKind::ServerUnavailable);
        assert_eq!(err.message(), ErrorKind::ServerUnavailable.default_message());
    }

    #[test]
    fn test_session_expired_kind() {
        let err = ApiError::SessionExpired {
            message: "No refresh token available".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::AuthExpired);
        assert!(err.is_session_expired());
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short"), "short");
        let long = "é".repeat(400);
        let truncated = truncate_body(&long);
        assert!(truncated.contains("truncated, 800 total bytes"));
    }
}
