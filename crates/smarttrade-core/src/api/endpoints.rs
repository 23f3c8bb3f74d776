//! Gateway endpoint paths used by the client itself.
//!
//! Domain services (stocks, news, watchlist, notifications) are reached
//! through [`ApiClient::request`](super::ApiClient::request) with their own
//! paths; only the account endpoints the session layer depends on live here.

pub mod auth {
    pub const LOGIN: &str = "/services/userservice/api/auth/login";
    pub const LOGOUT: &str = "/services/userservice/api/auth/logout";
    pub const REFRESH: &str = "/services/userservice/api/auth/refresh";
    pub const ME: &str = "/services/userservice/api/auth/me";
    pub const SESSIONS: &str = "/services/userservice/api/auth/sessions";
    pub const LOGOUT_ALL_DEVICES: &str = "/services/userservice/api/auth/sessions/logout-all";
    pub const SESSIONS_COUNT: &str = "/services/userservice/api/auth/sessions/count";

    pub fn revoke_session(id: &str) -> String {
        format!("{}/{}", SESSIONS, id)
    }
}
