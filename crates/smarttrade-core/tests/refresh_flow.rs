//! Integration tests for request dispatch and token refresh

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use smarttrade_core::api::endpoints;
use smarttrade_core::auth::{MemoryBackend, DEFAULT_CREDENTIALS_KEY};
use smarttrade_core::config::StorageKind;
use smarttrade_core::{
    ApiClient, ApiError, ClientConfig, CredentialStore, Credentials, ErrorKind, RequestDescriptor,
    SessionSignal, StorageOrigin, TabSyncBroadcaster,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WATCHLIST: &str = "/services/userservice/api/public/watchlist";

fn client_for(server_uri: String) -> (ApiClient, CredentialStore) {
    let config = ClientConfig {
        api_base_url: server_uri,
        storage: StorageKind::Memory,
        ..ClientConfig::default()
    };
    let origin = StorageOrigin::new(Arc::new(MemoryBackend::new()));
    let store = origin.open_context(DEFAULT_CREDENTIALS_KEY);
    let client = ApiClient::new(&config, store.clone()).expect("client should build");
    (client, store)
}

fn signed_in(store: &CredentialStore, access: &str, refresh: Option<&str>) {
    store.set(Credentials::new(access, refresh.map(str::to_string)));
}

async fn mount_watchlist(server: &MockServer, token: &str, status: u16, expected: u64) {
    let template = if status == 200 {
        ResponseTemplate::new(200).set_body_json(json!([{"symbol": "VNM"}]))
    } else {
        ResponseTemplate::new(status)
    };
    Mock::given(method("GET"))
        .and(path(WATCHLIST))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(template)
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn concurrent_auth_failures_share_one_refresh() {
    //* Given
    let server = MockServer::start().await;
    mount_watchlist(&server, "tok1", 401, 3).await;
    mount_watchlist(&server, "tok2", 200, 3).await;

    // The refresh endpoint must be hit exactly once
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .and(body_json(json!({"refreshToken": "ref1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "tok2"}))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    //* When
    let (r1, r2, r3) = tokio::join!(
        client.get::<Value>(WATCHLIST),
        client.get::<Value>(WATCHLIST),
        client.get::<Value>(WATCHLIST),
    );

    //* Then
    for result in [r1, r2, r3] {
        assert_eq!(result.expect("request should succeed after refresh")[0]["symbol"], "VNM");
    }
    assert_eq!(client.refresher().refresh_count(), 1);
    assert!(!client.refresher().is_refreshing());

    let creds = store.get().expect("credentials should be present");
    assert_eq!(creds.access_token, "tok2");
    // No rotation in the response: the old refresh token is kept
    assert_eq!(creds.refresh_token.as_deref(), Some("ref1"));

    server.verify().await;
}

#[tokio::test]
async fn many_waiters_observe_the_same_failure() {
    //* Given
    let server = MockServer::start().await;
    mount_watchlist(&server, "tok1", 401, 8).await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"message": "Refresh token revoked"}))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    //* When
    let results = futures::future::join_all((0..8).map(|_| client.get::<Value>(WATCHLIST))).await;

    //* Then
    for result in results {
        let err = result.expect_err("every waiter should fail");
        assert!(err.is_session_expired(), "unexpected error: {err}");
    }
    assert_eq!(client.refresher().refresh_count(), 1);
    assert!(store.get().is_none());
    server.verify().await;
}

#[tokio::test]
async fn refreshed_token_rejected_again_is_not_retried_twice() {
    //* Given
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(WATCHLIST))
        .respond_with(ResponseTemplate::new(401))
        .expect(2) // original + the single retry
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "tok2"})))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    //* When
    let err = client.get::<Value>(WATCHLIST).await.expect_err("should give up");

    //* Then
    assert!(err.is_session_expired());
    assert_eq!(err.kind(), ErrorKind::AuthExpired);
    assert!(store.get().is_none());
    server.verify().await;
}

#[tokio::test]
async fn failed_refresh_clears_credentials() {
    //* Given
    let server = MockServer::start().await;
    mount_watchlist(&server, "tok1", 401, 1).await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    //* When
    let err = client.get::<Value>(WATCHLIST).await.expect_err("refresh failure is terminal");

    //* Then
    assert!(err.is_session_expired());
    assert!(store.get().is_none());
    server.verify().await;
}

#[tokio::test]
async fn missing_refresh_token_skips_refresh_call() {
    //* Given
    let server = MockServer::start().await;
    mount_watchlist(&server, "tok1", 401, 1).await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "tok2"})))
        .expect(0)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", None);
    let mut signals = client.local_signals();

    //* When
    let err = client.get::<Value>(WATCHLIST).await.expect_err("no way to recover");

    //* Then
    assert!(err.is_session_expired());
    assert!(store.get().is_none());
    assert_eq!(client.refresher().refresh_count(), 0);
    assert_eq!(signals.try_recv().ok(), Some(SessionSignal::SignedOut));

    // Clearing again is harmless
    store.clear();
    assert!(store.get().is_none());
    server.verify().await;
}

#[tokio::test]
async fn rotated_refresh_token_replaces_the_old_one() {
    //* Given
    let server = MockServer::start().await;
    mount_watchlist(&server, "tok1", 401, 1).await;
    mount_watchlist(&server, "tok2", 200, 1).await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "tok2",
            "refreshToken": "ref2",
            "expiresIn": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    //* When
    client.get::<Value>(WATCHLIST).await.expect("should succeed");

    //* Then
    let creds = store.get().expect("credentials should be present");
    assert_eq!(creds.access_token, "tok2");
    assert_eq!(creds.refresh_token.as_deref(), Some("ref2"));
    assert!(creds.expires_at.is_some());
    server.verify().await;
}

#[tokio::test]
async fn request_resolving_after_a_refresh_uses_the_newer_token() {
    //* Given
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(WATCHLIST))
        .and(header("authorization", "Bearer tok1"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(100)))
        .expect(1)
        .mount(&server)
        .await;
    mount_watchlist(&server, "tok2", 200, 1).await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "tok3"})))
        .expect(0)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    //* When - another refresh lands while the slow request is in flight
    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.get::<Value>(WATCHLIST).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    signed_in(&store, "tok2", Some("ref2"));

    //* Then
    slow.await.unwrap().expect("should retry with the stored token");
    assert_eq!(client.refresher().refresh_count(), 0);
    assert_eq!(store.access_token().as_deref(), Some("tok2"));
    server.verify().await;
}

#[tokio::test]
async fn refresh_completes_when_the_caller_gives_up() {
    //* Given
    let server = MockServer::start().await;
    mount_watchlist(&server, "tok1", 401, 1).await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "tok2"}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    //* When
    let outcome = tokio::time::timeout(Duration::from_millis(40), client.get::<Value>(WATCHLIST)).await;
    assert!(outcome.is_err(), "caller should time out while refresh is pending");
    tokio::time::sleep(Duration::from_millis(200)).await;

    //* Then
    assert_eq!(store.access_token().as_deref(), Some("tok2"));
    assert!(!client.refresher().is_refreshing());
    server.verify().await;
}

#[tokio::test]
async fn logout_during_refresh_stays_signed_out() {
    //* Given
    let server = MockServer::start().await;
    mount_watchlist(&server, "tok1", 401, 1).await;
    mount_watchlist(&server, "tok2", 200, 0).await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::LOGOUT))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "Logged out"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "tok2"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let origin = StorageOrigin::new(Arc::new(MemoryBackend::new()));
    let store = origin.open_context(DEFAULT_CREDENTIALS_KEY);
    let config = ClientConfig {
        api_base_url: server.uri(),
        storage: StorageKind::Memory,
        ..ClientConfig::default()
    };
    let client = ApiClient::new(&config, store.clone()).expect("client should build");
    signed_in(&store, "tok1", Some("ref1"));

    // Another context watching the same origin
    let other = TabSyncBroadcaster::new(origin.open_context(DEFAULT_CREDENTIALS_KEY));
    let (tx, mut other_signals) = tokio::sync::mpsc::unbounded_channel();
    let _subscription = other.subscribe(move |signal| {
        let _ = tx.send(signal);
    });
    let mut signals = client.local_signals();

    //* When
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.get::<Value>(WATCHLIST).await }
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    client.logout().await;
    assert!(store.get().is_none());

    let err = pending.await.unwrap().expect_err("signed out while refreshing");

    //* Then
    assert!(err.is_session_expired());
    assert!(store.get().is_none(), "refresh must not bring credentials back");
    assert!(!client.refresher().is_refreshing());

    assert_eq!(signals.try_recv().ok(), Some(SessionSignal::SignedOut));
    assert!(signals.try_recv().is_err());

    let relayed = tokio::time::timeout(Duration::from_millis(500), other_signals.recv()).await;
    assert_eq!(relayed.ok().flatten(), Some(SessionSignal::SignedOut));
    let late = tokio::time::timeout(Duration::from_millis(150), other_signals.recv()).await;
    assert!(late.is_err(), "no sign-in may follow the logout");

    server.verify().await;
}

#[tokio::test]
async fn failed_refresh_keeps_a_newer_sign_in() {
    //* Given
    let server = MockServer::start().await;
    mount_watchlist(&server, "tok1", 401, 1).await;
    mount_watchlist(&server, "tok9", 200, 1).await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(150)))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    //* When - a fresh login lands while the doomed refresh is in flight
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.get::<Value>(WATCHLIST).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    signed_in(&store, "tok9", Some("ref9"));

    //* Then
    pending.await.unwrap().expect("should retry with the new sign-in");
    let creds = store.get().expect("new sign-in survives");
    assert_eq!(creds.access_token, "tok9");
    assert_eq!(creds.refresh_token.as_deref(), Some("ref9"));
    server.verify().await;
}

#[tokio::test]
async fn logout_signals_once_when_the_session_expires_during_it() {
    //* Given
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::LOGOUT))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));
    let mut signals = client.local_signals();

    //* When
    client.logout().await;

    //* Then
    assert!(store.get().is_none());
    assert_eq!(signals.try_recv().ok(), Some(SessionSignal::SignedOut));
    assert!(signals.try_recv().is_err(), "SignedOut must be emitted once");
    server.verify().await;
}

#[tokio::test]
async fn base_path_prefix_is_kept_for_requests_and_refresh() {
    //* Given - gateway mounted under /gateway
    let server = MockServer::start().await;
    let watchlist = format!("/gateway{}", WATCHLIST);
    Mock::given(method("GET"))
        .and(path(watchlist.as_str()))
        .and(header("authorization", "Bearer tok1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(watchlist.as_str()))
        .and(header("authorization", "Bearer tok2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/gateway{}", endpoints::auth::REFRESH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "tok2"})))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(format!("{}/gateway", server.uri()));
    signed_in(&store, "tok1", Some("ref1"));

    //* When
    let body: Value = client.get(WATCHLIST).await.expect("should succeed under the prefix");

    //* Then
    assert_eq!(body, json!([]));
    assert_eq!(client.refresher().refresh_url().path(), format!("/gateway{}", endpoints::auth::REFRESH));
    server.verify().await;
}

#[tokio::test]
async fn other_error_kinds_are_surfaced_without_retry() {
    //* Given
    let server = MockServer::start().await;
    let cases = [
        ("/limited", ResponseTemplate::new(429), ErrorKind::RateLimited),
        ("/broken", ResponseTemplate::new(500), ErrorKind::ServerUnavailable),
        ("/forbidden", ResponseTemplate::new(403), ErrorKind::Forbidden),
        ("/conflict", ResponseTemplate::new(409), ErrorKind::Conflict),
        ("/invalid", ResponseTemplate::new(400), ErrorKind::ClientInvalid),
        (
            "/missing",
            ResponseTemplate::new(404).set_body_json(json!({"message": "Stock not found"})),
            ErrorKind::NotFound,
        ),
        ("/teapot", ResponseTemplate::new(418), ErrorKind::Unknown),
    ];
    for (endpoint, template, _) in &cases {
        Mock::given(method("GET"))
            .and(path(*endpoint))
            .respond_with(template.clone())
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    //* When / Then
    for (endpoint, _, kind) in &cases {
        let err = client.get::<Value>(endpoint).await.expect_err("should fail");
        assert_eq!(err.kind(), *kind, "endpoint {}", endpoint);
        assert!(!err.message().is_empty());
    }
    let err = client.get::<Value>("/missing").await;
    assert!(matches!(err, Err(ApiError::Status { .. })));

    // Credentials untouched
    assert_eq!(store.access_token().as_deref(), Some("tok1"));
    server.verify().await;
}

#[tokio::test]
async fn not_found_carries_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/stockservice/api/public/stocks/XYZ"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Stock not found"})))
        .mount(&server)
        .await;

    let (client, _store) = client_for(server.uri());
    let err = client
        .get::<Value>("/services/stockservice/api/public/stocks/XYZ")
        .await
        .expect_err("should be not found");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.message(), "Stock not found");
}

#[tokio::test]
async fn unauthenticated_requests_never_refresh() {
    //* Given
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::LOGIN))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::REFRESH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "stale", Some("ref1"));

    //* When
    let err = client.login("Trader", "wrong", true).await.expect_err("bad password");

    //* Then
    assert_eq!(err.kind(), ErrorKind::AuthExpired);
    assert!(!err.is_session_expired());
    assert!(err.message().contains("username or password"));

    let requests = server.received_requests().await.expect("recording enabled");
    assert!(requests[0].headers.get("authorization").is_none());
    server.verify().await;
}

#[tokio::test]
async fn login_stores_credentials_and_logout_clears_them() {
    //* Given
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::LOGIN))
        .and(body_json(json!({"username": "trader", "password": "pw", "rememberMe": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": "tok1",
            "refreshToken": "ref1",
            "tokenType": "Bearer",
            "expiresIn": 86400,
            "login": "trader",
            "email": "trader@example.com",
            "authorities": ["ROLE_USER"]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(endpoints::auth::LOGOUT))
        .and(header("authorization", "Bearer tok1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    let mut signals = client.local_signals();

    //* When
    let login = client.login("Trader", "pw", true).await.expect("login should succeed");

    //* Then
    assert_eq!(login.login, "trader");
    let creds = store.get().expect("credentials stored");
    assert_eq!(creds.access_token, "tok1");
    assert_eq!(creds.refresh_token.as_deref(), Some("ref1"));
    assert!(!creds.is_expired());
    assert_eq!(signals.try_recv().ok(), Some(SessionSignal::SignedIn));

    // Server-side logout fails; local credentials go anyway
    client.logout().await;
    assert!(store.get().is_none());
    assert_eq!(signals.try_recv().ok(), Some(SessionSignal::SignedOut));
    server.verify().await;
}

#[tokio::test]
async fn no_content_parses_as_unit() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/VNM", WATCHLIST)))
        .and(header("authorization", "Bearer tok1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    let _: () = client
        .delete(&format!("{}/VNM", WATCHLIST))
        .await
        .expect("204 should decode as unit");
    server.verify().await;
}

#[tokio::test]
async fn descriptor_headers_and_params_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/newsservice/api/public/news/search"))
        .and(header("x-device-id", "web-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _store) = client_for(server.uri());
    let descriptor = RequestDescriptor::get("/services/newsservice/api/public/news/search")
        .param("q", "banking")
        .param_opt::<u32>("page", None)
        .header(
            reqwest::header::HeaderName::from_static("x-device-id"),
            reqwest::header::HeaderValue::from_static("web-abc"),
        );
    let body: Value = client.request(descriptor).await.expect("should succeed");
    assert_eq!(body["items"], json!([]));

    let requests = server.received_requests().await.expect("recording enabled");
    assert_eq!(requests[0].url.query(), Some("q=banking"));
    // Anonymous call: nothing stored, nothing attached
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn only_the_stored_token_is_sent_as_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(WATCHLIST))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(server.uri());
    signed_in(&store, "tok1", Some("ref1"));

    let descriptor = RequestDescriptor::get(WATCHLIST).header(
        reqwest::header::AUTHORIZATION,
        reqwest::header::HeaderValue::from_static("Bearer stale"),
    );
    assert!(descriptor.headers().is_empty());
    let _: Value = client.request(descriptor).await.expect("should succeed");

    let requests = server.received_requests().await.expect("recording enabled");
    let sent: Vec<_> = requests[0].headers.get_all("authorization").iter().collect();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], "Bearer tok1");
}

#[tokio::test]
async fn network_failure_is_classified() {
    // Nothing listens on this port
    let (client, _store) = client_for("http://127.0.0.1:1".to_string());
    let err = client.get::<Value>("/anything").await.expect_err("connection refused");
    assert_eq!(err.kind(), ErrorKind::NetworkFailure);
}
