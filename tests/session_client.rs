//! Integration tests for the authenticated client against a mock API server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use httpmock::prelude::*;
use serde_json::json;
use tokio::sync::Notify;

use sharehub_client::{
    ChatCompletionRequest, ChatMessage, ClientConfig, ClientError, CredentialBackend, CredentialRecord,
    CredentialStore, FileBackend, MemoryBackend, RenewalScheduler, RequestOptions, SessionClient, TokenPair,
    TokenRefresher,
};

const REFRESH_PATH: &str = "/api/auth/refresh";
const ACCOUNTS_PATH: &str = "/api/plugin-api/accounts";

fn record(access: &str, refresh: &str, expires_in: i64) -> CredentialRecord {
    CredentialRecord::issue(
        TokenPair {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            token_type: "bearer".to_string(),
            expires_in,
        },
        None,
        Utc::now(),
    )
}

fn logged_in_client(server: &MockServer) -> Arc<SessionClient> {
    let client = SessionClient::new(ClientConfig::new(server.base_url())).unwrap();
    client.start_session(record("T1", "R1", 3600)).unwrap();
    client
}

fn user_json() -> serde_json::Value {
    json!({
        "id": 42,
        "username": "alice@example.com",
        "trust_level": 1,
        "is_active": true,
        "is_silenced": false,
        "beta": 0,
        "created_at": "2024-05-01T00:00:00Z"
    })
}

#[tokio::test]
async fn concurrent_unauthorized_calls_share_one_refresh() {
    let server = MockServer::start_async().await;
    let stale = server
        .mock_async(|when, then| {
            when.method(GET).path(ACCOUNTS_PATH).header("authorization", "Bearer T1");
            then.status(401).json_body(json!({ "detail": "Token expired" }));
        })
        .await;
    let fresh = server
        .mock_async(|when, then| {
            when.method(GET).path(ACCOUNTS_PATH).header("authorization", "Bearer T2");
            then.status(200).json_body(json!({ "success": true, "data": [] }));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(REFRESH_PATH)
                .json_body(json!({ "refresh_token": "R1" }));
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body(json!({
                    "access_token": "T2",
                    "refresh_token": "R2",
                    "token_type": "bearer",
                    "expires_in": 3600
                }));
        })
        .await;

    let client = logged_in_client(&server);
    let (a, b, c) = tokio::join!(client.accounts(), client.accounts(), client.accounts());

    assert!(a.unwrap().is_empty());
    assert!(b.unwrap().is_empty());
    assert!(c.unwrap().is_empty());

    refresh.assert_hits_async(1).await;
    stale.assert_hits_async(3).await;
    fresh.assert_hits_async(3).await;

    assert_eq!(client.stored_token().as_deref(), Some("T2"));
    assert_eq!(client.stored_refresh_token().as_deref(), Some("R2"));
    assert!(!client.gate().is_refreshing());
    assert_eq!(client.gate().waiter_count(), 0);
}

#[tokio::test]
async fn failed_refresh_expires_every_caller() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(ACCOUNTS_PATH);
            then.status(401).json_body(json!({ "detail": "Token expired" }));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path(REFRESH_PATH);
            then.status(400)
                .delay(Duration::from_millis(200))
                .json_body(json!({ "detail": "Invalid refresh token" }));
        })
        .await;

    let client = logged_in_client(&server);
    let (a, b, c) = tokio::join!(client.accounts(), client.accounts(), client.accounts());

    for result in [a, b, c] {
        assert!(matches!(result, Err(ClientError::SessionExpired)));
    }
    refresh.assert_hits_async(1).await;

    assert!(client.store().get().is_none());
    assert!(!client.is_authenticated());
    assert!(client.stored_refresh_token().is_none());
    assert!(!client.gate().is_refreshing());
}

#[tokio::test]
async fn replayed_call_is_not_refreshed_twice() {
    let server = MockServer::start_async().await;
    let me = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/auth/me");
            then.status(401).json_body(json!({ "detail": "Not authorized" }));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path(REFRESH_PATH);
            then.status(200).json_body(json!({
                "access_token": "T2",
                "refresh_token": "R2",
                "token_type": "bearer",
                "expires_in": 3600
            }));
        })
        .await;

    let client = logged_in_client(&server);
    let err = client.current_user().await.unwrap_err();

    assert!(matches!(err, ClientError::Api { status: 401, ref message } if message == "Not authorized"));
    refresh.assert_hits_async(1).await;
    me.assert_hits_async(2).await;

    // The refreshed pair is kept; only the replay failed
    assert_eq!(client.stored_token().as_deref(), Some("T2"));
}

#[tokio::test]
async fn forbidden_also_triggers_refresh() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/auth/beta-status").header("authorization", "Bearer T1");
            then.status(403).json_body(json!({ "detail": "Forbidden" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/auth/beta-status").header("authorization", "Bearer T2");
            then.status(200)
                .json_body(json!({ "success": true, "message": "ok", "beta": 1 }));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path(REFRESH_PATH);
            then.status(200).json_body(json!({
                "access_token": "T2",
                "refresh_token": "R2",
                "token_type": "bearer",
                "expires_in": 3600
            }));
        })
        .await;

    let client = logged_in_client(&server);
    let status = client.beta_status().await.unwrap();

    assert_eq!(status.beta, 1);
    refresh.assert_hits_async(1).await;
}

#[tokio::test]
async fn unauthenticated_calls_pass_through() {
    let server = MockServer::start_async().await;
    let health = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/health");
            then.status(200).json_body(json!({ "status": "healthy" }));
        })
        .await;

    let client = SessionClient::new(ClientConfig::new(server.base_url())).unwrap();
    let body: serde_json::Value = client.execute("/api/health", RequestOptions::get()).await.unwrap();

    assert_eq!(body["status"], "healthy");
    health.assert_hits_async(1).await;
}

#[tokio::test]
async fn validation_errors_are_flattened() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/api/plugin-api/accounts/c-1/status");
            then.status(422).json_body(json!({
                "detail": [
                    { "loc": ["body", "status"], "msg": "field required", "type": "value_error.missing" },
                    { "loc": ["path", "cookie_id"], "msg": "unknown account", "type": "value_error" }
                ]
            }));
        })
        .await;

    let client = logged_in_client(&server);
    let err = client.update_account_status("c-1", 1).await.unwrap_err();

    assert_eq!(err.status(), Some(422));
    assert_eq!(err.to_string(), "field required, unknown account");
}

#[tokio::test]
async fn login_then_logout() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/auth/login")
                .json_body(json!({ "username": "alice@example.com", "password": "hunter2" }));
            then.status(200).json_body(json!({
                "access_token": "T1",
                "refresh_token": "R1",
                "token_type": "bearer",
                "expires_in": 900,
                "user": user_json()
            }));
        })
        .await;
    let logout = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/auth/logout")
                .header("authorization", "Bearer T1")
                .json_body(json!({ "refresh_token": "R1" }));
            then.status(500).json_body(json!({ "detail": "backend unavailable" }));
        })
        .await;

    let client = SessionClient::new(ClientConfig::new(server.base_url())).unwrap();
    let login = client.login("alice@example.com", "hunter2").await.unwrap();

    assert_eq!(login.user.id, 42);
    assert!(client.is_authenticated());
    assert_eq!(client.stored_user().unwrap().username, "alice@example.com");
    assert!(!client.is_token_expiring_soon(Duration::from_secs(60)));

    // Local state is cleared even though the server failed
    let err = client.logout().await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    logout.assert_hits_async(1).await;
    assert!(!client.is_authenticated());
    assert!(client.stored_user().is_none());
    assert!(client.stored_refresh_token().is_none());
}

#[tokio::test]
async fn sso_callback_starts_session() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/auth/sso/callback")
                .query_param("code", "abc")
                .query_param("state", "xyz");
            then.status(200).json_body(json!({
                "access_token": "T9",
                "refresh_token": "R9",
                "token_type": "bearer",
                "expires_in": 3600,
                "user": user_json()
            }));
        })
        .await;

    let client = SessionClient::new(ClientConfig::new(server.base_url())).unwrap();
    client.sso_callback("abc", "xyz").await.unwrap();

    assert_eq!(client.stored_token().as_deref(), Some("T9"));
    assert_eq!(client.stored_refresh_token().as_deref(), Some("R9"));
}

#[tokio::test]
async fn refreshed_session_survives_restart() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/auth/me").header("authorization", "Bearer T1");
            then.status(401);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/auth/me").header("authorization", "Bearer T2");
            then.status(200).json_body(user_json());
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(REFRESH_PATH);
            then.status(200).json_body(json!({
                "access_token": "T2",
                "refresh_token": "R2",
                "token_type": "bearer",
                "expires_in": 3600
            }));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");

    let client = SessionClient::with_backend(
        ClientConfig::new(server.base_url()),
        Arc::new(FileBackend::open(&path).unwrap()),
    )
    .unwrap();
    client.start_session(record("T1", "R1", 3600)).unwrap();
    assert_eq!(client.current_user().await.unwrap().id, 42);

    let restarted = SessionClient::with_backend(
        ClientConfig::new(server.base_url()),
        Arc::new(FileBackend::open(&path).unwrap()),
    )
    .unwrap();
    assert_eq!(restarted.stored_token().as_deref(), Some("T2"));
    assert_eq!(restarted.stored_refresh_token().as_deref(), Some("R2"));
}

#[tokio::test]
async fn chat_completion_streams_text_chunks() {
    let server = MockServer::start_async().await;
    let sse = [
        r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
        "",
        r#"data: {"choices":[{"delta":{"content":", world"}}]}"#,
        "data: [DONE]",
        "",
    ]
    .join("\n");
    let chat = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer T1")
                .json_body_includes(json!({ "stream": true }).to_string());
            then.status(200).header("content-type", "text/event-stream").body(sse.clone());
        })
        .await;

    let client = logged_in_client(&server);
    let request = ChatCompletionRequest::new("gemini-2.5-flash", vec![ChatMessage::user("hi")]);
    let chunks: Vec<String> = client
        .chat_completion_stream(&request)
        .await
        .unwrap()
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;

    assert_eq!(chunks.concat(), "Hello, world");
    chat.assert_hits_async(1).await;
}

#[tokio::test]
async fn chat_requires_session() {
    let client = SessionClient::new(ClientConfig::default()).unwrap();
    let request = ChatCompletionRequest::new("m", vec![ChatMessage::user("hi")]);

    assert!(matches!(
        client.chat_completion_stream(&request).await,
        Err(ClientError::NotAuthenticated)
    ));
}

fn token_pair(access: &str, refresh: &str) -> TokenPair {
    TokenPair {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        token_type: "bearer".to_string(),
        expires_in: 3600,
    }
}

/// Refresher that blocks until the test releases it
#[derive(Clone, Default)]
struct HeldRefresher {
    started: Arc<Notify>,
    release: Arc<Notify>,
    calls: Arc<AtomicUsize>,
}

impl TokenRefresher for HeldRefresher {
    async fn refresh(&self) -> sharehub_client::Result<TokenPair> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        Ok(token_pair("T2", "R2"))
    }
}

/// Memory backend whose writes can be made to fail
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    fail_writes: AtomicBool,
}

impl CredentialBackend for FlakyBackend {
    fn load(&self) -> sharehub_client::Result<Option<CredentialRecord>> {
        self.inner.load()
    }

    fn store(&self, record: &CredentialRecord) -> sharehub_client::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full").into());
        }
        self.inner.store(record)
    }

    fn remove(&self) -> sharehub_client::Result<()> {
        self.inner.remove()
    }
}

fn held_client(store: CredentialStore) -> (Arc<SessionClient<HeldRefresher>>, HeldRefresher) {
    let refresher = HeldRefresher::default();
    let client = SessionClient::with_refresher(ClientConfig::default(), store, refresher.clone()).unwrap();
    client.start_session(record("T1", "R1", 3600)).unwrap();
    (client, refresher)
}

async fn wait_for_waiters(client: &SessionClient<HeldRefresher>, count: usize) {
    while client.gate().waiter_count() < count {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn logout_during_refresh_stays_logged_out() {
    let (client, refresher) = held_client(CredentialStore::in_memory());

    let leader = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.refresh_session().await }
    });
    refresher.started.notified().await;

    client.end_session().unwrap();
    assert!(!client.is_authenticated());

    refresher.release.notify_one();
    let result = leader.await.unwrap();

    assert!(matches!(result, Err(ClientError::SessionExpired)));
    assert!(!client.is_authenticated());
    assert!(client.stored_token().is_none());
    assert!(!client.gate().is_refreshing());
}

#[tokio::test]
async fn cancelled_leader_hands_refresh_to_waiter() {
    let (client, refresher) = held_client(CredentialStore::in_memory());

    let leader = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.refresh_session().await }
    });
    refresher.started.notified().await;

    let waiter = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.refresh_session().await }
    });
    wait_for_waiters(&client, 1).await;

    leader.abort();
    assert!(leader.await.unwrap_err().is_cancelled());

    // The waiter leads a fresh round instead of reporting an expired session
    refresher.started.notified().await;
    refresher.release.notify_one();

    assert_eq!(waiter.await.unwrap().unwrap(), "T2");
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.stored_token().as_deref(), Some("T2"));
}

#[tokio::test]
async fn unsaved_refresh_keeps_session_for_waiters() {
    let backend = Arc::new(FlakyBackend::default());
    let (client, refresher) = held_client(CredentialStore::new(backend.clone()));

    let leader = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.refresh_session().await }
    });
    refresher.started.notified().await;

    let waiter = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.refresh_session().await }
    });
    wait_for_waiters(&client, 1).await;

    backend.fail_writes.store(true, Ordering::SeqCst);
    refresher.release.notify_one();

    assert!(matches!(leader.await.unwrap(), Err(ClientError::Io(_))));
    let waiter_err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(waiter_err, ClientError::Persist(ref reason) if reason.contains("disk full")));
    assert!(!waiter_err.is_session_expired());

    // Nothing was cleared: the previous pair is still usable
    assert!(client.is_authenticated());
    assert_eq!(client.stored_token().as_deref(), Some("T1"));
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn waiter_replays_fail_independently() {
    let server = MockServer::start_async().await;
    for path in [ACCOUNTS_PATH, "/api/auth/me"] {
        server
            .mock_async(|when, then| {
                when.method(GET).path(path).header("authorization", "Bearer T1");
                then.status(401).json_body(json!({ "detail": "Token expired" }));
            })
            .await;
    }
    server
        .mock_async(|when, then| {
            when.method(GET).path(ACCOUNTS_PATH).header("authorization", "Bearer T2");
            then.status(200).json_body(json!({ "success": true, "data": [] }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/auth/me").header("authorization", "Bearer T2");
            then.status(500).json_body(json!({ "detail": "profile service down" }));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path(REFRESH_PATH);
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body(json!({
                    "access_token": "T2",
                    "refresh_token": "R2",
                    "token_type": "bearer",
                    "expires_in": 3600
                }));
        })
        .await;

    let client = logged_in_client(&server);
    let (first, me, second) = tokio::join!(client.accounts(), client.current_user(), client.accounts());

    assert!(first.unwrap().is_empty());
    assert!(second.unwrap().is_empty());
    let err = me.unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert_eq!(err.to_string(), "profile service down");

    refresh.assert_hits_async(1).await;
    assert_eq!(client.stored_token().as_deref(), Some("T2"));
}

#[tokio::test]
async fn renewal_joins_request_refresh_in_flight() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(ACCOUNTS_PATH).header("authorization", "Bearer T1");
            then.status(401);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(ACCOUNTS_PATH).header("authorization", "Bearer T2");
            then.status(200).json_body(json!({ "success": true, "data": [] }));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path(REFRESH_PATH);
            then.status(200)
                .delay(Duration::from_millis(300))
                .json_body(json!({
                    "access_token": "T2",
                    "refresh_token": "R2",
                    "token_type": "bearer",
                    "expires_in": 3600
                }));
        })
        .await;

    let config = ClientConfig::new(server.base_url());
    assert!(config.renewal.share_refresh_gate);
    let client = SessionClient::new(config).unwrap();
    // Inside the default five-minute lead window, so renewal is due immediately
    client.start_session(record("T1", "R1", 60)).unwrap();

    let request = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.accounts().await }
    });
    while !client.gate().is_refreshing() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let renewal = RenewalScheduler::start(Arc::clone(&client), || panic!("renewal should not fail"));
    while client.gate().waiter_count() < 1 {
        tokio::task::yield_now().await;
    }

    assert!(request.await.unwrap().unwrap().is_empty());
    while client.gate().is_refreshing() || client.gate().waiter_count() > 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    renewal.stop();
    renewal.join().await;

    refresh.assert_hits_async(1).await;
    assert_eq!(client.stored_token().as_deref(), Some("T2"));
}

#[tokio::test]
async fn quota_status_update() {
    let server = MockServer::start_async().await;
    let quota = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/api/plugin-api/accounts/c-1/quotas/gemini-2.5-pro/status")
                .header("authorization", "Bearer T1")
                .json_body(json!({ "status": 0 }));
            then.status(200).json_body(json!({
                "success": true,
                "data": { "model_name": "gemini-2.5-pro", "status": 0 }
            }));
        })
        .await;

    let client = logged_in_client(&server);
    let data = client.update_quota_status("c-1", "gemini-2.5-pro", 0).await.unwrap();

    assert_eq!(data["status"], 0);
    quota.assert_hits_async(1).await;
}

#[tokio::test]
async fn kiro_account_balance() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/kiro/accounts/12/balance")
                .header("authorization", "Bearer T1");
            then.status(200).json_body(json!({
                "success": true,
                "data": {
                    "account_id": "12",
                    "account_name": "work",
                    "email": "alice@example.com",
                    "subscription": "pro",
                    "balance": {
                        "available": 412.5,
                        "total_limit": 500.0,
                        "current_usage": 87.5,
                        "is_trial": false,
                        "reset_date": "2024-07-01",
                        "free_trial_expiry": null
                    },
                    "raw_data": {
                        "usage_limit": 500.0,
                        "free_trial_limit": 0.0,
                        "current_usage": 87.5,
                        "free_trial_usage": 0.0
                    }
                }
            }));
        })
        .await;

    let client = logged_in_client(&server);
    let balance = client.kiro_account_balance(12).await.unwrap();

    assert_eq!(balance.subscription, "pro");
    assert_eq!(balance.balance.available, 412.5);
    assert!(!balance.balance.is_trial);
    assert!(balance.balance.free_trial_expiry.is_none());
    assert_eq!(balance.raw_data.current_usage, 87.5);
}

#[tokio::test]
async fn sso_login_initiation_is_public() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/auth/github/login");
            then.status(200).json_body(json!({
                "authorization_url": "https://github.com/login/oauth/authorize?state=s1",
                "state": "s1"
            }));
        })
        .await;

    let client = SessionClient::new(ClientConfig::new(server.base_url())).unwrap();
    let start = client.initiate_github_login().await.unwrap();

    assert_eq!(start.state, "s1");
    assert!(start.authorization_url.starts_with("https://github.com/"));
}
