use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chat_server::ai::{AiBackend, ChatTurn};
use chat_server::auth::otp::OtpPurpose;
use chat_server::config::{AppState, ChatServerConfig};
use chat_server::mailer::{Mailer, MemoryMailer};
use chat_server::models::SendMessageInput;
use chat_server::realtime::ServerEvent;
use chat_server::{build_state, router, store};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tower::ServiceExt;

struct EchoBackend;

#[async_trait]
impl AiBackend for EchoBackend {
    async fn complete(&self, turns: Vec<ChatTurn>) -> anyhow::Result<String> {
        Ok(format!("echo: {}", turns.last().map(|t| t.content.as_str()).unwrap_or("")))
    }
}

/// Records codes like `MemoryMailer` but can be told to fail
#[derive(Default)]
struct FlakyMailer {
    inner: MemoryMailer,
    down: AtomicBool,
}

impl FlakyMailer {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn last_code(&self, to: &str, purpose: OtpPurpose) -> Option<String> {
        self.inner.last_code(to, purpose)
    }
}

#[async_trait]
impl Mailer for FlakyMailer {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> anyhow::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("smtp unreachable");
        }
        self.inner.send_otp(to, code, purpose).await
    }
}

struct TestApp {
    app: Router,
    state: AppState,
    mailer: Arc<FlakyMailer>,
    _dir: tempfile::TempDir,
}

async fn test_app() -> TestApp {
    let backend: Arc<dyn AiBackend> = Arc::new(EchoBackend);
    test_app_with(Some(backend), 0).await
}

async fn test_app_with(
    backend: Option<Arc<dyn AiBackend>>,
    resend_cooldown_secs: i64,
) -> TestApp {
    let dir = tempdir().unwrap();
    let mut config = ChatServerConfig::with_base_dir(dir.path());
    config.database_url = "sqlite::memory:".to_string();
    config.otp_resend_cooldown_secs = resend_cooldown_secs;
    config.bcrypt_cost = 4;
    config.ensure_dirs().await.unwrap();

    let pool = store::connect(&config.database_url).await.unwrap();
    let mailer = Arc::new(FlakyMailer::default());
    let state = build_state(config, pool, mailer.clone(), backend)
        .await
        .unwrap();

    TestApp {
        app: router::router(state.clone()),
        state,
        mailer,
        _dir: dir,
    }
}

impl TestApp {
    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Sign up, read the code from the mailer, verify; returns (user_id, token)
    async fn register(&self, name: &str) -> (String, String) {
        let email = format!("{}@example.com", name);
        let (status, _) = self
            .call(
                Method::POST,
                "/api/auth/signup",
                None,
                Some(json!({"email": email, "username": name, "password": "secret1"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let code = self
            .mailer
            .last_code(&email, OtpPurpose::VerifyEmail)
            .unwrap();
        let (status, body) = self
            .call(
                Method::POST,
                "/api/auth/verify-email",
                None,
                Some(json!({"email": email, "code": code})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        (
            body["user"]["id"].as_str().unwrap().to_string(),
            body["token"].as_str().unwrap().to_string(),
        )
    }
}

#[tokio::test]
async fn test_auth_flow() {
    let t = test_app().await;

    let (status, body) = t.call(Method::GET, "/api/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"]["message"].is_string());

    let (status, _) = t
        .call(
            Method::POST,
            "/api/auth/signup",
            None,
            Some(json!({
                "email": "pending@example.com",
                "username": "pending",
                "password": "secret1"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = t
        .call(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"email": "pending@example.com", "password": "secret1"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (alice_id, token) = t.register("alice").await;
    let (status, me) = t.call(Method::GET, "/api/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["id"], alice_id);
    assert!(me.get("password_hash").is_none());

    let (status, login) = t
        .call(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"email": "alice@example.com", "password": "secret1"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let second_token = login["token"].as_str().unwrap().to_string();

    let (status, _) = t
        .call(Method::POST, "/api/auth/logout", Some(&second_token), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = t
        .call(Method::GET, "/api/auth/me", Some(&second_token), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The first session is unaffected.
    let (status, _) = t.call(Method::GET, "/api/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_conversation_and_message_flow() {
    let t = test_app().await;
    let (alice_id, alice) = t.register("alice").await;
    let (bob_id, bob) = t.register("bob").await;
    let (carol_id, carol) = t.register("carol").await;

    let (status, users) = t.call(Method::GET, "/api/users?q=bo", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(users.as_array().unwrap().len(), 1);
    assert_eq!(users[0]["id"], bob_id);

    // Direct conversation is created once
    let (status, direct) = t
        .call(
            Method::POST,
            "/api/conversations/direct",
            Some(&alice),
            Some(json!({"peer_id": bob_id})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let direct_id = direct["id"].as_str().unwrap().to_string();
    let (status, again) = t
        .call(
            Method::POST,
            "/api/conversations/direct",
            Some(&bob),
            Some(json!({"peer_id": alice_id})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], direct_id.as_str());

    // Message with a client id comes back tagged
    let messages_uri = format!("/api/conversations/{}/messages", direct_id);
    let (status, sent) = t
        .call(
            Method::POST,
            &messages_uri,
            Some(&alice),
            Some(json!({"content": "hi bob", "client_id": "tmp-42"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent["client_id"], "tmp-42");
    assert_eq!(sent["type"], "text");
    let message_id = sent["id"].as_str().unwrap().to_string();

    let (status, _) = t.call(Method::GET, &messages_uri, Some(&carol), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, list) = t.call(Method::GET, "/api/conversations", Some(&bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list[0]["unread_count"], 1);

    let (status, read) = t
        .call(
            Method::POST,
            &format!("/api/conversations/{}/read", direct_id),
            Some(&bob),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read["message_ids"], json!([message_id]));

    let (status, reacted) = t
        .call(
            Method::POST,
            &format!("/api/messages/{}/reactions", message_id),
            Some(&bob),
            Some(json!({"emoji": "👍"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reacted["reactions"][0]["user_id"], bob_id.as_str());

    let (status, _) = t
        .call(
            Method::DELETE,
            &format!("/api/messages/{}", message_id),
            Some(&bob),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = t
        .call(
            Method::DELETE,
            &format!("/api/messages/{}", message_id),
            Some(&alice),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, history) = t.call(Method::GET, &messages_uri, Some(&bob), None).await;
    assert_eq!(history[0]["deleted"], true);
    assert_eq!(history[0]["content"], "");

    // Group with a system notice
    let (status, group) = t
        .call(
            Method::POST,
            "/api/conversations/group",
            Some(&alice),
            Some(json!({"name": "Weekend", "participant_ids": [bob_id, carol_id]})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(group["participants"].as_array().unwrap().len(), 3);
    assert_eq!(group["last_message"]["type"], "system");

    let (status, _) = t
        .call(
            Method::PUT,
            &format!("/api/conversations/{}/name", group["id"].as_str().unwrap()),
            Some(&carol),
            Some(json!({"name": "Mine now"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = t
        .call(
            Method::POST,
            "/api/conversations/group",
            Some(&alice),
            Some(json!({"name": "Too small", "participant_ids": [bob_id]})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_password_reset_closes_open_sockets() {
    let t = test_app().await;
    let (alice_id, token) = t.register("alice").await;
    let (bob_id, _) = t.register("bob").await;
    let mut socket = t.state.hub.connect(&alice_id, &token);
    let _bob_socket = t.state.hub.connect(&bob_id, "bob-session");

    let (status, _) = t
        .call(
            Method::POST,
            "/api/auth/forgot-password",
            None,
            Some(json!({"email": "alice@example.com"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let code = t
        .mailer
        .last_code("alice@example.com", OtpPurpose::ResetPassword)
        .unwrap();
    let (status, _) = t
        .call(
            Method::POST,
            "/api/auth/reset-password",
            None,
            Some(json!({
                "email": "alice@example.com",
                "code": code,
                "new_password": "newsecret"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let closed = tokio::time::timeout(Duration::from_millis(50), socket.closed.notified()).await;
    assert!(closed.is_ok());
    assert!(!t.state.hub.is_online(&alice_id));
    assert!(t.state.hub.is_online(&bob_id));

    t.state.hub.send_to_user(&alice_id, &ServerEvent::Pong);
    assert!(socket.rx.try_recv().is_err());

    let (status, _) = t.call(Method::GET, "/api/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_failed_mail_lets_the_code_be_resent() {
    let t = test_app_with(None, 60).await;
    let signup = json!({"email": "dora@example.com", "username": "dora", "password": "secret1"});

    t.mailer.set_down(true);
    let (status, body) = t
        .call(Method::POST, "/api/auth/signup", None, Some(signup))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"]["message"].is_string());
    assert!(t
        .mailer
        .last_code("dora@example.com", OtpPurpose::VerifyEmail)
        .is_none());

    // The undelivered code is gone, so the cooldown does not apply.
    t.mailer.set_down(false);
    let (status, _) = t
        .call(
            Method::POST,
            "/api/auth/resend-otp",
            None,
            Some(json!({"email": "dora@example.com"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let code = t
        .mailer
        .last_code("dora@example.com", OtpPurpose::VerifyEmail)
        .unwrap();

    // A delivered code does start the cooldown.
    let (status, _) = t
        .call(
            Method::POST,
            "/api/auth/resend-otp",
            None,
            Some(json!({"email": "dora@example.com"})),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, _) = t
        .call(
            Method::POST,
            "/api/auth/verify-email",
            None,
            Some(json!({"email": "dora@example.com", "code": code})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_assistant_disabled_without_backend() {
    let t = test_app_with(None, 0).await;
    let (_, alice) = t.register("alice").await;

    let (status, ai) = t.call(Method::GET, "/api/ai", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ai["enabled"], false);
    assert!(ai["bot"].is_null());

    let (status, _) = t
        .call(Method::POST, "/api/conversations/ai", Some(&alice), None)
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, health) = t.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["ai_enabled"], false);
}

#[tokio::test]
async fn test_ai_conversation_and_uploads() {
    let t = test_app().await;
    let (_, alice) = t.register("alice").await;

    let (status, ai) = t.call(Method::GET, "/api/ai", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ai["enabled"], true);
    assert_eq!(ai["bot"]["username"], "assistant");
    let bot_id = ai["bot"]["id"].as_str().unwrap();
    assert!(t.state.hub.is_online(bot_id));

    let (status, conv) = t
        .call(Method::POST, "/api/conversations/ai", Some(&alice), None)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(conv["kind"], "ai");
    let (status, again) = t
        .call(Method::POST, "/api/conversations/ai", Some(&alice), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], conv["id"]);

    // The bot never shows up in the user directory
    let (_, users) = t.call(Method::GET, "/api/users", Some(&alice), None).await;
    assert!(users.as_array().unwrap().is_empty());

    // Upload a tiny PNG and fetch it back
    let png: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
    let boundary = "XBOUNDARYX";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"dot.png\"\r\nContent-Type: image/png\r\n\r\n",
            b = boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(png);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    let request = Request::builder()
        .method(Method::POST)
        .uri("/uploads")
        .header(header::AUTHORIZATION, format!("Bearer {}", alice))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let uploaded: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(uploaded["content_type"], "image/png");
    let url = uploaded["url"].as_str().unwrap().to_string();

    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri(&url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

    // Image messages reference the stored URL
    let (status, msg) = t
        .call(
            Method::POST,
            &format!("/api/conversations/{}/messages", conv["id"].as_str().unwrap()),
            Some(&alice),
            Some(json!({"image_url": url})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(msg["type"], "image");

    let (status, health) = t.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["ai_enabled"], true);
}

#[tokio::test]
async fn test_messages_survive_restart() {
    let dir = tempdir().unwrap();
    let mut config = ChatServerConfig::with_base_dir(dir.path());
    config.otp_resend_cooldown_secs = 0;
    config.bcrypt_cost = 4;
    config.ensure_dirs().await.unwrap();

    let conversation_id;
    let alice_id;
    {
        let pool = store::connect(&config.database_url).await.unwrap();
        let mailer = Arc::new(MemoryMailer::new());
        let state = build_state(config.clone(), pool.clone(), mailer.clone(), None)
            .await
            .unwrap();

        state
            .auth
            .signup("alice@example.com", "alice", "secret1")
            .await
            .unwrap();
        state
            .auth
            .signup("bob@example.com", "bob", "secret1")
            .await
            .unwrap();
        let (alice, _) = state
            .auth
            .verify_email(
                "alice@example.com",
                &mailer
                    .last_code("alice@example.com", OtpPurpose::VerifyEmail)
                    .unwrap(),
            )
            .await
            .unwrap();
        let (bob, _) = state
            .auth
            .verify_email(
                "bob@example.com",
                &mailer
                    .last_code("bob@example.com", OtpPurpose::VerifyEmail)
                    .unwrap(),
            )
            .await
            .unwrap();

        let (conv, _) = state
            .conversations
            .create_direct(&alice.id, &bob.id)
            .await
            .unwrap();
        state
            .messages
            .send(
                &conv.id,
                &alice.id,
                SendMessageInput {
                    content: Some("Hello Integrity!".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        conversation_id = conv.id;
        alice_id = alice.id;
        pool.close().await;
    }

    assert!(dir.path().join("chat.sqlite").exists());

    let pool = store::connect(&config.database_url).await.unwrap();
    let state = build_state(config, pool, Arc::new(MemoryMailer::new()), None)
        .await
        .unwrap();
    let messages = state
        .messages
        .list(&conversation_id, &alice_id, None, None)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hello Integrity!");
}
