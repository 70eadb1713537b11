//! One WebSocket session
//!
//! The socket is split in two: a writer task drains the hub channel into
//! the socket, a reader task parses client frames and dispatches them.
//! Whichever finishes first tears the other down, as does the hub closing
//! the connection when its session is revoked.

use super::events::{ClientEvent, ServerEvent};
use super::hub::Registration;
use super::relay_typing;
use crate::auth::middleware::bearer_token;
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::messages::handlers::post_message;
use crate::models::SendMessageInput;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws?token=<session token>
///
/// Browsers cannot set headers on the upgrade request, hence the query
/// parameter. A bearer header is accepted as well.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = match query.token.filter(|t| !t.is_empty()) {
        Some(token) => token,
        None => bearer_token(&headers)?.to_string(),
    };
    let user_id = state.auth.validate_session(&token).await?;

    debug!("[WS] Upgrading connection for {}", user_id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, token)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String, token: String) {
    let (mut sink, mut stream) = socket.split();
    let registration = open_connection(&state, &user_id, &token).await;
    let conn_id = registration.conn_id;
    let closed = registration.closed;
    let mut rx = registration.rx;

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("[WS] Failed to encode event: {}", e);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let reader_state = state.clone();
    let reader_user = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                WsMessage::Text(text) => {
                    handle_frame(&reader_state, &reader_user, conn_id, text.as_str()).await;
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        _ = closed.notified() => {
            debug!("[WS] Hub closed connection {} of {}", conn_id, user_id);
            send_task.abort();
            recv_task.abort();
        }
    }

    close_connection(&state, &user_id, conn_id).await;
}

/// Register a socket, greet it, and announce the user if this is their
/// first one
pub(crate) async fn open_connection(
    state: &AppState,
    user_id: &str,
    token: &str,
) -> Registration {
    let registration = state.hub.connect(user_id, token);
    let conn_id = registration.conn_id;

    state.hub.send_to_connection(
        user_id,
        conn_id,
        ServerEvent::Connected {
            user_id: user_id.to_string(),
        },
    );
    state.hub.send_to_connection(
        user_id,
        conn_id,
        ServerEvent::OnlineUsers {
            user_ids: state.hub.online_users(),
        },
    );

    if registration.first {
        sync_presence(state, user_id, true).await;
    }
    registration
}

/// Forget a socket; the last one out clears typing and goes offline
pub(crate) async fn close_connection(state: &AppState, user_id: &str, conn_id: Uuid) {
    let last = state.hub.disconnect(user_id, conn_id);
    if last {
        for stopped in state.typing.clear_user(user_id) {
            relay_typing(state, stopped).await;
        }
        sync_presence(state, user_id, false).await;
    }
    info!("[WS] {} closed connection {}", user_id, conn_id);
}

/// Persist and announce a presence change, unless the hub has moved on
/// (a reconnect racing a teardown) by the time the lock is held
async fn sync_presence(state: &AppState, user_id: &str, online: bool) {
    let _guard = state.hub.presence_lock().await;
    if state.hub.is_online(user_id) != online {
        debug!("[WS] Skipping stale presence change for {}", user_id);
        return;
    }
    match state.auth.set_online(user_id, online).await {
        Ok(presence) => state.hub.broadcast(&ServerEvent::Presence(presence)),
        Err(e) => warn!("[WS] Failed to update presence of {}: {}", user_id, e),
    }
}

/// Parse and dispatch one client frame; failures go back to the sender only
async fn handle_frame(state: &AppState, user_id: &str, conn_id: Uuid, text: &str) {
    let result = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => dispatch(state, user_id, conn_id, event).await,
        Err(e) => Err(Error::BadRequest(format!("Invalid frame: {}", e))),
    };

    if let Err(e) = result {
        debug!("[WS] Frame from {} rejected: {}", user_id, e);
        let message = if e.status().is_server_error() {
            "Internal server error".to_string()
        } else {
            e.to_string()
        };
        state
            .hub
            .send_to_connection(user_id, conn_id, ServerEvent::Error { message });
    }
}

async fn dispatch(
    state: &AppState,
    user_id: &str,
    conn_id: Uuid,
    event: ClientEvent,
) -> Result<()> {
    match event {
        ClientEvent::SendMessage {
            conversation_id,
            content,
            image_url,
            client_id,
        } => {
            let input = SendMessageInput {
                content,
                image_url,
                client_id,
            };
            post_message(state, user_id, &conversation_id, input).await?;
        }
        ClientEvent::Typing { conversation_id } => {
            let participants = state.conversations.participant_ids(&conversation_id).await?;
            if !participants.iter().any(|id| id == user_id) {
                return Err(Error::Forbidden(
                    "You are not a member of this conversation".to_string(),
                ));
            }
            let indicator = state.typing.start(&conversation_id, user_id);
            relay_typing(state, indicator).await;
        }
        ClientEvent::StopTyping { conversation_id } => {
            if let Some(indicator) = state.typing.stop(&conversation_id, user_id) {
                relay_typing(state, indicator).await;
            }
        }
        ClientEvent::MarkRead { conversation_id } => {
            state.messages.mark_read(&conversation_id, user_id).await?;
        }
        ClientEvent::React { message_id, emoji } => {
            state.messages.react(&message_id, user_id, &emoji).await?;
        }
        ClientEvent::Ping => {
            state.hub.send_to_connection(user_id, conn_id, ServerEvent::Pong);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::verified_user;
    use crate::build_state;
    use crate::config::ChatServerConfig;
    use crate::ctx::Ctx;
    use crate::mailer::MemoryMailer;
    use crate::models::UserInfo;
    use crate::realtime::hub::EventReceiver;
    use crate::store::memory_pool;
    use axum::extract::State;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        state: AppState,
        alice: (UserInfo, String),
        bob: (UserInfo, String),
        carol: (UserInfo, String),
        conversation_id: String,
    }

    async fn fixture() -> Fixture {
        let mut config = ChatServerConfig::with_base_dir("unused");
        config.otp_resend_cooldown_secs = 0;
        config.bcrypt_cost = 4;
        let mailer = Arc::new(MemoryMailer::new());
        let state = build_state(config, memory_pool().await, mailer.clone(), None)
            .await
            .unwrap();

        let mut users = Vec::new();
        for name in ["alice", "bob", "carol"] {
            let (user, session) = verified_user(&state.auth, &mailer, name).await;
            users.push((user, session.token));
        }
        let carol = users.pop().unwrap();
        let bob = users.pop().unwrap();
        let alice = users.pop().unwrap();

        let (conversation, _) = state
            .conversations
            .create_direct(&alice.0.id, &bob.0.id)
            .await
            .unwrap();

        Fixture {
            state,
            alice,
            bob,
            carol,
            conversation_id: conversation.id,
        }
    }

    fn drain(rx: &mut EventReceiver) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn frame(event: &str, data: serde_json::Value) -> String {
        serde_json::json!({ "event": event, "data": data }).to_string()
    }

    #[tokio::test]
    async fn test_connect_greets_and_announces_presence() {
        let f = fixture().await;
        let (alice, alice_token) = &f.alice;
        let mut bob = open_connection(&f.state, &f.bob.0.id, &f.bob.1).await;
        drain(&mut bob.rx);

        let mut tab1 = open_connection(&f.state, &alice.id, alice_token).await;
        let events = drain(&mut tab1.rx);
        assert_eq!(
            events[0],
            ServerEvent::Connected {
                user_id: alice.id.clone()
            }
        );
        match &events[1] {
            ServerEvent::OnlineUsers { user_ids } => {
                assert!(user_ids.contains(&alice.id));
                assert!(user_ids.contains(&f.bob.0.id));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match drain(&mut bob.rx).as_slice() {
            [ServerEvent::Presence(p)] => {
                assert_eq!(p.user_id, alice.id);
                assert!(p.is_online);
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert!(f.state.auth.get_user(&alice.id).await.unwrap().is_online);

        // A second tab is not news.
        let tab2 = open_connection(&f.state, &alice.id, alice_token).await;
        assert!(drain(&mut bob.rx).is_empty());

        close_connection(&f.state, &alice.id, tab1.conn_id).await;
        assert!(drain(&mut bob.rx).is_empty());
        assert!(f.state.auth.get_user(&alice.id).await.unwrap().is_online);

        close_connection(&f.state, &alice.id, tab2.conn_id).await;
        match drain(&mut bob.rx).as_slice() {
            [ServerEvent::Presence(p)] => assert!(!p.is_online),
            other => panic!("unexpected events {:?}", other),
        }
        let stored = f.state.auth.get_user(&alice.id).await.unwrap();
        assert!(!stored.is_online);
        assert!(stored.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_during_teardown_stays_online() {
        let f = fixture().await;
        let (alice, token) = &f.alice;
        let old = open_connection(&f.state, &alice.id, token).await;
        let mut bob = open_connection(&f.state, &f.bob.0.id, &f.bob.1).await;
        drain(&mut bob.rx);

        // The old socket leaves the hub, a refresh reconnects, and only
        // then does the old teardown get to write presence.
        assert!(f.state.hub.disconnect(&alice.id, old.conn_id));
        let _new = open_connection(&f.state, &alice.id, token).await;
        sync_presence(&f.state, &alice.id, false).await;

        assert!(f.state.auth.get_user(&alice.id).await.unwrap().is_online);
        let offline = drain(&mut bob.rx)
            .into_iter()
            .any(|e| matches!(e, ServerEvent::Presence(p) if !p.is_online));
        assert!(!offline);
    }

    #[tokio::test]
    async fn test_typing_survives_until_last_socket_closes() {
        let f = fixture().await;
        let (alice, token) = &f.alice;
        let tab1 = open_connection(&f.state, &alice.id, token).await;
        let tab2 = open_connection(&f.state, &alice.id, token).await;
        let mut bob = open_connection(&f.state, &f.bob.0.id, &f.bob.1).await;
        drain(&mut bob.rx);

        let typing = frame("typing", serde_json::json!({ "conversation_id": f.conversation_id }));
        handle_frame(&f.state, &alice.id, tab2.conn_id, &typing).await;
        match drain(&mut bob.rx).as_slice() {
            [ServerEvent::Typing(t)] => assert!(t.is_typing),
            other => panic!("unexpected events {:?}", other),
        }

        close_connection(&f.state, &alice.id, tab1.conn_id).await;
        assert!(drain(&mut bob.rx).is_empty());
        assert_eq!(f.state.typing.active(&f.conversation_id).len(), 1);

        close_connection(&f.state, &alice.id, tab2.conn_id).await;
        let events = drain(&mut bob.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Typing(t) if !t.is_typing && t.user_id == alice.id)));
        assert!(f.state.typing.active(&f.conversation_id).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_frames_answer_with_error() {
        let f = fixture().await;
        let (carol, token) = &f.carol;
        let mut conn = open_connection(&f.state, &carol.id, token).await;
        drain(&mut conn.rx);

        handle_frame(&f.state, &carol.id, conn.conn_id, "not json").await;
        handle_frame(
            &f.state,
            &carol.id,
            conn.conn_id,
            &frame("typing", serde_json::json!({ "conversation_id": f.conversation_id })),
        )
        .await;
        handle_frame(
            &f.state,
            &carol.id,
            conn.conn_id,
            &frame(
                "send_message",
                serde_json::json!({ "conversation_id": f.conversation_id, "content": "hi" }),
            ),
        )
        .await;

        let events = drain(&mut conn.rx);
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| matches!(e, ServerEvent::Error { .. })));
        assert!(f
            .state
            .messages
            .recent(&f.conversation_id, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_ping_answers_only_that_socket() {
        let f = fixture().await;
        let (alice, token) = &f.alice;
        let mut tab1 = open_connection(&f.state, &alice.id, token).await;
        let mut tab2 = open_connection(&f.state, &alice.id, token).await;
        drain(&mut tab1.rx);
        drain(&mut tab2.rx);

        handle_frame(&f.state, &alice.id, tab1.conn_id, r#"{"event":"ping"}"#).await;
        assert_eq!(drain(&mut tab1.rx), vec![ServerEvent::Pong]);
        assert!(drain(&mut tab2.rx).is_empty());
    }

    #[tokio::test]
    async fn test_message_read_and_reaction_over_socket() {
        let f = fixture().await;
        let (alice, alice_token) = &f.alice;
        let (bob, bob_token) = &f.bob;
        let mut a = open_connection(&f.state, &alice.id, alice_token).await;
        let mut b = open_connection(&f.state, &bob.id, bob_token).await;
        drain(&mut a.rx);
        drain(&mut b.rx);

        let send = frame(
            "send_message",
            serde_json::json!({
                "conversation_id": f.conversation_id,
                "content": "hello bob",
                "client_id": "tmp-1"
            }),
        );
        handle_frame(&f.state, &alice.id, a.conn_id, &send).await;

        let message = match drain(&mut b.rx).as_slice() {
            [ServerEvent::NewMessage(m)] => m.clone(),
            other => panic!("unexpected events {:?}", other),
        };
        assert_eq!(message.content, "hello bob");
        assert_eq!(message.client_id.as_deref(), Some("tmp-1"));
        assert!(drain(&mut a.rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::NewMessage(m) if m.id == message.id)));

        let read = frame("mark_read", serde_json::json!({ "conversation_id": f.conversation_id }));
        handle_frame(&f.state, &bob.id, b.conn_id, &read).await;
        match drain(&mut a.rx).as_slice() {
            [ServerEvent::MessagesRead {
                reader_id,
                message_ids,
                ..
            }] => {
                assert_eq!(reader_id, &bob.id);
                assert_eq!(message_ids, &vec![message.id.clone()]);
            }
            other => panic!("unexpected events {:?}", other),
        }

        let react = frame(
            "react",
            serde_json::json!({ "message_id": message.id, "emoji": "👍" }),
        );
        handle_frame(&f.state, &bob.id, b.conn_id, &react).await;
        match drain(&mut a.rx).as_slice() {
            [ServerEvent::ReactionUpdated { reactions, .. }] => {
                assert_eq!(reactions.len(), 1);
                assert_eq!(reactions[0].emoji, "👍");
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_logout_closes_that_session_socket() {
        let f = fixture().await;
        let (alice, token) = &f.alice;
        let mut conn = open_connection(&f.state, &alice.id, token).await;
        drain(&mut conn.rx);

        crate::auth::handlers::logout(
            State(f.state.clone()),
            Ctx::new(alice.id.clone(), token.clone()),
        )
        .await
        .unwrap();

        let fired = tokio::time::timeout(Duration::from_millis(50), conn.closed.notified()).await;
        assert!(fired.is_ok());
        assert!(!f.state.hub.is_online(&alice.id));

        f.state.hub.send_to_user(&alice.id, &ServerEvent::Pong);
        assert!(drain(&mut conn.rx).is_empty());

        close_connection(&f.state, &alice.id, conn.conn_id).await;
        assert!(!f.state.auth.get_user(&alice.id).await.unwrap().is_online);
    }
}
