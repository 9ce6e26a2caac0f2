//! Conversation room handler. The sender identity comes verbatim from
//! the client frame; nothing here re-checks it against a logged-in
//! user, which mirrors the system this replaces. See DESIGN.md.

use axum::body::Bytes;
use axum::debug_handler;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::registry::{broadcast_event, spawn_writer, RoomRegistry, Session, IDLE_TIMEOUT, PING_INTERVAL};
use crate::{store, AppResult};

#[derive(Deserialize)]
struct ChatFrame {
    #[serde(default)]
    content: String,
    sender_id: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatEvent {
    Message {
        conversation_id: String,
        content: String,
        sender_id: String,
        created_at: String,
    },
    Departure {
        conversation_id: String,
    },
}

// Room ids are opaque strings: anything that is not a stored
// conversation id gets refused with 1008 after the lookup, it is never
// parsed at the route.
#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    Path(conversation_id): Path<String>,
    State(db_pool): State<SqlitePool>,
    State(registry): State<RoomRegistry>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| chat_socket(socket, db_pool, registry, conversation_id))
}

async fn chat_socket(
    socket: WebSocket,
    db_pool: SqlitePool,
    registry: RoomRegistry,
    conversation_id: String,
) {
    let (mut sink, mut stream) = socket.split();

    // Validate the room before registering anything.
    match store::get_conversation(&db_pool, &conversation_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Utf8Bytes::from_static("Conversation not found or accessible."),
                })))
                .await;
            return;
        }
        Err(err) => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: Utf8Bytes::from(format!("Server error: {err}")),
                })))
                .await;
            return;
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = spawn_writer(sink, rx);

    let session = Session::new(tx);
    let session_id = session.id();
    registry.register(&conversation_id, session.clone());

    let mut ping = interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = stream.next() => {
                last_seen = Instant::now();
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = handle_chat_frame(
                            &db_pool,
                            &registry,
                            &conversation_id,
                            &session,
                            text.as_str(),
                        )
                        .await
                        {
                            warn!(room = %conversation_id, error = %err.0, "closing chat session after unhandled error");
                            session.send(Message::Close(Some(CloseFrame {
                                code: close_code::ERROR,
                                reason: Utf8Bytes::from(format!("Server error: {}", err.0)),
                            })));
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > IDLE_TIMEOUT {
                    info!(room = %conversation_id, session = %session_id, "disconnecting idle chat session");
                    break;
                }
                if !session.send(Message::Ping(Bytes::new())) {
                    break;
                }
            }
        }
    }

    registry.unregister(&conversation_id, session_id);
    broadcast_event(
        &registry,
        &conversation_id,
        &ChatEvent::Departure { conversation_id: conversation_id.clone() },
    );
    // Dropping the last sender lets the writer drain anything still
    // queued (a pending 1011 close in particular) before it exits.
    drop(session);
    let _ = writer.await;
}

/// One inbound frame: validate, persist, broadcast. Protocol errors get
/// a personal reply and leave the session registered; only store-level
/// failures bubble up and end the connection.
pub(crate) async fn handle_chat_frame(
    db_pool: &SqlitePool,
    registry: &RoomRegistry,
    conversation_id: &str,
    session: &Session,
    raw: &str,
) -> AppResult<()> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        session.send_text("Invalid JSON format.");
        return Ok(());
    };
    let Ok(frame) = serde_json::from_value::<ChatFrame>(value) else {
        session.send_text("Missing 'content' or 'sender_id'");
        return Ok(());
    };

    let content = frame.content.trim();
    let sender_id = match frame.sender_id {
        Some(sender_id) if !content.is_empty() && !sender_id.is_empty() => sender_id,
        _ => {
            session.send_text("Missing 'content' or 'sender_id'");
            return Ok(());
        }
    };

    // The store write has to commit before the broadcast starts so that
    // broadcast order mirrors commit order for the room.
    let created_at = store::now_iso();
    let message =
        store::create_message(db_pool, conversation_id, &sender_id, content, &created_at).await?;
    debug!(room = conversation_id, message = %message.id, "persisted conversation message");

    broadcast_event(
        registry,
        conversation_id,
        &ChatEvent::Message {
            conversation_id: conversation_id.to_owned(),
            content: content.to_owned(),
            sender_id,
            created_at,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_pool;

    fn session() -> (Session, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(tx), rx)
    }

    fn recv_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> String {
        match rx.try_recv().expect("expected a queued message") {
            Message::Text(text) => text.as_str().to_owned(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_gets_a_personal_reply_and_nothing_else() {
        let pool = test_pool().await;
        let conversation = store::create_conversation(&pool, "u1", "u2").await.unwrap();
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = session();
        let (b, mut rx_b) = session();
        registry.register(&conversation.id, a.clone());
        registry.register(&conversation.id, b);

        handle_chat_frame(&pool, &registry, &conversation.id, &a, "{not json")
            .await
            .unwrap();

        assert_eq!(recv_text(&mut rx_a), "Invalid JSON format.");
        assert!(rx_b.try_recv().is_err());
        let rows = store::messages_by_conversation(&pool, &conversation.id).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn missing_fields_persist_and_broadcast_nothing() {
        let pool = test_pool().await;
        let conversation = store::create_conversation(&pool, "u1", "u2").await.unwrap();
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = session();
        registry.register(&conversation.id, a.clone());

        for raw in [r#"{"sender_id":"u1"}"#, r#"{"content":"  ","sender_id":"u1"}"#, r#"{"content":"hi"}"#] {
            handle_chat_frame(&pool, &registry, &conversation.id, &a, raw)
                .await
                .unwrap();
            assert_eq!(recv_text(&mut rx_a), "Missing 'content' or 'sender_id'");
        }

        let rows = store::messages_by_conversation(&pool, &conversation.id).await.unwrap();
        assert!(rows.is_empty());
        let cached = store::get_conversation(&pool, &conversation.id).await.unwrap().unwrap();
        assert!(cached.last_message.is_none());
    }

    #[tokio::test]
    async fn valid_frame_is_persisted_and_broadcast_to_both_sessions() {
        let pool = test_pool().await;
        let conversation = store::create_conversation(&pool, "u1", "u2").await.unwrap();
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = session();
        let (b, mut rx_b) = session();
        registry.register(&conversation.id, a.clone());
        registry.register(&conversation.id, b);

        handle_chat_frame(
            &pool,
            &registry,
            &conversation.id,
            &a,
            r#"{"content":"hi","sender_id":"u1"}"#,
        )
        .await
        .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let payload: serde_json::Value = serde_json::from_str(&recv_text(rx)).unwrap();
            assert_eq!(payload["conversation_id"], conversation.id.as_str());
            assert_eq!(payload["content"], "hi");
            assert_eq!(payload["sender_id"], "u1");
            assert_eq!(payload["type"], "message");
            assert!(payload["created_at"].is_string());
        }

        let rows = store::messages_by_conversation(&pool, &conversation.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sender_id, "u1");
        assert_eq!(rows[0].content, "hi");

        let cached = store::get_conversation(&pool, &conversation.id).await.unwrap().unwrap();
        assert_eq!(cached.last_message.as_deref(), Some("hi"));
        assert_eq!(cached.last_message_time.as_deref(), Some(rows[0].created_at.as_str()));
    }
}
