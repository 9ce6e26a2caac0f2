//! Community room handler. Unlike the conversation handler this one
//! does check identity: the sender must resolve to a stored user who is
//! a member of the community before anything is persisted or broadcast.

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
use uuid::Uuid;

use crate::registry::{broadcast_event, spawn_writer, RoomRegistry, Session, IDLE_TIMEOUT, PING_INTERVAL};
use crate::{store, AppResult};

/// Closed set of inbound frame shapes, discriminated on `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CommunityFrame {
    Message {
        sender_id: String,
        content: String,
    },
    Reply {
        sender_id: String,
        content: String,
        #[serde(default)]
        message_id: Option<String>,
    },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CommunityEvent {
    Message {
        sender_id: String,
        content: String,
        created_at: String,
        id: String,
        community_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
    },
    Reply {
        sender_id: String,
        content: String,
        created_at: String,
        id: String,
        message_id: String,
    },
    Departure {
        community_id: String,
    },
}

fn decode_frame(value: serde_json::Value) -> Result<CommunityFrame, &'static str> {
    match value.get("type").and_then(serde_json::Value::as_str) {
        Some("message") | Some("reply") => serde_json::from_value(value)
            .map_err(|_| "Missing 'type', 'sender_id', or 'content'."),
        Some(_) => Err("Unknown message type. Expected 'message' or 'reply'."),
        None => Err("Missing 'type', 'sender_id', or 'content'."),
    }
}

// Opaque room id: unknown strings are refused with 1008 after the
// store lookup, never rejected at the route.
#[debug_handler(state = crate::AppState)]
pub async fn community_ws(
    Path(community_id): Path<String>,
    State(db_pool): State<SqlitePool>,
    State(registry): State<RoomRegistry>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| community_socket(socket, db_pool, registry, community_id))
}

async fn community_socket(
    socket: WebSocket,
    db_pool: SqlitePool,
    registry: RoomRegistry,
    community_id: String,
) {
    let (mut sink, mut stream) = socket.split();

    match store::get_community(&db_pool, &community_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            let _ = sink
                .send(Message::Text(Utf8Bytes::from_static("Community not found.")))
                .await;
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Utf8Bytes::from_static(""),
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
    registry.register(&community_id, session.clone());

    let mut ping = interval(PING_INTERVAL);
    ping.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = stream.next() => {
                last_seen = Instant::now();
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = handle_community_frame(
                            &db_pool,
                            &registry,
                            &community_id,
                            &session,
                            text.as_str(),
                        )
                        .await
                        {
                            warn!(room = %community_id, error = %err.0, "closing community session after unhandled error");
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
                    info!(room = %community_id, session = %session_id, "disconnecting idle community session");
                    break;
                }
                if !session.send(Message::Ping(Bytes::new())) {
                    break;
                }
            }
        }
    }

    registry.unregister(&community_id, session_id);
    broadcast_event(
        &registry,
        &community_id,
        &CommunityEvent::Departure { community_id: community_id.clone() },
    );
    // Dropping the last sender lets the writer drain anything still
    // queued (a pending 1011 close in particular) before it exits.
    drop(session);
    let _ = writer.await;
}

/// One inbound frame. Validation order: field presence, sender id
/// format, sender exists, sender is a member, then (for replies) the
/// parent message exists. Every failure is a personal reply and stops
/// before any write.
pub(crate) async fn handle_community_frame(
    db_pool: &SqlitePool,
    registry: &RoomRegistry,
    community_id: &str,
    session: &Session,
    raw: &str,
) -> AppResult<()> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        session.send_text("Invalid JSON format.");
        return Ok(());
    };
    let frame = match decode_frame(value) {
        Ok(frame) => frame,
        Err(reply) => {
            session.send_text(reply);
            return Ok(());
        }
    };

    let (sender_id, content) = match &frame {
        CommunityFrame::Message { sender_id, content }
        | CommunityFrame::Reply { sender_id, content, .. } => {
            (sender_id.clone(), content.trim().to_owned())
        }
    };
    if sender_id.is_empty() || content.is_empty() {
        session.send_text("Missing 'type', 'sender_id', or 'content'.");
        return Ok(());
    }
    let Ok(sender_uuid) = Uuid::parse_str(&sender_id) else {
        session.send_text("Invalid 'sender_id' format (must be UUID).");
        return Ok(());
    };
    let sender_id = sender_uuid.to_string();

    let Some(sender) = store::get_user(db_pool, &sender_id).await? else {
        session.send_text("Sender user not found.");
        return Ok(());
    };
    if !store::is_member(db_pool, &sender_id, community_id).await? {
        session.send_text("You are not a member of this community.");
        return Ok(());
    }

    let created_at = store::now_iso();
    let event = match frame {
        CommunityFrame::Message { .. } => {
            let saved = store::create_community_message(
                db_pool,
                community_id,
                &sender_id,
                &content,
                &created_at,
            )
            .await?;
            debug!(room = community_id, message = %saved.id, "persisted community message");
            CommunityEvent::Message {
                sender_id,
                content,
                created_at,
                id: saved.id,
                community_id: community_id.to_owned(),
                sender_name: Some(sender.name),
            }
        }
        CommunityFrame::Reply { message_id, .. } => {
            let Some(message_id) = message_id else {
                session.send_text("Missing 'message_id' for reply.");
                return Ok(());
            };
            if store::get_community_message(db_pool, &message_id).await?.is_none() {
                session.send_text("Parent message not found for reply.");
                return Ok(());
            }
            let saved =
                store::create_reply(db_pool, &message_id, &sender_id, &content, &created_at)
                    .await?;
            debug!(room = community_id, reply = %saved.id, "persisted reply");
            CommunityEvent::Reply {
                sender_id,
                content,
                created_at,
                id: saved.id,
                message_id,
            }
        }
    };

    broadcast_event(registry, community_id, &event);
    Ok(())
}
