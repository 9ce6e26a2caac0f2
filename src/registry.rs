//! Per-room connection registry: one entry per live room, one `Session`
//! per accepted socket. The registry is an injected handle cloned into
//! every connection task; all mutation and broadcast iteration happens
//! under a single lock, and sends are non-blocking pushes into each
//! session's outbound queue, so the lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes};
use futures_util::{Sink, SinkExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Server ping cadence on idle connections.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A connection with no inbound traffic (frames or pongs) for this long
/// is disconnected. The source system had no idle policy at all; this
/// bounds dead connections.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// One live connection registered under a room. Cloning shares the same
/// outbound queue; the receiving half is owned by the connection's
/// writer task.
#[derive(Clone)]
pub struct Session {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
}

impl Session {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { id: Uuid::now_v7(), tx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a message for the peer. Returns false once the writer task
    /// is gone, which the registry treats as a dead session.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Personal reply: a text frame to this session only.
    pub fn send_text(&self, text: &str) -> bool {
        self.send(Message::Text(Utf8Bytes::from(text.to_owned())))
    }
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<String, Vec<Session>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session into a room, creating the room entry if absent.
    pub fn register(&self, room_id: &str, session: Session) {
        let mut rooms = self.rooms.lock().unwrap();
        debug!(room = room_id, session = %session.id, "session registered");
        rooms.entry(room_id.to_owned()).or_default().push(session);
    }

    /// Remove a session if present; idempotent. The room entry is
    /// dropped the instant it becomes empty.
    pub fn unregister(&self, room_id: &str, session_id: Uuid) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(sessions) = rooms.get_mut(room_id) {
            sessions.retain(|s| s.id != session_id);
            if sessions.is_empty() {
                rooms.remove(room_id);
            }
            debug!(room = room_id, session = %session_id, "session unregistered");
        }
    }

    /// Deliver a serialized frame to every session in the room, in
    /// registration order. A failed send evicts that session and never
    /// aborts delivery to the rest.
    pub fn broadcast(&self, room_id: &str, payload: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        let Some(sessions) = rooms.get_mut(room_id) else {
            return;
        };
        sessions.retain(|session| {
            let ok = session.send(Message::Text(Utf8Bytes::from(payload.to_owned())));
            if !ok {
                warn!(room = room_id, session = %session.id, "dropping stale session");
            }
            ok
        });
        if sessions.is_empty() {
            rooms.remove(room_id);
        }
    }

    /// Whether the room currently has an entry (it then has at least
    /// one session).
    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.lock().unwrap().contains_key(room_id)
    }

    pub fn session_count(&self, room_id: &str) -> usize {
        self.rooms.lock().unwrap().get(room_id).map_or(0, Vec::len)
    }
}

/// Writer half of a connection: drains the session queue into the
/// socket sink and exits once every sender handle is dropped. Teardown
/// must drop its `Session` and await the handle rather than abort it,
/// so frames queued during shutdown (departure, a 1011 close) still
/// reach the peer.
pub fn spawn_writer<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Message>) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    })
}

/// Serialize an outbound frame and fan it out; serialization failure is
/// logged and swallowed rather than tearing the room down.
pub fn broadcast_event<T: Serialize>(registry: &RoomRegistry, room_id: &str, event: &T) {
    match serde_json::to_string(event) {
        Ok(payload) => registry.broadcast(room_id, &payload),
        Err(err) => warn!(room = room_id, error = %err, "failed to serialize outbound frame"),
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use axum::extract::ws::{close_code, CloseFrame};

    use super::*;

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

    #[test]
    fn register_then_unregister_drops_empty_entry() {
        let registry = RoomRegistry::new();
        let (a, _rx) = session();
        let id = a.id();

        registry.register("conv-1", a);
        assert!(registry.has_room("conv-1"));
        assert_eq!(registry.session_count("conv-1"), 1);

        registry.unregister("conv-1", id);
        assert!(!registry.has_room("conv-1"));

        // idempotent
        registry.unregister("conv-1", id);
        assert!(!registry.has_room("conv-1"));
    }

    #[test]
    fn broadcast_reaches_every_session() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = session();
        let (b, mut rx_b) = session();
        registry.register("conv-1", a);
        registry.register("conv-1", b);

        registry.broadcast("conv-1", "hello");
        assert_eq!(recv_text(&mut rx_a), "hello");
        assert_eq!(recv_text(&mut rx_b), "hello");
    }

    #[test]
    fn failed_send_evicts_only_the_dead_session() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = session();
        let (b, rx_b) = session();
        let (c, mut rx_c) = session();
        registry.register("conv-1", a);
        registry.register("conv-1", b);
        registry.register("conv-1", c);
        drop(rx_b);

        registry.broadcast("conv-1", "hello");
        assert_eq!(recv_text(&mut rx_a), "hello");
        assert_eq!(recv_text(&mut rx_c), "hello");
        assert_eq!(registry.session_count("conv-1"), 2);
    }

    #[test]
    fn broadcast_to_all_dead_sessions_removes_the_room() {
        let registry = RoomRegistry::new();
        let (a, rx_a) = session();
        registry.register("conv-1", a);
        drop(rx_a);

        registry.broadcast("conv-1", "hello");
        assert!(!registry.has_room("conv-1"));

        // broadcasting into an absent room is a no-op
        registry.broadcast("conv-1", "hello");
    }

    #[derive(Clone, Default)]
    struct CollectSink(Arc<Mutex<Vec<Message>>>);

    impl Sink<Message> for CollectSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.0.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn writer_drains_queued_frames_after_the_last_sender_drops() {
        let sink = CollectSink::default();
        let sent = sink.0.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(sink, rx);

        let session = Session::new(tx);
        assert!(session.send_text("last words"));
        assert!(session.send(Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: Utf8Bytes::from_static("Server error: boom"),
        }))));
        drop(session);

        writer.await.unwrap();
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        match &sent[1] {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::ERROR),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn same_transport_connecting_twice_yields_distinct_sessions() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = Session::new(tx.clone());
        let second = Session::new(tx);
        assert_ne!(first.id(), second.id());

        registry.register("conv-1", first);
        registry.register("conv-1", second);
        assert_eq!(registry.session_count("conv-1"), 2);
    }
}
