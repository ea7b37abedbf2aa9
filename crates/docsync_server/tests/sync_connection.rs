//! In-process connection tests with channel-backed sinks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docsync_core::context::DocumentContext;
use docsync_core::protocol::{AwarenessEntry, AwarenessUpdate, Message, SyncMessage};
use docsync_core::storage::MemoryStorage;
use docsync_core::{DocumentManager, DocumentManagerOptions};
use docsync_server::sync::{ClientConnection, ConnectionError, ConnectionRegistry, MessageSink};
use tokio::sync::{Notify, Semaphore, mpsc};
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Text, Transact};

/// Holds every send until permits are released.
struct Gate {
    entered: Notify,
    permits: Semaphore,
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    gate: Option<Arc<Gate>>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.permits
                .acquire()
                .await
                .map_err(|e| ConnectionError::Transport(e.to_string()))?
                .forget();
        }
        self.tx
            .send(frame)
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}

/// Accepts `accepted` frames, then never completes another send.
struct StuckSink {
    accepted: usize,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl MessageSink for StuckSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if self.accepted == 0 {
            std::future::pending::<()>().await;
        }
        self.accepted -= 1;
        self.tx
            .send(frame)
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}

struct Server {
    manager: Arc<DocumentManager>,
    registry: Arc<ConnectionRegistry>,
}

impl Server {
    fn new() -> Self {
        let manager = DocumentManager::new(
            Arc::new(MemoryStorage::new()),
            DocumentManagerOptions::default(),
        );
        let registry = ConnectionRegistry::new();
        manager.add_callback(registry.clone());
        Self { manager, registry }
    }

    fn connect(&self, doc: &str) -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<Vec<u8>>) {
        self.connect_gated(doc, None)
    }

    fn connect_gated(
        &self,
        doc: &str,
        gate: Option<Arc<Gate>>,
    ) -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection =
            self.registry
                .connect(doc, self.manager.clone(), Box::new(ChannelSink { tx, gate }));
        (connection, rx)
    }

    /// Apply an update as if it came from another client.
    async fn remote_edit(&self, doc: &str, update: &[u8]) {
        self.manager
            .apply_update(&DocumentContext::new(doc, 99), update)
            .await
            .unwrap();
    }
}

fn empty_state_vector() -> Vec<u8> {
    Doc::new().transact().state_vector().encode_v1()
}

fn insert(text: &str) -> Vec<u8> {
    let doc = Doc::new();
    let body = doc.get_or_insert_text("body");
    let mut txn = doc.transact_mut();
    body.insert(&mut txn, 0, text);
    txn.encode_update_v1()
}

fn step1(state_vector: Vec<u8>) -> Vec<u8> {
    Message::from(SyncMessage::SyncStep1(state_vector)).encode()
}

fn awareness(client_id: u64, clock: u64, state: &str) -> Vec<u8> {
    Message::Awareness(AwarenessUpdate::new(vec![AwarenessEntry::new(
        client_id,
        clock,
        Some(state.to_string()),
    )]))
    .encode()
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Message {
    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("sink dropped");
    let mut messages = Message::decode_all(&frame).unwrap();
    assert_eq!(messages.len(), 1);
    messages.remove(0)
}

/// Nothing else arrives within a short window.
async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) {
    let extra = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(extra.is_err(), "unexpected frame: {:?}", extra);
}

fn kind(message: &Message) -> &'static str {
    match message {
        Message::Sync(SyncMessage::SyncStep1(_)) => "step1",
        Message::Sync(SyncMessage::SyncStep2(_)) => "step2",
        Message::Sync(SyncMessage::Update(_)) => "update",
        Message::Awareness(_) => "awareness",
        Message::Auth(_) => "auth",
        Message::QueryAwareness => "query_awareness",
    }
}

#[tokio::test]
async fn test_handshake_replies_step2_then_step1() {
    let server = Server::new();
    let (conn, mut rx) = server.connect("notes");
    assert!(!conn.is_synced());

    conn.handle_frame(&step1(empty_state_vector())).await.unwrap();

    assert_eq!(kind(&next(&mut rx).await), "step2");
    assert_eq!(kind(&next(&mut rx).await), "step1");
    assert_quiet(&mut rx).await;
    assert!(conn.is_synced());
}

#[tokio::test]
async fn test_updates_queue_until_handshake() {
    let server = Server::new();
    let (conn, mut rx) = server.connect("notes");

    server.remote_edit("notes", &insert("Hello")).await;
    assert_quiet(&mut rx).await;

    conn.handle_frame(&step1(empty_state_vector())).await.unwrap();
    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(kind(&next(&mut rx).await));
    }
    assert_eq!(order, ["step2", "step1", "update"]);

    server.remote_edit("notes", &insert("!")).await;
    assert_eq!(kind(&next(&mut rx).await), "update");
}

#[tokio::test]
async fn test_slow_writer_keeps_catch_up_ahead_of_live_updates() {
    let server = Server::new();
    let gate = Arc::new(Gate {
        entered: Notify::new(),
        permits: Semaphore::new(0),
    });
    let (conn, mut rx) = server.connect_gated("notes", Some(gate.clone()));

    // Answering only queues; the writer is now blocked on SyncStep2.
    conn.handle_frame(&step1(empty_state_vector())).await.unwrap();
    gate.entered.notified().await;
    assert!(conn.is_synced());

    server.remote_edit("notes", &insert("concurrent")).await;
    gate.permits.add_permits(100);

    assert_eq!(kind(&next(&mut rx).await), "step2");
    assert_eq!(kind(&next(&mut rx).await), "step1");
    match next(&mut rx).await {
        Message::Sync(SyncMessage::Update(update)) => assert!(!update.is_empty()),
        other => panic!("expected live update, got {:?}", other),
    }

    server.remote_edit("notes", &insert("live")).await;
    assert_eq!(kind(&next(&mut rx).await), "update");
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_stalled_peer_does_not_block_document() {
    let server = Server::new();
    let (tx, mut stuck_rx) = mpsc::unbounded_channel();
    let stuck = server.registry.connect(
        "notes",
        server.manager.clone(),
        Box::new(StuckSink { accepted: 2, tx }),
    );
    stuck.handle_frame(&step1(empty_state_vector())).await.unwrap();
    assert_eq!(kind(&next(&mut stuck_rx).await), "step2");
    assert_eq!(kind(&next(&mut stuck_rx).await), "step1");

    // The stalled writer parks on this broadcast.
    server.remote_edit("notes", &insert("Hello")).await;

    let second = tokio::time::timeout(
        Duration::from_secs(2),
        server
            .manager
            .apply_update(&DocumentContext::new("notes", 98), &insert("World")),
    )
    .await;
    assert!(matches!(second, Ok(Ok(_))));

    let (fresh, mut fresh_rx) = server.connect("notes");
    tokio::time::timeout(
        Duration::from_secs(2),
        fresh.handle_frame(&step1(empty_state_vector())),
    )
    .await
    .expect("handshake stalled")
    .unwrap();
    assert_eq!(kind(&next(&mut fresh_rx).await), "step2");
    assert_eq!(kind(&next(&mut fresh_rx).await), "step1");

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        server.registry.disconnect(&stuck).await;
        stuck.close().await;
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(server.registry.document_connections("notes"), 1);
}

#[tokio::test]
async fn test_updates_are_not_echoed_to_sender() {
    let server = Server::new();
    let (a, mut a_rx) = server.connect("notes");
    let (b, mut b_rx) = server.connect("notes");
    for (conn, rx) in [(&a, &mut a_rx), (&b, &mut b_rx)] {
        conn.handle_frame(&step1(empty_state_vector())).await.unwrap();
        next(rx).await;
        next(rx).await;
    }

    a.handle_frame(&awareness(7, 1, r#"{"name":"ada"}"#))
        .await
        .unwrap();
    assert_eq!(a.client_id(), Some(7));
    match next(&mut b_rx).await {
        Message::Awareness(update) => {
            assert_eq!(update.clients[0].client_id, 7);
            assert_eq!(update.clients[0].clock, 1);
        }
        other => panic!("expected awareness, got {:?}", other),
    }

    let update = Message::from(SyncMessage::Update(insert("Hello"))).encode();
    a.handle_frame(&update).await.unwrap();

    assert_eq!(kind(&next(&mut b_rx).await), "update");
    assert_quiet(&mut a_rx).await;
}

#[tokio::test]
async fn test_disconnect_announces_departure_once() {
    let server = Server::new();
    let (a, _a_rx) = server.connect("notes");
    let (b, mut b_rx) = server.connect("notes");
    b.handle_frame(&step1(empty_state_vector())).await.unwrap();
    next(&mut b_rx).await;
    next(&mut b_rx).await;

    a.handle_frame(&awareness(7, 4, "{}")).await.unwrap();
    next(&mut b_rx).await;
    assert_eq!(server.registry.document_connections("notes"), 2);

    server.registry.disconnect(&a).await;
    match next(&mut b_rx).await {
        Message::Awareness(update) => {
            assert_eq!(update.clients, vec![AwarenessEntry::new(7, 5, None)]);
        }
        other => panic!("expected awareness, got {:?}", other),
    }
    assert!(server.manager.get_awareness("notes").is_empty());
    assert_eq!(server.registry.document_connections("notes"), 1);

    server.registry.disconnect(&a).await;
    assert_quiet(&mut b_rx).await;
}

#[tokio::test]
async fn test_multi_entry_awareness_does_not_assign_identity() {
    let server = Server::new();
    let (conn, _rx) = server.connect("notes");

    let update = Message::Awareness(AwarenessUpdate::new(vec![
        AwarenessEntry::new(1, 1, None),
        AwarenessEntry::new(2, 1, None),
    ]))
    .encode();
    conn.handle_frame(&update).await.unwrap();

    assert_eq!(conn.client_id(), None);
    assert_eq!(server.manager.get_awareness("notes").len(), 2);
}

#[tokio::test]
async fn test_query_awareness_lists_known_clients() {
    let server = Server::new();
    let (a, _a_rx) = server.connect("notes");
    let (b, mut b_rx) = server.connect("notes");

    a.handle_frame(&awareness(7, 1, "{}")).await.unwrap();
    b.handle_frame(&Message::QueryAwareness.encode()).await.unwrap();

    match next(&mut b_rx).await {
        Message::Awareness(update) => {
            assert_eq!(update.clients, vec![AwarenessEntry::new(7, 1, Some("{}".into()))]);
        }
        other => panic!("expected awareness, got {:?}", other),
    }
}

#[tokio::test]
async fn test_protocol_violations_are_errors() {
    let server = Server::new();
    let (conn, _rx) = server.connect("notes");

    let err = conn.handle_frame(&[9]).await.unwrap_err();
    assert!(err.is_protocol_violation());

    // SyncUpdate whose length prefix runs past the frame
    let err = conn.handle_frame(&[0, 2, 10, 1]).await.unwrap_err();
    assert!(err.is_protocol_violation());
}
