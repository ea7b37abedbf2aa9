use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use docsync_core::DocumentManager;
use docsync_core::context::{DocumentContext, SYSTEM_CLIENT_ID};
use docsync_core::error::DocSyncError;
use docsync_core::protocol::{AwarenessUpdate, Message, SyncMessage, msg_type};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pending updates beyond this size are logged; the queue itself is not capped.
const PENDING_WARN_THRESHOLD: usize = 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Sync(#[from] DocSyncError),
}

impl ConnectionError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, ConnectionError::Sync(e) if e.is_protocol_violation())
    }
}

/// Outbound half of a client transport.
#[async_trait]
pub trait MessageSink: Send {
    /// Send one binary protocol frame.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError>;

    async fn pong(&mut self, _payload: Vec<u8>) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

#[derive(Default)]
struct SyncState {
    synced: bool,
    pending: Vec<Vec<u8>>,
}

enum Outbound {
    Frame(Vec<u8>),
    Pong(Vec<u8>),
}

/// Protocol state for one connected socket.
///
/// A connection starts unsynced: live updates are queued until the
/// client's SyncStep1 has been answered, then flushed in arrival order.
/// Outbound frames go through a per-connection queue drained by a writer
/// task, so delivering to a slow socket never blocks the caller.
pub struct ClientConnection {
    id: u64,
    document_name: String,
    client_id: OnceLock<u64>,
    manager: Arc<DocumentManager>,
    sink: Arc<AsyncMutex<Box<dyn MessageSink>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    writer: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<SyncState>,
    closed: AtomicBool,
}

impl ClientConnection {
    /// Must be called within a Tokio runtime.
    pub(crate) fn new(
        id: u64,
        document_name: String,
        manager: Arc<DocumentManager>,
        sink: Box<dyn MessageSink>,
    ) -> Self {
        let sink = Arc::new(AsyncMutex::new(sink));
        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_outbound(id, Arc::clone(&sink), queue));

        Self {
            id,
            document_name,
            client_id: OnceLock::new(),
            manager,
            sink,
            outbound,
            writer: Mutex::new(Some(writer)),
            state: Mutex::new(SyncState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    /// Client id announced through the first awareness message, if any.
    pub fn client_id(&self) -> Option<u64> {
        self.client_id.get().copied()
    }

    pub fn is_synced(&self) -> bool {
        self.lock_state().synced
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> DocumentContext {
        DocumentContext::new(
            self.document_name.clone(),
            self.client_id().unwrap_or(SYSTEM_CLIENT_ID),
        )
    }

    fn enqueue(&self, item: Outbound) -> Result<(), ConnectionError> {
        self.outbound
            .send(item)
            .map_err(|_| ConnectionError::Transport("connection writer stopped".to_string()))
    }

    /// Handle one binary frame from the client.
    ///
    /// Any error is fatal to the connection.
    pub async fn handle_frame(&self, data: &[u8]) -> Result<(), ConnectionError> {
        for message in Message::decode_all(data)? {
            self.handle_message(message).await?;
        }
        Ok(())
    }

    async fn handle_message(&self, message: Message) -> Result<(), ConnectionError> {
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                self.sync_handshake(&state_vector).await
            }
            Message::Sync(SyncMessage::SyncStep2(update))
            | Message::Sync(SyncMessage::Update(update)) => {
                self.manager.apply_update(&self.context(), &update).await?;
                Ok(())
            }
            Message::Awareness(update) => {
                self.handle_awareness(update).await;
                Ok(())
            }
            Message::QueryAwareness => {
                let clients = self.manager.get_awareness(&self.document_name);
                let frame = Message::Awareness(AwarenessUpdate::new(clients)).encode();
                self.enqueue(Outbound::Frame(frame))
            }
            Message::Auth(_) => Err(DocSyncError::UnexpectedMessageType(msg_type::AUTH).into()),
        }
    }

    /// Answer SyncStep1 with SyncStep2 and the server's own SyncStep1, then
    /// flush queued updates and current presence before going live.
    async fn sync_handshake(&self, state_vector: &[u8]) -> Result<(), ConnectionError> {
        self.lock_state().synced = false;

        let ctx = self.context();
        let update = self.manager.get_update(&ctx, state_vector).await?;
        let server_state = self.manager.get_state_vector(&ctx).await?;

        // Everything below is queued under the state lock, so a broadcast
        // either lands in `pending` or is queued after the catch-up.
        let flushed = {
            let mut state = self.lock_state();
            self.enqueue(Outbound::Frame(
                Message::from(SyncMessage::SyncStep2(update)).encode(),
            ))?;
            self.enqueue(Outbound::Frame(
                Message::from(SyncMessage::SyncStep1(server_state)).encode(),
            ))?;

            let flushed = state.pending.len();
            for frame in state.pending.drain(..) {
                self.enqueue(Outbound::Frame(frame))?;
            }

            let clients = self.manager.get_awareness(&self.document_name);
            if !clients.is_empty() {
                self.enqueue(Outbound::Frame(
                    Message::Awareness(AwarenessUpdate::new(clients)).encode(),
                ))?;
            }
            state.synced = true;
            flushed
        };

        debug!(
            document = %self.document_name,
            connection = self.id,
            flushed,
            "Sync handshake complete"
        );
        Ok(())
    }

    async fn handle_awareness(&self, update: AwarenessUpdate) {
        if self.client_id.get().is_none()
            && let [entry] = update.clients.as_slice()
            && self.client_id.set(entry.client_id).is_ok()
        {
            info!(
                document = %self.document_name,
                connection = self.id,
                client_id = entry.client_id,
                "Client identified"
            );
        }

        for entry in update.clients {
            let ctx = DocumentContext::new(self.document_name.clone(), entry.client_id);
            self.manager.ping(&ctx, entry.clock, entry.state).await;
        }
    }

    /// Queue a live update, or hold it until the handshake completes.
    pub(crate) fn deliver_update(&self, frame: Vec<u8>) {
        let mut state = self.lock_state();
        if !state.synced {
            state.pending.push(frame);
            if state.pending.len() == PENDING_WARN_THRESHOLD {
                warn!(
                    document = %self.document_name,
                    connection = self.id,
                    pending = state.pending.len(),
                    "Unsynced connection is accumulating updates"
                );
            }
            return;
        }
        self.queue_quietly(frame);
    }

    /// Queue a presence frame. Unsynced connections get presence with the
    /// handshake instead.
    pub(crate) fn deliver_awareness(&self, frame: Vec<u8>) {
        let state = self.lock_state();
        if state.synced {
            self.queue_quietly(frame);
        }
    }

    fn queue_quietly(&self, frame: Vec<u8>) {
        if self.enqueue(Outbound::Frame(frame)).is_err() {
            debug!(connection = self.id, "Dropping frame for closing connection");
        }
    }

    pub fn pong(&self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.enqueue(Outbound::Pong(payload))
    }

    /// Stop the writer and close the transport. Frames still queued are dropped.
    pub async fn close(&self) {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            writer.abort();
            let _ = writer.await;
        }
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(connection = self.id, "Close failed: {}", e);
        }
    }

    /// Drop this client's presence. Runs once; later calls return `false`.
    pub(crate) async fn disconnect(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.client_id().is_some() {
            self.manager.disconnect(&self.context()).await;
        }
        true
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(writer) = self
            .writer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            writer.abort();
        }
    }
}

/// Drain a connection's queue into its sink until the sink fails.
async fn write_outbound(
    id: u64,
    sink: Arc<AsyncMutex<Box<dyn MessageSink>>>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = queue.recv().await {
        let mut sink = sink.lock().await;
        let result = match item {
            Outbound::Frame(frame) => sink.send(frame).await,
            Outbound::Pong(payload) => sink.pong(payload).await,
        };
        if let Err(e) = result {
            debug!(connection = id, "Outbound writer stopped: {}", e);
            break;
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("document_name", &self.document_name)
            .field("client_id", &self.client_id())
            .finish()
    }
}
