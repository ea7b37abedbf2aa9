use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use docsync_core::callbacks::{CallbackResult, DocumentCallback};
use docsync_core::context::DocumentContext;
use docsync_core::protocol::{AwarenessEntry, AwarenessUpdate, Message, SyncMessage};
use docsync_core::DocumentManager;
use tracing::{debug, info};

use super::connection::{ClientConnection, MessageSink};

/// Live connections grouped by document; the broadcast set for local fan-out.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    documents: RwLock<HashMap<String, HashMap<u64, Arc<ClientConnection>>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new socket on `document`.
    pub fn connect(
        &self,
        document: &str,
        manager: Arc<DocumentManager>,
        sink: Box<dyn MessageSink>,
    ) -> Arc<ClientConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connection = Arc::new(ClientConnection::new(
            id,
            document.to_string(),
            manager,
            sink,
        ));

        let count = {
            let mut documents = self
                .documents
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let connections = documents.entry(document.to_string()).or_default();
            connections.insert(id, Arc::clone(&connection));
            connections.len()
        };

        info!(document, connection = id, connections = count, "Client connected");
        connection
    }

    /// Remove a socket and announce its departure. Safe to call twice.
    pub async fn disconnect(&self, connection: &ClientConnection) {
        {
            let mut documents = self
                .documents
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(connections) = documents.get_mut(connection.document_name()) {
                connections.remove(&connection.id());
                if connections.is_empty() {
                    documents.remove(connection.document_name());
                }
            }
        }

        if connection.disconnect().await {
            info!(
                document = connection.document_name(),
                connection = connection.id(),
                "Client disconnected"
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn document_connections(&self, document: &str) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document)
            .map_or(0, HashMap::len)
    }

    /// Connections on `ctx`'s document other than the originating client.
    fn peers(&self, ctx: &DocumentContext) -> Vec<Arc<ClientConnection>> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        let Some(connections) = documents.get(&ctx.document_name) else {
            return Vec::new();
        };
        let mut peers: Vec<_> = connections
            .values()
            .filter(|connection| connection.client_id() != Some(ctx.client_id))
            .cloned()
            .collect();
        peers.sort_by_key(|connection| connection.id());
        peers
    }
}

#[async_trait]
impl DocumentCallback for ConnectionRegistry {
    fn name(&self) -> &str {
        "connection_registry"
    }

    async fn on_document_changed(&self, ctx: &DocumentContext, diff: &[u8]) -> CallbackResult {
        let peers = self.peers(ctx);
        if peers.is_empty() {
            return Ok(());
        }

        let frame = Message::from(SyncMessage::Update(diff.to_vec())).encode();
        debug!(
            document = %ctx.document_name,
            client_id = ctx.client_id,
            peers = peers.len(),
            "Broadcasting update"
        );
        for peer in peers {
            peer.deliver_update(frame.clone());
        }
        Ok(())
    }

    async fn on_client_disconnected(&self, ctx: &DocumentContext, last_clock: u64) -> CallbackResult {
        let entry = AwarenessEntry::removed(ctx.client_id, last_clock);
        let frame = Message::Awareness(AwarenessUpdate::new(vec![entry])).encode();
        for peer in self.peers(ctx) {
            peer.deliver_awareness(frame.clone());
        }
        Ok(())
    }

    async fn on_awareness_updated(
        &self,
        ctx: &DocumentContext,
        clock: u64,
        state: Option<&str>,
    ) -> CallbackResult {
        let entry = AwarenessEntry::new(ctx.client_id, clock, state.map(str::to_string));
        let frame = Message::Awareness(AwarenessUpdate::new(vec![entry])).encode();
        for peer in self.peers(ctx) {
            peer.deliver_awareness(frame.clone());
        }
        Ok(())
    }
}
