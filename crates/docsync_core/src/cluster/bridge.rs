//! Loop-free fan-out of document events across server processes.
//!
//! Local events are queued and published in batches (by count and by
//! time, never per document). Incoming batches are replayed into the
//! local [`DocumentManager`] tagged as cluster replays, which keeps them
//! from being published again.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::PubSubChannel;
use super::message::{ClusterMessage, ClusterPayload, decode_batch, encode_batch};
use crate::callbacks::{CallbackResult, DocumentCallback};
use crate::context::{ContextMetadata, DocumentContext};
use crate::debounce::{DebounceAction, Debouncer};
use crate::manager::DocumentManager;

/// Tuning for [`ClusterBridge`].
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Publish as soon as this many events are queued.
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub batch_max_delay: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_delay: Duration::from_millis(10),
            batch_max_delay: Duration::from_millis(50),
        }
    }
}

type Queue = Arc<Mutex<Vec<ClusterMessage>>>;

fn lock_queue(queue: &Mutex<Vec<ClusterMessage>>) -> MutexGuard<'_, Vec<ClusterMessage>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ClusterBridge {
    sender_id: Uuid,
    channel: Arc<dyn PubSubChannel>,
    options: ClusterOptions,
    queue: Queue,
    batcher: Debouncer,
    manager: OnceLock<Weak<DocumentManager>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterBridge {
    /// Must be called within a Tokio runtime.
    pub fn new(channel: Arc<dyn PubSubChannel>, options: ClusterOptions) -> Arc<Self> {
        let queue: Queue = Arc::default();

        let action: DebounceAction = {
            let channel = Arc::clone(&channel);
            let queue = Arc::clone(&queue);
            Arc::new(move || {
                let channel = Arc::clone(&channel);
                let queue = Arc::clone(&queue);
                Box::pin(async move { publish_queued(channel.as_ref(), &queue).await })
            })
        };

        Arc::new(Self {
            sender_id: Uuid::new_v4(),
            batcher: Debouncer::new(options.batch_delay, options.batch_max_delay, action),
            channel,
            options,
            queue,
            manager: OnceLock::new(),
            receiver: Mutex::new(None),
        })
    }

    /// Random id stamped on everything this process publishes.
    pub fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    /// Attach to `manager` and start replaying messages from other nodes.
    ///
    /// Called automatically when the manager starts with this bridge
    /// registered as a callback.
    pub fn start(&self, manager: &Arc<DocumentManager>) {
        if self.manager.set(Arc::downgrade(manager)).is_err() {
            warn!("Cluster bridge already started");
            return;
        }

        let mut incoming = self.channel.subscribe();
        let manager = Arc::downgrade(manager);
        let sender_id = self.sender_id;
        let handle = tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(payload) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        replay_batch(&manager, sender_id, &payload).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Cluster receiver lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        *self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(sender_id = %self.sender_id, "Cluster bridge started");
    }

    /// Replay a batch published by another node.
    ///
    /// Returns the number of messages replayed.
    pub async fn handle_incoming(&self, payload: &[u8]) -> usize {
        let Some(manager) = self.manager.get().and_then(Weak::upgrade) else {
            return 0;
        };
        replay_batch(&manager, self.sender_id, payload).await
    }

    fn enqueue(&self, ctx: &DocumentContext, payload: ClusterPayload) {
        if ctx.is_cluster_replay() {
            return;
        }
        if !self.channel.is_connected() {
            debug!(document = %ctx.document_name, "Cluster channel not connected, dropping event");
            return;
        }

        let queued = {
            let mut queue = lock_queue(&self.queue);
            queue.push(ClusterMessage {
                sender_id: self.sender_id,
                client_id: ctx.client_id,
                document_name: ctx.document_name.clone(),
                payload,
            });
            queue.len()
        };

        self.batcher.ping();
        if queued >= self.options.batch_size {
            self.batcher.trigger();
        }
    }

    /// Publish whatever is queued and stop publishing.
    pub async fn shutdown(&self) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            receiver.abort();
        }
        self.batcher.flush().await;
    }
}

async fn publish_queued(channel: &dyn PubSubChannel, queue: &Mutex<Vec<ClusterMessage>>) {
    let batch = std::mem::take(&mut *lock_queue(queue));
    if batch.is_empty() {
        return;
    }

    match encode_batch(&batch) {
        Ok(payload) => {
            if let Err(e) = channel.publish(payload).await {
                debug!(events = batch.len(), "Cluster publish dropped: {}", e);
            }
        }
        Err(e) => error!("Failed to encode cluster batch: {}", e),
    }
}

/// Messages stamped with `local_id` are this node's own and are skipped.
async fn replay_batch(manager: &DocumentManager, local_id: Uuid, payload: &[u8]) -> usize {
    let messages = match decode_batch(payload) {
        Ok(messages) => messages,
        Err(e) => {
            warn!("Discarding malformed cluster batch: {}", e);
            return 0;
        }
    };

    let mut replayed = 0;
    for message in messages {
        if message.sender_id == local_id {
            continue;
        }
        replay(manager, message).await;
        replayed += 1;
    }
    replayed
}

async fn replay(manager: &DocumentManager, message: ClusterMessage) {
    let ctx = DocumentContext::new(message.document_name, message.client_id).with_metadata(
        ContextMetadata::ClusterReplay {
            sender: message.sender_id,
        },
    );

    match message.payload {
        ClusterPayload::DocumentChanged { diff } => {
            if let Err(e) = manager.apply_update(&ctx, &diff).await {
                warn!(document = %ctx.document_name, "Failed to replay cluster update: {}", e);
            }
        }
        ClusterPayload::ClientPinged { clock, state } => {
            manager.ping(&ctx, clock, state).await;
        }
        ClusterPayload::ClientDisconnected => {
            manager.disconnect(&ctx).await;
        }
    }
}

#[async_trait]
impl DocumentCallback for ClusterBridge {
    fn name(&self) -> &str {
        "cluster_bridge"
    }

    async fn on_initialized(&self, manager: &Arc<DocumentManager>) -> CallbackResult {
        self.start(manager);
        Ok(())
    }

    async fn on_document_changed(&self, ctx: &DocumentContext, diff: &[u8]) -> CallbackResult {
        self.enqueue(
            ctx,
            ClusterPayload::DocumentChanged {
                diff: diff.to_vec(),
            },
        );
        Ok(())
    }

    async fn on_client_disconnected(
        &self,
        ctx: &DocumentContext,
        _last_clock: u64,
    ) -> CallbackResult {
        self.enqueue(ctx, ClusterPayload::ClientDisconnected);
        Ok(())
    }

    async fn on_awareness_updated(
        &self,
        ctx: &DocumentContext,
        clock: u64,
        state: Option<&str>,
    ) -> CallbackResult {
        self.enqueue(
            ctx,
            ClusterPayload::ClientPinged {
                clock,
                state: state.map(str::to_string),
            },
        );
        Ok(())
    }
}
