//! Relay hub for multi-process deployments.
//!
//! Every node connects to `/cluster` on the hub; each binary frame a node
//! sends is rebroadcast to every other node.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::AppState;
use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

const HUB_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct RelayHub {
    frames: broadcast::Sender<(u64, Bytes)>,
    next_node: AtomicU64,
}

impl RelayHub {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            frames,
            next_node: AtomicU64::new(0),
        }
    }

    pub fn node_count(&self) -> usize {
        self.frames.receiver_count()
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn cluster_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(hub) = state.relay_hub else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| relay_node(socket, hub))
        .into_response()
}

async fn relay_node(socket: WebSocket, hub: Arc<RelayHub>) {
    let node = hub.next_node.fetch_add(1, Ordering::Relaxed) + 1;
    let mut frames = hub.frames.subscribe();
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!(node, nodes = hub.node_count(), "Cluster node joined");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = hub.frames.send((node, data));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(node, "Cluster node socket error: {}", e);
                        break;
                    }
                }
            }
            frame = frames.recv() => {
                match frame {
                    Ok((from, data)) if from != node => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(node, skipped, "Cluster node lagged, frames dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    info!(node, "Cluster node left");
}
