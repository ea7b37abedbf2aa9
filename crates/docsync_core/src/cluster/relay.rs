//! WebSocket client to a cluster relay hub.
//!
//! The relay rebroadcasts every binary frame to all other connected
//! nodes. The connection is re-established forever; while it is down
//! [`PubSubChannel::is_connected`] reports `false` and publishes fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::channel::PubSubChannel;
use crate::error::{DocSyncError, Result};

const OUTGOING_CAPACITY: usize = 1024;
const INCOMING_CAPACITY: usize = 1024;

pub struct RelayChannel {
    url: Url,
    connected: Arc<AtomicBool>,
    outgoing: mpsc::Sender<Vec<u8>>,
    incoming: broadcast::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl RelayChannel {
    /// Start connecting to `url` (`ws://` or `wss://`).
    ///
    /// Returns immediately; the first connection is made in the background.
    pub fn connect(url: &str, reconnect_delay: Duration) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| DocSyncError::InvalidRelayUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(DocSyncError::InvalidRelayUrl(url.to_string()));
        }

        let connected = Arc::new(AtomicBool::new(false));
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (incoming, _) = broadcast::channel(INCOMING_CAPACITY);

        let task = tokio::spawn(run_relay(
            parsed.clone(),
            reconnect_delay,
            Arc::clone(&connected),
            outgoing_rx,
            incoming.clone(),
        ));

        Ok(Self {
            url: parsed,
            connected,
            outgoing,
            incoming,
            task,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl PubSubChannel for RelayChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(DocSyncError::ChannelUnavailable);
        }
        self.outgoing
            .send(payload)
            .await
            .map_err(|_| DocSyncError::ChannelUnavailable)
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.incoming.subscribe()
    }
}

async fn run_relay(
    url: Url,
    reconnect_delay: Duration,
    connected: Arc<AtomicBool>,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    incoming: broadcast::Sender<Vec<u8>>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                info!(url = %url, "Connected to cluster relay");
                connected.store(true, Ordering::Release);
                let (mut sink, mut stream) = ws.split();

                loop {
                    tokio::select! {
                        frame = outgoing.recv() => {
                            let Some(frame) = frame else {
                                // Channel dropped; stop for good.
                                connected.store(false, Ordering::Release);
                                return;
                            };
                            if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                                warn!("Cluster relay send failed: {}", e);
                                break;
                            }
                        }
                        msg = stream.next() => {
                            match msg {
                                Some(Ok(Message::Binary(data))) => {
                                    let _ = incoming.send(data.to_vec());
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    if sink.send(Message::Pong(data)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("Cluster relay receive failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }

                connected.store(false, Ordering::Release);
                warn!(url = %url, "Disconnected from cluster relay");
            }
            Err(e) => {
                debug!(url = %url, "Cluster relay connect failed: {}", e);
            }
        }

        tokio::time::sleep(reconnect_delay).await;
    }
}
