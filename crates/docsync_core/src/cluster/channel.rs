//! Pub/sub transport between server processes.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

/// A fan-out channel shared by every node of a cluster.
///
/// Every published payload is delivered to every subscriber, including
/// the publisher itself; receivers filter their own messages.
#[async_trait]
pub trait PubSubChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;
}

/// Process-local channel. Clones share the same hub, so several managers
/// in one process behave like a cluster.
#[derive(Debug, Clone)]
pub struct InMemoryPubSub {
    hub: broadcast::Sender<Vec<u8>>,
}

impl InMemoryPubSub {
    pub fn new(capacity: usize) -> Self {
        let (hub, _) = broadcast::channel(capacity.max(1));
        Self { hub }
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubChannel for InMemoryPubSub {
    fn is_connected(&self) -> bool {
        true
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        // No subscribers is not an error
        let _ = self.hub.send(payload);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_one_hub() {
        let a = InMemoryPubSub::new(8);
        let b = a.clone();
        let mut rx = b.subscribe();

        a.publish(vec![1, 2]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let hub = InMemoryPubSub::default();
        assert!(hub.publish(vec![0]).await.is_ok());
    }
}
