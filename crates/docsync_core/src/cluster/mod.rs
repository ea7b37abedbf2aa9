//! Horizontal scaling: several server processes serving the same
//! documents stay consistent by exchanging document, presence and
//! disconnect events over a shared pub/sub channel.

mod bridge;
mod channel;
mod message;
mod relay;

pub use bridge::{ClusterBridge, ClusterOptions};
pub use channel::{InMemoryPubSub, PubSubChannel};
pub use message::{ClusterMessage, ClusterPayload, decode_batch, encode_batch};
pub use relay::RelayChannel;
