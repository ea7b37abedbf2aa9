mod connection;
mod registry;

pub use connection::{ClientConnection, ConnectionError, MessageSink};
pub use registry::ConnectionRegistry;
