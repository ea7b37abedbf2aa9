pub mod cluster;
pub mod ws;

pub use cluster::{RelayHub, cluster_handler};
pub use ws::ws_handler;
