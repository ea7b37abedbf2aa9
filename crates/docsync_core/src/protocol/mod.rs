//! Y-sync wire protocol.
//!
//! # Wire Format (y-protocols compatible)
//!
//! Messages use varUint encoding (variable-length unsigned integers):
//! - `varUint(0)`: Sync message type
//!   - `varUint(0)`: SyncStep1 - contains state vector
//!   - `varUint(1)`: SyncStep2 - contains missing updates
//!   - `varUint(2)`: Update - contains incremental update
//! - `varUint(1)`: Awareness message, a byte array wrapping
//!   `varUint(count)` and per client `clientId, clock, varString(state)`
//! - `varUint(2)`: Auth message, `varUint(0)` + `varString(reason)`
//! - `varUint(3)`: QueryAwareness (no payload)
//!
//! Byte arrays are encoded as: `varUint(length) + raw bytes`

mod awareness;
mod encoding;
mod message;

pub use awareness::{AwarenessEntry, AwarenessUpdate, NULL_STATE};
pub use encoding::{Decoder, Encoder};
pub use message::{AuthMessage, Message, SyncMessage, msg_type, sync_type};
