//! Awareness (presence) payloads.

use super::encoding::{Decoder, Encoder};
use crate::error::Result;

/// JSON literal clients use to announce that a peer is gone.
pub const NULL_STATE: &str = "null";

/// One client's presence entry inside an awareness message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    /// JSON-encoded state; `None` travels as the literal `null`.
    pub state: Option<String>,
}

impl AwarenessEntry {
    pub fn new(client_id: u64, clock: u64, state: Option<String>) -> Self {
        Self {
            client_id,
            clock,
            state,
        }
    }

    /// Entry telling peers that `client_id` left.
    pub fn removed(client_id: u64, last_clock: u64) -> Self {
        Self {
            client_id,
            clock: last_clock.saturating_add(1),
            state: None,
        }
    }
}

/// Awareness update: a list of client entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub clients: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn new(clients: Vec<AwarenessEntry>) -> Self {
        Self { clients }
    }

    /// Inner payload: `varuint count` then `(clientId, clock, varstring state)` per client.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(1 + self.clients.len() * 16);
        enc.write_var_uint(self.clients.len() as u64);
        for entry in &self.clients {
            enc.write_var_uint(entry.client_id);
            enc.write_var_uint(entry.clock);
            enc.write_var_string(entry.state.as_deref().unwrap_or(NULL_STATE));
        }
        enc.into_bytes()
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(payload);
        let count = dec.read_var_uint()?;
        // Every entry needs at least three bytes, so a bogus count cannot
        // trigger a huge allocation.
        let capacity = (count as usize).min(payload.len() / 3);
        let mut clients = Vec::with_capacity(capacity);
        for _ in 0..count {
            let client_id = dec.read_var_uint()?;
            let clock = dec.read_var_uint()?;
            let state = dec.read_var_string()?;
            let state = if state == NULL_STATE { None } else { Some(state) };
            clients.push(AwarenessEntry {
                client_id,
                clock,
                state,
            });
        }
        Ok(Self { clients })
    }
}
