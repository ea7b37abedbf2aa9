//! Message envelope for the real-time protocol.

use super::awareness::AwarenessUpdate;
use super::encoding::{Decoder, Encoder};
use crate::error::{DocSyncError, Result};

/// Top-level message type tags.
pub mod msg_type {
    /// Sync message (SyncStep1, SyncStep2, Update)
    pub const SYNC: u64 = 0;
    /// Awareness message
    pub const AWARENESS: u64 = 1;
    /// Auth message
    pub const AUTH: u64 = 2;
    /// Request for the full awareness state
    pub const QUERY_AWARENESS: u64 = 3;
}

/// Sync sub-message types.
pub mod sync_type {
    /// SyncStep1: Initial state vector exchange
    pub const STEP1: u64 = 0;
    /// SyncStep2: Missing updates response
    pub const STEP2: u64 = 1;
    /// Update: Incremental update
    pub const UPDATE: u64 = 2;
}

/// Auth sub-message types.
mod auth_type {
    pub const PERMISSION_DENIED: u64 = 0;
}

/// Y-sync message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// SyncStep1 contains a state vector
    SyncStep1(Vec<u8>),
    /// SyncStep2 contains missing updates
    SyncStep2(Vec<u8>),
    /// Update contains an incremental update
    Update(Vec<u8>),
}

/// Auth messages (server to client only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    PermissionDenied { reason: String },
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
    Auth(AuthMessage),
    QueryAwareness,
}

impl Message {
    /// Encode the message to bytes using y-protocols compatible format.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.into_bytes()
    }

    pub fn encode_into(&self, enc: &mut Encoder) {
        match self {
            Message::Sync(sync) => {
                enc.write_var_uint(msg_type::SYNC);
                let (tag, payload) = match sync {
                    SyncMessage::SyncStep1(sv) => (sync_type::STEP1, sv),
                    SyncMessage::SyncStep2(update) => (sync_type::STEP2, update),
                    SyncMessage::Update(update) => (sync_type::UPDATE, update),
                };
                enc.write_var_uint(tag);
                enc.write_var_bytes(payload);
            }
            Message::Awareness(update) => {
                enc.write_var_uint(msg_type::AWARENESS);
                enc.write_var_bytes(&update.encode_payload());
            }
            Message::Auth(AuthMessage::PermissionDenied { reason }) => {
                enc.write_var_uint(msg_type::AUTH);
                enc.write_var_uint(auth_type::PERMISSION_DENIED);
                enc.write_var_string(reason);
            }
            Message::QueryAwareness => {
                enc.write_var_uint(msg_type::QUERY_AWARENESS);
            }
        }
    }

    /// Decode exactly one message from the front of `dec`.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let tag = dec.read_var_uint()?;
        match tag {
            msg_type::SYNC => {
                let sync_tag = dec.read_var_uint()?;
                let payload = dec.read_var_bytes()?.to_vec();
                let msg = match sync_tag {
                    sync_type::STEP1 => SyncMessage::SyncStep1(payload),
                    sync_type::STEP2 => SyncMessage::SyncStep2(payload),
                    sync_type::UPDATE => SyncMessage::Update(payload),
                    other => {
                        return Err(DocSyncError::Malformed(format!(
                            "unknown sync type: {}",
                            other
                        )));
                    }
                };
                Ok(Message::Sync(msg))
            }
            msg_type::AWARENESS => {
                let payload = dec.read_var_bytes()?;
                Ok(Message::Awareness(AwarenessUpdate::decode_payload(payload)?))
            }
            msg_type::AUTH => {
                let auth_tag = dec.read_var_uint()?;
                if auth_tag != auth_type::PERMISSION_DENIED {
                    return Err(DocSyncError::Malformed(format!(
                        "unknown auth type: {}",
                        auth_tag
                    )));
                }
                let reason = dec.read_var_string()?;
                Ok(Message::Auth(AuthMessage::PermissionDenied { reason }))
            }
            msg_type::QUERY_AWARENESS => Ok(Message::QueryAwareness),
            other => Err(DocSyncError::UnexpectedMessageType(other)),
        }
    }

    /// Decode every message in a frame.
    ///
    /// Some clients batch several messages (e.g. SyncStep2 + SyncStep1)
    /// into one frame. Trailing garbage is an error.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut dec = Decoder::new(data);
        let mut messages = Vec::new();
        while dec.has_remaining() {
            messages.push(Self::decode(&mut dec)?);
        }
        Ok(messages)
    }
}

impl From<SyncMessage> for Message {
    fn from(msg: SyncMessage) -> Self {
        Message::Sync(msg)
    }
}
