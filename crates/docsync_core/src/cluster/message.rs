//! Process-to-process message format.
//!
//! A batch is a JSON array of [`ClusterMessage`] records published as
//! one blob. Binary diffs travel as base64 strings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// One event published by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Session id of the publishing node.
    pub sender_id: Uuid,
    pub client_id: u64,
    pub document_name: String,
    #[serde(flatten)]
    pub payload: ClusterPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterPayload {
    DocumentChanged {
        #[serde(with = "base64_bytes")]
        diff: Vec<u8>,
    },
    ClientPinged {
        clock: u64,
        state: Option<String>,
    },
    ClientDisconnected,
}

pub fn encode_batch(messages: &[ClusterMessage]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(messages)?)
}

pub fn decode_batch(payload: &[u8]) -> Result<Vec<ClusterMessage>> {
    Ok(serde_json::from_slice(payload)?)
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}
