//! Wire protocol: newline-delimited JSON frames over TCP
//!
//! Every frame is one JSON object per line with an integer `type`, the
//! sender's node id, and an opaque `payload` string (usually JSON itself).

pub mod peer;

use serde::{Deserialize, Serialize};

use crate::error::{ChainError, ChainResult};

/// Upper bound on a single frame
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Bound on queued outbound messages per peer
pub const MAX_PENDING_MESSAGES: usize = 1_000;

/// Message types carried on the wire, values 0 through 10
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Handshake = 0,
    NewTransaction = 1,
    NewBlock = 2,
    RequestChain = 3,
    ResponseChain = 4,
    SyncRequest = 5,
    SyncResponse = 6,
    PeerList = 7,
    Ack = 8,
    StateSyncRequest = 9,
    StateSyncResponse = 10,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Handshake),
            1 => Some(Self::NewTransaction),
            2 => Some(Self::NewBlock),
            3 => Some(Self::RequestChain),
            4 => Some(Self::ResponseChain),
            5 => Some(Self::SyncRequest),
            6 => Some(Self::SyncResponse),
            7 => Some(Self::PeerList),
            8 => Some(Self::Ack),
            9 => Some(Self::StateSyncRequest),
            10 => Some(Self::StateSyncResponse),
            _ => None,
        }
    }
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMessage {
    pub message_type: MessageType,
    pub sender_id: String,
    pub payload: String,
}

/// On-the-wire shape with the integer type tag
#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    message_type: u8,
    sender_id: String,
    payload: String,
}

impl NetworkMessage {
    pub fn new(message_type: MessageType, sender_id: &str, payload: String) -> Self {
        Self {
            message_type,
            sender_id: sender_id.to_string(),
            payload,
        }
    }

    /// Serialize to one newline-terminated frame
    pub fn encode_frame(&self) -> String {
        let wire = WireMessage {
            message_type: self.message_type as u8,
            sender_id: self.sender_id.clone(),
            payload: self.payload.clone(),
        };
        let mut frame = serde_json::to_string(&wire).expect("message serialization cannot fail");
        frame.push('\n');
        frame
    }

    /// Parse a single frame (without the trailing newline)
    pub fn decode(line: &str) -> ChainResult<Self> {
        if line.len() > MAX_FRAME_BYTES {
            return Err(ChainError::Network("frame exceeds size limit".into()));
        }
        let wire: WireMessage = serde_json::from_str(line)?;
        let message_type = MessageType::from_u8(wire.message_type)
            .ok_or_else(|| ChainError::Network(format!("unknown message type {}", wire.message_type)))?;
        Ok(Self {
            message_type,
            sender_id: wire.sender_id,
            payload: wire.payload,
        })
    }
}
