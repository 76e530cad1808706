// WebSocket message types for the scrolllive-feed.v1 protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ChatMessage, Participant, SessionUpdate, StreamSession};

pub const CURRENT_PROTOCOL_VERSION: &str = "scrolllive-feed.v1";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION];

pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// All message types in the scrolllive-feed.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WsMessage {
    /// Server -> Client: sent once the socket is authenticated and attached.
    HelloAck {
        protocol_version: String,
        stream_id: Uuid,
        server_time: String,
        lease_ttl_secs: u64,
    },

    /// Server -> Client: current participants and count for the stream.
    SessionUpdate {
        participants: Vec<Participant>,
        viewer_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream: Option<StreamSession>,
    },

    /// Server -> Client: the complete ordered chat log.
    ChatHistory { messages: Vec<ChatMessage> },

    /// Server -> Client: one newly appended chat message.
    ChatMessage { message: ChatMessage },

    /// Client -> Server: renew the presence lease.
    Heartbeat,

    /// Server -> Client: lease renewed.
    HeartbeatAck { lease_expires_at: DateTime<Utc> },

    /// Client -> Server: append a chat message.
    SendChat { message: String },

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl From<SessionUpdate> for WsMessage {
    fn from(update: SessionUpdate) -> Self {
        Self::SessionUpdate {
            participants: update.participants,
            viewer_count: update.viewer_count,
            stream: update.stream,
        }
    }
}
