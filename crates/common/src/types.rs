// Core domain types shared by the server and its clients.
//
// Every type here is a wire type: JSON field names are camelCase to match the
// browser client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a participant is allowed to do inside a stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Broadcaster,
    Moderator,
    #[default]
    Viewer,
}

impl ParticipantRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Broadcaster => "broadcaster",
            Self::Moderator => "moderator",
            Self::Viewer => "viewer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "broadcaster" => Some(Self::Broadcaster),
            "moderator" => Some(Self::Moderator),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

/// A user present (or recently present) in a stream.
///
/// Keyed by `user_id` within its stream; the record has no identity outside
/// the session that owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub user_avatar: Option<String>,
    #[serde(default)]
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Presence lease; the participant is demoted to offline once it passes.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// One live stream and its presence state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSession {
    pub id: Uuid,
    pub room_name: String,
    pub title: String,
    pub category: String,
    pub created_by: String,
    pub created_by_name: String,
    #[serde(default)]
    pub created_by_avatar: Option<String>,
    pub is_live: bool,
    /// Always equals the number of online participants.
    pub viewer_count: u32,
    /// Ordered by `joined_at`.
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    /// Bumped on every write to the session or its participants.
    pub version: i64,
}

impl StreamSession {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.created_by == user_id
    }

    pub fn online_participants(&self) -> usize {
        self.participants.iter().filter(|participant| participant.is_online).count()
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|participant| participant.user_id == user_id)
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            title: self.title.clone(),
            category: self.category.clone(),
            created_by: self.created_by_name.clone(),
            created_by_avatar: self.created_by_avatar.clone(),
        }
    }

    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            id: self.id,
            title: self.title.clone(),
            category: self.category.clone(),
            created_by: self.created_by_name.clone(),
            created_by_avatar: self.created_by_avatar.clone(),
            viewer_count: self.viewer_count,
            created_at: self.created_at,
            participants: self.participants.clone(),
        }
    }
}

/// Stream details returned to a viewer on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub title: String,
    pub category: String,
    /// Display name of the broadcaster.
    pub created_by: String,
    #[serde(default)]
    pub created_by_avatar: Option<String>,
}

/// Entry in the active stream directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub id: Uuid,
    pub title: String,
    pub category: String,
    pub created_by: String,
    #[serde(default)]
    pub created_by_avatar: Option<String>,
    pub viewer_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

/// An immutable chat line scoped to a stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub stream_id: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub user_avatar: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Decoded session state handed to change subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub participants: Vec<Participant>,
    pub viewer_count: u32,
    /// `None` when the stream does not exist.
    pub stream: Option<StreamSession>,
}

impl SessionUpdate {
    pub fn from_session(session: Option<StreamSession>) -> Self {
        match session {
            Some(session) => Self {
                participants: session.participants.clone(),
                viewer_count: session.viewer_count,
                stream: Some(session),
            },
            None => Self::default(),
        }
    }
}
