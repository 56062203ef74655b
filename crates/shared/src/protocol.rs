//! Payloads exchanged with the remote group-messaging service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::RemoteId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: RemoteId,
    /// Group id, or `a+b` for a direct chat.
    pub conversation_id: String,
    pub sender_id: RemoteId,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub sender_avatar_url: Option<String>,
    #[serde(default)]
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub attachments: Vec<RemoteAttachment>,
    #[serde(default)]
    pub favorited_by: Vec<RemoteId>,
    #[serde(default)]
    pub source_guid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteAttachment {
    Image {
        url: String,
    },
    Video {
        url: String,
        #[serde(default)]
        preview_url: Option<String>,
    },
    File {
        file_id: String,
    },
    Location {
        name: String,
        lat: String,
        lng: String,
    },
    Reply {
        reply_id: RemoteId,
    },
    Mentions {
        #[serde(default)]
        user_ids: Vec<RemoteId>,
    },
    #[serde(other)]
    Unsupported,
}

impl RemoteAttachment {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::File { .. } => "file",
            Self::Location { .. } => "location",
            Self::Reply { .. } => "reply",
            Self::Mentions { .. } => "mentions",
            Self::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMember {
    pub user_id: RemoteId,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteGroup {
    pub id: RemoteId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub members: Vec<RemoteMember>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDirectChat {
    pub other_user: RemoteMember,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryDirection {
    /// Messages older than the cursor, newest first.
    Before,
    /// Messages newer than the cursor, oldest first.
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingText {
    pub source_guid: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedMedia {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}
