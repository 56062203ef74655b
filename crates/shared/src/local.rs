//! Payloads exchanged with the local federated chat system.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{ContentUri, EventId, LocalUserId, RoomId};

/// Who a local request is performed as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Intent {
    pub user_id: LocalUserId,
    /// Present for double-puppeted accounts acting through their own session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Intent {
    pub fn new(user_id: LocalUserId) -> Self {
        Self {
            user_id,
            access_token: None,
        }
    }

    pub fn with_token(user_id: LocalUserId, access_token: String) -> Self {
        Self {
            user_id,
            access_token: Some(access_token),
        }
    }

    pub fn is_custom(&self) -> bool {
        self.access_token.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    #[serde(rename = "m.text")]
    Text,
    #[serde(rename = "m.notice")]
    Notice,
    #[serde(rename = "m.emote")]
    Emote,
    #[serde(rename = "m.image")]
    Image,
    #[serde(rename = "m.video")]
    Video,
    #[serde(rename = "m.audio")]
    Audio,
    #[serde(rename = "m.file")]
    File,
    #[serde(rename = "m.location")]
    Location,
    #[serde(other)]
    Unknown,
}

impl MsgType {
    pub fn for_mime(mime_type: &str) -> Self {
        match mime_type.split('/').next().unwrap_or_default() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub msgtype: MsgType,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<ContentUri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<MediaInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EventId>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::with_type(MsgType::Text, body)
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self::with_type(MsgType::Notice, body)
    }

    pub fn with_type(msgtype: MsgType, body: impl Into<String>) -> Self {
        Self {
            msgtype,
            body: body.into(),
            url: None,
            info: None,
            geo_uri: None,
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerLevels {
    #[serde(default)]
    pub users: BTreeMap<LocalUserId, i64>,
    pub users_default: i64,
    #[serde(default)]
    pub events: BTreeMap<String, i64>,
    pub events_default: i64,
    pub state_default: i64,
    pub ban: i64,
    pub kick: i64,
    pub invite: i64,
    pub redact: i64,
}

impl Default for PowerLevels {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            users_default: 0,
            events: BTreeMap::new(),
            events_default: 0,
            state_default: 50,
            ban: 50,
            kick: 50,
            invite: 0,
            redact: 50,
        }
    }
}

impl PowerLevels {
    pub fn user_level(&self, user_id: &LocalUserId) -> i64 {
        self.users
            .get(user_id)
            .copied()
            .unwrap_or(self.users_default)
    }

    /// Raises `user_id` to at least `level`. Returns whether anything changed.
    pub fn ensure_user_level(&mut self, user_id: &LocalUserId, level: i64) -> bool {
        if self.user_level(user_id) >= level {
            return false;
        }
        self.users.insert(user_id.clone(), level);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub event_type: String,
    pub state_key: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCreateRequest {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar_url: Option<ContentUri>,
    pub invite: Vec<LocalUserId>,
    pub is_direct: bool,
    pub power_levels: PowerLevels,
    pub initial_state: Vec<StateEvent>,
}

/// An event pushed to the bridge by the local chat system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEvent {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub sender: LocalUserId,
    #[serde(default)]
    pub origin_server_ts: i64,
    pub content: LocalEventContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalEventContent {
    Message { msgtype: MsgType, body: String },
    Leave,
    Redaction { redacts: EventId },
    #[serde(other)]
    Other,
}
