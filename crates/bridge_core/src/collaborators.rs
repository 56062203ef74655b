use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ContentUri, ConversationKey, EventId, LocalUserId, RemoteId, RoomId},
    local::{Intent, MessageContent, PowerLevels, RoomCreateRequest},
    protocol::{
        DownloadedMedia, HistoryDirection, OutgoingText, RemoteDirectChat, RemoteGroup,
        RemoteMember, RemoteMessage,
    },
};

/// One logged-in session against the remote service.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn current_user(&self) -> Result<RemoteMember>;
    async fn list_groups(&self) -> Result<Vec<RemoteGroup>>;
    async fn list_direct_chats(&self) -> Result<Vec<RemoteDirectChat>>;
    async fn list_relations(&self) -> Result<Vec<RemoteMember>>;
    async fn show_group(&self, group_id: &RemoteId) -> Result<RemoteGroup>;
    /// One page of history relative to `cursor`; `None` means "from the newest message".
    async fn fetch_messages(
        &self,
        key: &ConversationKey,
        cursor: Option<&RemoteId>,
        direction: HistoryDirection,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>>;
    async fn send_message(
        &self,
        key: &ConversationKey,
        message: &OutgoingText,
    ) -> Result<RemoteMessage>;
    async fn leave_group(&self, group_id: &RemoteId) -> Result<()>;
    async fn download(&self, url: &str) -> Result<DownloadedMedia>;
    async fn download_file(&self, key: &ConversationKey, file_id: &str)
        -> Result<DownloadedMedia>;
    async fn subscribe(
        &self,
        remote_user_id: &RemoteId,
        handler: Arc<dyn RemoteEventHandler>,
    ) -> Result<()>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Arc<dyn RemoteClient>>;
}

/// Live-event callbacks. Implementations must only enqueue and return.
pub trait RemoteEventHandler: Send + Sync {
    fn on_message(&self, message: RemoteMessage);
    /// `message.favorited_by` carries the full, current reactor set.
    fn on_reaction_change(&self, message: RemoteMessage);
    fn on_group_name(&self, group_id: RemoteId, name: String);
    fn on_group_topic(&self, group_id: RemoteId, topic: String);
    fn on_group_avatar(&self, group_id: RemoteId, image_url: Option<String>);
    fn on_membership_change(&self, group_id: RemoteId);
    fn on_nickname_change(&self, group_id: RemoteId, member: RemoteMember);
    fn on_member_avatar_change(&self, group_id: RemoteId, member: RemoteMember);
    fn on_joined(&self, group_id: RemoteId);
}

#[async_trait]
pub trait LocalChat: Send + Sync {
    async fn create_room(&self, intent: &Intent, request: RoomCreateRequest) -> Result<RoomId>;
    async fn invite(&self, intent: &Intent, room: &RoomId, user: &LocalUserId) -> Result<()>;
    async fn kick(
        &self,
        intent: &Intent,
        room: &RoomId,
        user: &LocalUserId,
        reason: &str,
    ) -> Result<()>;
    async fn join(&self, intent: &Intent, room: &RoomId) -> Result<()>;
    async fn leave(&self, intent: &Intent, room: &RoomId) -> Result<()>;
    async fn send_message(
        &self,
        intent: &Intent,
        room: &RoomId,
        content: &MessageContent,
        timestamp_ms: Option<i64>,
    ) -> Result<EventId>;
    async fn send_reaction(
        &self,
        intent: &Intent,
        room: &RoomId,
        target: &EventId,
        key: &str,
    ) -> Result<EventId>;
    async fn redact(&self, intent: &Intent, room: &RoomId, event: &EventId) -> Result<()>;
    async fn set_room_name(&self, intent: &Intent, room: &RoomId, name: &str) -> Result<()>;
    async fn set_room_topic(&self, intent: &Intent, room: &RoomId, topic: &str) -> Result<()>;
    async fn set_room_avatar(
        &self,
        intent: &Intent,
        room: &RoomId,
        avatar: Option<&ContentUri>,
    ) -> Result<()>;
    async fn power_levels(&self, intent: &Intent, room: &RoomId) -> Result<PowerLevels>;
    async fn set_power_levels(
        &self,
        intent: &Intent,
        room: &RoomId,
        levels: &PowerLevels,
    ) -> Result<()>;
    async fn joined_members(&self, intent: &Intent, room: &RoomId) -> Result<Vec<LocalUserId>>;
    async fn mark_read(&self, intent: &Intent, room: &RoomId, event: &EventId) -> Result<()>;
    async fn upload_media(
        &self,
        intent: &Intent,
        bytes: Vec<u8>,
        mime_type: &str,
        filename: Option<&str>,
    ) -> Result<ContentUri>;
    async fn set_display_name(&self, intent: &Intent, name: &str) -> Result<()>;
    async fn set_avatar(&self, intent: &Intent, avatar: Option<&ContentUri>) -> Result<()>;
}

pub struct MissingRemoteConnector;

#[async_trait]
impl RemoteConnector for MissingRemoteConnector {
    async fn connect(&self, _token: &str) -> Result<Arc<dyn RemoteClient>> {
        Err(anyhow!("remote service client is unavailable"))
    }
}

pub struct MissingLocalChat;

fn local_unavailable<T>(operation: &str) -> Result<T> {
    Err(anyhow!("local chat backend unavailable: {operation}"))
}

#[async_trait]
impl LocalChat for MissingLocalChat {
    async fn create_room(&self, _intent: &Intent, _request: RoomCreateRequest) -> Result<RoomId> {
        local_unavailable("create room")
    }

    async fn invite(&self, _intent: &Intent, _room: &RoomId, _user: &LocalUserId) -> Result<()> {
        local_unavailable("invite")
    }

    async fn kick(
        &self,
        _intent: &Intent,
        _room: &RoomId,
        _user: &LocalUserId,
        _reason: &str,
    ) -> Result<()> {
        local_unavailable("kick")
    }

    async fn join(&self, _intent: &Intent, _room: &RoomId) -> Result<()> {
        local_unavailable("join")
    }

    async fn leave(&self, _intent: &Intent, _room: &RoomId) -> Result<()> {
        local_unavailable("leave")
    }

    async fn send_message(
        &self,
        _intent: &Intent,
        _room: &RoomId,
        _content: &MessageContent,
        _timestamp_ms: Option<i64>,
    ) -> Result<EventId> {
        local_unavailable("send message")
    }

    async fn send_reaction(
        &self,
        _intent: &Intent,
        _room: &RoomId,
        _target: &EventId,
        _key: &str,
    ) -> Result<EventId> {
        local_unavailable("send reaction")
    }

    async fn redact(&self, _intent: &Intent, _room: &RoomId, _event: &EventId) -> Result<()> {
        local_unavailable("redact")
    }

    async fn set_room_name(&self, _intent: &Intent, _room: &RoomId, _name: &str) -> Result<()> {
        local_unavailable("set room name")
    }

    async fn set_room_topic(&self, _intent: &Intent, _room: &RoomId, _topic: &str) -> Result<()> {
        local_unavailable("set room topic")
    }

    async fn set_room_avatar(
        &self,
        _intent: &Intent,
        _room: &RoomId,
        _avatar: Option<&ContentUri>,
    ) -> Result<()> {
        local_unavailable("set room avatar")
    }

    async fn power_levels(&self, _intent: &Intent, _room: &RoomId) -> Result<PowerLevels> {
        local_unavailable("power levels")
    }

    async fn set_power_levels(
        &self,
        _intent: &Intent,
        _room: &RoomId,
        _levels: &PowerLevels,
    ) -> Result<()> {
        local_unavailable("set power levels")
    }

    async fn joined_members(&self, _intent: &Intent, _room: &RoomId) -> Result<Vec<LocalUserId>> {
        local_unavailable("joined members")
    }

    async fn mark_read(&self, _intent: &Intent, _room: &RoomId, _event: &EventId) -> Result<()> {
        local_unavailable("mark read")
    }

    async fn upload_media(
        &self,
        _intent: &Intent,
        _bytes: Vec<u8>,
        _mime_type: &str,
        _filename: Option<&str>,
    ) -> Result<ContentUri> {
        local_unavailable("upload media")
    }

    async fn set_display_name(&self, _intent: &Intent, _name: &str) -> Result<()> {
        local_unavailable("set display name")
    }

    async fn set_avatar(&self, _intent: &Intent, _avatar: Option<&ContentUri>) -> Result<()> {
        local_unavailable("set avatar")
    }
}
