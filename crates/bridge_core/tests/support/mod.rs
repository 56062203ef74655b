#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bridge_core::{
    Bridge, BridgeSettings, LocalChat, RemoteClient, RemoteConnector, RemoteEventHandler,
    UserAccount,
};
use chrono::{DateTime, Utc};
use shared::{
    domain::{ContentUri, ConversationKey, EventId, LocalUserId, RemoteId, RoomId},
    local::{Intent, MessageContent, MsgType, PowerLevels, RoomCreateRequest},
    protocol::{
        DownloadedMedia, HistoryDirection, OutgoingText, RemoteDirectChat, RemoteGroup,
        RemoteMember, RemoteMessage,
    },
};
use storage::Storage;

pub const OWN_REMOTE_ID: &str = "100";
pub const ALICE: &str = "@alice:example.org";

#[derive(Debug, Clone)]
pub struct SentEvent {
    pub intent: Intent,
    pub room: RoomId,
    pub content: MessageContent,
    pub event_id: EventId,
}

#[derive(Debug, Clone)]
pub struct SentReaction {
    pub intent: Intent,
    pub room: RoomId,
    pub target: EventId,
    pub key: String,
    pub event_id: EventId,
}

#[derive(Default)]
pub struct FakeLocalChat {
    pub created: Mutex<Vec<(Intent, RoomCreateRequest, RoomId)>>,
    pub sent: Mutex<Vec<SentEvent>>,
    pub reactions: Mutex<Vec<SentReaction>>,
    pub redactions: Mutex<Vec<EventId>>,
    pub redacted_by: Mutex<Vec<LocalUserId>>,
    pub invites: Mutex<Vec<(RoomId, LocalUserId)>>,
    pub kicks: Mutex<Vec<(RoomId, LocalUserId, String)>>,
    pub uploads: Mutex<Vec<(String, Option<String>)>>,
    pub read_markers: Mutex<Vec<EventId>>,
    pub display_names: Mutex<Vec<(LocalUserId, String)>>,
    pub level_writes: Mutex<Vec<(RoomId, PowerLevels)>>,
    pub fail_power_levels: Mutex<bool>,
    members: Mutex<HashMap<RoomId, HashSet<LocalUserId>>>,
    send_failures: Mutex<VecDeque<anyhow::Error>>,
    counter: Mutex<u64>,
}

impl FakeLocalChat {
    fn next(&self) -> u64 {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        *counter
    }

    pub fn fail_next_send(&self, err: anyhow::Error) {
        self.send_failures.lock().unwrap().push_back(err);
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, room)| room.clone())
            .collect()
    }

    pub fn bodies_in(&self, room: &RoomId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|event| &event.room == room)
            .map(|event| event.content.body.clone())
            .collect()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.content.body.clone())
            .collect()
    }

    pub fn sent_events(&self) -> Vec<SentEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn add_member(&self, room: &RoomId, user: &LocalUserId) {
        self.members
            .lock()
            .unwrap()
            .entry(room.clone())
            .or_default()
            .insert(user.clone());
    }

    pub fn remove_member(&self, room: &RoomId, user: &LocalUserId) {
        if let Some(members) = self.members.lock().unwrap().get_mut(room) {
            members.remove(user);
        }
    }

    pub fn members_of(&self, room: &RoomId) -> HashSet<LocalUserId> {
        self.members
            .lock()
            .unwrap()
            .get(room)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LocalChat for FakeLocalChat {
    async fn create_room(&self, intent: &Intent, request: RoomCreateRequest) -> Result<RoomId> {
        let room = RoomId::new(format!("!room{}:example.org", self.next()));
        self.add_member(&room, &intent.user_id);
        self.created
            .lock()
            .unwrap()
            .push((intent.clone(), request, room.clone()));
        Ok(room)
    }

    async fn invite(&self, _intent: &Intent, room: &RoomId, user: &LocalUserId) -> Result<()> {
        self.invites
            .lock()
            .unwrap()
            .push((room.clone(), user.clone()));
        Ok(())
    }

    async fn kick(
        &self,
        _intent: &Intent,
        room: &RoomId,
        user: &LocalUserId,
        reason: &str,
    ) -> Result<()> {
        self.remove_member(room, user);
        self.kicks
            .lock()
            .unwrap()
            .push((room.clone(), user.clone(), reason.to_string()));
        Ok(())
    }

    async fn join(&self, intent: &Intent, room: &RoomId) -> Result<()> {
        self.add_member(room, &intent.user_id);
        Ok(())
    }

    async fn leave(&self, intent: &Intent, room: &RoomId) -> Result<()> {
        self.remove_member(room, &intent.user_id);
        Ok(())
    }

    async fn send_message(
        &self,
        intent: &Intent,
        room: &RoomId,
        content: &MessageContent,
        _timestamp_ms: Option<i64>,
    ) -> Result<EventId> {
        if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let event_id = EventId::new(format!("$event{}", self.next()));
        self.sent.lock().unwrap().push(SentEvent {
            intent: intent.clone(),
            room: room.clone(),
            content: content.clone(),
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn send_reaction(
        &self,
        intent: &Intent,
        room: &RoomId,
        target: &EventId,
        key: &str,
    ) -> Result<EventId> {
        let event_id = EventId::new(format!("$reaction{}", self.next()));
        self.reactions.lock().unwrap().push(SentReaction {
            intent: intent.clone(),
            room: room.clone(),
            target: target.clone(),
            key: key.to_string(),
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn redact(&self, intent: &Intent, _room: &RoomId, event: &EventId) -> Result<()> {
        self.redactions.lock().unwrap().push(event.clone());
        self.redacted_by.lock().unwrap().push(intent.user_id.clone());
        Ok(())
    }

    async fn set_room_name(&self, _intent: &Intent, _room: &RoomId, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn set_room_topic(&self, _intent: &Intent, _room: &RoomId, _topic: &str) -> Result<()> {
        Ok(())
    }

    async fn set_room_avatar(
        &self,
        _intent: &Intent,
        _room: &RoomId,
        _avatar: Option<&ContentUri>,
    ) -> Result<()> {
        Ok(())
    }

    async fn power_levels(&self, _intent: &Intent, room: &RoomId) -> Result<PowerLevels> {
        if *self.fail_power_levels.lock().unwrap() {
            return Err(anyhow!("power levels unavailable"));
        }
        let levels = self
            .level_writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(written, _)| written == room)
            .map(|(_, levels)| levels.clone());
        Ok(levels.unwrap_or_default())
    }

    async fn set_power_levels(
        &self,
        _intent: &Intent,
        room: &RoomId,
        levels: &PowerLevels,
    ) -> Result<()> {
        self.level_writes
            .lock()
            .unwrap()
            .push((room.clone(), levels.clone()));
        Ok(())
    }

    async fn joined_members(&self, _intent: &Intent, room: &RoomId) -> Result<Vec<LocalUserId>> {
        Ok(self.members_of(room).into_iter().collect())
    }

    async fn mark_read(&self, _intent: &Intent, _room: &RoomId, event: &EventId) -> Result<()> {
        self.read_markers.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn upload_media(
        &self,
        _intent: &Intent,
        _bytes: Vec<u8>,
        mime_type: &str,
        filename: Option<&str>,
    ) -> Result<ContentUri> {
        self.uploads
            .lock()
            .unwrap()
            .push((mime_type.to_string(), filename.map(str::to_string)));
        Ok(ContentUri::new(format!("mxc://example.org/media{}", self.next())))
    }

    async fn set_display_name(&self, intent: &Intent, name: &str) -> Result<()> {
        self.display_names
            .lock()
            .unwrap()
            .push((intent.user_id.clone(), name.to_string()));
        Ok(())
    }

    async fn set_avatar(&self, _intent: &Intent, _avatar: Option<&ContentUri>) -> Result<()> {
        Ok(())
    }
}

pub struct FakeRemoteClient {
    pub me: RemoteMember,
    pub groups: Mutex<HashMap<RemoteId, RemoteGroup>>,
    pub listed_groups: Mutex<Vec<RemoteGroup>>,
    pub direct_chats: Mutex<Vec<RemoteDirectChat>>,
    pub relations: Mutex<Vec<RemoteMember>>,
    /// Server-side history for every conversation, any order.
    pub history: Mutex<Vec<(ConversationKey, RemoteMessage)>>,
    pub sent: Mutex<Vec<(ConversationKey, OutgoingText)>>,
    pub left_groups: Mutex<Vec<RemoteId>>,
    pub failed_downloads: Mutex<HashSet<String>>,
    send_failures: Mutex<VecDeque<anyhow::Error>>,
    handler: Mutex<Option<Arc<dyn RemoteEventHandler>>>,
    counter: Mutex<u64>,
}

impl FakeRemoteClient {
    pub fn new(own_id: &str) -> Self {
        Self {
            me: RemoteMember {
                user_id: RemoteId::from(own_id),
                nickname: "Alice".into(),
                image_url: None,
            },
            groups: Mutex::default(),
            listed_groups: Mutex::default(),
            direct_chats: Mutex::default(),
            relations: Mutex::default(),
            history: Mutex::default(),
            sent: Mutex::default(),
            left_groups: Mutex::default(),
            failed_downloads: Mutex::default(),
            send_failures: Mutex::default(),
            handler: Mutex::default(),
            counter: Mutex::default(),
        }
    }

    pub fn add_group(&self, group: RemoteGroup) {
        self.groups.lock().unwrap().insert(group.id.clone(), group);
    }

    pub fn add_history(&self, key: &ConversationKey, message: RemoteMessage) {
        self.history.lock().unwrap().push((key.clone(), message));
    }

    pub fn fail_next_send(&self, err: anyhow::Error) {
        self.send_failures.lock().unwrap().push_back(err);
    }

    pub fn handler(&self) -> Arc<dyn RemoteEventHandler> {
        self.handler.lock().unwrap().clone().expect("subscribed")
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.text.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteClient for FakeRemoteClient {
    async fn current_user(&self) -> Result<RemoteMember> {
        Ok(self.me.clone())
    }

    async fn list_groups(&self) -> Result<Vec<RemoteGroup>> {
        Ok(self.listed_groups.lock().unwrap().clone())
    }

    async fn list_direct_chats(&self) -> Result<Vec<RemoteDirectChat>> {
        Ok(self.direct_chats.lock().unwrap().clone())
    }

    async fn list_relations(&self) -> Result<Vec<RemoteMember>> {
        Ok(self.relations.lock().unwrap().clone())
    }

    async fn show_group(&self, group_id: &RemoteId) -> Result<RemoteGroup> {
        self.groups
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown group {group_id}"))
    }

    async fn fetch_messages(
        &self,
        key: &ConversationKey,
        cursor: Option<&RemoteId>,
        direction: HistoryDirection,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>> {
        let mut messages: Vec<RemoteMessage> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|(conversation, _)| conversation == key)
            .map(|(_, message)| message.clone())
            .collect();
        messages.sort_by_key(|message| message.created_at);
        let pivot = cursor.and_then(|cursor| messages.iter().position(|m| &m.id == cursor));
        let page = match direction {
            HistoryDirection::Before => {
                let end = match (cursor, pivot) {
                    (None, _) => messages.len(),
                    (Some(_), Some(pivot)) => pivot,
                    (Some(_), None) => 0,
                };
                let mut older: Vec<_> = messages[..end].to_vec();
                older.reverse();
                older.truncate(limit);
                older
            }
            HistoryDirection::After => {
                let start = pivot.map(|pivot| pivot + 1).unwrap_or(messages.len());
                messages[start..].iter().take(limit).cloned().collect()
            }
        };
        Ok(page)
    }

    async fn send_message(
        &self,
        key: &ConversationKey,
        message: &OutgoingText,
    ) -> Result<RemoteMessage> {
        if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let id = {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            RemoteId::new(format!("9000{}", *counter))
        };
        self.sent
            .lock()
            .unwrap()
            .push((key.clone(), message.clone()));
        Ok(RemoteMessage {
            id,
            conversation_id: key.to_string(),
            sender_id: self.me.user_id.clone(),
            sender_name: self.me.nickname.clone(),
            sender_avatar_url: None,
            text: message.text.clone(),
            created_at: Utc::now(),
            system: false,
            attachments: Vec::new(),
            favorited_by: Vec::new(),
            source_guid: Some(message.source_guid.clone()),
        })
    }

    async fn leave_group(&self, group_id: &RemoteId) -> Result<()> {
        self.left_groups.lock().unwrap().push(group_id.clone());
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<DownloadedMedia> {
        if self.failed_downloads.lock().unwrap().contains(url) {
            return Err(anyhow!("download of {url} failed"));
        }
        Ok(DownloadedMedia {
            bytes: vec![0x89, 0x50, 0x4e, 0x47],
            mime_type: None,
            filename: None,
        })
    }

    async fn download_file(&self, _key: &ConversationKey, file_id: &str) -> Result<DownloadedMedia> {
        Ok(DownloadedMedia {
            bytes: b"%PDF".to_vec(),
            mime_type: Some("application/pdf".into()),
            filename: Some(format!("{file_id}.pdf")),
        })
    }

    async fn subscribe(
        &self,
        _remote_user_id: &RemoteId,
        handler: Arc<dyn RemoteEventHandler>,
    ) -> Result<()> {
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }
}

pub struct FakeConnector {
    pub client: Arc<FakeRemoteClient>,
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(&self, token: &str) -> Result<Arc<dyn RemoteClient>> {
        if token.is_empty() {
            return Err(anyhow!("empty token"));
        }
        Ok(self.client.clone())
    }
}

pub struct Harness {
    pub bridge: Arc<Bridge>,
    pub local: Arc<FakeLocalChat>,
    pub remote: Arc<FakeRemoteClient>,
}

pub fn test_settings() -> BridgeSettings {
    let mut settings = BridgeSettings::default();
    settings.backfill.initial_history_fill = 0;
    settings.retry.gateway_delay_ms = 1;
    settings
}

pub async fn harness(settings: BridgeSettings) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let local = Arc::new(FakeLocalChat::default());
    let remote = Arc::new(FakeRemoteClient::new(OWN_REMOTE_ID));
    let bridge = Bridge::new(
        settings,
        storage,
        local.clone(),
        Arc::new(FakeConnector {
            client: remote.clone(),
        }),
    );
    Harness {
        bridge,
        local,
        remote,
    }
}

impl Harness {
    pub async fn login(&self) -> Arc<UserAccount> {
        let account = self
            .bridge
            .get_or_create_account(&LocalUserId::from(ALICE))
            .await
            .expect("account");
        account.login("token").await.expect("login");
        account
    }
}

pub fn group(id: &str, members: &[&str]) -> RemoteGroup {
    RemoteGroup {
        id: RemoteId::from(id),
        name: format!("Group {id}"),
        description: String::new(),
        image_url: None,
        members: members
            .iter()
            .map(|member| RemoteMember {
                user_id: RemoteId::from(*member),
                nickname: format!("User {member}"),
                image_url: None,
            })
            .collect(),
        last_activity: Utc::now(),
    }
}

pub fn message(id: &str, conversation_id: &str, sender: &str, text: &str, at: DateTime<Utc>) -> RemoteMessage {
    RemoteMessage {
        id: RemoteId::from(id),
        conversation_id: conversation_id.to_string(),
        sender_id: RemoteId::from(sender),
        sender_name: format!("User {sender}"),
        sender_avatar_url: None,
        text: text.to_string(),
        created_at: at,
        system: false,
        attachments: Vec::new(),
        favorited_by: Vec::new(),
        source_guid: None,
    }
}

pub fn text_content(body: &str) -> MessageContent {
    MessageContent::with_type(MsgType::Text, body)
}

/// Polls `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check(), "condition not reached in time");
}
