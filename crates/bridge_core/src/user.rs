//! Per-account dispatcher.
//!
//! Remote callbacks push into an unbounded intake. A forwarder task moves
//! items into a bounded [`LossyQueue`] that evicts the oldest item when full,
//! and a dispatch task drains that queue into the owning portals. Portal
//! queues are bounded too, so a slow portal stalls dispatch and raises the
//! drop rate at the lossy queue.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::{
    domain::{ConversationKey, LocalUserId, RemoteId, RoomId},
    local::{MessageContent, PowerLevels, RoomCreateRequest},
    protocol::{RemoteGroup, RemoteMember, RemoteMessage},
};
use storage::StoredAccount;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::{
    bridge::Bridge,
    collaborators::{RemoteClient, RemoteEventHandler},
    error::BridgeError,
    identity::ManagedAccount,
    portal::PortalEvent,
};

/// Bounded FIFO that makes room for a new item by dropping the oldest one.
pub struct LossyQueue<T> {
    items: StdMutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> LossyQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: StdMutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Returns the evicted item when the queue was full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub(crate) enum DispatchItem {
    Message(RemoteMessage),
    ReactionChange(RemoteMessage),
    GroupChanged { group_id: RemoteId },
    MemberProfile { group_id: RemoteId, member: RemoteMember },
}

impl DispatchItem {
    fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::ReactionChange(_) => "reaction_change",
            Self::GroupChanged { .. } => "group_changed",
            Self::MemberProfile { .. } => "member_profile",
        }
    }
}

async fn forward_intake(
    mut intake: mpsc::UnboundedReceiver<DispatchItem>,
    queue: Arc<LossyQueue<DispatchItem>>,
    user: LocalUserId,
) {
    while let Some(item) = intake.recv().await {
        if let Some(dropped) = queue.push(item) {
            warn!(%user, dropped = dropped.kind(), "user: buffer is full, dropping event");
        }
    }
    debug!(%user, "user: intake closed");
}

async fn dispatch_loop(account: Weak<UserAccount>, queue: Arc<LossyQueue<DispatchItem>>) {
    loop {
        let item = queue.pop().await;
        let Some(account) = account.upgrade() else {
            break;
        };
        account.dispatch(item).await;
    }
}

pub struct UserAccount {
    bridge: Arc<Bridge>,
    local_user_id: LocalUserId,
    row: RwLock<StoredAccount>,
    session: RwLock<Option<Arc<dyn RemoteClient>>>,
    connect_lock: Mutex<()>,
    management_lock: Mutex<()>,
    intake: mpsc::UnboundedSender<DispatchItem>,
}

impl UserAccount {
    pub(crate) fn spawn(bridge: Arc<Bridge>, row: StoredAccount) -> Arc<Self> {
        let (intake, intake_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(LossyQueue::new(bridge.settings().dispatch_buffer));
        let account = Arc::new(Self {
            bridge,
            local_user_id: row.local_id.clone(),
            row: RwLock::new(row),
            session: RwLock::new(None),
            connect_lock: Mutex::new(()),
            management_lock: Mutex::new(()),
            intake,
        });
        tokio::spawn(forward_intake(
            intake_rx,
            Arc::clone(&queue),
            account.local_user_id.clone(),
        ));
        tokio::spawn(dispatch_loop(Arc::downgrade(&account), queue));
        account
    }

    pub fn local_user_id(&self) -> &LocalUserId {
        &self.local_user_id
    }

    pub async fn snapshot(&self) -> StoredAccount {
        self.row.read().await.clone()
    }

    pub async fn remote_id(&self) -> Option<RemoteId> {
        self.row.read().await.remote_id.clone()
    }

    pub async fn client(&self) -> Option<Arc<dyn RemoteClient>> {
        self.session.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Opens the remote session from stored credentials. Returns `Ok(false)`
    /// when there is nothing to connect with.
    pub async fn connect(self: &Arc<Self>) -> Result<bool> {
        let _connecting = self.connect_lock.lock().await;
        if self.is_connected().await {
            return Ok(true);
        }
        let (token, remote_id) = {
            let row = self.row.read().await;
            (row.token.clone(), row.remote_id.clone())
        };
        let Some(token) = token else {
            return Ok(false);
        };
        let client = self
            .bridge
            .connector()
            .connect(&token)
            .await
            .context("connecting to remote service")?;
        let remote_id = match remote_id {
            Some(remote_id) => remote_id,
            None => {
                let me = client.current_user().await?;
                let mut row = self.row.write().await;
                row.remote_id = Some(me.user_id.clone());
                self.bridge.storage().update_account(&row).await?;
                me.user_id
            }
        };
        self.install_session(client, remote_id).await?;
        Ok(true)
    }

    async fn install_session(self: &Arc<Self>, client: Arc<dyn RemoteClient>, remote_id: RemoteId) -> Result<()> {
        let handler: Arc<dyn RemoteEventHandler> = Arc::clone(self) as Arc<dyn RemoteEventHandler>;
        client
            .subscribe(&remote_id, handler)
            .await
            .context("subscribing to live events")?;
        *self.session.write().await = Some(client);
        self.bridge
            .index_account_remote_id(remote_id.clone(), Arc::clone(self))
            .await;
        info!(user = %self.local_user_id, %remote_id, "user: connected");
        Ok(())
    }

    /// Links the account to the remote identity behind `token` and syncs its
    /// recent conversations.
    pub async fn login(self: &Arc<Self>, token: &str) -> Result<RemoteId> {
        let remote_id = {
            let _connecting = self.connect_lock.lock().await;
            let client = self
                .bridge
                .connector()
                .connect(token)
                .await
                .context("connecting to remote service")?;
            let me = client.current_user().await?;
            {
                let mut row = self.row.write().await;
                row.token = Some(token.to_string());
                row.remote_id = Some(me.user_id.clone());
                self.bridge.storage().update_account(&row).await?;
            }
            self.install_session(client, me.user_id.clone()).await?;
            me.user_id
        };
        if let Err(err) = self.sync_conversations().await {
            warn!(user = %self.local_user_id, "user: post-login sync failed: {err}");
        }
        Ok(remote_id)
    }

    /// Drops the session and the stored token. The account record stays.
    pub async fn logout(&self) -> Result<()> {
        let _connecting = self.connect_lock.lock().await;
        self.session.write().await.take();
        let mut row = self.row.write().await;
        row.token = None;
        self.bridge.storage().update_account(&row).await?;
        info!(user = %self.local_user_id, "user: logged out");
        Ok(())
    }

    /// Resyncs the most recently active conversations and any that already
    /// have a room. Returns how many were queued.
    pub async fn sync_conversations(self: &Arc<Self>) -> Result<usize> {
        let client = self
            .client()
            .await
            .ok_or_else(|| BridgeError::NotLoggedIn(self.local_user_id.clone()))?;
        let own = self
            .remote_id()
            .await
            .ok_or_else(|| anyhow!("{} has no linked remote account", self.local_user_id))?;
        let settings = self.bridge.settings();

        let mut conversations: Vec<(DateTime<Utc>, ConversationKey, Option<RemoteGroup>)> =
            Vec::new();
        for group in client.list_groups().await? {
            conversations.push((
                group.last_activity,
                ConversationKey::group(group.id.clone()),
                Some(group),
            ));
        }
        for chat in client.list_direct_chats().await? {
            match self.bridge.get_or_create_ghost(&chat.other_user.user_id).await {
                Ok(ghost) => ghost.sync(self, &chat.other_user).await,
                Err(err) => warn!(user = %self.local_user_id, "user: failed to load ghost: {err}"),
            }
            conversations.push((
                chat.last_activity,
                ConversationKey::direct(chat.other_user.user_id.clone(), own.clone()),
                None,
            ));
        }
        conversations.sort_by(|a, b| b.0.cmp(&a.0));

        match client.list_relations().await {
            Ok(relations) => {
                for member in relations {
                    match self.bridge.get_or_create_ghost(&member.user_id).await {
                        Ok(ghost) => ghost.sync(self, &member).await,
                        Err(err) => warn!(user = %self.local_user_id, "user: failed to load ghost: {err}"),
                    }
                }
            }
            Err(err) => warn!(user = %self.local_user_id, "user: relation sync failed, continuing: {err}"),
        }

        let max_age = ChronoDuration::from_std(settings.sync_chat_max_age())
            .unwrap_or_else(|_| ChronoDuration::weeks(52));
        let cutoff = Utc::now() - max_age;
        let mut queued = 0;
        for (index, (last_activity, key, group)) in conversations.into_iter().enumerate() {
            let recent = index < settings.initial_chat_sync && last_activity >= cutoff;
            let portal = if recent {
                match self.bridge.get_or_create_portal(&key).await {
                    Ok(portal) => portal,
                    Err(err) => {
                        warn!(user = %self.local_user_id, portal = %key, "user: failed to load portal: {err}");
                        continue;
                    }
                }
            } else {
                match self.bridge.portal_by_key(&key).await {
                    Some(portal) if portal.room_id().await.is_some() => portal,
                    _ => continue,
                }
            };
            let event = PortalEvent::Resync {
                source: Arc::clone(self),
                group,
                recover_history: settings.backfill.recover_history,
            };
            match portal.enqueue(event).await {
                Ok(()) => queued += 1,
                Err(err) => debug!(user = %self.local_user_id, "user: {err}"),
            }
        }
        info!(user = %self.local_user_id, queued, "user: conversations synced");
        Ok(queued)
    }

    /// The account's private notice room, created on first use.
    pub async fn management_room(self: &Arc<Self>) -> Result<RoomId> {
        let _creating = self.management_lock.lock().await;
        if let Some(room_id) = self.row.read().await.management_room.clone() {
            return Ok(room_id);
        }
        let settings = self.bridge.settings();
        let request = RoomCreateRequest {
            name: Some(format!("{} bridge notices", settings.network_name)),
            topic: None,
            avatar_url: None,
            invite: vec![self.local_user_id.clone()],
            is_direct: true,
            power_levels: PowerLevels::default(),
            initial_state: Vec::new(),
        };
        let room_id = self
            .bridge
            .local()
            .create_room(&self.bridge.bot_intent(), request)
            .await?;
        {
            let mut row = self.row.write().await;
            row.management_room = Some(room_id.clone());
            if let Err(err) = self.bridge.storage().update_account(&row).await {
                warn!(user = %self.local_user_id, "user: failed to persist management room: {err}");
            }
        }
        self.bridge
            .index_management_room(room_id.clone(), Arc::clone(self))
            .await;
        Ok(room_id)
    }

    pub async fn send_bridge_notice(self: &Arc<Self>, text: &str) -> Result<()> {
        let room_id = self.management_room().await?;
        self.bridge
            .local()
            .send_message(&self.bridge.bot_intent(), &room_id, &MessageContent::notice(text), None)
            .await?;
        Ok(())
    }

    fn push(&self, item: DispatchItem) {
        if self.intake.send(item).is_err() {
            debug!(user = %self.local_user_id, "user: intake closed, event discarded");
        }
    }

    async fn dispatch(self: &Arc<Self>, item: DispatchItem) {
        match item {
            DispatchItem::Message(message) => self.route_message(message, false).await,
            DispatchItem::ReactionChange(message) => self.route_message(message, true).await,
            DispatchItem::GroupChanged { group_id } => {
                let key = ConversationKey::group(group_id);
                let portal = match self.bridge.get_or_create_portal(&key).await {
                    Ok(portal) => portal,
                    Err(err) => {
                        warn!(user = %self.local_user_id, portal = %key, "user: failed to load portal: {err}");
                        return;
                    }
                };
                let event = PortalEvent::Resync {
                    source: Arc::clone(self),
                    group: None,
                    recover_history: false,
                };
                if let Err(err) = portal.enqueue(event).await {
                    debug!(user = %self.local_user_id, "user: {err}");
                }
            }
            DispatchItem::MemberProfile { group_id, member } => {
                match self.bridge.get_or_create_ghost(&member.user_id).await {
                    Ok(ghost) => ghost.sync(self, &member).await,
                    Err(err) => {
                        warn!(user = %self.local_user_id, %group_id, "user: failed to load ghost: {err}")
                    }
                }
            }
        }
    }

    async fn route_message(self: &Arc<Self>, message: RemoteMessage, reactions_only: bool) {
        let Some(own) = self.remote_id().await else {
            warn!(user = %self.local_user_id, "user: event received while not linked");
            return;
        };
        let Some(key) = ConversationKey::from_conversation_id(&message.conversation_id, &own) else {
            warn!(
                user = %self.local_user_id,
                conversation_id = %message.conversation_id,
                "user: {}",
                BridgeError::UnknownConversation(message.conversation_id.clone())
            );
            return;
        };

        if !reactions_only && !message.sender_id.is_empty() {
            self.spawn_sender_sync(&message);
        }

        let portal = match self.bridge.get_or_create_portal(&key).await {
            Ok(portal) => portal,
            Err(err) => {
                warn!(user = %self.local_user_id, portal = %key, "user: failed to load portal: {err}");
                return;
            }
        };
        let event = if reactions_only {
            PortalEvent::Reactions {
                source: Arc::clone(self),
                target: message.id,
                reactors: message.favorited_by,
            }
        } else {
            PortalEvent::Message {
                source: Arc::clone(self),
                message,
            }
        };
        if let Err(err) = portal.enqueue(event).await {
            debug!(user = %self.local_user_id, "user: {err}");
        }
    }

    /// Best-effort profile refresh for a message sender. Failures are only logged.
    fn spawn_sender_sync(self: &Arc<Self>, message: &RemoteMessage) {
        let account = Arc::clone(self);
        let member = RemoteMember {
            user_id: message.sender_id.clone(),
            nickname: message.sender_name.clone(),
            image_url: message.sender_avatar_url.clone(),
        };
        tokio::spawn(async move {
            match account.bridge.get_or_create_ghost(&member.user_id).await {
                Ok(ghost) => ghost.sync(&account, &member).await,
                Err(err) => debug!(user = %account.local_user_id, "user: sender sync failed: {err}"),
            }
        });
    }
}

impl RemoteEventHandler for UserAccount {
    fn on_message(&self, message: RemoteMessage) {
        self.push(DispatchItem::Message(message));
    }

    fn on_reaction_change(&self, message: RemoteMessage) {
        self.push(DispatchItem::ReactionChange(message));
    }

    fn on_group_name(&self, group_id: RemoteId, _name: String) {
        self.push(DispatchItem::GroupChanged { group_id });
    }

    fn on_group_topic(&self, group_id: RemoteId, _topic: String) {
        self.push(DispatchItem::GroupChanged { group_id });
    }

    fn on_group_avatar(&self, group_id: RemoteId, _image_url: Option<String>) {
        self.push(DispatchItem::GroupChanged { group_id });
    }

    fn on_membership_change(&self, group_id: RemoteId) {
        self.push(DispatchItem::GroupChanged { group_id });
    }

    fn on_nickname_change(&self, group_id: RemoteId, member: RemoteMember) {
        self.push(DispatchItem::MemberProfile { group_id, member });
    }

    fn on_member_avatar_change(&self, group_id: RemoteId, member: RemoteMember) {
        self.push(DispatchItem::MemberProfile { group_id, member });
    }

    fn on_joined(&self, group_id: RemoteId) {
        self.push(DispatchItem::GroupChanged { group_id });
    }
}

#[async_trait]
impl ManagedAccount for UserAccount {
    fn local_user_id(&self) -> &LocalUserId {
        &self.local_user_id
    }

    async fn linked_remote_id(&self) -> Option<RemoteId> {
        self.remote_id().await
    }

    async fn management_room_id(&self) -> Option<RoomId> {
        self.row.read().await.management_room.clone()
    }
}

#[cfg(test)]
#[path = "tests/user_tests.rs"]
mod tests;
