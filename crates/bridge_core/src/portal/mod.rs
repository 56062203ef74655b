//! Per-conversation actor.
//!
//! Every event for a conversation goes through one bounded queue and one
//! consumer task, which gives strict ordering within the conversation. The
//! consumer holds the `handling` lock while it works on an event; backfill
//! replays under the same lock, so the two never interleave.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Utc;
use shared::{
    domain::{ConversationKey, EventId, RemoteId, RoomId},
    local::{Intent, LocalEvent, MessageContent},
    protocol::{RemoteGroup, RemoteMessage},
};
use storage::{StoredMessage, StoredPortal};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::{
    attachments,
    bridge::Bridge,
    delivery,
    error::{BridgeError, DeliveryError},
    user::UserAccount,
};

mod local_events;
mod recent;
mod room;

pub(crate) use recent::RecentIds;

/// Messages up to this much older than the last accepted one still go through.
const STALE_TOLERANCE_MS: i64 = 1_000;
const MEDIA_FAILURE_NOTICE: &str = "Failed to bridge media";

pub enum PortalEvent {
    Message {
        source: Arc<UserAccount>,
        message: RemoteMessage,
    },
    Reactions {
        source: Arc<UserAccount>,
        target: RemoteId,
        reactors: Vec<RemoteId>,
    },
    Resync {
        source: Arc<UserAccount>,
        group: Option<RemoteGroup>,
        recover_history: bool,
    },
    /// The counterpart ghost of a direct chat changed its profile.
    CounterpartChanged,
    Local {
        sender: Arc<UserAccount>,
        event: LocalEvent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Bridged,
    Stale,
    Duplicate,
    System,
    NoIntent,
}

pub(crate) struct HandlingState {
    pub(crate) last_message_ts: i64,
    pub(crate) recent: RecentIds,
}

pub struct Portal {
    key: ConversationKey,
    bridge: Arc<Bridge>,
    row: RwLock<StoredPortal>,
    room_lock: Mutex<()>,
    handling: Mutex<HandlingState>,
    backfilling: AtomicBool,
    closed: AtomicBool,
    inbound: mpsc::Sender<PortalEvent>,
}

impl Portal {
    pub(crate) fn spawn(bridge: Arc<Bridge>, row: StoredPortal) -> Arc<Self> {
        let settings = bridge.settings();
        let (inbound, receiver) = mpsc::channel(settings.portal_message_buffer.max(1));
        let handling = HandlingState {
            last_message_ts: 0,
            recent: RecentIds::new(settings.recent_message_capacity),
        };
        let portal = Arc::new(Self {
            key: row.key.clone(),
            bridge,
            row: RwLock::new(row),
            room_lock: Mutex::new(()),
            handling: Mutex::new(handling),
            backfilling: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            inbound,
        });
        tokio::spawn(Arc::clone(&portal).run(receiver));
        portal
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn is_private(&self) -> bool {
        self.key.is_private()
    }

    pub async fn room_id(&self) -> Option<RoomId> {
        self.row.read().await.room_id.clone()
    }

    pub async fn snapshot(&self) -> StoredPortal {
        self.row.read().await.clone()
    }

    pub fn is_backfilling(&self) -> bool {
        self.backfilling.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub(crate) fn backfilling_flag(&self) -> &AtomicBool {
        &self.backfilling
    }

    /// Blocks while the inbound queue is full.
    pub async fn enqueue(&self, event: PortalEvent) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::PortalClosed(self.key.clone()));
        }
        self.inbound
            .send(event)
            .await
            .map_err(|_| BridgeError::PortalClosed(self.key.clone()))
    }

    /// The counterpart ghost in a direct chat, the bot everywhere else.
    pub fn main_intent(&self) -> Intent {
        let settings = self.bridge.settings();
        if self.is_private() {
            Intent::new(settings.ghost_user_id(&self.key.conversation_id))
        } else {
            self.bridge.bot_intent()
        }
    }

    async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<PortalEvent>) {
        while let Some(event) = receiver.recv().await {
            self.handle_event(event).await;
            if self.is_closed() {
                break;
            }
        }
        debug!(portal = %self.key, "portal: consumer stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: PortalEvent) {
        let mut state = self.handling.lock().await;
        match event {
            PortalEvent::Message { source, message } => {
                self.handle_incoming(&mut state, &source, message).await;
            }
            PortalEvent::Reactions {
                source: _,
                target,
                reactors,
            } => {
                self.sync_reactions(&target, &reactors).await;
            }
            PortalEvent::Resync {
                source,
                group,
                recover_history,
            } => {
                self.resync_locked(&mut state, &source, group, recover_history)
                    .await;
            }
            PortalEvent::CounterpartChanged => self.refresh_private_meta().await,
            PortalEvent::Local { sender, event } => {
                self.handle_local_event(&mut state, &sender, event).await;
            }
        }
    }

    async fn handle_incoming(
        self: &Arc<Self>,
        state: &mut HandlingState,
        source: &Arc<UserAccount>,
        message: RemoteMessage,
    ) {
        if self.room_id().await.is_none() {
            let max_age = self.bridge.settings().max_message_age_to_create_portal();
            let age = Utc::now().signed_duration_since(message.created_at);
            if age.to_std().map(|age| age > max_age).unwrap_or(false) {
                debug!(
                    portal = %self.key,
                    message_id = %message.id,
                    age_secs = age.num_seconds(),
                    "portal: not creating room for stale message"
                );
                return;
            }
            if let Err(err) = self.ensure_room_locked(state, source).await {
                error!(portal = %self.key, message_id = %message.id, "portal: {err}");
                return;
            }
        }
        self.handle_remote_message(state, source, &message).await;
    }

    /// Runs the acceptance pipeline and, if accepted, mirrors the message.
    pub(crate) async fn handle_remote_message(
        &self,
        state: &mut HandlingState,
        source: &Arc<UserAccount>,
        message: &RemoteMessage,
    ) -> MessageOutcome {
        let timestamp_ms = message.created_at.timestamp_millis();
        if timestamp_ms + STALE_TOLERANCE_MS < state.last_message_ts {
            debug!(
                portal = %self.key,
                message_id = %message.id,
                last_ts = state.last_message_ts,
                message_ts = timestamp_ms,
                "portal: dropping out-of-order message"
            );
            return MessageOutcome::Stale;
        }
        if state.recent.contains(&message.id) {
            debug!(portal = %self.key, message_id = %message.id, "portal: recently handled");
            return MessageOutcome::Duplicate;
        }
        match self
            .bridge
            .storage()
            .get_message(&self.key, &message.id)
            .await
        {
            Ok(Some(_)) => {
                debug!(portal = %self.key, message_id = %message.id, "portal: already bridged");
                return MessageOutcome::Duplicate;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(portal = %self.key, message_id = %message.id, "portal: dedup lookup failed: {err}");
            }
        }
        if message.system {
            debug!(portal = %self.key, message_id = %message.id, "portal: skipping system message");
            return MessageOutcome::System;
        }

        state.last_message_ts = timestamp_ms;
        let Some(intent) = self.message_intent(source, message).await else {
            warn!(portal = %self.key, message_id = %message.id, "portal: no identity to mirror sender");
            return MessageOutcome::NoIntent;
        };
        let Some(room_id) = self.room_id().await else {
            return MessageOutcome::NoIntent;
        };

        let mut text = message.text.clone();
        let mut send_text = true;
        let mut last_event = None;
        for attachment in &message.attachments {
            match attachments::convert(self, source, &intent, message, attachment).await {
                Ok(Some(converted)) => {
                    send_text &= converted.send_text;
                    if let Some(strip) = converted.strip_from_text {
                        text = text.replace(&strip, "").trim().to_string();
                    }
                    match self
                        .send_event(&intent, &room_id, &converted.content, Some(timestamp_ms))
                        .await
                    {
                        Ok(event_id) => last_event = Some(event_id),
                        Err(err) => {
                            warn!(portal = %self.key, message_id = %message.id, "portal: failed to send attachment: {err}");
                            self.send_notice(&intent, &room_id, MEDIA_FAILURE_NOTICE)
                                .await;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(portal = %self.key, message_id = %message.id, "portal: failed to bridge attachment: {err}");
                    self.send_notice(&intent, &room_id, MEDIA_FAILURE_NOTICE)
                        .await;
                }
            }
        }

        if send_text && !text.is_empty() {
            match self
                .send_event(&intent, &room_id, &MessageContent::text(text), Some(timestamp_ms))
                .await
            {
                Ok(event_id) => last_event = Some(event_id),
                Err(err) => {
                    warn!(portal = %self.key, message_id = %message.id, "portal: failed to send message: {err}");
                    self.send_notice(
                        &self.main_intent(),
                        &room_id,
                        &format!("⚠ Failed to bridge message: {err}"),
                    )
                    .await;
                }
            }
        }

        self.finish_handling(state, source, message, last_event)
            .await;
        MessageOutcome::Bridged
    }

    async fn finish_handling(
        &self,
        state: &mut HandlingState,
        source: &Arc<UserAccount>,
        message: &RemoteMessage,
        event_id: Option<EventId>,
    ) {
        state.recent.push(message.id.clone());
        let Some(event_id) = event_id else {
            debug!(portal = %self.key, message_id = %message.id, "portal: nothing was sent");
            return;
        };
        let row = StoredMessage {
            key: self.key.clone(),
            remote_id: message.id.clone(),
            event_id: event_id.clone(),
            sender: self.recorded_sender(source, message).await,
            timestamp_ms: message.created_at.timestamp_millis(),
            delivered: true,
        };
        if let Err(err) = self.bridge.storage().insert_message(&row).await {
            warn!(portal = %self.key, message_id = %message.id, "portal: failed to persist message mapping: {err}");
        }
        self.send_delivery_receipt(&event_id).await;
        debug!(portal = %self.key, message_id = %message.id, %event_id, "portal: message bridged");

        if !message.favorited_by.is_empty() {
            self.sync_reactions(&message.id, &message.favorited_by)
                .await;
        }
    }

    async fn recorded_sender(&self, source: &UserAccount, message: &RemoteMessage) -> RemoteId {
        let own = source.remote_id().await;
        if own.as_ref() == Some(&message.sender_id) {
            message.sender_id.clone()
        } else if self.is_private() {
            self.key.conversation_id.clone()
        } else {
            message.sender_id.clone()
        }
    }

    async fn message_intent(&self, source: &UserAccount, message: &RemoteMessage) -> Option<Intent> {
        if message.sender_id.is_empty() {
            return None;
        }
        let from_me = source.remote_id().await.as_ref() == Some(&message.sender_id);
        if self.is_private() {
            if !from_me {
                return Some(self.main_intent());
            }
            let own = self.bridge.settings().ghost_user_id(&message.sender_id);
            return Some(Intent::new(own));
        }
        self.ghost_intent(&message.sender_id).await
    }

    pub(crate) async fn ghost_intent(&self, remote_id: &RemoteId) -> Option<Intent> {
        match self.bridge.get_or_create_ghost(remote_id).await {
            Ok(ghost) => Some(ghost.intent_for(self).await),
            Err(err) => {
                warn!(portal = %self.key, %remote_id, "portal: failed to load ghost: {err}");
                None
            }
        }
    }

    pub(crate) async fn send_event(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        content: &MessageContent,
        timestamp_ms: Option<i64>,
    ) -> Result<EventId, DeliveryError> {
        let local = self.bridge.local();
        delivery::with_retry(&self.bridge.send_policy(), "send event", || {
            local.send_message(intent, room_id, content, timestamp_ms)
        })
        .await
    }

    pub(crate) async fn send_notice(&self, intent: &Intent, room_id: &RoomId, text: &str) {
        let content = MessageContent::notice(text);
        if let Err(err) = self
            .bridge
            .local()
            .send_message(intent, room_id, &content, None)
            .await
        {
            warn!(portal = %self.key, "portal: failed to send notice: {err}");
        }
    }

    pub(crate) async fn send_delivery_receipt(&self, event_id: &EventId) {
        if !self.bridge.settings().delivery_receipts {
            return;
        }
        let Some(room_id) = self.room_id().await else {
            return;
        };
        if let Err(err) = self
            .bridge
            .local()
            .mark_read(&self.bridge.bot_intent(), &room_id, event_id)
            .await
        {
            debug!(portal = %self.key, %event_id, "portal: failed to send delivery receipt: {err}");
        }
    }

    /// Creates the local room if it does not exist yet.
    pub async fn ensure_room(self: &Arc<Self>, account: &Arc<UserAccount>) -> Result<RoomId, BridgeError> {
        let mut state = self.handling.lock().await;
        self.ensure_room_locked(&mut state, account).await
    }

    /// Re-reads the remote conversation and brings the room up to date.
    pub async fn resync(
        self: &Arc<Self>,
        account: &Arc<UserAccount>,
        group: Option<RemoteGroup>,
        recover_history: bool,
    ) {
        let mut state = self.handling.lock().await;
        self.resync_locked(&mut state, account, group, recover_history)
            .await;
    }

    pub(crate) fn counterpart_ghost_id(&self) -> Option<&RemoteId> {
        self.is_private().then_some(&self.key.conversation_id)
    }
}

