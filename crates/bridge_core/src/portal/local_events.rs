use std::sync::Arc;

use shared::{
    domain::EventId,
    local::{LocalEvent, LocalEventContent, MsgType},
    protocol::OutgoingText,
};
use storage::StoredMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HandlingState, Portal};
use crate::{delivery, user::UserAccount};

const NOT_BRIDGED_PREFIX: &str = "⚠ Your message may not have been bridged";

impl Portal {
    pub(crate) async fn handle_local_event(
        &self,
        state: &mut HandlingState,
        sender: &Arc<UserAccount>,
        event: LocalEvent,
    ) {
        match &event.content {
            LocalEventContent::Message { msgtype, body } => {
                self.handle_local_message(state, sender, &event.event_id, *msgtype, body)
                    .await;
            }
            LocalEventContent::Leave => self.handle_local_leave(sender).await,
            LocalEventContent::Redaction { redacts } => {
                match self.bridge.storage().delete_message_by_event(redacts).await {
                    Ok(true) => debug!(portal = %self.key, %redacts, "portal: forgot redacted message"),
                    Ok(false) => {}
                    Err(err) => warn!(portal = %self.key, %redacts, "portal: failed to forget redacted message: {err}"),
                }
            }
            LocalEventContent::Other => {
                debug!(portal = %self.key, event_id = %event.event_id, "portal: ignoring local event")
            }
        }
    }

    async fn handle_local_message(
        &self,
        state: &mut HandlingState,
        sender: &Arc<UserAccount>,
        event_id: &EventId,
        msgtype: MsgType,
        body: &str,
    ) {
        // Events the bridge itself sent through a double-puppeted account come back here.
        match self.bridge.storage().get_message_by_event(event_id).await {
            Ok(Some(_)) => {
                debug!(portal = %self.key, %event_id, "portal: ignoring echo of a mirrored message");
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(portal = %self.key, %event_id, "portal: echo lookup failed: {err}");
            }
        }
        let sender_remote = sender.remote_id().await;
        if self.is_private() && sender_remote.as_ref() != Some(&self.key.receiver) {
            debug!(portal = %self.key, user = %sender.local_user_id(), "portal: ignoring message from non-receiver");
            return;
        }
        let Some(room_id) = self.room_id().await else {
            return;
        };
        let text = match msgtype {
            MsgType::Text | MsgType::Notice => body.to_string(),
            MsgType::Emote => format!("/me {body}"),
            other => {
                debug!(portal = %self.key, %event_id, msgtype = ?other, "portal: unsupported outgoing msgtype");
                return;
            }
        };
        let Some(client) = sender.client().await else {
            self.send_notice(
                &self.main_intent(),
                &room_id,
                &format!("{NOT_BRIDGED_PREFIX}: not logged in"),
            )
            .await;
            return;
        };

        let outgoing = OutgoingText {
            source_guid: Uuid::new_v4().to_string(),
            text,
        };
        let result = delivery::with_retry(&self.bridge.send_policy(), "remote send", || {
            client.send_message(&self.key, &outgoing)
        })
        .await;
        let sent = match result {
            Ok(sent) => sent,
            Err(err) => {
                warn!(portal = %self.key, %event_id, "portal: failed to send to remote: {err}");
                self.send_notice(
                    &self.main_intent(),
                    &room_id,
                    &format!("{NOT_BRIDGED_PREFIX}: {err}"),
                )
                .await;
                return;
            }
        };

        state.recent.push(sent.id.clone());
        let row = StoredMessage {
            key: self.key.clone(),
            remote_id: sent.id.clone(),
            event_id: event_id.clone(),
            sender: sender_remote.unwrap_or_else(|| sent.sender_id.clone()),
            timestamp_ms: sent.created_at.timestamp_millis(),
            delivered: true,
        };
        if let Err(err) = self.bridge.storage().insert_message(&row).await {
            warn!(portal = %self.key, message_id = %sent.id, "portal: failed to persist sent message: {err}");
        }
        self.send_delivery_receipt(event_id).await;
        debug!(portal = %self.key, %event_id, message_id = %sent.id, "portal: local message sent");
    }

    async fn handle_local_leave(&self, sender: &Arc<UserAccount>) {
        if self.is_private() {
            if sender.remote_id().await.as_ref() != Some(&self.key.receiver) {
                return;
            }
            info!(portal = %self.key, user = %sender.local_user_id(), "portal: receiver left private chat");
            self.cleanup(false).await;
            self.delete().await;
            return;
        }

        match sender.client().await {
            Some(client) => {
                if let Err(err) = client.leave_group(&self.key.conversation_id).await {
                    warn!(portal = %self.key, user = %sender.local_user_id(), "portal: failed to leave remote group: {err}");
                }
            }
            None => debug!(portal = %self.key, user = %sender.local_user_id(), "portal: left without a session"),
        }
        self.cleanup_if_empty().await;
    }
}
