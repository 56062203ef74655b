use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{ContentUri, LocalUserId},
    local::{Intent, LocalEvent},
};
use storage::Storage;
use tracing::{debug, info, warn};

use crate::{
    collaborators::{LocalChat, RemoteConnector},
    delivery::{self, RetryPolicy},
    error::{BridgeError, DeliveryError},
    portal::PortalEvent,
    registry::IdentityRegistry,
    settings::BridgeSettings,
};

/// Shared context every actor hangs off.
pub struct Bridge {
    settings: BridgeSettings,
    storage: Storage,
    local: Arc<dyn LocalChat>,
    connector: Arc<dyn RemoteConnector>,
    pub(crate) registry: IdentityRegistry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRouting {
    Queued,
    /// Sent by the bot or a ghost, i.e. an echo of our own activity.
    Ignored,
    UnknownRoom,
}

impl Bridge {
    pub fn new(
        settings: BridgeSettings,
        storage: Storage,
        local: Arc<dyn LocalChat>,
        connector: Arc<dyn RemoteConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            storage,
            local,
            connector,
            registry: IdentityRegistry::default(),
        })
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn local(&self) -> &Arc<dyn LocalChat> {
        &self.local
    }

    pub(crate) fn connector(&self) -> &Arc<dyn RemoteConnector> {
        &self.connector
    }

    pub fn bot_intent(&self) -> Intent {
        Intent::new(self.settings.bot_user_id())
    }

    /// True for the bot and for every ghost user id.
    pub fn is_bridge_user(&self, user_id: &LocalUserId) -> bool {
        *user_id == self.settings.bot_user_id()
            || self.settings.parse_ghost_user_id(user_id).is_some()
    }

    pub fn send_policy(&self) -> RetryPolicy {
        RetryPolicy::for_send(&self.settings.retry)
    }

    pub fn upload_policy(&self) -> RetryPolicy {
        RetryPolicy::for_upload(&self.settings.retry)
    }

    pub(crate) async fn upload_with_retry(
        &self,
        intent: &Intent,
        bytes: Vec<u8>,
        mime_type: &str,
        filename: Option<&str>,
    ) -> Result<ContentUri, DeliveryError> {
        delivery::with_retry(&self.upload_policy(), "upload media", || {
            self.local
                .upload_media(intent, bytes.clone(), mime_type, filename)
        })
        .await
    }

    /// Reconnects every account that still has remote credentials.
    pub async fn restore_sessions(self: &Arc<Self>) -> Result<usize> {
        let accounts = self.storage.list_logged_in_accounts().await?;
        let mut connected = 0;
        for stored in accounts {
            let account = match self.get_or_create_account(&stored.local_id).await {
                Ok(account) => account,
                Err(err) => {
                    warn!(user = %stored.local_id, "bridge: failed to load account: {err}");
                    continue;
                }
            };
            match account.connect().await {
                Ok(true) => connected += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(user = %stored.local_id, "bridge: failed to restore session: {err}");
                    if let Err(notice_err) = account
                        .send_bridge_notice(&format!("Failed to connect to {}: {err}", self.settings.network_name))
                        .await
                    {
                        debug!(user = %stored.local_id, "bridge: failed to send notice: {notice_err}");
                    }
                }
            }
        }
        info!(connected, "bridge: sessions restored");
        Ok(connected)
    }

    /// Routes an event pushed by the local chat system to the owning portal.
    pub async fn handle_local_event(
        self: &Arc<Self>,
        event: LocalEvent,
    ) -> Result<LocalRouting, BridgeError> {
        if self.is_bridge_user(&event.sender) {
            return Ok(LocalRouting::Ignored);
        }
        let Some(portal) = self.portal_by_room(&event.room_id).await else {
            debug!(room_id = %event.room_id, event_id = %event.event_id, "bridge: event for unknown room");
            return Ok(LocalRouting::UnknownRoom);
        };
        let sender = self.get_or_create_account(&event.sender).await?;
        portal.enqueue(PortalEvent::Local { sender, event }).await?;
        Ok(LocalRouting::Queued)
    }
}
