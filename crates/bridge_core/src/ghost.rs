use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ContentUri, LocalUserId, RemoteId},
    local::Intent,
    protocol::RemoteMember,
};
use storage::StoredGhost;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    attachments,
    bridge::Bridge,
    identity::GhostIdentity,
    portal::{Portal, PortalEvent},
    user::UserAccount,
};

/// Sender id the remote service uses for its own announcements.
const SYSTEM_SENDER: &str = "system";

pub struct Ghost {
    bridge: Arc<Bridge>,
    remote_id: RemoteId,
    local_user_id: LocalUserId,
    row: RwLock<StoredGhost>,
    sync_lock: Mutex<()>,
}

impl Ghost {
    pub(crate) fn new(bridge: Arc<Bridge>, row: StoredGhost) -> Self {
        let local_user_id = bridge.settings().ghost_user_id(&row.remote_id);
        Self {
            remote_id: row.remote_id.clone(),
            local_user_id,
            bridge,
            row: RwLock::new(row),
            sync_lock: Mutex::new(()),
        }
    }

    pub async fn snapshot(&self) -> StoredGhost {
        self.row.read().await.clone()
    }

    /// The double-puppet intent where allowed, the ghost itself otherwise.
    pub async fn intent_for(&self, portal: &Portal) -> Intent {
        let row = self.row.read().await;
        let (Some(local_id), Some(token)) = (&row.custom_local_id, &row.access_token) else {
            return self.default_intent();
        };
        let backfill = &self.bridge.settings().backfill;
        if portal.is_backfilling() && backfill.invite_own_ghost_for_backfilling {
            return self.default_intent();
        }
        if portal.counterpart_ghost_id() == Some(&self.remote_id) {
            return self.default_intent();
        }
        Intent::with_token(local_id.clone(), token.clone())
    }

    /// Publishes the member's current name and avatar when they changed.
    pub async fn sync(&self, source: &UserAccount, member: &RemoteMember) {
        if self.remote_id.as_str() == SYSTEM_SENDER {
            return;
        }
        let _syncing = self.sync_lock.lock().await;
        let settings = self.bridge.settings();
        let intent = self.default_intent();
        let mut row = self.snapshot().await;
        let mut changed = false;

        let nickname = if member.nickname.is_empty() {
            self.remote_id.as_str()
        } else {
            member.nickname.as_str()
        };
        let display_name = settings.ghost_display_name(nickname);
        let name_changed = row.display_name != display_name || !row.name_set;
        if name_changed {
            row.name_set = match self.bridge.local().set_display_name(&intent, &display_name).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(ghost = %self.remote_id, "ghost: failed to set display name: {err}");
                    false
                }
            };
            row.display_name = display_name;
            changed = true;
        }

        let avatar = member.image_url.as_deref().unwrap_or_default();
        if row.avatar != avatar || !row.avatar_set {
            match self.mirror_avatar(source, &intent, avatar).await {
                Ok(uri) => {
                    row.avatar_set = match self.bridge.local().set_avatar(&intent, uri.as_ref()).await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(ghost = %self.remote_id, "ghost: failed to set avatar: {err}");
                            false
                        }
                    };
                    row.avatar = avatar.to_string();
                    row.avatar_url = uri;
                    changed = true;
                }
                Err(err) => warn!(ghost = %self.remote_id, "ghost: failed to mirror avatar: {err}"),
            }
        }

        if !changed {
            return;
        }
        *self.row.write().await = row.clone();
        if let Err(err) = self.bridge.storage().update_ghost(&row).await {
            warn!(ghost = %self.remote_id, "ghost: failed to persist profile: {err}");
        }
        debug!(ghost = %self.remote_id, name = %row.display_name, "ghost: profile synced");
        if name_changed && settings.private_chat_portal_meta {
            self.notify_private_portals().await;
        }
    }

    async fn mirror_avatar(
        &self,
        source: &UserAccount,
        intent: &Intent,
        image_url: &str,
    ) -> Result<Option<ContentUri>> {
        if image_url.is_empty() {
            return Ok(None);
        }
        let client = source
            .client()
            .await
            .ok_or_else(|| anyhow::anyhow!("{} is not logged in", source.local_user_id()))?;
        let uri = attachments::mirror_remote_image(&self.bridge, &client, intent, image_url).await?;
        Ok(Some(uri))
    }

    /// Tells every loaded direct chat with this ghost to refresh its room metadata.
    async fn notify_private_portals(&self) {
        let rows = match self
            .bridge
            .storage()
            .list_private_portals_with(&self.remote_id)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(ghost = %self.remote_id, "ghost: failed to list direct chats: {err}");
                return;
            }
        };
        for row in rows {
            let Some(portal) = self.bridge.portal_by_key(&row.key).await else {
                continue;
            };
            tokio::spawn(async move {
                if let Err(err) = portal.enqueue(PortalEvent::CounterpartChanged).await {
                    debug!("ghost: {err}");
                }
            });
        }
    }

    /// Enables double puppeting through the given real account.
    pub async fn link_custom_local_id(
        self: &Arc<Self>,
        local_id: LocalUserId,
        access_token: String,
    ) -> Result<()> {
        self.bridge
            .link_ghost_custom_local_id(self, local_id, access_token)
            .await
    }

    /// Returns the previously linked local id, if any.
    pub(crate) async fn set_custom_local_id(
        &self,
        local_id: Option<LocalUserId>,
        access_token: Option<String>,
    ) -> Result<Option<LocalUserId>> {
        let mut row = self.row.write().await;
        let mut updated = row.clone();
        let previous = std::mem::replace(&mut updated.custom_local_id, local_id);
        updated.access_token = access_token;
        updated.enable_receipts = updated.custom_local_id.is_some();
        self.bridge.storage().update_ghost(&updated).await?;
        *row = updated;
        Ok(previous)
    }
}

#[async_trait]
impl GhostIdentity for Ghost {
    fn remote_id(&self) -> &RemoteId {
        &self.remote_id
    }

    fn local_user_id(&self) -> &LocalUserId {
        &self.local_user_id
    }

    async fn display_name(&self) -> String {
        self.row.read().await.display_name.clone()
    }
}
