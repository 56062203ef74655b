use std::{
    collections::HashSet,
    sync::{atomic::Ordering, Arc},
};

use anyhow::{anyhow, Result};
use serde_json::json;
use shared::{
    domain::{ContentUri, LocalUserId, RoomId},
    local::{Intent, PowerLevels, RoomCreateRequest, StateEvent},
    protocol::{RemoteGroup, RemoteMember},
};
use tracing::{debug, info, warn};

use super::{HandlingState, Portal};
use crate::{
    attachments, backfill, error::BridgeError, identity::GhostIdentity, user::UserAccount,
};

const MAIN_INTENT_LEVEL: i64 = 100;
const ADMIN_LEVEL: i64 = 99;
const MODERATOR_LEVEL: i64 = 50;
const PARTICIPANT_LEVEL: i64 = 0;

impl Portal {
    pub(crate) async fn ensure_room_locked(
        self: &Arc<Self>,
        state: &mut HandlingState,
        account: &Arc<UserAccount>,
    ) -> Result<RoomId, BridgeError> {
        if let Some(room_id) = self.room_id().await {
            return Ok(room_id);
        }
        let _creating = self.room_lock.lock().await;
        if let Some(room_id) = self.room_id().await {
            return Ok(room_id);
        }
        let room_id = self
            .create_room(account)
            .await
            .map_err(|source| BridgeError::RoomCreation {
                key: self.key.clone(),
                source,
            })?;
        if self.bridge.settings().backfill.initial_history_fill > 0 {
            backfill::fill_initial_history(self, state, account).await;
        }
        Ok(room_id)
    }

    async fn create_room(self: &Arc<Self>, account: &Arc<UserAccount>) -> Result<RoomId> {
        let settings = self.bridge.settings();
        let local = self.bridge.local();
        let main_intent = self.main_intent();
        let mut row = self.snapshot().await;
        row.encrypted = settings.encryption_default;

        let mut invite = vec![account.local_user_id().clone()];
        let mut members = Vec::new();
        if self.is_private() {
            row.topic = format!("{} private chat", settings.network_name);
            row.topic_set = true;
            if settings.private_chat_portal_meta || row.encrypted {
                let ghost = self
                    .bridge
                    .get_or_create_ghost(&self.key.conversation_id)
                    .await?;
                let ghost_row = ghost.snapshot().await;
                row.name = ghost_row.display_name;
                row.name_set = !row.name.is_empty();
                row.avatar = ghost_row.avatar;
                row.avatar_url = ghost_row.avatar_url;
                row.avatar_set = row.avatar_url.is_some();
            }
            if row.encrypted {
                invite.push(settings.bot_user_id());
            }
        } else {
            let client = account
                .client()
                .await
                .ok_or_else(|| anyhow!("{} is not logged in", account.local_user_id()))?;
            let group = client.show_group(&self.key.conversation_id).await?;
            row.name = group.name.clone();
            row.name_set = !row.name.is_empty();
            row.topic = group.description.clone();
            row.topic_set = !row.topic.is_empty();
            if let Some(url) = group.image_url.as_deref().filter(|url| !url.is_empty()) {
                match attachments::mirror_remote_image(&self.bridge, &client, &main_intent, url)
                    .await
                {
                    Ok(uri) => {
                        row.avatar = url.to_string();
                        row.avatar_url = Some(uri);
                        row.avatar_set = true;
                    }
                    Err(err) => {
                        warn!(portal = %self.key, "portal: failed to mirror group avatar: {err}")
                    }
                }
            }
            members = group.members;
        }

        let mut initial_state = vec![StateEvent {
            event_type: "m.bridge".into(),
            state_key: format!("{}://{}", settings.network_id, self.key),
            content: json!({
                "bridgebot": settings.bot_user_id(),
                "protocol": { "id": settings.network_id, "displayname": settings.network_name },
                "channel": { "id": self.key.to_string(), "displayname": row.name },
            }),
        }];
        if row.encrypted {
            initial_state.push(StateEvent {
                event_type: "m.room.encryption".into(),
                state_key: String::new(),
                content: json!({ "algorithm": "m.megolm.v1.aes-sha2" }),
            });
        }

        let request = RoomCreateRequest {
            name: row.name_set.then(|| row.name.clone()),
            topic: row.topic_set.then(|| row.topic.clone()),
            avatar_url: row.avatar_url.clone(),
            invite,
            is_direct: self.is_private(),
            power_levels: self.base_power_levels(),
            initial_state,
        };
        let room_id = local.create_room(&main_intent, request).await?;
        row.room_id = Some(room_id.clone());
        *self.row.write().await = row.clone();
        if let Err(err) = self.bridge.storage().update_portal(&row).await {
            warn!(portal = %self.key, %room_id, "portal: failed to persist room id: {err}");
        }
        self.bridge
            .register_room(room_id.clone(), Arc::clone(self))
            .await;
        info!(portal = %self.key, %room_id, encrypted = row.encrypted, "portal: room created");

        if self.is_private() {
            if row.encrypted {
                if let Err(err) = local.join(&self.bridge.bot_intent(), &room_id).await {
                    warn!(portal = %self.key, %room_id, "portal: bot failed to join: {err}");
                }
            }
        } else {
            self.sync_participants(account, &members).await;
        }
        Ok(room_id)
    }

    fn base_power_levels(&self) -> PowerLevels {
        let settings = self.bridge.settings();
        let mut levels = PowerLevels {
            users_default: 0,
            events_default: 0,
            state_default: ADMIN_LEVEL,
            ban: ADMIN_LEVEL,
            kick: MODERATOR_LEVEL,
            invite: if settings.allow_user_invite {
                0
            } else {
                MODERATOR_LEVEL
            },
            ..PowerLevels::default()
        };
        for event_type in ["m.room.name", "m.room.avatar", "m.room.topic"] {
            levels.events.insert(event_type.to_string(), 0);
        }
        levels.ensure_user_level(&self.main_intent().user_id, MAIN_INTENT_LEVEL);
        levels
    }

    /// Compares a remote group snapshot with the mirrored metadata and
    /// republishes what changed. Returns whether anything changed.
    pub async fn reconcile_metadata(&self, source: &UserAccount, group: &RemoteGroup) -> bool {
        let mut changed = self.update_name(&group.name).await;
        changed |= self.update_topic(&group.description).await;
        changed |= self
            .update_remote_avatar(source, group.image_url.as_deref())
            .await;
        changed
    }

    async fn update_name(&self, name: &str) -> bool {
        let room_id = {
            let row = self.row.read().await;
            if row.name == name && (row.name_set || name.is_empty()) {
                return false;
            }
            row.room_id.clone()
        };
        let mut published = false;
        if let Some(room_id) = &room_id {
            match self
                .bridge
                .local()
                .set_room_name(&self.main_intent(), room_id, name)
                .await
            {
                Ok(()) => published = true,
                Err(err) => warn!(portal = %self.key, "portal: failed to set room name: {err}"),
            }
        }
        let mut row = self.row.write().await;
        row.name = name.to_string();
        row.name_set = published;
        true
    }

    async fn update_topic(&self, topic: &str) -> bool {
        let room_id = {
            let row = self.row.read().await;
            if row.topic == topic && (row.topic_set || topic.is_empty()) {
                return false;
            }
            row.room_id.clone()
        };
        let mut published = false;
        if let Some(room_id) = &room_id {
            match self
                .bridge
                .local()
                .set_room_topic(&self.main_intent(), room_id, topic)
                .await
            {
                Ok(()) => published = true,
                Err(err) => warn!(portal = %self.key, "portal: failed to set room topic: {err}"),
            }
        }
        let mut row = self.row.write().await;
        row.topic = topic.to_string();
        row.topic_set = published;
        true
    }

    async fn update_remote_avatar(&self, source: &UserAccount, image_url: Option<&str>) -> bool {
        let image_url = image_url.unwrap_or_default();
        {
            let row = self.row.read().await;
            if row.avatar == image_url && (row.avatar_set || image_url.is_empty()) {
                return false;
            }
        }
        let uri = if image_url.is_empty() {
            None
        } else {
            let Some(client) = source.client().await else {
                debug!(portal = %self.key, "portal: no session to fetch avatar with");
                return false;
            };
            match attachments::mirror_remote_image(&self.bridge, &client, &self.main_intent(), image_url)
                .await
            {
                Ok(uri) => Some(uri),
                Err(err) => {
                    warn!(portal = %self.key, "portal: failed to mirror avatar: {err}");
                    return false;
                }
            }
        };
        self.apply_avatar(image_url, uri).await
    }

    async fn apply_avatar(&self, avatar: &str, uri: Option<ContentUri>) -> bool {
        let room_id = {
            let row = self.row.read().await;
            if row.avatar == avatar && row.avatar_url == uri && (row.avatar_set || avatar.is_empty()) {
                return false;
            }
            row.room_id.clone()
        };
        let mut published = false;
        if let Some(room_id) = &room_id {
            match self
                .bridge
                .local()
                .set_room_avatar(&self.main_intent(), room_id, uri.as_ref())
                .await
            {
                Ok(()) => published = true,
                Err(err) => warn!(portal = %self.key, "portal: failed to set room avatar: {err}"),
            }
        }
        let mut row = self.row.write().await;
        row.avatar = avatar.to_string();
        row.avatar_url = uri;
        row.avatar_set = published;
        true
    }

    async fn persist(&self) {
        let row = self.snapshot().await;
        if let Err(err) = self.bridge.storage().update_portal(&row).await {
            warn!(portal = %self.key, "portal: failed to persist portal: {err}");
        }
    }

    /// Copies the counterpart ghost's name and avatar onto a direct-chat room.
    pub(crate) async fn refresh_private_meta(&self) {
        let settings = self.bridge.settings();
        if !self.is_private() || !settings.private_chat_portal_meta {
            return;
        }
        let ghost = match self
            .bridge
            .get_or_create_ghost(&self.key.conversation_id)
            .await
        {
            Ok(ghost) => ghost,
            Err(err) => {
                warn!(portal = %self.key, "portal: failed to load counterpart: {err}");
                return;
            }
        };
        let ghost_row = ghost.snapshot().await;
        let mut changed = self.update_name(&ghost_row.display_name).await;
        changed |= self
            .apply_avatar(&ghost_row.avatar, ghost_row.avatar_url)
            .await;
        if changed {
            self.persist().await;
        }
    }

    pub(crate) async fn resync_locked(
        self: &Arc<Self>,
        state: &mut HandlingState,
        source: &Arc<UserAccount>,
        group: Option<RemoteGroup>,
        recover_history: bool,
    ) {
        let had_room = self.room_id().await.is_some();
        if self.is_private() {
            if had_room {
                self.refresh_private_meta().await;
            } else if let Err(err) = self.ensure_room_locked(state, source).await {
                warn!(portal = %self.key, "portal: {err}");
                return;
            }
        } else {
            let group = match group {
                Some(group) => group,
                None => {
                    let Some(client) = source.client().await else {
                        debug!(portal = %self.key, "portal: resync skipped, not logged in");
                        return;
                    };
                    match client.show_group(&self.key.conversation_id).await {
                        Ok(group) => group,
                        Err(err) => {
                            warn!(portal = %self.key, "portal: failed to fetch group: {err}");
                            return;
                        }
                    }
                }
            };
            if had_room {
                if self.reconcile_metadata(source, &group).await {
                    self.persist().await;
                }
                self.sync_participants(source, &group.members).await;
            } else if let Err(err) = self.ensure_room_locked(state, source).await {
                warn!(portal = %self.key, "portal: {err}");
                return;
            }
        }
        if had_room && recover_history {
            backfill::backfill_gap(self, state, source).await;
        }
    }

    /// Brings room membership in line with the remote member list.
    pub(crate) async fn sync_participants(&self, source: &Arc<UserAccount>, members: &[RemoteMember]) {
        let Some(room_id) = self.room_id().await else {
            return;
        };
        let settings = self.bridge.settings();
        let local = self.bridge.local();
        let main_intent = self.main_intent();
        let (mut levels, mut levels_changed) = match local.power_levels(&main_intent, &room_id).await {
            Ok(levels) => (levels, false),
            Err(err) => {
                debug!(portal = %self.key, "portal: falling back to base power levels: {err}");
                (self.base_power_levels(), true)
            }
        };
        let mut expected = HashSet::new();
        for member in members {
            if let Some(account) = self.bridge.account_by_remote_id(&member.user_id).await {
                self.ensure_user_invited(account.local_user_id()).await;
                levels_changed |= levels.ensure_user_level(account.local_user_id(), PARTICIPANT_LEVEL);
            }
            let ghost = match self.bridge.get_or_create_ghost(&member.user_id).await {
                Ok(ghost) => ghost,
                Err(err) => {
                    warn!(portal = %self.key, remote_id = %member.user_id, "portal: failed to load ghost: {err}");
                    continue;
                }
            };
            expected.insert(ghost.local_user_id().clone());
            if let Err(err) = local.join(&ghost.default_intent(), &room_id).await {
                warn!(portal = %self.key, user = %ghost.local_user_id(), "portal: ghost failed to join: {err}");
            }
            levels_changed |= levels.ensure_user_level(ghost.local_user_id(), PARTICIPANT_LEVEL);
            ghost.sync(source, member).await;
        }
        if levels_changed {
            if let Err(err) = local.set_power_levels(&main_intent, &room_id, &levels).await {
                warn!(portal = %self.key, "portal: failed to update power levels: {err}");
            }
        }

        let joined = match local.joined_members(&main_intent, &room_id).await {
            Ok(joined) => joined,
            Err(err) => {
                warn!(portal = %self.key, "portal: failed to list members: {err}");
                return;
            }
        };
        for user in joined {
            if settings.parse_ghost_user_id(&user).is_none() || expected.contains(&user) {
                continue;
            }
            if let Err(err) = local
                .kick(&main_intent, &room_id, &user, "User has left this group chat")
                .await
            {
                warn!(portal = %self.key, %user, "portal: failed to kick departed ghost: {err}");
            }
        }
    }

    pub(crate) async fn ensure_user_invited(&self, user: &LocalUserId) {
        let Some(room_id) = self.room_id().await else {
            return;
        };
        if let Err(err) = self
            .bridge
            .local()
            .invite(&self.main_intent(), &room_id, user)
            .await
        {
            debug!(portal = %self.key, %user, "portal: invite failed: {err}");
        }
    }

    /// Removes the portal row and drops the actor from the registry. The
    /// consumer task stops after the current event.
    pub(crate) async fn delete(&self) {
        if let Err(err) = self.bridge.storage().delete_portal(&self.key).await {
            warn!(portal = %self.key, "portal: failed to delete portal: {err}");
        }
        let room_id = self.room_id().await;
        self.bridge.evict_portal(&self.key, room_id.as_ref()).await;
        self.closed.store(true, Ordering::Release);
        info!(portal = %self.key, "portal: deleted");
    }

    /// Empties the local room. With `puppets_only` real users are left alone.
    pub(crate) async fn cleanup(&self, puppets_only: bool) {
        let Some(room_id) = self.room_id().await else {
            return;
        };
        let settings = self.bridge.settings();
        let local = self.bridge.local();
        let main_intent = self.main_intent();
        if self.is_private() {
            if let Err(err) = local.leave(&main_intent, &room_id).await {
                debug!(portal = %self.key, "portal: main intent failed to leave: {err}");
            }
            return;
        }
        let members = match local.joined_members(&main_intent, &room_id).await {
            Ok(members) => members,
            Err(err) => {
                warn!(portal = %self.key, "portal: failed to list members for cleanup: {err}");
                Vec::new()
            }
        };
        for user in members {
            if user == main_intent.user_id {
                continue;
            }
            if settings.parse_ghost_user_id(&user).is_some() {
                let intent = Intent::new(user.clone());
                if let Err(err) = local.leave(&intent, &room_id).await {
                    debug!(portal = %self.key, %user, "portal: ghost failed to leave: {err}");
                }
            } else if !puppets_only && user != settings.bot_user_id() {
                if let Err(err) = local
                    .kick(&main_intent, &room_id, &user, "Deleting portal")
                    .await
                {
                    debug!(portal = %self.key, %user, "portal: failed to kick: {err}");
                }
            }
        }
        if let Err(err) = local.leave(&main_intent, &room_id).await {
            debug!(portal = %self.key, "portal: main intent failed to leave: {err}");
        }
    }

    /// Deletes the portal when no real users remain in its room.
    pub(crate) async fn cleanup_if_empty(&self) -> bool {
        let Some(room_id) = self.room_id().await else {
            return false;
        };
        let members = match self
            .bridge
            .local()
            .joined_members(&self.main_intent(), &room_id)
            .await
        {
            Ok(members) => members,
            Err(err) => {
                warn!(portal = %self.key, "portal: failed to list members: {err}");
                return false;
            }
        };
        if members.iter().any(|user| !self.bridge.is_bridge_user(user)) {
            return false;
        }
        debug!(portal = %self.key, "portal: room is empty, cleaning up");
        self.cleanup(false).await;
        self.delete().await;
        true
    }
}
