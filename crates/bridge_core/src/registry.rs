//! Single-instance lookup of portals, ghosts and accounts.
//!
//! Each entity kind has its own map and its own lock. A get-or-create holds
//! that lock from the map check through storage and construction, so two
//! callers racing on one key always end up with the same `Arc`.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use shared::domain::{ConversationKey, LocalUserId, RemoteId, RoomId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    bridge::Bridge, ghost::Ghost, identity::GhostIdentity, portal::Portal, user::UserAccount,
};

#[derive(Default)]
pub struct IdentityRegistry {
    portals: Mutex<PortalMaps>,
    ghosts: Mutex<GhostMaps>,
    accounts: Mutex<AccountMaps>,
}

#[derive(Default)]
struct PortalMaps {
    by_key: HashMap<ConversationKey, Arc<Portal>>,
    by_room: HashMap<RoomId, Arc<Portal>>,
}

#[derive(Default)]
struct GhostMaps {
    by_remote_id: HashMap<RemoteId, Arc<Ghost>>,
    by_custom_local_id: HashMap<LocalUserId, Arc<Ghost>>,
}

#[derive(Default)]
struct AccountMaps {
    by_local_id: HashMap<LocalUserId, Arc<UserAccount>>,
    by_remote_id: HashMap<RemoteId, Arc<UserAccount>>,
    by_management_room: HashMap<RoomId, Arc<UserAccount>>,
}

impl Bridge {
    pub async fn get_or_create_portal(self: &Arc<Self>, key: &ConversationKey) -> Result<Arc<Portal>> {
        let mut maps = self.registry.portals.lock().await;
        if let Some(portal) = maps.by_key.get(key) {
            return Ok(Arc::clone(portal));
        }
        let row = match self.storage().get_portal(key).await? {
            Some(row) => row,
            None => self.storage().insert_portal_if_absent(key).await?,
        };
        let room_id = row.room_id.clone();
        let portal = Portal::spawn(Arc::clone(self), row);
        if let Some(room_id) = room_id {
            maps.by_room.insert(room_id, Arc::clone(&portal));
        }
        maps.by_key.insert(key.clone(), Arc::clone(&portal));
        debug!(portal = %key, "registry: portal loaded");
        Ok(portal)
    }

    /// Lookup only: never creates a row.
    pub async fn portal_by_key(self: &Arc<Self>, key: &ConversationKey) -> Option<Arc<Portal>> {
        let mut maps = self.registry.portals.lock().await;
        if let Some(portal) = maps.by_key.get(key) {
            return Some(Arc::clone(portal));
        }
        let row = match self.storage().get_portal(key).await {
            Ok(row) => row?,
            Err(err) => {
                warn!(portal = %key, "registry: portal lookup failed: {err}");
                return None;
            }
        };
        let room_id = row.room_id.clone();
        let portal = Portal::spawn(Arc::clone(self), row);
        if let Some(room_id) = room_id {
            maps.by_room.insert(room_id, Arc::clone(&portal));
        }
        maps.by_key.insert(key.clone(), Arc::clone(&portal));
        Some(portal)
    }

    pub async fn portal_by_room(self: &Arc<Self>, room_id: &RoomId) -> Option<Arc<Portal>> {
        let mut maps = self.registry.portals.lock().await;
        if let Some(portal) = maps.by_room.get(room_id) {
            return Some(Arc::clone(portal));
        }
        let row = match self.storage().get_portal_by_room(room_id).await {
            Ok(row) => row?,
            Err(err) => {
                warn!(%room_id, "registry: portal lookup by room failed: {err}");
                return None;
            }
        };
        if let Some(portal) = maps.by_key.get(&row.key) {
            let portal = Arc::clone(portal);
            maps.by_room.insert(room_id.clone(), Arc::clone(&portal));
            return Some(portal);
        }
        let key = row.key.clone();
        let portal = Portal::spawn(Arc::clone(self), row);
        maps.by_room.insert(room_id.clone(), Arc::clone(&portal));
        maps.by_key.insert(key, Arc::clone(&portal));
        Some(portal)
    }

    pub async fn loaded_portals(&self) -> Vec<Arc<Portal>> {
        self.registry
            .portals
            .lock()
            .await
            .by_key
            .values()
            .cloned()
            .collect()
    }

    pub(crate) async fn register_room(&self, room_id: RoomId, portal: Arc<Portal>) {
        self.registry
            .portals
            .lock()
            .await
            .by_room
            .insert(room_id, portal);
    }

    pub(crate) async fn evict_portal(&self, key: &ConversationKey, room_id: Option<&RoomId>) {
        let mut maps = self.registry.portals.lock().await;
        maps.by_key.remove(key);
        if let Some(room_id) = room_id {
            maps.by_room.remove(room_id);
        }
    }

    pub async fn get_or_create_ghost(self: &Arc<Self>, remote_id: &RemoteId) -> Result<Arc<Ghost>> {
        let mut maps = self.registry.ghosts.lock().await;
        if let Some(ghost) = maps.by_remote_id.get(remote_id) {
            return Ok(Arc::clone(ghost));
        }
        let row = match self.storage().get_ghost(remote_id).await? {
            Some(row) => row,
            None => self.storage().insert_ghost_if_absent(remote_id).await?,
        };
        let custom_local_id = row.custom_local_id.clone();
        let ghost = Arc::new(Ghost::new(Arc::clone(self), row));
        maps.by_remote_id
            .insert(remote_id.clone(), Arc::clone(&ghost));
        if let Some(local_id) = custom_local_id {
            maps.by_custom_local_id.insert(local_id, Arc::clone(&ghost));
        }
        Ok(ghost)
    }

    /// Resolves a ghost user id, or a local account linked to a ghost for double puppeting.
    pub async fn ghost_by_local_user_id(self: &Arc<Self>, user_id: &LocalUserId) -> Option<Arc<Ghost>> {
        if let Some(remote_id) = self.settings().parse_ghost_user_id(user_id) {
            return match self.get_or_create_ghost(&remote_id).await {
                Ok(ghost) => Some(ghost),
                Err(err) => {
                    warn!(%user_id, "registry: ghost lookup failed: {err}");
                    None
                }
            };
        }
        self.ghost_by_custom_local_id(user_id).await
    }

    pub async fn ghost_by_custom_local_id(self: &Arc<Self>, local_id: &LocalUserId) -> Option<Arc<Ghost>> {
        let mut maps = self.registry.ghosts.lock().await;
        if let Some(ghost) = maps.by_custom_local_id.get(local_id) {
            return Some(Arc::clone(ghost));
        }
        let row = match self.storage().get_ghost_by_custom_local_id(local_id).await {
            Ok(row) => row?,
            Err(err) => {
                warn!(%local_id, "registry: ghost lookup by credential failed: {err}");
                return None;
            }
        };
        let ghost = match maps.by_remote_id.get(&row.remote_id) {
            Some(ghost) => Arc::clone(ghost),
            None => {
                let ghost = Arc::new(Ghost::new(Arc::clone(self), row));
                maps.by_remote_id
                    .insert(ghost.remote_id().clone(), Arc::clone(&ghost));
                ghost
            }
        };
        maps.by_custom_local_id
            .insert(local_id.clone(), Arc::clone(&ghost));
        Some(ghost)
    }

    /// Links `ghost` to a real local account so its messages are sent through that account.
    pub async fn link_ghost_custom_local_id(
        &self,
        ghost: &Arc<Ghost>,
        local_id: LocalUserId,
        access_token: String,
    ) -> Result<()> {
        let mut maps = self.registry.ghosts.lock().await;
        let previous = ghost
            .set_custom_local_id(Some(local_id.clone()), Some(access_token))
            .await?;
        if let Some(previous) = previous {
            maps.by_custom_local_id.remove(&previous);
        }
        maps.by_custom_local_id.insert(local_id, Arc::clone(ghost));
        Ok(())
    }

    pub async fn get_or_create_account(
        self: &Arc<Self>,
        local_id: &LocalUserId,
    ) -> Result<Arc<UserAccount>> {
        let mut maps = self.registry.accounts.lock().await;
        if let Some(account) = maps.by_local_id.get(local_id) {
            return Ok(Arc::clone(account));
        }
        let row = match self.storage().get_account(local_id).await? {
            Some(row) => row,
            None => self.storage().insert_account_if_absent(local_id).await?,
        };
        let account = UserAccount::spawn(Arc::clone(self), row.clone());
        maps.by_local_id
            .insert(local_id.clone(), Arc::clone(&account));
        if let Some(remote_id) = row.remote_id {
            maps.by_remote_id.insert(remote_id, Arc::clone(&account));
        }
        if let Some(room_id) = row.management_room {
            maps.by_management_room
                .insert(room_id, Arc::clone(&account));
        }
        Ok(account)
    }

    /// Lookup only: accounts that have never been referenced stay absent.
    pub async fn account_by_local_id(self: &Arc<Self>, local_id: &LocalUserId) -> Option<Arc<UserAccount>> {
        {
            let maps = self.registry.accounts.lock().await;
            if let Some(account) = maps.by_local_id.get(local_id) {
                return Some(Arc::clone(account));
            }
        }
        match self.storage().get_account(local_id).await {
            Ok(Some(_)) => self.get_or_create_account(local_id).await.ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(%local_id, "registry: account lookup failed: {err}");
                None
            }
        }
    }

    pub async fn account_by_remote_id(self: &Arc<Self>, remote_id: &RemoteId) -> Option<Arc<UserAccount>> {
        {
            let maps = self.registry.accounts.lock().await;
            if let Some(account) = maps.by_remote_id.get(remote_id) {
                return Some(Arc::clone(account));
            }
        }
        match self.storage().get_account_by_remote_id(remote_id).await {
            Ok(Some(row)) => self.get_or_create_account(&row.local_id).await.ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(%remote_id, "registry: account lookup by remote id failed: {err}");
                None
            }
        }
    }

    pub async fn account_by_management_room(
        self: &Arc<Self>,
        room_id: &RoomId,
    ) -> Option<Arc<UserAccount>> {
        {
            let maps = self.registry.accounts.lock().await;
            if let Some(account) = maps.by_management_room.get(room_id) {
                return Some(Arc::clone(account));
            }
        }
        match self.storage().get_account_by_management_room(room_id).await {
            Ok(Some(row)) => self.get_or_create_account(&row.local_id).await.ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(%room_id, "registry: account lookup by management room failed: {err}");
                None
            }
        }
    }

    pub(crate) async fn index_account_remote_id(&self, remote_id: RemoteId, account: Arc<UserAccount>) {
        self.registry
            .accounts
            .lock()
            .await
            .by_remote_id
            .insert(remote_id, account);
    }

    pub(crate) async fn index_management_room(&self, room_id: RoomId, account: Arc<UserAccount>) {
        self.registry
            .accounts
            .lock()
            .await
            .by_management_room
            .insert(room_id, account);
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
