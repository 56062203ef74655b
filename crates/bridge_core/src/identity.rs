use async_trait::async_trait;
use shared::{
    domain::{LocalUserId, RemoteId, RoomId},
    local::Intent,
};

/// A remote identity mirrored on the local side.
#[async_trait]
pub trait GhostIdentity: Send + Sync {
    fn remote_id(&self) -> &RemoteId;
    fn local_user_id(&self) -> &LocalUserId;
    /// Last display name published for this identity.
    async fn display_name(&self) -> String;

    fn default_intent(&self) -> Intent {
        Intent::new(self.local_user_id().clone())
    }
}

/// A local account the bridge manages a remote session for.
#[async_trait]
pub trait ManagedAccount: Send + Sync {
    fn local_user_id(&self) -> &LocalUserId;
    async fn linked_remote_id(&self) -> Option<RemoteId>;
    async fn management_room_id(&self) -> Option<RoomId>;
}
