use shared::domain::{ConversationKey, LocalUserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to create room for {key}: {source}")]
    RoomCreation {
        key: ConversationKey,
        source: anyhow::Error,
    },
    #[error("portal {0} is closed")]
    PortalClosed(ConversationKey),
    #[error("{0} is not logged in")]
    NotLoggedIn(LocalUserId),
    #[error("unknown conversation id {0}")]
    UnknownConversation(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{operation} rejected: {source}")]
    Permanent {
        operation: &'static str,
        source: anyhow::Error,
    },
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
        source: anyhow::Error,
    },
    #[error("{operation} failed: {source}")]
    Failed {
        operation: &'static str,
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("unable to handle attachment type {0}")]
    Unsupported(&'static str),
    #[error("failed to download {kind} attachment: {source}")]
    Download {
        kind: &'static str,
        source: anyhow::Error,
    },
    #[error("failed to upload {kind} attachment: {source}")]
    Upload {
        kind: &'static str,
        source: DeliveryError,
    },
}
