pub mod attachments;
mod backfill;
pub mod bridge;
pub mod collaborators;
pub mod delivery;
pub mod error;
pub mod ghost;
pub mod identity;
pub mod portal;
pub mod reactions;
mod registry;
pub mod settings;
pub mod user;

pub use bridge::{Bridge, LocalRouting};
pub use collaborators::{
    LocalChat, MissingLocalChat, MissingRemoteConnector, RemoteClient, RemoteConnector,
    RemoteEventHandler,
};
pub use error::{AttachmentError, BridgeError, DeliveryError};
pub use ghost::Ghost;
pub use identity::{GhostIdentity, ManagedAccount};
pub use portal::{MessageOutcome, Portal, PortalEvent};
pub use settings::BridgeSettings;
pub use user::{LossyQueue, UserAccount};
