use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::domain::{LocalUserId, RemoteId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Server name of the local chat system, used to build user ids.
    pub domain: String,
    pub bot_username: String,
    /// `{id}` is replaced by the remote user id.
    pub username_template: String,
    /// `{name}` is replaced by the remote display name.
    pub displayname_template: String,
    pub network_name: String,
    pub network_id: String,
    pub portal_message_buffer: usize,
    pub dispatch_buffer: usize,
    pub recent_message_capacity: usize,
    pub max_message_age_to_create_portal_secs: u64,
    pub delivery_receipts: bool,
    pub private_chat_portal_meta: bool,
    pub encryption_default: bool,
    pub allow_user_invite: bool,
    pub reaction_key: String,
    pub initial_chat_sync: usize,
    pub sync_chat_max_age_secs: u64,
    pub backfill: BackfillSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillSettings {
    pub initial_history_fill: usize,
    pub recover_history: bool,
    pub page_size: usize,
    pub invite_own_ghost_for_backfilling: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub send_attempts: usize,
    pub upload_attempts: usize,
    pub gateway_delay_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            domain: "example.org".into(),
            bot_username: "remotebot".into(),
            username_template: "remote_{id}".into(),
            displayname_template: "{name} (Remote)".into(),
            network_name: "Remote".into(),
            network_id: "remote".into(),
            portal_message_buffer: 128,
            dispatch_buffer: 128,
            recent_message_capacity: 100,
            max_message_age_to_create_portal_secs: 5 * 60,
            delivery_receipts: false,
            private_chat_portal_meta: false,
            encryption_default: false,
            allow_user_invite: false,
            reaction_key: "❤️".into(),
            initial_chat_sync: 10,
            sync_chat_max_age_secs: 3 * 24 * 60 * 60,
            backfill: BackfillSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            initial_history_fill: 20,
            recover_history: true,
            page_size: 50,
            invite_own_ghost_for_backfilling: true,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            send_attempts: 5,
            upload_attempts: 5,
            gateway_delay_ms: 5_000,
        }
    }
}

impl RetrySettings {
    pub fn gateway_delay(&self) -> Duration {
        Duration::from_millis(self.gateway_delay_ms)
    }
}

impl BridgeSettings {
    pub fn max_message_age_to_create_portal(&self) -> Duration {
        Duration::from_secs(self.max_message_age_to_create_portal_secs)
    }

    pub fn sync_chat_max_age(&self) -> Duration {
        Duration::from_secs(self.sync_chat_max_age_secs)
    }

    pub fn bot_user_id(&self) -> LocalUserId {
        LocalUserId(format!("@{}:{}", self.bot_username, self.domain))
    }

    pub fn ghost_user_id(&self, remote_id: &RemoteId) -> LocalUserId {
        let localpart = self.username_template.replace("{id}", remote_id.as_str());
        LocalUserId(format!("@{localpart}:{}", self.domain))
    }

    /// Reverses [`Self::ghost_user_id`]; `None` for anything that is not a ghost.
    pub fn parse_ghost_user_id(&self, user_id: &LocalUserId) -> Option<RemoteId> {
        let (prefix, suffix) = self.username_template.split_once("{id}")?;
        let localpart = user_id
            .as_str()
            .strip_prefix('@')?
            .strip_suffix(&format!(":{}", self.domain))?;
        let remote = localpart.strip_prefix(prefix)?.strip_suffix(suffix)?;
        if remote.is_empty() {
            return None;
        }
        Some(RemoteId::from(remote))
    }

    pub fn ghost_display_name(&self, name: &str) -> String {
        self.displayname_template.replace("{name}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ghost_user_ids_round_trip() {
        let settings = BridgeSettings::default();
        let remote = RemoteId::from("12345");
        let local = settings.ghost_user_id(&remote);
        assert_eq!(local.as_str(), "@remote_12345:example.org");
        assert_eq!(settings.parse_ghost_user_id(&local), Some(remote));
    }

    #[test]
    fn non_ghost_ids_do_not_parse() {
        let settings = BridgeSettings::default();
        assert_eq!(
            settings.parse_ghost_user_id(&LocalUserId::from("@alice:example.org")),
            None
        );
        assert_eq!(
            settings.parse_ghost_user_id(&LocalUserId::from("@remote_1:other.org")),
            None
        );
        assert_eq!(settings.parse_ghost_user_id(&settings.bot_user_id()), None);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let settings: BridgeSettings = from_json(
            r#"{ "domain": "chat.example", "backfill": { "initial_history_fill": 0 } }"#,
        );
        assert_eq!(settings.domain, "chat.example");
        assert_eq!(settings.backfill.initial_history_fill, 0);
        assert_eq!(settings.backfill.page_size, 50);
        assert_eq!(settings.max_message_age_to_create_portal_secs, 300);
    }

    fn from_json(raw: &str) -> BridgeSettings {
        serde_json::from_str(raw).expect("settings")
    }
}
