use std::collections::HashSet;

use shared::domain::RemoteId;
use storage::StoredReaction;
use tracing::{debug, warn};

use crate::{delivery, portal::Portal};

/// What has to change locally to match an observed reactor set.
#[derive(Debug, Default, PartialEq)]
pub struct ReactionDiff {
    pub added: Vec<RemoteId>,
    pub removed: Vec<StoredReaction>,
}

impl ReactionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff_reactors(existing: Vec<StoredReaction>, observed: &[RemoteId]) -> ReactionDiff {
    let known: HashSet<&RemoteId> = existing.iter().map(|reaction| &reaction.reactor).collect();
    let mut seen = HashSet::new();
    let added = observed
        .iter()
        .filter(|reactor| !known.contains(reactor) && seen.insert(*reactor))
        .cloned()
        .collect();
    let observed: HashSet<&RemoteId> = observed.iter().collect();
    let removed = existing
        .into_iter()
        .filter(|reaction| !observed.contains(&reaction.reactor))
        .collect();
    ReactionDiff { added, removed }
}

impl Portal {
    /// Mirrors the reactor set of `target` onto its local event.
    pub(crate) async fn sync_reactions(&self, target: &RemoteId, reactors: &[RemoteId]) {
        let bridge = self.bridge();
        let storage = bridge.storage();
        let Some(room_id) = self.room_id().await else {
            debug!(portal = %self.key(), %target, "reactions: no room yet");
            return;
        };
        let target_row = match storage.get_message(self.key(), target).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                debug!(portal = %self.key(), %target, "reactions: target was never bridged");
                return;
            }
            Err(err) => {
                warn!(portal = %self.key(), %target, "reactions: failed to load target: {err}");
                return;
            }
        };
        let existing = match storage.list_reactions(self.key(), target).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(portal = %self.key(), %target, "reactions: failed to load reactions: {err}");
                return;
            }
        };
        let diff = diff_reactors(existing, reactors);
        if diff.is_empty() {
            return;
        }

        let local = bridge.local();
        let reaction_key = &bridge.settings().reaction_key;
        for reactor in diff.added {
            let Some(intent) = self.ghost_intent(&reactor).await else {
                continue;
            };
            let sent = delivery::with_retry(&bridge.send_policy(), "send reaction", || {
                local.send_reaction(&intent, &room_id, &target_row.event_id, reaction_key)
            })
            .await;
            match sent {
                Ok(event_id) => {
                    let row = StoredReaction {
                        key: self.key().clone(),
                        target_remote_id: target.clone(),
                        reactor: reactor.clone(),
                        event_id,
                    };
                    if let Err(err) = storage.upsert_reaction(&row).await {
                        warn!(portal = %self.key(), %target, %reactor, "reactions: failed to persist reaction: {err}");
                    }
                }
                Err(err) => {
                    warn!(portal = %self.key(), %target, %reactor, "reactions: failed to mirror reaction: {err}")
                }
            }
        }

        // The reactor's intent may have changed since the reaction was sent.
        let main_intent = self.main_intent();
        for reaction in diff.removed {
            if let Err(err) = local.redact(&main_intent, &room_id, &reaction.event_id).await {
                warn!(portal = %self.key(), %target, reactor = %reaction.reactor, "reactions: failed to retract reaction: {err}");
                continue;
            }
            if let Err(err) = storage
                .delete_reaction(self.key(), target, &reaction.reactor)
                .await
            {
                warn!(portal = %self.key(), %target, reactor = %reaction.reactor, "reactions: failed to delete reaction: {err}");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/reactions_tests.rs"]
mod tests;
