//! History backfill.
//!
//! Pages are fetched from the remote service, sorted oldest-first and
//! replayed through the normal acceptance pipeline while the portal's
//! handling lock is held, so live messages never interleave with history.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use shared::{
    domain::RemoteId,
    local::Intent,
    protocol::{HistoryDirection, RemoteMessage},
};
use tracing::{debug, info, warn};

use crate::{
    portal::{HandlingState, MessageOutcome, Portal},
    user::UserAccount,
};

/// Raises the portal's backfilling flag for as long as it lives.
struct BackfillFlag<'a>(&'a AtomicBool);

impl<'a> BackfillFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for BackfillFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fetches up to `initial_history_fill` messages before the newest one and
/// replays them. Returns how many were bridged.
pub(crate) async fn fill_initial_history(
    portal: &Portal,
    state: &mut HandlingState,
    source: &Arc<UserAccount>,
) -> usize {
    let settings = &portal.bridge().settings().backfill;
    let Some(client) = source.client().await else {
        debug!(portal = %portal.key(), "backfill: no session, skipping initial fill");
        return 0;
    };
    let wanted = settings.initial_history_fill;
    let page_size = settings.page_size.max(1);
    let mut history: Vec<RemoteMessage> = Vec::new();
    let mut cursor: Option<RemoteId> = None;
    while history.len() < wanted {
        let limit = page_size.min(wanted - history.len());
        let mut page = match client
            .fetch_messages(portal.key(), cursor.as_ref(), HistoryDirection::Before, limit)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(portal = %portal.key(), "backfill: failed to fetch history: {err}");
                break;
            }
        };
        if page.is_empty() {
            break;
        }
        page.truncate(limit);
        page.reverse();
        cursor = page.first().map(|message| message.id.clone());
        page.append(&mut history);
        history = page;
    }
    replay(portal, state, source, history).await
}

/// Fetches everything newer than the last persisted message and replays it.
pub(crate) async fn backfill_gap(
    portal: &Portal,
    state: &mut HandlingState,
    source: &Arc<UserAccount>,
) -> usize {
    let bridge = portal.bridge();
    let Some(client) = source.client().await else {
        return 0;
    };
    let last = match bridge.storage().last_message(portal.key()).await {
        Ok(Some(last)) => last,
        Ok(None) => {
            debug!(portal = %portal.key(), "backfill: nothing persisted yet, no gap to fill");
            return 0;
        }
        Err(err) => {
            warn!(portal = %portal.key(), "backfill: failed to load last message: {err}");
            return 0;
        }
    };

    let page_size = bridge.settings().backfill.page_size.max(1);
    let mut cursor = last.remote_id;
    let mut missed = Vec::new();
    loop {
        let page = match client
            .fetch_messages(portal.key(), Some(&cursor), HistoryDirection::After, page_size)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(portal = %portal.key(), "backfill: failed to fetch missed messages: {err}");
                break;
            }
        };
        let Some(newest) = page
            .iter()
            .max_by_key(|message| message.created_at)
            .map(|message| message.id.clone())
        else {
            break;
        };
        if newest == cursor {
            break;
        }
        cursor = newest;
        missed.extend(page);
    }
    replay(portal, state, source, missed).await
}

async fn replay(
    portal: &Portal,
    state: &mut HandlingState,
    source: &Arc<UserAccount>,
    mut messages: Vec<RemoteMessage>,
) -> usize {
    if messages.is_empty() {
        return 0;
    }
    messages.sort_by_key(|message| message.created_at);
    let _backfilling = BackfillFlag::raise(portal.backfilling_flag());

    let bridge = portal.bridge();
    if bridge.settings().backfill.invite_own_ghost_for_backfilling {
        if let (Some(own), Some(room_id)) = (source.remote_id().await, portal.room_id().await) {
            let intent = Intent::new(bridge.settings().ghost_user_id(&own));
            if let Err(err) = bridge.local().join(&intent, &room_id).await {
                debug!(portal = %portal.key(), "backfill: own ghost failed to join: {err}");
            }
        }
    }

    let mut bridged = 0;
    for message in &messages {
        if portal.handle_remote_message(state, source, message).await == MessageOutcome::Bridged {
            bridged += 1;
        }
    }
    info!(portal = %portal.key(), fetched = messages.len(), bridged, "backfill: replay finished");
    bridged
}

#[cfg(test)]
#[path = "tests/backfill_tests.rs"]
mod tests;
