mod support;

use std::sync::Arc;

use bridge_core::PortalEvent;
use chrono::{Duration, Utc};
use shared::{
    domain::{ConversationKey, RemoteId},
    protocol::{RemoteDirectChat, RemoteMember},
};
use support::{group, harness, message, test_settings, wait_until, OWN_REMOTE_ID};

#[tokio::test]
async fn room_creation_replays_recent_history_oldest_first() {
    let mut settings = test_settings();
    settings.backfill.initial_history_fill = 3;
    settings.backfill.page_size = 2;
    let h = harness(settings).await;
    h.remote.add_group(group("40", &["100", "200"]));
    let key = ConversationKey::group(RemoteId::from("40"));
    let now = Utc::now();
    for index in 1..=5 {
        h.remote.add_history(
            &key,
            message(
                &format!("400{index}"),
                "40",
                "200",
                &format!("history {index}"),
                now - Duration::seconds(60 - index * 10),
            ),
        );
    }
    h.login().await;

    h.remote
        .handler()
        .on_message(message("4006", "40", "200", "live", now));
    wait_until(|| h.local.bodies().len() == 4).await;

    assert_eq!(
        h.local.bodies(),
        vec!["history 3", "history 4", "history 5", "live"]
    );
    let portal = h.bridge.portal_by_key(&key).await.expect("portal");
    assert!(!portal.is_backfilling());
    assert_eq!(
        h.bridge.storage().list_messages(&key).await.expect("list").len(),
        4
    );
}

#[tokio::test]
async fn resync_recovers_messages_missed_since_the_last_persisted_one() {
    let h = harness(test_settings()).await;
    h.remote.add_group(group("41", &["100", "200"]));
    let key = ConversationKey::group(RemoteId::from("41"));
    let account = h.login().await;
    let portal = h.bridge.get_or_create_portal(&key).await.expect("portal");

    let now = Utc::now();
    let seen = message("4101", "41", "200", "seen", now - Duration::seconds(30));
    h.remote.add_history(&key, seen.clone());
    portal
        .enqueue(PortalEvent::Message {
            source: Arc::clone(&account),
            message: seen,
        })
        .await
        .expect("enqueue");
    wait_until(|| h.local.bodies() == vec!["seen".to_string()]).await;

    // Newest first on purpose: replay must sort.
    h.remote.add_history(
        &key,
        message("4103", "41", "200", "missed two", now - Duration::seconds(10)),
    );
    h.remote.add_history(
        &key,
        message("4102", "41", "200", "missed one", now - Duration::seconds(20)),
    );
    portal.resync(&account, None, true).await;

    assert_eq!(h.local.bodies(), vec!["seen", "missed one", "missed two"]);
    assert!(h
        .bridge
        .storage()
        .get_message(&key, &RemoteId::from("4103"))
        .await
        .expect("query")
        .is_some());
}

#[tokio::test]
async fn login_syncs_recently_active_conversations() {
    let h = harness(test_settings()).await;
    let mut recent = group("42", &["100", "200"]);
    recent.last_activity = Utc::now() - Duration::hours(1);
    let mut old = group("43", &["100", "200"]);
    old.last_activity = Utc::now() - Duration::days(30);
    h.remote.add_group(recent.clone());
    h.remote.add_group(old.clone());
    *h.remote.listed_groups.lock().unwrap() = vec![recent, old];
    *h.remote.direct_chats.lock().unwrap() = vec![RemoteDirectChat {
        other_user: RemoteMember {
            user_id: RemoteId::from("300"),
            nickname: "Carol".into(),
            image_url: None,
        },
        last_activity: Utc::now(),
    }];
    *h.remote.relations.lock().unwrap() = vec![RemoteMember {
        user_id: RemoteId::from("400"),
        nickname: "Dave".into(),
        image_url: None,
    }];

    h.login().await;
    assert!(h
        .local
        .display_names
        .lock()
        .unwrap()
        .iter()
        .any(|(user, name)| user.as_str() == "@remote_400:example.org" && name == "Dave (Remote)"));
    wait_until(|| h.local.rooms().len() == 2).await;

    let created = h.local.created.lock().unwrap().clone();
    let direct = created
        .iter()
        .find(|(_, request, _)| request.is_direct)
        .expect("direct chat room");
    assert_eq!(direct.0.user_id.as_str(), "@remote_300:example.org");
    assert_eq!(direct.1.topic.as_deref(), Some("Remote private chat"));
    assert!(created
        .iter()
        .any(|(_, request, _)| request.name.as_deref() == Some("Group 42")));

    let private_key = ConversationKey::direct(RemoteId::from("300"), RemoteId::from(OWN_REMOTE_ID));
    assert!(h
        .bridge
        .storage()
        .get_portal(&private_key)
        .await
        .expect("query")
        .and_then(|row| row.room_id)
        .is_some());
    assert!(h
        .bridge
        .storage()
        .get_portal(&ConversationKey::group(RemoteId::from("43")))
        .await
        .expect("query")
        .is_none());
    assert!(h
        .local
        .display_names
        .lock()
        .unwrap()
        .iter()
        .any(|(_, name)| name == "Carol (Remote)"));
}
