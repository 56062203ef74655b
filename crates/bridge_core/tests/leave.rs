mod support;

use bridge_core::{BridgeError, PortalEvent};
use chrono::Utc;
use shared::{
    domain::{ConversationKey, EventId, LocalUserId, RemoteId, RoomId},
    local::{LocalEvent, LocalEventContent},
};
use support::{group, harness, message, test_settings, Harness, ALICE, OWN_REMOTE_ID};

fn leave_event(room: &RoomId, sender: &str) -> LocalEvent {
    LocalEvent {
        event_id: EventId::from("$leave"),
        room_id: room.clone(),
        sender: LocalUserId::from(sender),
        origin_server_ts: 0,
        content: LocalEventContent::Leave,
    }
}

async fn wait_for_portal_row(h: &Harness, key: &ConversationKey, present: bool) {
    for _ in 0..200 {
        let found = h
            .bridge
            .storage()
            .get_portal(key)
            .await
            .expect("query")
            .is_some();
        if found == present {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("portal row presence never became {present}");
}

#[tokio::test]
async fn receiver_leaving_a_private_chat_deletes_the_portal() {
    let h = harness(test_settings()).await;
    let account = h.login().await;
    let key = ConversationKey::direct(RemoteId::from("200"), RemoteId::from(OWN_REMOTE_ID));
    let portal = h.bridge.get_or_create_portal(&key).await.expect("portal");
    let room = portal.ensure_room(&account).await.expect("room");
    let ghost = LocalUserId::from("@remote_200:example.org");
    assert!(h.local.members_of(&room).contains(&ghost));
    let eve = LocalUserId::from("@eve:example.org");
    h.local.add_member(&room, &eve);

    h.bridge
        .handle_local_event(leave_event(&room, ALICE))
        .await
        .expect("route");
    wait_for_portal_row(&h, &key, false).await;

    assert!(portal.is_closed());
    assert!(!h.local.members_of(&room).contains(&ghost));
    assert!(h.local.members_of(&room).contains(&eve));
    assert!(h.local.kicks.lock().unwrap().is_empty());
    assert!(h.bridge.portal_by_room(&room).await.is_none());
    assert!(h.bridge.portal_by_key(&key).await.is_none());
    let late = portal
        .enqueue(PortalEvent::Message {
            source: account,
            message: message("1", "200+100", "200", "too late", Utc::now()),
        })
        .await;
    assert!(matches!(late, Err(BridgeError::PortalClosed(_))));
}

#[tokio::test]
async fn leaving_the_last_user_out_of_a_group_deletes_the_portal() {
    let h = harness(test_settings()).await;
    h.remote.add_group(group("60", &[OWN_REMOTE_ID, "200"]));
    let account = h.login().await;
    let key = ConversationKey::group(RemoteId::from("60"));
    let portal = h.bridge.get_or_create_portal(&key).await.expect("portal");
    let room = portal.ensure_room(&account).await.expect("room");

    h.bridge
        .handle_local_event(leave_event(&room, ALICE))
        .await
        .expect("route");
    wait_for_portal_row(&h, &key, false).await;

    assert_eq!(*h.remote.left_groups.lock().unwrap(), vec![RemoteId::from("60")]);
    assert!(h.local.members_of(&room).is_empty());
}

#[tokio::test]
async fn group_portal_survives_while_real_users_remain() {
    let h = harness(test_settings()).await;
    h.remote.add_group(group("61", &[OWN_REMOTE_ID, "200"]));
    let account = h.login().await;
    let key = ConversationKey::group(RemoteId::from("61"));
    let portal = h.bridge.get_or_create_portal(&key).await.expect("portal");
    let room = portal.ensure_room(&account).await.expect("room");
    h.local.add_member(&room, &LocalUserId::from("@bob:example.org"));

    h.bridge
        .handle_local_event(leave_event(&room, ALICE))
        .await
        .expect("route");
    for _ in 0..200 {
        if !h.remote.left_groups.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert_eq!(*h.remote.left_groups.lock().unwrap(), vec![RemoteId::from("61")]);
    wait_for_portal_row(&h, &key, true).await;
    assert!(!portal.is_closed());
}
