use shared::domain::{ConversationKey, EventId};

use super::*;

fn stored(reactor: &str) -> StoredReaction {
    StoredReaction {
        key: ConversationKey::group(RemoteId::from("10")),
        target_remote_id: RemoteId::from("500"),
        reactor: RemoteId::from(reactor),
        event_id: EventId::new(format!("$reaction-{reactor}")),
    }
}

fn ids(raw: &[&str]) -> Vec<RemoteId> {
    raw.iter().copied().map(RemoteId::from).collect()
}

#[test]
fn swapped_reactor_is_one_add_and_one_removal() {
    let diff = diff_reactors(vec![stored("A"), stored("B")], &ids(&["B", "C"]));

    assert_eq!(diff.added, ids(&["C"]));
    assert_eq!(diff.removed, vec![stored("A")]);
}

#[test]
fn identical_sets_produce_nothing() {
    let diff = diff_reactors(vec![stored("A"), stored("B")], &ids(&["B", "A"]));
    assert!(diff.is_empty());
}

#[test]
fn repeated_reactors_are_added_once() {
    let diff = diff_reactors(Vec::new(), &ids(&["A", "A", "B"]));
    assert_eq!(diff.added, ids(&["A", "B"]));
    assert!(diff.removed.is_empty());
}

#[test]
fn empty_observation_removes_everything() {
    let diff = diff_reactors(vec![stored("A"), stored("B")], &[]);
    assert!(diff.added.is_empty());
    assert_eq!(diff.removed.len(), 2);
}
