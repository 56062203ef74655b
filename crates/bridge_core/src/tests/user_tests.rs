use std::time::Duration;

use super::*;

#[test]
fn overflow_drops_the_oldest_items_in_order() {
    let queue = LossyQueue::new(3);
    let mut dropped = Vec::new();
    for item in 0..8 {
        if let Some(evicted) = queue.push(item) {
            dropped.push(evicted);
        }
    }

    assert_eq!(dropped, vec![0, 1, 2, 3, 4]);
    assert_eq!(queue.len(), 3);
    let remaining: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
    assert_eq!(remaining, vec![5, 6, 7]);
    assert!(queue.is_empty());
}

#[test]
fn zero_capacity_keeps_the_latest_item() {
    let queue = LossyQueue::new(0);
    assert_eq!(queue.push("a"), None);
    assert_eq!(queue.push("b"), Some("a"));
    assert_eq!(queue.try_pop(), Some("b"));
}

#[tokio::test]
async fn pop_waits_for_a_push() {
    let queue = Arc::new(LossyQueue::new(4));
    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.pop().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.push("ready");

    let item = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .expect("woken")
        .expect("task");
    assert_eq!(item, "ready");
}

#[tokio::test]
async fn forwarder_reports_drops_but_keeps_the_newest() {
    let (sender, receiver) = mpsc::unbounded_channel();
    let queue = Arc::new(LossyQueue::new(2));
    for id in ["1", "2", "3", "4"] {
        sender
            .send(DispatchItem::GroupChanged {
                group_id: RemoteId::from(id),
            })
            .expect("send");
    }
    drop(sender);

    forward_intake(
        receiver,
        Arc::clone(&queue),
        LocalUserId::from("@alice:example.org"),
    )
    .await;

    let ids: Vec<_> = std::iter::from_fn(|| queue.try_pop())
        .map(|item| match item {
            DispatchItem::GroupChanged { group_id } => group_id,
            other => panic!("unexpected item: {}", other.kind()),
        })
        .collect();
    assert_eq!(ids, vec![RemoteId::from("3"), RemoteId::from("4")]);
}
