use std::collections::{HashSet, VecDeque};

use shared::domain::RemoteId;

/// Fixed-size memory of the most recently handled message ids.
///
/// Only a fast path in front of the persisted message table.
#[derive(Debug)]
pub(crate) struct RecentIds {
    order: VecDeque<RemoteId>,
    members: HashSet<RemoteId>,
    capacity: usize,
}

impl RecentIds {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn contains(&self, id: &RemoteId) -> bool {
        self.members.contains(id)
    }

    pub(crate) fn push(&mut self, id: RemoteId) {
        if self.members.contains(&id) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_newest_ids() {
        let mut recent = RecentIds::new(3);
        for id in ["a", "b", "c", "d"] {
            recent.push(RemoteId::from(id));
        }
        assert_eq!(recent.len(), 3);
        assert!(!recent.contains(&RemoteId::from("a")));
        assert!(recent.contains(&RemoteId::from("d")));
    }

    #[test]
    fn repeated_push_does_not_evict() {
        let mut recent = RecentIds::new(2);
        recent.push(RemoteId::from("a"));
        recent.push(RemoteId::from("b"));
        recent.push(RemoteId::from("b"));
        assert!(recent.contains(&RemoteId::from("a")));
        assert_eq!(recent.len(), 2);
    }
}
