use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

use uuid::Uuid;

use crate::ChannelId;

use super::{Channel, ConnectionStatus};

/// Working channels indexed by priority.
#[derive(Debug, Default)]
struct WorkingIndex {
    priorities: HashMap<ChannelId, i32>,
    counts: BTreeMap<i32, usize>,
}

/// The channels known to a dispatch manager, and which of them can currently work.
pub struct ChannelRegistry {
    channels: RwLock<BTreeMap<ChannelId, Arc<dyn Channel>>>,
    working: Mutex<WorkingIndex>,
    next_id: AtomicUsize,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(BTreeMap::new()),
            working: Mutex::new(WorkingIndex::default()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Reserves the id of a channel about to be created.
    pub fn next_id(&self) -> ChannelId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add(&self, channel: Arc<dyn Channel>) {
        let id = channel.id();
        let status = channel.status();
        let priority = channel.core().priority();
        self.channels.write().unwrap().insert(id, channel);
        if status.is_working() {
            self.update_working(id, priority, status);
        }
    }

    pub fn remove(&self, id: ChannelId) -> Option<Arc<dyn Channel>> {
        let removed = self.channels.write().unwrap().remove(&id);
        if let Some(channel) = removed.as_ref() {
            let priority = channel.core().priority();
            self.update_working(id, priority, ConnectionStatus::Closed);
        }
        removed
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<dyn Channel>> {
        self.channels.read().unwrap().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the channel in or out of the working index according to `status`.
    pub fn update_working(&self, id: ChannelId, priority: i32, status: ConnectionStatus) {
        let mut index = self.working.lock().unwrap();
        if status.is_working() {
            if index.priorities.insert(id, priority).is_none() {
                *index.counts.entry(priority).or_insert(0) += 1;
            }
        } else if let Some(priority) = index.priorities.remove(&id) {
            let emptied = match index.counts.get_mut(&priority) {
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            };
            if emptied {
                index.counts.remove(&priority);
            }
        }
    }

    pub fn is_working(&self, id: ChannelId) -> bool {
        self.working.lock().unwrap().priorities.contains_key(&id)
    }

    pub fn working_count(&self) -> usize {
        self.working.lock().unwrap().priorities.len()
    }

    /// The highest priority among the working channels.
    pub fn highest_priority(&self) -> Option<i32> {
        self.working
            .lock()
            .unwrap()
            .counts
            .keys()
            .next_back()
            .copied()
    }

    /// Working channels of the highest priority with room for another unit.
    pub fn idle_channels(&self) -> Vec<Arc<dyn Channel>> {
        let (highest, ids): (i32, Vec<ChannelId>) = {
            let index = self.working.lock().unwrap();
            let highest = match index.counts.keys().next_back() {
                Some(priority) => *priority,
                None => return Vec::new(),
            };
            let ids = index
                .priorities
                .iter()
                .filter(|(_, priority)| **priority == highest)
                .map(|(id, _)| *id)
                .collect();
            (highest, ids)
        };
        let channels = self.channels.read().unwrap();
        ids.into_iter()
            .filter_map(|id| channels.get(&id))
            .filter(|channel| channel.core().priority() == highest && channel.core().is_idle())
            .cloned()
            .collect()
    }

    /// The distinct drivers reachable through a working remote channel.
    pub fn working_drivers(&self) -> BTreeSet<Uuid> {
        let ids: Vec<ChannelId> = self
            .working
            .lock()
            .unwrap()
            .priorities
            .keys()
            .copied()
            .collect();
        let channels = self.channels.read().unwrap();
        ids.into_iter()
            .filter_map(|id| channels.get(&id))
            .filter(|channel| !channel.is_local())
            .filter_map(|channel| channel.driver_uuid())
            .collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Test that the priority index follows the working status of channels.
    #[test]
    fn test_working_index() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.highest_priority(), None);
        registry.update_working(0, 1, ConnectionStatus::Active);
        registry.update_working(1, 5, ConnectionStatus::Executing);
        registry.update_working(1, 5, ConnectionStatus::Active);
        assert_eq!(
            registry.working_count(),
            2,
            "Re-entering the index is a no-op."
        );
        assert_eq!(registry.highest_priority(), Some(5));

        registry.update_working(1, 5, ConnectionStatus::Disconnected);
        assert_eq!(registry.highest_priority(), Some(1));
        assert!(!registry.is_working(1));
        registry.update_working(0, 1, ConnectionStatus::Failed);
        assert_eq!(registry.highest_priority(), None);
    }
}
