//! Registry of live activity instances

use serde::{Deserialize, Serialize};

use super::instance::{ActivityInstance, InstanceId};

/// Dense arena of instances keyed by serialized id
///
/// Slot `id - 1` holds instance `id`; completed instances leave a hole
/// that is never reused, so serialized ids stay collision-free for the
/// life of the map and across persistence round-trips.
#[derive(Debug, Default)]
pub struct InstanceMap {
    slots: Vec<Option<ActivityInstance>>,
    live: usize,
}

impl InstanceMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new instance, allocating the next serialized id
    pub fn register(
        &mut self,
        create: impl FnOnce(InstanceId) -> ActivityInstance,
    ) -> InstanceId {
        let id = InstanceId::new(self.slots.len() as u64 + 1);
        self.slots.push(Some(create(id)));
        self.live += 1;
        id
    }

    /// Look up a live instance
    pub fn get(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    /// Look up a live instance mutably
    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut ActivityInstance> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// Unregister a completed instance
    pub fn remove(&mut self, id: InstanceId) -> Option<ActivityInstance> {
        let removed = self.slots.get_mut(id.index()).and_then(|s| s.take());
        if removed.is_some() {
            self.live -= 1;
        }
        removed
    }

    /// Whether the instance is still registered
    pub fn contains(&self, id: InstanceId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live (non-terminal) instances
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Iterate over live instances in id order
    pub fn iter_live(&self) -> impl Iterator<Item = &ActivityInstance> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Snapshot live instances for persistence
    pub fn snapshot(&self) -> InstanceMapSnapshot {
        InstanceMapSnapshot {
            instances: self.iter_live().cloned().collect(),
            next_id: self.slots.len() as u64 + 1,
        }
    }

    /// Rebuild the map from a snapshot, preserving serialized ids
    pub fn restore(snapshot: InstanceMapSnapshot) -> Self {
        let mut slots: Vec<Option<ActivityInstance>> =
            (0..snapshot.next_id.saturating_sub(1)).map(|_| None).collect();
        let mut live = 0;
        for instance in snapshot.instances {
            let index = instance.id.index();
            slots[index] = Some(instance);
            live += 1;
        }
        Self { slots, live }
    }
}

/// Serialized form of the instance map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMapSnapshot {
    /// Live instances in id order
    pub instances: Vec<ActivityInstance>,

    /// Next id the map would allocate
    pub next_id: u64,
}
