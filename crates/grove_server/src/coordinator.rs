//! Maps each live map id to the worker hosting its room.
//!
//! Rooms are owned by one worker at a time. A session entering a map
//! acquires a reference on the mapping; portal hand-offs acquire the
//! target before releasing the source, so a room's worker never changes
//! while anyone still points at it. When the count hits zero the entry is
//! dropped and the owning worker may tear the room down.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

struct Entry {
    worker: usize,
    refs: usize,
}

#[derive(Default)]
pub struct RoomThreadCoordinator {
    rooms: Mutex<FxHashMap<u32, Entry>>,
}

impl RoomThreadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a reference on `map`, assigning it to a worker if nobody
    /// is there yet. Fresh assignments currently all land on worker 0.
    pub fn acquire(&self, map: u32) -> usize {
        let mut rooms = self.rooms.lock();
        let entry = rooms.entry(map).or_insert(Entry { worker: 0, refs: 0 });
        entry.refs += 1;
        entry.worker
    }

    /// The worker currently hosting `map`, if any.
    pub fn worker_of(&self, map: u32) -> Option<usize> {
        self.rooms.lock().get(&map).map(|entry| entry.worker)
    }

    /// Releases one reference; at zero the mapping disappears.
    pub fn release(&self, map: u32) {
        let mut rooms = self.rooms.lock();
        if let Some(entry) = rooms.get_mut(&map) {
            entry.refs -= 1;
            if entry.refs == 0 {
                rooms.remove(&map);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn acquire_is_sticky_until_the_last_release() {
        let coordinator = RoomThreadCoordinator::new();
        let worker = coordinator.acquire(100000000);
        assert_eq!(coordinator.acquire(100000000), worker);
        assert_eq!(coordinator.worker_of(100000000), Some(worker));

        coordinator.release(100000000);
        assert_eq!(coordinator.worker_of(100000000), Some(worker));
        coordinator.release(100000000);
        assert_eq!(coordinator.worker_of(100000000), None);
    }

    #[test]
    fn release_of_unknown_map_is_harmless() {
        let coordinator = RoomThreadCoordinator::new();
        coordinator.release(999999999);
        assert_eq!(coordinator.worker_of(999999999), None);
    }
}
