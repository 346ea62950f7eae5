//! Minimum-load controller selection.
//!
//! Monster AI runs client-side on exactly one player per monster. The map
//! keeps its players in a min-heap keyed by how many monsters each one
//! already controls so newly spawned monsters always land on the least
//! loaded player. Nodes track their own heap position so removal and
//! re-keying stay O(log n).

/// Index of a player in the map's player array (the heap's payload).
pub type PlayerSlot = usize;

#[derive(Clone, Copy, Debug)]
struct HeapNode {
    controllee_count: usize,
    player: PlayerSlot,
}

/// Index-tracked min-heap on `controllee_count`.
///
/// The map patches `heap_index` back into its players whenever nodes move,
/// via the swap callback threaded through every operation.
#[derive(Default)]
pub struct ControllerHeap {
    nodes: Vec<HeapNode>,
}

/// Stable handle to a heap node, owned by the player it tracks.
pub type NodeIndex = usize;

impl ControllerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pushes a player with `count` controllees; `moved` reports every
    /// (player, new_heap_index) relocation, the new node included.
    pub fn push(
        &mut self,
        count: usize,
        player: PlayerSlot,
        moved: &mut impl FnMut(PlayerSlot, NodeIndex),
    ) {
        self.nodes.push(HeapNode {
            controllee_count: count,
            player,
        });
        let index = self.nodes.len() - 1;
        moved(player, index);
        self.sift_up(index, moved);
    }

    /// The least-loaded player, if any.
    pub fn top(&self) -> Option<PlayerSlot> {
        self.nodes.first().map(|node| node.player)
    }

    pub fn top_count(&self) -> Option<usize> {
        self.nodes.first().map(|node| node.controllee_count)
    }

    /// Adds `delta` controllees to the root and restores heap order.
    pub fn inc(&mut self, delta: usize, moved: &mut impl FnMut(PlayerSlot, NodeIndex)) {
        if let Some(root) = self.nodes.first_mut() {
            root.controllee_count += delta;
            self.sift_down(0, moved);
        }
    }

    /// Removes the node at `index` (a player's tracked position).
    pub fn remove(&mut self, index: NodeIndex, moved: &mut impl FnMut(PlayerSlot, NodeIndex)) {
        self.nodes.swap_remove(index);
        if index < self.nodes.len() {
            moved(self.nodes[index].player, index);
            let parent_larger = index > 0
                && self.nodes[(index - 1) / 2].controllee_count
                    > self.nodes[index].controllee_count;
            if parent_larger {
                self.sift_up(index, moved);
            } else {
                self.sift_down(index, moved);
            }
        }
    }

    /// Repoints a node at a relocated player slot (the map compacts its
    /// player array with swap-removes).
    pub fn set_player(&mut self, index: NodeIndex, player: PlayerSlot) {
        self.nodes[index].player = player;
    }

    /// Re-keys the node at `index` after its player's controllee count
    /// changed by outside bookkeeping.
    pub fn update(
        &mut self,
        index: NodeIndex,
        count: usize,
        moved: &mut impl FnMut(PlayerSlot, NodeIndex),
    ) {
        let old = self.nodes[index].controllee_count;
        self.nodes[index].controllee_count = count;
        if count < old {
            self.sift_up(index, moved);
        } else {
            self.sift_down(index, moved);
        }
    }

    fn sift_up(&mut self, mut index: usize, moved: &mut impl FnMut(PlayerSlot, NodeIndex)) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.nodes[parent].controllee_count <= self.nodes[index].controllee_count {
                break;
            }
            self.swap(parent, index, moved);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize, moved: &mut impl FnMut(PlayerSlot, NodeIndex)) {
        loop {
            let left = index * 2 + 1;
            let right = index * 2 + 2;
            let mut smallest = index;
            if left < self.nodes.len()
                && self.nodes[left].controllee_count < self.nodes[smallest].controllee_count
            {
                smallest = left;
            }
            if right < self.nodes.len()
                && self.nodes[right].controllee_count < self.nodes[smallest].controllee_count
            {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest, moved);
            index = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize, moved: &mut impl FnMut(PlayerSlot, NodeIndex)) {
        self.nodes.swap(a, b);
        moved(self.nodes[a].player, a);
        moved(self.nodes[b].player, b);
    }

    /// Verifies the min-heap invariant. Test support.
    #[cfg(test)]
    fn is_ordered(&self) -> bool {
        (1..self.nodes.len())
            .all(|i| self.nodes[(i - 1) / 2].controllee_count <= self.nodes[i].controllee_count)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rustc_hash::FxHashMap;

    use super::*;

    /// Drives the heap the way the map does, mirroring node positions into
    /// a side table and checking they never go stale.
    struct Tracked {
        heap: ControllerHeap,
        positions: FxHashMap<PlayerSlot, NodeIndex>,
    }

    impl Tracked {
        fn new() -> Self {
            Self {
                heap: ControllerHeap::new(),
                positions: FxHashMap::default(),
            }
        }

        fn push(&mut self, count: usize, player: PlayerSlot) {
            let positions = &mut self.positions;
            self.heap
                .push(count, player, &mut |p, i| drop(positions.insert(p, i)));
            assert!(self.heap.is_ordered());
        }

        fn remove(&mut self, player: PlayerSlot) {
            let index = self.positions.remove(&player).unwrap();
            let positions = &mut self.positions;
            self.heap
                .remove(index, &mut |p, i| drop(positions.insert(p, i)));
            assert!(self.heap.is_ordered());
        }

        fn inc(&mut self, delta: usize) {
            let positions = &mut self.positions;
            self.heap
                .inc(delta, &mut |p, i| drop(positions.insert(p, i)));
            assert!(self.heap.is_ordered());
        }
    }

    #[test]
    fn top_is_always_least_loaded() {
        let mut tracked = Tracked::new();
        tracked.push(5, 0);
        tracked.push(2, 1);
        tracked.push(9, 2);
        tracked.push(0, 3);
        assert_eq!(tracked.heap.top(), Some(3));

        tracked.remove(3);
        assert_eq!(tracked.heap.top(), Some(1));
    }

    #[test]
    fn inc_rotates_the_root_away() {
        let mut tracked = Tracked::new();
        tracked.push(1, 0);
        tracked.push(2, 1);
        assert_eq!(tracked.heap.top(), Some(0));

        tracked.inc(5);
        assert_eq!(tracked.heap.top(), Some(1));
        assert_eq!(tracked.heap.top_count(), Some(2));
    }

    #[test]
    fn positions_stay_live_through_churn() {
        let mut tracked = Tracked::new();
        for player in 0..32 {
            tracked.push(player * 7 % 13, player);
        }
        for player in (0..32).step_by(3) {
            tracked.remove(player);
        }
        for _ in 0..10 {
            tracked.inc(4);
        }

        // Every tracked position must still point at its own player.
        for (&player, &index) in &tracked.positions {
            assert_eq!(tracked.heap.nodes[index].player, player);
        }
    }
}
