use std::collections::{HashMap, VecDeque};

use crate::buffer::FrameId;
use crate::error::{VellumDBError, VellumDBResult};
use crate::utils::cache::Replacer;

#[derive(Debug)]
struct LruKNode {
    /// The last `k` access timestamps, oldest first.
    history: VecDeque<u64>,
    evictable: bool,
}

impl LruKNode {
    fn new(k: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(k),
            evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64, k: usize) {
        self.history.push_back(timestamp);
        if self.history.len() > k {
            self.history.pop_front();
        }
    }
}

/// LRU-K replacement.
///
/// The victim is the evictable frame with the largest backward K-distance,
/// i.e. `now - t` where `t` is the K-th most recent access. Frames with fewer
/// than K recorded accesses have infinite distance and are ordered among
/// themselves by their oldest access; equal finite distances also fall back to
/// the older K-th access.
#[derive(Debug)]
pub struct LruKReplacer {
    /// Count of evictable frames, kept incrementally.
    current_size: usize,
    replacer_size: usize,
    k: usize,
    node_store: HashMap<FrameId, LruKNode>,
    current_timestamp: u64,
}

impl LruKReplacer {
    pub fn new(num_frames: usize) -> Self {
        Self::with_k(num_frames, 2)
    }

    pub fn with_k(num_frames: usize, k: usize) -> Self {
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k,
            node_store: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
        }
    }

    fn distance_of(&self, node: &LruKNode) -> (u64, u64) {
        let oldest = *node.history.front().unwrap_or(&0);
        if node.history.len() < self.k {
            (u64::MAX, oldest)
        } else {
            (self.current_timestamp - oldest, oldest)
        }
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&mut self, frame_id: FrameId) -> VellumDBResult<()> {
        let timestamp = self.current_timestamp;
        self.current_timestamp += 1;
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            node.record_access(timestamp, self.k);
        } else {
            if self.node_store.len() >= self.replacer_size {
                return Err(VellumDBError::Internal(
                    "frame count exceeds replacer capacity".to_string(),
                ));
            }
            let mut node = LruKNode::new(self.k);
            node.record_access(timestamp, self.k);
            self.node_store.insert(frame_id, node);
        }
        Ok(())
    }

    fn evict(&mut self) -> Option<FrameId> {
        let mut victim: Option<(FrameId, u64, u64)> = None;
        for (frame_id, node) in self.node_store.iter() {
            if !node.evictable {
                continue;
            }
            let (distance, kth_timestamp) = self.distance_of(node);
            let better = match victim {
                None => true,
                Some((_, best_distance, best_timestamp)) => {
                    distance > best_distance
                        || (distance == best_distance && kth_timestamp < best_timestamp)
                }
            };
            if better {
                victim = Some((*frame_id, distance, kth_timestamp));
            }
        }
        let (frame_id, _, _) = victim?;
        self.remove(frame_id);
        Some(frame_id)
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> VellumDBResult<()> {
        let Some(node) = self.node_store.get_mut(&frame_id) else {
            return Err(VellumDBError::Internal(format!(
                "frame {} not found",
                frame_id
            )));
        };
        if evictable && !node.evictable {
            self.current_size += 1;
        } else if !evictable && node.evictable {
            self.current_size -= 1;
        }
        node.evictable = evictable;
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.get(&frame_id) {
            debug_assert!(node.evictable, "removing a non-evictable frame");
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
    }

    fn size(&self) -> usize {
        self.current_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_evictable_tracks_size() {
        let mut replacer = LruKReplacer::with_k(3, 2);
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.size(), 1);
        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn evicts_largest_k_distance() {
        let mut replacer = LruKReplacer::with_k(2, 3);
        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1
        replacer.record_access(2).unwrap(); // ts=2
        replacer.record_access(1).unwrap(); // ts=3
        replacer.record_access(2).unwrap(); // ts=4
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        // frame 1 history [0, 3] -> distance 5; frame 2 history [2, 4] -> 3
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn infinite_distance_wins_and_ties_break_by_oldest() {
        let mut replacer = LruKReplacer::with_k(3, 3);
        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1
        replacer.record_access(3).unwrap(); // ts=2
        replacer.record_access(1).unwrap(); // ts=3
        replacer.record_access(1).unwrap(); // ts=4, frame 1 has k accesses
        replacer.record_access(3).unwrap(); // ts=5
        for frame in [1, 2, 3] {
            replacer.set_evictable(frame, true).unwrap();
        }
        // frames 2 and 3 are below k accesses: infinite distance; 2 is older
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn full_scenario() {
        let mut replacer = LruKReplacer::with_k(7, 2);

        for frame in 1..=6 {
            replacer.record_access(frame).unwrap(); // ts = frame - 1
        }
        for frame in 1..=5 {
            replacer.set_evictable(frame, true).unwrap();
        }
        replacer.set_evictable(6, false).unwrap();
        assert_eq!(replacer.size(), 5);

        // frame 1 reaches two accesses; 2..=5 stay infinite
        replacer.record_access(1).unwrap(); // ts=6

        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.size(), 2);

        replacer.record_access(3).unwrap(); // ts=7
        replacer.record_access(4).unwrap(); // ts=8
        replacer.record_access(5).unwrap(); // ts=9
        replacer.record_access(4).unwrap(); // ts=10
        replacer.set_evictable(3, true).unwrap();
        replacer.set_evictable(4, true).unwrap();
        assert_eq!(replacer.size(), 4);

        // frame 3 is the only infinite-distance frame left
        assert_eq!(replacer.evict(), Some(3));

        replacer.set_evictable(6, true).unwrap();
        // frame 6 has a single access at ts=5: infinite distance
        assert_eq!(replacer.evict(), Some(6));

        replacer.set_evictable(1, false).unwrap();
        // both finite: frame 5 history [4, 9], frame 4 history [8, 10]
        assert_eq!(replacer.evict(), Some(5));
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.size(), 0);

        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
    }
}
