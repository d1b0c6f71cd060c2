use std::collections::{HashSet, VecDeque};

use crate::buffer::FrameId;
use crate::error::{VellumDBError, VellumDBResult};
use crate::utils::cache::Replacer;

/// Plain LRU over evictable frames.
///
/// The queue is insertion-ordered: a frame enters at the back when it becomes
/// evictable and the victim is always popped from the front. Accesses do not
/// reorder the queue; recency is expressed purely by when a frame last turned
/// evictable.
#[derive(Debug)]
pub struct LruReplacer {
    capacity: usize,
    queue: VecDeque<FrameId>,
    registered: HashSet<FrameId>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: VecDeque::with_capacity(capacity),
            registered: HashSet::with_capacity(capacity),
        }
    }

    fn in_queue(&self, frame_id: FrameId) -> bool {
        self.queue.iter().any(|f| *f == frame_id)
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, frame_id: FrameId) -> VellumDBResult<()> {
        if !self.registered.contains(&frame_id) {
            if self.registered.len() >= self.capacity {
                return Err(VellumDBError::Internal(
                    "frame count exceeds replacer capacity".to_string(),
                ));
            }
            self.registered.insert(frame_id);
        }
        Ok(())
    }

    fn evict(&mut self) -> Option<FrameId> {
        let frame_id = self.queue.pop_front()?;
        self.registered.remove(&frame_id);
        Some(frame_id)
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> VellumDBResult<()> {
        if !self.registered.contains(&frame_id) {
            return Err(VellumDBError::Internal(format!(
                "frame {} not found",
                frame_id
            )));
        }
        if evictable {
            if !self.in_queue(frame_id) {
                self.queue.push_back(frame_id);
            }
        } else {
            self.queue.retain(|f| *f != frame_id);
        }
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        self.queue.retain(|f| *f != frame_id);
        self.registered.remove(&frame_id);
    }

    fn size(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_in_insertion_order() {
        let mut replacer = LruReplacer::new(4);
        for frame in [1, 2, 3] {
            replacer.record_access(frame).unwrap();
            replacer.set_evictable(frame, true).unwrap();
        }
        assert_eq!(replacer.size(), 3);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn pinned_frames_are_skipped() {
        let mut replacer = LruReplacer::new(4);
        for frame in [1, 2, 3] {
            replacer.record_access(frame).unwrap();
            replacer.set_evictable(frame, true).unwrap();
        }
        replacer.set_evictable(2, false).unwrap();
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), None);

        // unpinning re-enters at the back
        replacer.set_evictable(2, true).unwrap();
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn accesses_do_not_reorder() {
        let mut replacer = LruReplacer::new(4);
        for frame in [1, 2, 3] {
            replacer.record_access(frame).unwrap();
            replacer.set_evictable(frame, true).unwrap();
        }
        replacer.record_access(1).unwrap();
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn remove_drops_frame() {
        let mut replacer = LruReplacer::new(4);
        for frame in [1, 2] {
            replacer.record_access(frame).unwrap();
            replacer.set_evictable(frame, true).unwrap();
        }
        replacer.remove(1);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(2));
    }
}
