use std::collections::HashMap;

use crate::buffer::FrameId;
use crate::error::{VellumDBError, VellumDBResult};
use crate::utils::cache::Replacer;

#[derive(Debug, Clone)]
struct ClockEntry {
    frame_id: FrameId,
    referenced: bool,
    evictable: bool,
}

impl ClockEntry {
    fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            referenced: false,
            evictable: false,
        }
    }
}

/// Second-chance (clock) replacement.
///
/// Frames live in a fixed circular array scanned by a hand. The victim is the
/// first evictable frame without its reference bit set; set bits encountered
/// along the way are cleared, giving every referenced frame one extra lap.
#[derive(Debug)]
pub struct ClockReplacer {
    evictable_count: usize,
    capacity: usize,
    hand: usize,
    slots: Vec<Option<ClockEntry>>,
    frame_map: HashMap<FrameId, usize>,
}

impl ClockReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            evictable_count: 0,
            capacity,
            hand: 0,
            slots: vec![None; capacity],
            frame_map: HashMap::with_capacity(capacity),
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }

    fn drop_slot(&mut self, index: usize) {
        if let Some(entry) = self.slots[index].take() {
            self.frame_map.remove(&entry.frame_id);
            if entry.evictable {
                self.evictable_count -= 1;
            }
        }
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&mut self, frame_id: FrameId) -> VellumDBResult<()> {
        if let Some(&index) = self.frame_map.get(&frame_id) {
            if let Some(entry) = &mut self.slots[index] {
                entry.referenced = true;
            }
            return Ok(());
        }

        let Some(index) = self.free_slot() else {
            return Err(VellumDBError::Internal(
                "frame count exceeds replacer capacity".to_string(),
            ));
        };
        // new frames start with the reference bit clear
        self.slots[index] = Some(ClockEntry::new(frame_id));
        self.frame_map.insert(frame_id, index);
        Ok(())
    }

    fn evict(&mut self) -> Option<FrameId> {
        if self.evictable_count == 0 {
            return None;
        }

        let start = self.hand;
        let mut fallback: Option<usize> = None;

        loop {
            if let Some(entry) = &mut self.slots[self.hand] {
                if entry.evictable {
                    if fallback.is_none() {
                        fallback = Some(self.hand);
                    }
                    if !entry.referenced {
                        let frame_id = entry.frame_id;
                        let position = self.hand;
                        self.hand = (self.hand + 1) % self.capacity;
                        self.drop_slot(position);
                        return Some(frame_id);
                    }
                    entry.referenced = false;
                }
            }

            self.hand = (self.hand + 1) % self.capacity;
            if self.hand == start {
                break;
            }
        }

        // every evictable frame had its bit set on entry; take the first seen
        let position = fallback?;
        let frame_id = self.slots[position].as_ref().map(|e| e.frame_id)?;
        self.hand = (position + 1) % self.capacity;
        self.drop_slot(position);
        Some(frame_id)
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> VellumDBResult<()> {
        let Some(&index) = self.frame_map.get(&frame_id) else {
            return Err(VellumDBError::Internal(format!(
                "frame {} not found",
                frame_id
            )));
        };
        if let Some(entry) = &mut self.slots[index] {
            if !entry.evictable && evictable {
                self.evictable_count += 1;
            } else if entry.evictable && !evictable {
                self.evictable_count -= 1;
            }
            entry.evictable = evictable;
        }
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(index) = self.frame_map.get(&frame_id).copied() {
            self.drop_slot(index);
        }
    }

    fn size(&self) -> usize {
        self.evictable_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweeps_from_hand() {
        let mut replacer = ClockReplacer::new(3);
        for frame in [1, 2, 3] {
            replacer.record_access(frame).unwrap();
            replacer.set_evictable(frame, true).unwrap();
        }
        assert_eq!(replacer.size(), 3);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn reference_bit_grants_second_chance() {
        let mut replacer = ClockReplacer::new(3);
        for frame in [1, 2, 3] {
            replacer.record_access(frame).unwrap();
            replacer.set_evictable(frame, true).unwrap();
        }
        // touch frame 1 so its bit is set; the sweep clears it and takes 2
        replacer.record_access(1).unwrap();
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn pinned_frame_is_skipped() {
        let mut replacer = ClockReplacer::new(5);
        for frame in [1, 2, 3, 4, 5] {
            replacer.record_access(frame).unwrap();
            replacer.set_evictable(frame, true).unwrap();
        }
        replacer.set_evictable(3, false).unwrap();
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn all_bits_set_falls_back_to_first_seen() {
        let mut replacer = ClockReplacer::new(2);
        for frame in [1, 2] {
            replacer.record_access(frame).unwrap();
            replacer.set_evictable(frame, true).unwrap();
            replacer.record_access(frame).unwrap();
        }
        // both referenced: first lap clears, fallback takes frame 1
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn remove_mid_sweep() {
        let mut replacer = ClockReplacer::new(3);
        for frame in [1, 2, 3] {
            replacer.record_access(frame).unwrap();
            replacer.set_evictable(frame, true).unwrap();
        }
        replacer.remove(2);
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(3));
    }
}
