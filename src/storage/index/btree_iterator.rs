use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::buffer::INVALID_PAGE_ID;
use crate::error::VellumDBResult;
use crate::storage::index::btree_index::BPlusTreeIndex;
use crate::storage::page::btree_page::{BPlusTreeLeafPage, IndexKey};
use crate::storage::page::RecordId;

/// Forward-only range scan over the leaf chain.
///
/// The iterator works on a decoded copy of the current leaf; stepping past
/// its last slot fetches the next leaf through the buffer pool (pinning and
/// read-latching it only for the duration of the fetch) before the current
/// copy is replaced.
#[derive(Debug)]
pub struct TreeIndexIterator {
    index: Arc<BPlusTreeIndex>,
    start_bound: Bound<IndexKey>,
    end_bound: Bound<IndexKey>,
    leaf: Option<BPlusTreeLeafPage>,
    cursor: usize,
    started: bool,
}

impl TreeIndexIterator {
    pub fn new<R: RangeBounds<IndexKey>>(index: Arc<BPlusTreeIndex>, range: R) -> Self {
        Self {
            index,
            start_bound: range.start_bound().cloned(),
            end_bound: range.end_bound().cloned(),
            leaf: None,
            cursor: 0,
            started: false,
        }
    }

    fn load_next_leaf(&mut self) -> VellumDBResult<bool> {
        let Some(ref leaf) = self.leaf else {
            return Ok(false);
        };
        let next_page_id = leaf.header.next_page_id;
        if next_page_id == INVALID_PAGE_ID {
            self.leaf = None;
            return Ok(false);
        }
        self.leaf = Some(self.index.leaf_snapshot(next_page_id)?);
        self.cursor = 0;
        Ok(true)
    }

    /// Skip forward until the cursor sits on a real entry.
    fn settle(&mut self) -> VellumDBResult<bool> {
        loop {
            let Some(ref leaf) = self.leaf else {
                return Ok(false);
            };
            if self.cursor < leaf.header.current_size as usize {
                return Ok(true);
            }
            if !self.load_next_leaf()? {
                return Ok(false);
            }
        }
    }

    fn position_at_start(&mut self) -> VellumDBResult<bool> {
        let comparator = self.index.comparator();
        match self.start_bound.clone() {
            Bound::Unbounded => {
                self.leaf = self.index.first_leaf_snapshot()?;
                self.cursor = 0;
            }
            Bound::Included(key) => {
                self.leaf = self.index.leaf_snapshot_for(&key)?;
                if let Some(ref leaf) = self.leaf {
                    match leaf.next_closest(&key, true, comparator) {
                        Some(position) => self.cursor = position,
                        None => {
                            self.cursor = leaf.header.current_size as usize;
                        }
                    }
                }
            }
            Bound::Excluded(key) => {
                self.leaf = self.index.leaf_snapshot_for(&key)?;
                if let Some(ref leaf) = self.leaf {
                    match leaf.next_closest(&key, false, comparator) {
                        Some(position) => self.cursor = position,
                        None => {
                            self.cursor = leaf.header.current_size as usize;
                        }
                    }
                }
            }
        }
        self.settle()
    }

    fn within_end_bound(&self, key: &[u8]) -> bool {
        let comparator = self.index.comparator();
        match &self.end_bound {
            Bound::Unbounded => true,
            Bound::Included(end) => comparator(key, end) != std::cmp::Ordering::Greater,
            Bound::Excluded(end) => comparator(key, end) == std::cmp::Ordering::Less,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> VellumDBResult<Option<(IndexKey, RecordId)>> {
        let positioned = if self.started {
            self.cursor += 1;
            self.settle()?
        } else {
            self.started = true;
            self.position_at_start()?
        };
        if !positioned {
            return Ok(None);
        }
        let Some(ref leaf) = self.leaf else {
            return Ok(None);
        };
        let (key, rid) = leaf.array[self.cursor].clone();
        if self.within_end_bound(&key) {
            Ok(Some((key, rid)))
        } else {
            Ok(None)
        }
    }
}
