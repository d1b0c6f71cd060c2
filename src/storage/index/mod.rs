pub mod btree_index;
pub mod btree_iterator;
pub mod hash_index;

use std::ops::RangeBounds;
use std::sync::Arc;

use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::page::btree_page::IndexKey;
use crate::storage::page::RecordId;
use crate::transaction::Transaction;

pub use btree_index::BPlusTreeIndex;
pub use btree_iterator::TreeIndexIterator;
pub use hash_index::DiskHashIndex;

/// Executor-facing index surface. Implementations do not take locks; callers
/// are expected to hold the appropriate table/row locks for `txn` already.
pub trait Index: std::fmt::Debug + Send + Sync {
    /// Insert a unique key. `KeyExists` on a duplicate.
    fn insert(&self, txn: &Transaction, key: &[u8], rid: RecordId) -> VellumDBResult<()>;

    fn get(&self, txn: &Transaction, key: &[u8]) -> VellumDBResult<Option<RecordId>>;

    /// Remove a key. `KeyMissing` when absent.
    fn remove(&self, txn: &Transaction, key: &[u8]) -> VellumDBResult<()>;
}

impl Index for BPlusTreeIndex {
    fn insert(&self, _txn: &Transaction, key: &[u8], rid: RecordId) -> VellumDBResult<()> {
        BPlusTreeIndex::insert(self, key, rid)
    }

    fn get(&self, _txn: &Transaction, key: &[u8]) -> VellumDBResult<Option<RecordId>> {
        BPlusTreeIndex::get(self, key)
    }

    fn remove(&self, _txn: &Transaction, key: &[u8]) -> VellumDBResult<()> {
        BPlusTreeIndex::remove(self, key)
    }
}

impl Index for DiskHashIndex {
    fn insert(&self, _txn: &Transaction, key: &[u8], rid: RecordId) -> VellumDBResult<()> {
        DiskHashIndex::insert(self, key, rid)
    }

    fn get(&self, _txn: &Transaction, key: &[u8]) -> VellumDBResult<Option<RecordId>> {
        DiskHashIndex::get(self, key)
    }

    fn remove(&self, _txn: &Transaction, key: &[u8]) -> VellumDBResult<()> {
        if DiskHashIndex::remove(self, key)? {
            Ok(())
        } else {
            Err(VellumDBError::KeyMissing(format!("{:?}", key)))
        }
    }
}

/// Full ascending scan over an ordered index.
pub fn scan(index: Arc<BPlusTreeIndex>) -> TreeIndexIterator {
    TreeIndexIterator::new(index, ..)
}

/// Ascending scan starting at `key` (inclusive).
pub fn scan_from(index: Arc<BPlusTreeIndex>, key: IndexKey) -> TreeIndexIterator {
    scan_range(index, key..)
}

pub fn scan_range<R: RangeBounds<IndexKey>>(
    index: Arc<BPlusTreeIndex>,
    range: R,
) -> TreeIndexIterator {
    TreeIndexIterator::new(index, range)
}
