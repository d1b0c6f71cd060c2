use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::buffer::{BufferManager, PageId, ReadPageGuard, WritePageGuard};
use crate::config::HashIndexConfig;
use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::codec::{HashBucketPageCodec, HashDirectoryPageCodec};
use crate::storage::page::hash_page::{HashBucketPage, HashDirectoryPage, MAX_GLOBAL_DEPTH};
use crate::storage::page::RecordId;

const SPLIT_RETRY_LIMIT: usize = 64;

/// On-disk extendible hash index: one directory page plus bucket pages, all
/// accessed through buffer-pool guards.
///
/// Point operations hold the table latch shared and take page latches; a
/// split or merge retakes everything under the exclusive table latch, so the
/// directory never changes under a reader.
#[derive(Debug)]
pub struct DiskHashIndex {
    buffer_pool: Arc<BufferManager>,
    key_size: usize,
    bucket_max_size: u32,
    directory_page_id: PageId,
    table_latch: RwLock<()>,
}

fn hash_bytes(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    hasher.finish()
}

impl DiskHashIndex {
    pub fn new(buffer_pool: Arc<BufferManager>, config: HashIndexConfig) -> VellumDBResult<Self> {
        let mut bucket_guard = buffer_pool.new_page()?;
        let bucket_page_id = bucket_guard.page_id();
        let bucket = HashBucketPage::new(config.bucket_max_size, config.key_size);
        bucket_guard.overwrite(&HashBucketPageCodec::encode(&bucket, config.key_size));
        drop(bucket_guard);

        let mut dir_guard = buffer_pool.new_page()?;
        let directory_page_id = dir_guard.page_id();
        let mut directory = HashDirectoryPage::new(directory_page_id);
        directory.set_bucket_page_id(0, bucket_page_id);
        directory.set_local_depth(0, 0);
        dir_guard.overwrite(&HashDirectoryPageCodec::encode(&directory));
        drop(dir_guard);

        Ok(Self {
            buffer_pool,
            key_size: config.key_size,
            bucket_max_size: config.bucket_max_size,
            directory_page_id,
            table_latch: RwLock::new(()),
        })
    }

    fn check_key(&self, key: &[u8]) -> VellumDBResult<()> {
        if key.len() != self.key_size {
            return Err(VellumDBError::Internal(format!(
                "index key must be {} bytes, got {}",
                self.key_size,
                key.len()
            )));
        }
        Ok(())
    }

    fn load_directory(&self) -> VellumDBResult<(ReadPageGuard, HashDirectoryPage)> {
        let guard = self.buffer_pool.fetch_page_read(self.directory_page_id)?;
        let directory = HashDirectoryPageCodec::decode(guard.data())?;
        Ok((guard, directory))
    }

    fn load_directory_mut(&self) -> VellumDBResult<(WritePageGuard, HashDirectoryPage)> {
        let guard = self.buffer_pool.fetch_page_write(self.directory_page_id)?;
        let directory = HashDirectoryPageCodec::decode(guard.data())?;
        Ok((guard, directory))
    }

    fn load_bucket_mut(&self, page_id: PageId) -> VellumDBResult<(WritePageGuard, HashBucketPage)> {
        let guard = self.buffer_pool.fetch_page_write(page_id)?;
        let bucket = HashBucketPageCodec::decode(guard.data(), self.key_size)?;
        Ok((guard, bucket))
    }

    pub fn get(&self, key: &[u8]) -> VellumDBResult<Option<RecordId>> {
        self.check_key(key)?;
        let _table = self.table_latch.read();
        let bucket_page_id = {
            let (_guard, directory) = self.load_directory()?;
            let index = hash_bytes(key) as usize & directory.global_depth_mask();
            directory.bucket_page_id(index)
        };
        let guard = self.buffer_pool.fetch_page_read(bucket_page_id)?;
        let bucket = HashBucketPageCodec::decode(guard.data(), self.key_size)?;
        Ok(bucket.look_up(key))
    }

    /// Upsert. A full bucket splits (doubling the directory when its local
    /// depth has reached the global depth) and the insert retries.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> VellumDBResult<()> {
        self.check_key(key)?;
        for _ in 0..SPLIT_RETRY_LIMIT {
            {
                let _table = self.table_latch.read();
                let bucket_page_id = {
                    let (_guard, directory) = self.load_directory()?;
                    let index = hash_bytes(key) as usize & directory.global_depth_mask();
                    directory.bucket_page_id(index)
                };
                let (mut guard, mut bucket) = self.load_bucket_mut(bucket_page_id)?;
                if bucket.insert(key, rid) {
                    guard.overwrite(&HashBucketPageCodec::encode(&bucket, self.key_size));
                    return Ok(());
                }
                // full: fall through to split with no latches held
            }
            self.split_bucket(key)?;
        }
        Err(VellumDBError::Internal(
            "hash insert exceeded split retry limit".to_string(),
        ))
    }

    pub fn remove(&self, key: &[u8]) -> VellumDBResult<bool> {
        self.check_key(key)?;
        let (removed, emptied) = {
            let _table = self.table_latch.read();
            let bucket_page_id = {
                let (_guard, directory) = self.load_directory()?;
                let index = hash_bytes(key) as usize & directory.global_depth_mask();
                directory.bucket_page_id(index)
            };
            let (mut guard, mut bucket) = self.load_bucket_mut(bucket_page_id)?;
            let removed = bucket.remove(key);
            if removed {
                guard.overwrite(&HashBucketPageCodec::encode(&bucket, self.key_size));
            }
            (removed, removed && bucket.is_empty())
        };
        if emptied {
            self.try_merge(key)?;
        }
        Ok(removed)
    }

    fn split_bucket(&self, key: &[u8]) -> VellumDBResult<()> {
        let _table = self.table_latch.write();
        let (mut dir_guard, mut directory) = self.load_directory_mut()?;
        let index = hash_bytes(key) as usize & directory.global_depth_mask();
        let bucket_page_id = directory.bucket_page_id(index);
        let (mut bucket_guard, mut bucket) = self.load_bucket_mut(bucket_page_id)?;
        if !bucket.is_full() {
            // another split already made room
            return Ok(());
        }

        let local_depth = directory.local_depth(index);
        if local_depth == directory.global_depth {
            if directory.global_depth >= MAX_GLOBAL_DEPTH {
                return Err(VellumDBError::Storage(
                    "hash directory cannot grow further".to_string(),
                ));
            }
            directory.incr_global_depth();
        }

        let mut sibling_guard = self.buffer_pool.new_page()?;
        let sibling_page_id = sibling_guard.page_id();
        let mut sibling = HashBucketPage::new(self.bucket_max_size, self.key_size);
        let new_depth = local_depth + 1;

        // every slot that pointed at the old bucket deepens; those with the
        // distinguishing bit set move to the split image
        for slot in 0..directory.size() {
            if directory.bucket_page_id(slot) == bucket_page_id {
                directory.set_local_depth(slot, new_depth);
                if (slot >> local_depth) & 1 == 1 {
                    directory.set_bucket_page_id(slot, sibling_page_id);
                }
            }
        }

        for (entry_key, entry_rid) in bucket.drain_entries() {
            let target = if (hash_bytes(&entry_key) >> local_depth) & 1 == 1 {
                &mut sibling
            } else {
                &mut bucket
            };
            if !target.insert(&entry_key, entry_rid) {
                return Err(VellumDBError::Internal(
                    "bucket overflow while redistributing a split".to_string(),
                ));
            }
        }

        debug!(
            "split bucket page {} into {} at depth {}",
            bucket_page_id, sibling_page_id, new_depth
        );
        bucket_guard.overwrite(&HashBucketPageCodec::encode(&bucket, self.key_size));
        sibling_guard.overwrite(&HashBucketPageCodec::encode(&sibling, self.key_size));
        dir_guard.overwrite(&HashDirectoryPageCodec::encode(&directory));
        Ok(())
    }

    /// Merge an emptied bucket into its split image when both sit at the same
    /// nonzero local depth, then contract the directory while possible.
    fn try_merge(&self, key: &[u8]) -> VellumDBResult<()> {
        let _table = self.table_latch.write();
        let (mut dir_guard, mut directory) = self.load_directory_mut()?;
        let index = hash_bytes(key) as usize & directory.global_depth_mask();
        let bucket_page_id = directory.bucket_page_id(index);
        let local_depth = directory.local_depth(index);
        if local_depth == 0 {
            return Ok(());
        }

        let image_index = index ^ (1usize << (local_depth - 1));
        let image_page_id = directory.bucket_page_id(image_index);
        if image_page_id == bucket_page_id || directory.local_depth(image_index) != local_depth {
            return Ok(());
        }

        {
            let guard = self.buffer_pool.fetch_page_read(bucket_page_id)?;
            let bucket = HashBucketPageCodec::decode(guard.data(), self.key_size)?;
            if !bucket.is_empty() {
                // refilled while we waited for the table latch
                return Ok(());
            }
        }

        for slot in 0..directory.size() {
            if directory.bucket_page_id(slot) == bucket_page_id {
                directory.set_bucket_page_id(slot, image_page_id);
            }
        }
        for slot in 0..directory.size() {
            if directory.bucket_page_id(slot) == image_page_id {
                directory.set_local_depth(slot, local_depth - 1);
            }
        }
        while directory.can_shrink() {
            directory.decr_global_depth();
        }

        debug!(
            "merged empty bucket page {} into {}",
            bucket_page_id, image_page_id
        );
        dir_guard.overwrite(&HashDirectoryPageCodec::encode(&directory));
        drop(dir_guard);
        self.buffer_pool.delete_page(bucket_page_id)?;
        Ok(())
    }

    pub fn global_depth(&self) -> VellumDBResult<u32> {
        let _table = self.table_latch.read();
        let (_guard, directory) = self.load_directory()?;
        Ok(directory.global_depth)
    }

    /// Assert the directory invariants; for tests.
    pub fn verify_integrity(&self) -> VellumDBResult<()> {
        let _table = self.table_latch.read();
        let (_guard, directory) = self.load_directory()?;
        directory.verify_integrity();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use tempfile::TempDir;

    fn key_of(v: u64) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    fn setup(bucket_max_size: u32) -> (TempDir, DiskHashIndex) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferManager::new(128, disk_scheduler));
        let index = DiskHashIndex::new(
            buffer_pool,
            HashIndexConfig {
                key_size: 8,
                bucket_max_size,
            },
        )
        .unwrap();
        (temp_dir, index)
    }

    #[test]
    fn insert_get_remove() {
        let (_tmp, index) = setup(8);
        for i in 1..=5u64 {
            index.insert(&key_of(i), RecordId::new(i as u32, i as u32)).unwrap();
        }
        for i in 1..=5u64 {
            assert_eq!(
                index.get(&key_of(i)).unwrap(),
                Some(RecordId::new(i as u32, i as u32))
            );
        }
        assert_eq!(index.get(&key_of(0)).unwrap(), None);

        // upsert replaces the value for an existing key
        index.insert(&key_of(5), RecordId::new(999, 999)).unwrap();
        assert_eq!(index.get(&key_of(5)).unwrap(), Some(RecordId::new(999, 999)));

        assert!(index.remove(&key_of(5)).unwrap());
        assert!(!index.remove(&key_of(5)).unwrap());
        assert_eq!(index.get(&key_of(5)).unwrap(), None);
    }

    #[test]
    fn overflow_doubles_directory() {
        let (_tmp, index) = setup(2);
        assert_eq!(index.global_depth().unwrap(), 0);
        for i in 0..3u64 {
            index.insert(&key_of(i), RecordId::new(i as u32, 0)).unwrap();
            index.verify_integrity().unwrap();
        }
        assert!(index.global_depth().unwrap() >= 1);
        for i in 0..3u64 {
            assert_eq!(
                index.get(&key_of(i)).unwrap(),
                Some(RecordId::new(i as u32, 0))
            );
        }
    }

    #[test]
    fn many_splits_keep_integrity() {
        let (_tmp, index) = setup(2);
        let total = 80u64;
        for i in 0..total {
            index.insert(&key_of(i), RecordId::new(i as u32, i as u32)).unwrap();
            index.verify_integrity().unwrap();
        }
        for i in 0..total {
            assert_eq!(
                index.get(&key_of(i)).unwrap(),
                Some(RecordId::new(i as u32, i as u32))
            );
        }
        let depth = index.global_depth().unwrap();
        assert!(depth >= 2);
    }

    #[test]
    fn removals_merge_and_shrink() {
        let (_tmp, index) = setup(2);
        let total = 64u64;
        for i in 0..total {
            index.insert(&key_of(i), RecordId::new(i as u32, 0)).unwrap();
        }
        let grown_depth = index.global_depth().unwrap();
        assert!(grown_depth >= 2);
        for i in 0..total {
            assert!(index.remove(&key_of(i)).unwrap());
            index.verify_integrity().unwrap();
        }
        for i in 0..total {
            assert_eq!(index.get(&key_of(i)).unwrap(), None);
        }
        assert!(index.global_depth().unwrap() <= grown_depth);
    }

    #[test]
    fn concurrent_inserts_and_gets() {
        let (_tmp, index) = setup(4);
        let index = Arc::new(index);
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let index = index.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200u64 {
                    let k = t * 10_000 + i;
                    index.insert(&key_of(k), RecordId::new(k as u32, 0)).unwrap();
                    assert_eq!(
                        index.get(&key_of(k)).unwrap(),
                        Some(RecordId::new(k as u32, 0))
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        index.verify_integrity().unwrap();
        for t in 0..4u64 {
            for i in 0..200u64 {
                let k = t * 10_000 + i;
                assert_eq!(
                    index.get(&key_of(k)).unwrap(),
                    Some(RecordId::new(k as u32, 0))
                );
            }
        }
    }
}
