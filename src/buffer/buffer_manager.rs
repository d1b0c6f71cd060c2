use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use log::error;
use parking_lot::{Mutex, RwLock};

use crate::buffer::buffer_pool::{BufferPool, FrameId, FrameMeta};
use crate::buffer::page::{self, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID};
use crate::config::BufferPoolConfig;
use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::{build_replacer, Replacer};

/// Coordinates frame allocation, pinning, dirty tracking and replacement over
/// a shared [`BufferPool`].
///
/// All access to cached pages happens through the guards returned by
/// `fetch_page_read` / `fetch_page_write` / `new_page`; a guard pins its page
/// for its whole lifetime and carries the page rw-latch.
#[derive(Debug)]
pub struct BufferManager {
    pool: Arc<BufferPool>,
    replacer: Arc<RwLock<Box<dyn Replacer>>>,
    /// Single-flights concurrent cache misses for the same page.
    inflight_loads: DashMap<PageId, Arc<Mutex<()>>>,
}

impl BufferManager {
    pub fn new(num_pages: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_scheduler,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let pool = Arc::new(BufferPool::new(config.buffer_pool_size, disk_scheduler));
        let replacer = build_replacer(config.replacer, pool.capacity(), config.lru_k_k);
        Self {
            pool,
            replacer: Arc::new(RwLock::new(replacer)),
            inflight_loads: DashMap::new(),
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    /// Number of frames the replacer would currently hand out.
    pub fn evictable_count(&self) -> usize {
        self.replacer.read().size()
    }

    pub fn new_page(self: &Arc<Self>) -> VellumDBResult<WritePageGuard> {
        if !self.pool.has_free_frame() && self.replacer.read().size() == 0 {
            return Err(VellumDBError::Storage(
                "no available frame: buffer pool is full and nothing is evictable".to_string(),
            ));
        }
        let page_id = self.pool.allocate_page_id()?;
        self.new_page_with_id(page_id)
    }

    /// Install a freshly allocated page id into a zeroed frame. Used directly
    /// by the parallel pool, which allocates ids itself to route them.
    pub(crate) fn new_page_with_id(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> VellumDBResult<WritePageGuard> {
        let frame_id = match self.allocate_frame() {
            Ok(frame_id) => frame_id,
            Err(e) => {
                let _ = self.pool.deallocate_page_id(page_id);
                return Err(e);
            }
        };
        self.pool.reset_frame(frame_id);
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.page_id = page_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        self.pool.insert_mapping(page_id, frame_id);
        {
            let mut replacer = self.replacer.write();
            let _ = replacer.record_access(frame_id);
            let _ = replacer.set_evictable(frame_id, false);
        }
        Ok(page::new_write_guard(Arc::clone(self), frame_id, page_id))
    }

    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> VellumDBResult<ReadPageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumDBError::Storage(
                "fetch_page_read: invalid page id".to_string(),
            ));
        }
        let frame_id = self.pin_page(page_id)?;
        Ok(page::new_read_guard(Arc::clone(self), frame_id, page_id))
    }

    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> VellumDBResult<WritePageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumDBError::Storage(
                "fetch_page_write: invalid page id".to_string(),
            ));
        }
        let frame_id = self.pin_page(page_id)?;
        Ok(page::new_write_guard(Arc::clone(self), frame_id, page_id))
    }

    /// Decrement a page's pin count, folding in the dirty flag. Returns true
    /// iff the decrement happened.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            return false;
        };
        let became_evictable = {
            let mut meta = self.pool.frame_meta(frame_id);
            if meta.page_id != page_id || meta.pin_count == 0 {
                return false;
            }
            meta.is_dirty |= is_dirty;
            meta.pin_count -= 1;
            meta.pin_count == 0
        };
        if became_evictable {
            let mut replacer = self.replacer.write();
            let _ = replacer.set_evictable(frame_id, true);
        }
        true
    }

    pub fn flush_page(&self, page_id: PageId) -> VellumDBResult<bool> {
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            return Ok(false);
        };
        {
            let meta = self.pool.frame_meta(frame_id);
            if meta.page_id != page_id || !meta.is_dirty {
                return Ok(false);
            }
        }
        let bytes = {
            let lock = self.pool.frame_lock(frame_id);
            let data = lock.read();
            Bytes::copy_from_slice(&data[..])
        };
        // the dirty flag is cleared only on success so a later flush retries
        self.pool.write_page_to_disk(page_id, bytes)?;
        let mut meta = self.pool.frame_meta(frame_id);
        if meta.page_id == page_id {
            meta.is_dirty = false;
        }
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> VellumDBResult<()> {
        for frame_id in 0..self.pool.capacity() {
            let (page_id, is_dirty) = {
                let meta = self.pool.frame_meta(frame_id);
                (meta.page_id, meta.is_dirty)
            };
            if page_id != INVALID_PAGE_ID && is_dirty {
                self.flush_page(page_id)?;
            }
        }
        Ok(())
    }

    pub fn delete_page(&self, page_id: PageId) -> VellumDBResult<bool> {
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            self.pool.deallocate_page_id(page_id)?;
            return Ok(true);
        };
        {
            let mut meta = self.pool.frame_meta(frame_id);
            if meta.page_id != page_id {
                // remapped under us; the page itself is no longer resident
                drop(meta);
                self.pool.deallocate_page_id(page_id)?;
                return Ok(true);
            }
            if meta.pin_count > 0 {
                return Ok(false);
            }
            self.pool.remove_mapping(page_id);
            *meta = FrameMeta::default();
        }
        self.pool.reset_frame(frame_id);
        {
            let mut replacer = self.replacer.write();
            let _ = replacer.set_evictable(frame_id, true);
            replacer.remove(frame_id);
        }
        self.pool.push_free_frame(frame_id);
        self.pool.deallocate_page_id(page_id)?;
        Ok(true)
    }

    /// Resolve `page_id` to a pinned frame, loading from disk on a miss.
    fn pin_page(&self, page_id: PageId) -> VellumDBResult<FrameId> {
        loop {
            let frame_id = self.ensure_frame(page_id)?;
            {
                let mut meta = self.pool.frame_meta(frame_id);
                if meta.page_id != page_id {
                    // evicted between lookup and pin
                    continue;
                }
                meta.pin_count += 1;
            }
            {
                let mut replacer = self.replacer.write();
                let _ = replacer.record_access(frame_id);
                let _ = replacer.set_evictable(frame_id, false);
            }
            return Ok(frame_id);
        }
    }

    fn ensure_frame(&self, page_id: PageId) -> VellumDBResult<FrameId> {
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            return Ok(frame_id);
        }

        let load_lock = self
            .inflight_loads
            .entry(page_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = load_lock.lock();

        let result = (|| {
            if let Some(frame_id) = self.pool.lookup_frame(page_id) {
                return Ok(frame_id);
            }
            let frame_id = self.allocate_frame()?;
            self.pool.load_page_into_frame(page_id, frame_id)?;
            {
                let mut meta = self.pool.frame_meta(frame_id);
                meta.page_id = page_id;
                meta.pin_count = 0;
                meta.is_dirty = false;
            }
            self.pool.insert_mapping(page_id, frame_id);
            {
                let mut replacer = self.replacer.write();
                let _ = replacer.record_access(frame_id);
            }
            Ok(frame_id)
        })();

        self.inflight_loads.remove(&page_id);
        result
    }

    fn allocate_frame(&self) -> VellumDBResult<FrameId> {
        if let Some(frame_id) = self.pool.pop_free_frame() {
            return Ok(frame_id);
        }
        self.evict_victim_frame()
    }

    fn evict_victim_frame(&self) -> VellumDBResult<FrameId> {
        loop {
            let victim = {
                let mut replacer = self.replacer.write();
                match replacer.evict() {
                    Some(frame_id) => frame_id,
                    None => {
                        return Err(VellumDBError::Storage(
                            "no available frame: buffer pool is full and nothing is evictable"
                                .to_string(),
                        ))
                    }
                }
            };

            let mut meta = self.pool.frame_meta(victim);
            if meta.pin_count > 0 {
                // stale replacer entry; reinstate and try again
                drop(meta);
                let mut replacer = self.replacer.write();
                let _ = replacer.record_access(victim);
                let _ = replacer.set_evictable(victim, false);
                continue;
            }

            if meta.page_id != INVALID_PAGE_ID {
                let page_id = meta.page_id;
                if meta.is_dirty {
                    let bytes = {
                        let lock = self.pool.frame_lock(victim);
                        let data = lock.read();
                        Bytes::copy_from_slice(&data[..])
                    };
                    if let Err(e) = self.pool.write_page_to_disk(page_id, bytes) {
                        // keep the page cached and dirty; the next flush retries
                        error!("write-back of evicted page {} failed: {}", page_id, e);
                        drop(meta);
                        let mut replacer = self.replacer.write();
                        let _ = replacer.record_access(victim);
                        let _ = replacer.set_evictable(victim, true);
                        return Err(e);
                    }
                    meta.is_dirty = false;
                }
                self.pool.remove_mapping(page_id);
            }

            *meta = FrameMeta::default();
            drop(meta);
            self.pool.reset_frame(victim);
            return Ok(victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn setup_manager(num_pages: usize) -> (TempDir, Arc<BufferManager>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let manager = Arc::new(BufferManager::new(num_pages, disk_scheduler));
        (temp_dir, manager)
    }

    #[test]
    fn new_page_initializes_frame() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        let frame_id = guard.frame_id();

        assert!(guard.data().iter().all(|b| *b == 0));
        assert!(!guard.is_dirty());
        drop(guard);

        let meta = manager.buffer_pool().frame_meta(frame_id).clone();
        assert_eq!(meta.page_id, page_id);
        assert_eq!(meta.pin_count, 0);
        assert!(!meta.is_dirty);
    }

    #[test]
    fn fetch_page_read_pins_and_unpins_on_drop() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        let frame_id = guard.frame_id();
        drop(guard);

        {
            let read_guard = manager.fetch_page_read(page_id).unwrap();
            assert_eq!(read_guard.pin_count(), 1);
            assert_eq!(read_guard.frame_id(), frame_id);
        }
        assert_eq!(manager.buffer_pool().frame_meta(frame_id).pin_count, 0);
        assert_eq!(manager.evictable_count(), 1);
    }

    #[test]
    fn explicit_unpin_semantics() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        // one pin from the guard
        assert!(manager.unpin_page(page_id, false));
        // pin count is now zero: further unpins report failure
        assert!(!manager.unpin_page(page_id, false));
        assert!(!manager.unpin_page(9999, false));
        std::mem::forget(guard); // its pin was consumed above
    }

    #[test]
    fn no_frame_when_all_pinned_then_recovers() {
        let (_tmp, manager) = setup_manager(3);
        let g1 = manager.new_page().unwrap();
        let _g2 = manager.new_page().unwrap();
        let _g3 = manager.new_page().unwrap();

        let err = manager.new_page();
        assert!(err.is_err());

        drop(g1);
        assert!(manager.new_page().is_ok());
    }

    #[test]
    fn dirty_page_written_back_on_eviction() {
        let (_tmp, manager) = setup_manager(1);
        let page_id = {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[0] = 77;
            guard.page_id()
        };

        // single frame: this evicts the dirty page and must write it back
        let other = manager.new_page().unwrap();
        drop(other);

        let guard = manager.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 77);
    }

    #[test]
    fn flush_clears_dirty_and_persists() {
        let (_tmp, manager) = setup_manager(2);
        let (page_id, frame_id) = {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[10] = 42;
            (guard.page_id(), guard.frame_id())
        };

        assert!(manager.flush_page(page_id).unwrap());
        assert!(!manager.buffer_pool().frame_meta(frame_id).is_dirty);
        // second flush is a no-op
        assert!(!manager.flush_page(page_id).unwrap());

        let read_back = manager
            .buffer_pool()
            .disk_scheduler()
            .schedule_read(page_id)
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();
        assert_eq!(read_back[10], 42);
    }

    #[test]
    fn delete_page_releases_frame() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();

        // pinned pages cannot be deleted
        assert!(!manager.delete_page(page_id).unwrap());
        drop(guard);

        assert!(manager.delete_page(page_id).unwrap());
        assert!(manager.buffer_pool().lookup_frame(page_id).is_none());
        assert!(manager.buffer_pool().has_free_frame());

        // deleting a non-resident page deallocates and succeeds
        assert!(manager.delete_page(page_id).unwrap());
    }

    #[test]
    fn frame_accounting_invariant_holds() {
        let (_tmp, manager) = setup_manager(4);
        let pool = manager.buffer_pool();
        let mut guards = Vec::new();
        for _ in 0..3 {
            guards.push(manager.new_page().unwrap());
        }
        assert_eq!(pool.free_frame_count() + pool.resident_page_count(), 4);
        drop(guards);
        assert_eq!(pool.free_frame_count() + pool.resident_page_count(), 4);
    }

    #[test]
    fn concurrent_reads_do_not_leak_pins() {
        const THREADS: usize = 8;
        let (_tmp, manager) = setup_manager(4);
        let (page_id, frame_id) = {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[0] = 42;
            (guard.page_id(), guard.frame_id())
        };

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::with_capacity(THREADS);
        for _ in 0..THREADS {
            let manager = manager.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let guard = manager.fetch_page_read(page_id).expect("read page");
                    assert_eq!(guard.data()[0], 42);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let meta = manager.buffer_pool().frame_meta(frame_id).clone();
        assert_eq!(meta.pin_count, 0);
        assert_eq!(meta.page_id, page_id);
    }

    #[test]
    fn eviction_round_trips_through_disk() {
        let (_tmp, manager) = setup_manager(2);
        let mut page_ids = Vec::new();
        for i in 0..6u8 {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[0] = i + 1;
            page_ids.push(guard.page_id());
        }
        for (i, page_id) in page_ids.iter().enumerate() {
            let guard = manager.fetch_page_read(*page_id).unwrap();
            assert_eq!(guard.data()[0], i as u8 + 1);
        }
    }
}
