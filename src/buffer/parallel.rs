use std::sync::Arc;

use crate::buffer::buffer_manager::BufferManager;
use crate::buffer::page::{PageId, ReadPageGuard, WritePageGuard};
use crate::config::BufferPoolConfig;
use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::disk_scheduler::DiskScheduler;

/// Round-robin fan-out over independent buffer-pool instances.
///
/// Instance `page_id % N` owns a page, so the per-instance latches shard by
/// page id. All instances share one disk scheduler; `new_page` allocates the
/// id first and routes the installation to its owner, which spreads fresh
/// allocations across instances since allocated ids are consecutive.
#[derive(Debug)]
pub struct ParallelBufferManager {
    instances: Vec<Arc<BufferManager>>,
    disk_scheduler: Arc<DiskScheduler>,
}

impl ParallelBufferManager {
    pub fn new(
        num_instances: usize,
        config: BufferPoolConfig,
        disk_scheduler: Arc<DiskScheduler>,
    ) -> Self {
        assert!(num_instances > 0);
        let instances = (0..num_instances)
            .map(|_| Arc::new(BufferManager::new_with_config(config, disk_scheduler.clone())))
            .collect();
        Self {
            instances,
            disk_scheduler,
        }
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// Total frame capacity across all instances.
    pub fn pool_size(&self) -> usize {
        self.instances
            .iter()
            .map(|instance| instance.buffer_pool().capacity())
            .sum()
    }

    fn owner(&self, page_id: PageId) -> &Arc<BufferManager> {
        &self.instances[page_id as usize % self.instances.len()]
    }

    pub fn new_page(&self) -> VellumDBResult<WritePageGuard> {
        let page_id = self
            .disk_scheduler
            .schedule_allocate()?
            .recv()
            .map_err(|e| VellumDBError::Internal(format!("disk channel disconnected: {}", e)))??;
        self.owner(page_id).new_page_with_id(page_id)
    }

    pub fn fetch_page_read(&self, page_id: PageId) -> VellumDBResult<ReadPageGuard> {
        self.owner(page_id).fetch_page_read(page_id)
    }

    pub fn fetch_page_write(&self, page_id: PageId) -> VellumDBResult<WritePageGuard> {
        self.owner(page_id).fetch_page_write(page_id)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.owner(page_id).unpin_page(page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> VellumDBResult<bool> {
        self.owner(page_id).flush_page(page_id)
    }

    pub fn delete_page(&self, page_id: PageId) -> VellumDBResult<bool> {
        self.owner(page_id).delete_page(page_id)
    }

    pub fn flush_all_pages(&self) -> VellumDBResult<()> {
        for instance in self.instances.iter() {
            instance.flush_all_pages()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use tempfile::TempDir;

    fn setup(num_instances: usize, pages_each: usize) -> (TempDir, ParallelBufferManager) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let manager = ParallelBufferManager::new(
            num_instances,
            BufferPoolConfig {
                buffer_pool_size: pages_each,
                ..Default::default()
            },
            disk_scheduler,
        );
        (temp_dir, manager)
    }

    #[test]
    fn pages_route_to_their_owner_instance() {
        let (_tmp, manager) = setup(3, 4);
        let mut page_ids = Vec::new();
        for i in 0..6u8 {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[0] = i + 1;
            page_ids.push(guard.page_id());
        }
        for (i, page_id) in page_ids.iter().enumerate() {
            let owner = manager.owner(*page_id);
            assert!(owner.buffer_pool().lookup_frame(*page_id).is_some());
            let guard = manager.fetch_page_read(*page_id).unwrap();
            assert_eq!(guard.data()[0], i as u8 + 1);
        }
    }

    #[test]
    fn consecutive_allocations_spread_across_instances() {
        let (_tmp, manager) = setup(2, 4);
        let mut owners = std::collections::HashSet::new();
        let mut guards = Vec::new();
        for _ in 0..4 {
            let guard = manager.new_page().unwrap();
            owners.insert(guard.page_id() as usize % manager.num_instances());
            guards.push(guard);
        }
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn flush_all_covers_every_instance() {
        let (_tmp, manager) = setup(2, 4);
        let mut page_ids = Vec::new();
        for i in 0..4u8 {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[0] = i + 10;
            page_ids.push(guard.page_id());
        }
        manager.flush_all_pages().unwrap();
        for page_id in page_ids {
            assert!(!manager.flush_page(page_id).unwrap());
        }
    }

    #[test]
    fn unpin_and_delete_route_by_page_id() {
        let (_tmp, manager) = setup(2, 4);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        drop(guard);
        assert!(!manager.unpin_page(page_id, false));
        assert!(manager.delete_page(page_id).unwrap());
    }
}
