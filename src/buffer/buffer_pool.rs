use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::buffer::page::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::extendible_hash::ExtendibleHashTable;

pub type FrameId = usize;
pub type FrameData = [u8; PAGE_SIZE];

/// Page-table bucket capacity; the table splits buckets as frames churn.
const PAGE_TABLE_BUCKET_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl Default for FrameMeta {
    fn default() -> Self {
        FrameMeta {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

/// Frame storage shared by the buffer manager and its page guards.
///
/// Each frame is a page-sized byte array behind its own rw-latch, with
/// bookkeeping (`page_id`, `pin_count`, `is_dirty`) in a per-frame mutex kept
/// separate from the latch so that pin accounting never waits on page I/O.
#[derive(Debug)]
pub struct BufferPool {
    frames: Vec<Arc<RwLock<FrameData>>>,
    metas: Vec<Mutex<FrameMeta>>,
    free_list: Mutex<VecDeque<FrameId>>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    disk_scheduler: Arc<DiskScheduler>,
}

impl BufferPool {
    pub fn new(capacity: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        let mut metas = Vec::with_capacity(capacity);
        let mut free_list = VecDeque::with_capacity(capacity);
        for frame_id in 0..capacity {
            frames.push(Arc::new(RwLock::new([0u8; PAGE_SIZE])));
            metas.push(Mutex::new(FrameMeta::default()));
            free_list.push_back(frame_id);
        }
        Self {
            frames,
            metas,
            free_list: Mutex::new(free_list),
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            disk_scheduler,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn disk_scheduler(&self) -> &Arc<DiskScheduler> {
        &self.disk_scheduler
    }

    pub fn has_free_frame(&self) -> bool {
        !self.free_list.lock().is_empty()
    }

    pub fn pop_free_frame(&self) -> Option<FrameId> {
        self.free_list.lock().pop_front()
    }

    pub fn push_free_frame(&self, frame_id: FrameId) {
        self.free_list.lock().push_back(frame_id);
    }

    pub fn free_frame_count(&self) -> usize {
        self.free_list.lock().len()
    }

    pub fn frame_meta(&self, frame_id: FrameId) -> MutexGuard<'_, FrameMeta> {
        self.metas[frame_id].lock()
    }

    pub fn frame_lock(&self, frame_id: FrameId) -> Arc<RwLock<FrameData>> {
        self.frames[frame_id].clone()
    }

    pub fn lookup_frame(&self, page_id: PageId) -> Option<FrameId> {
        self.page_table.get(&page_id)
    }

    pub fn resident_page_count(&self) -> usize {
        self.page_table.len()
    }

    pub fn insert_mapping(&self, page_id: PageId, frame_id: FrameId) {
        self.page_table.insert(page_id, frame_id);
    }

    pub fn remove_mapping(&self, page_id: PageId) {
        self.page_table.remove(&page_id);
    }

    pub fn reset_frame(&self, frame_id: FrameId) {
        let lock = self.frame_lock(frame_id);
        let mut data = lock.write();
        data.fill(0);
    }

    pub fn load_page_into_frame(&self, page_id: PageId, frame_id: FrameId) -> VellumDBResult<()> {
        let bytes = self
            .disk_scheduler
            .schedule_read(page_id)?
            .recv()
            .map_err(|e| VellumDBError::Internal(format!("disk channel disconnected: {}", e)))??;
        let lock = self.frame_lock(frame_id);
        let mut data = lock.write();
        data.copy_from_slice(&bytes[..PAGE_SIZE]);
        Ok(())
    }

    pub fn write_page_to_disk(&self, page_id: PageId, data: Bytes) -> VellumDBResult<()> {
        self.disk_scheduler
            .schedule_write(page_id, data)?
            .recv()
            .map_err(|e| VellumDBError::Internal(format!("disk channel disconnected: {}", e)))?
    }

    pub fn allocate_page_id(&self) -> VellumDBResult<PageId> {
        self.disk_scheduler
            .schedule_allocate()?
            .recv()
            .map_err(|e| VellumDBError::Internal(format!("disk channel disconnected: {}", e)))?
    }

    pub fn deallocate_page_id(&self, page_id: PageId) -> VellumDBResult<()> {
        self.disk_scheduler
            .schedule_deallocate(page_id)?
            .recv()
            .map_err(|e| VellumDBError::Internal(format!("disk channel disconnected: {}", e)))?
    }
}
