use std::mem::ManuallyDrop;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use log::warn;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::buffer::buffer_pool::{FrameData, FrameId};
use crate::buffer::BufferManager;

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

type FrameReadGuard = ArcRwLockReadGuard<RawRwLock, FrameData>;
type FrameWriteGuard = ArcRwLockWriteGuard<RawRwLock, FrameData>;

/// Shared latch on a resident page, holding one pin.
///
/// Dropping the guard releases the latch first and then unpins, so the frame
/// can never be recycled while its bytes are still readable through the
/// guard.
#[derive(Debug)]
pub struct ReadPageGuard {
    bpm: Arc<BufferManager>,
    page_id: PageId,
    frame_id: FrameId,
    guard: ManuallyDrop<FrameReadGuard>,
}

impl ReadPageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn data(&self) -> &[u8] {
        &self.guard[..]
    }

    pub fn pin_count(&self) -> u32 {
        self.bpm.buffer_pool().frame_meta(self.frame_id).pin_count
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if !self.bpm.unpin_page(self.page_id, false) {
            warn!("unpin of page {} failed: not resident or not pinned", self.page_id);
        }
    }
}

/// Exclusive latch on a resident page, holding one pin.
///
/// Any access through `data_mut` marks the page dirty; the dirty bit is
/// folded into the frame metadata when the guard drops.
#[derive(Debug)]
pub struct WritePageGuard {
    bpm: Arc<BufferManager>,
    page_id: PageId,
    frame_id: FrameId,
    dirty: bool,
    guard: ManuallyDrop<FrameWriteGuard>,
}

impl WritePageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn data(&self) -> &[u8] {
        &self.guard[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.guard[..]
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replace the page image wholesale, e.g. from a freshly encoded node.
    pub fn overwrite(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.data_mut().copy_from_slice(data);
    }

    pub fn pin_count(&self) -> u32 {
        self.bpm.buffer_pool().frame_meta(self.frame_id).pin_count
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if !self.bpm.unpin_page(self.page_id, self.dirty) {
            warn!("unpin of page {} failed: not resident or not pinned", self.page_id);
        }
    }
}

pub(crate) fn new_read_guard(
    bpm: Arc<BufferManager>,
    frame_id: FrameId,
    page_id: PageId,
) -> ReadPageGuard {
    let lock = bpm.buffer_pool().frame_lock(frame_id);
    let guard = lock.read_arc();
    ReadPageGuard {
        bpm,
        page_id,
        frame_id,
        guard: ManuallyDrop::new(guard),
    }
}

pub(crate) fn new_write_guard(
    bpm: Arc<BufferManager>,
    frame_id: FrameId,
    page_id: PageId,
) -> WritePageGuard {
    let lock = bpm.buffer_pool().frame_lock(frame_id);
    let guard = lock.write_arc();
    WritePageGuard {
        bpm,
        page_id,
        frame_id,
        dirty: false,
        guard: ManuallyDrop::new(guard),
    }
}
