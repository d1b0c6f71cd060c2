pub mod buffer_manager;
pub mod buffer_pool;
pub mod page;
pub mod parallel;

pub use buffer_manager::BufferManager;
pub use buffer_pool::{BufferPool, FrameId, FrameMeta};
pub use page::{
    AtomicPageId, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID, PAGE_SIZE,
};
pub use parallel::ParallelBufferManager;
