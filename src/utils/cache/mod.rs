use crate::buffer::FrameId;
use crate::config::ReplacerStrategy;
use crate::error::VellumDBResult;

pub mod clock;
pub mod lru;
pub mod lru_k;

/// Victim-selection policy over buffer-pool frames.
///
/// Implementations track which frames are evictable and pick a victim on
/// demand. All of them are driven by the buffer manager while it holds its
/// replacer lock, so the methods take `&mut self` and do no locking of their
/// own.
pub trait Replacer: std::fmt::Debug + Send + Sync {
    /// Note an access to `frame_id`, registering the frame if unknown.
    fn record_access(&mut self, frame_id: FrameId) -> VellumDBResult<()>;

    /// Pick a victim among the evictable frames and forget it.
    fn evict(&mut self) -> Option<FrameId>;

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> VellumDBResult<()>;

    /// Drop a frame from the replacer regardless of its position.
    fn remove(&mut self, frame_id: FrameId);

    /// Number of frames currently evictable.
    fn size(&self) -> usize;
}

pub fn build_replacer(
    strategy: ReplacerStrategy,
    capacity: usize,
    lru_k_k: usize,
) -> Box<dyn Replacer> {
    match strategy {
        ReplacerStrategy::Lru => Box::new(lru::LruReplacer::new(capacity)),
        ReplacerStrategy::Clock => Box::new(clock::ClockReplacer::new(capacity)),
        ReplacerStrategy::LruK => Box::new(lru_k::LruKReplacer::with_k(capacity, lru_k_k)),
    }
}
