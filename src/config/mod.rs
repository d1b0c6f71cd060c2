use std::time::Duration;

/// Victim-selection policy used by the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacerStrategy {
    Lru,
    Clock,
    LruK,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
    pub replacer: ReplacerStrategy,
    /// K parameter when `replacer` is `LruK`.
    pub lru_k_k: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1024,
            replacer: ReplacerStrategy::LruK,
            lru_k_k: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    /// Fixed width of every index key, in bytes.
    pub key_size: usize,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig {
            key_size: 8,
            leaf_max_size: 32,
            internal_max_size: 32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HashIndexConfig {
    pub key_size: usize,
    /// Slot capacity of a single bucket page.
    pub bucket_max_size: u32,
}

impl Default for HashIndexConfig {
    fn default() -> Self {
        HashIndexConfig {
            key_size: 8,
            bucket_max_size: 64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockManagerConfig {
    pub cycle_detection_interval: Duration,
    pub enable_cycle_detection: bool,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            cycle_detection_interval: Duration::from_millis(50),
            enable_cycle_detection: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IoSchedulerConfig {
    /// Number of I/O worker threads.
    pub workers: usize,
}

impl IoSchedulerConfig {
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4)
    }
}

impl Default for IoSchedulerConfig {
    fn default() -> Self {
        IoSchedulerConfig {
            workers: Self::default_workers(),
        }
    }
}
