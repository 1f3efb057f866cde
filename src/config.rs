use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
    pub lru_k_k: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1024,
            lru_k_k: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig {
            leaf_max_size: 32,
            internal_max_size: 32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IoSchedulerConfig {
    /// Number of background I/O worker threads.
    pub workers: usize,
}

impl IoSchedulerConfig {
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(1)
    }
}

impl Default for IoSchedulerConfig {
    fn default() -> Self {
        IoSchedulerConfig {
            workers: Self::default_workers(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockManagerConfig {
    pub enable_deadlock_detection: bool,
    pub deadlock_detection_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            enable_deadlock_detection: true,
            deadlock_detection_interval: Duration::from_millis(50),
        }
    }
}
