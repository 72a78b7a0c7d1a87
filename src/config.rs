use std::time::Duration;

/// Configuration for the spline store
#[derive(Debug, Clone)]
pub struct Config {
    /// Record capacity of a single page (default: 64)
    pub records_per_page: usize,

    /// Number of consecutive pages grouped into one segment (default: 4)
    pub pages_per_segment: usize,

    /// Memtable size that triggers a flush, in bytes (default: 64MB)
    pub memtable_flush_threshold: usize,

    /// Minimum number of pending entries a page needs before a flush
    /// issues I/O for it (default: 1)
    pub io_threshold: u64,

    /// Maximum number of consecutive flushes a page's entries may be
    /// deferred before forced I/O (default: 0)
    pub max_deferrals: u64,

    /// How many neighboring segments a rewrite region may absorb on each
    /// side (default: 2)
    pub search_radius: u32,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check whether the memtable needs flushing (default: 1s)
    pub flush_interval: Duration,

    /// How often to look for overflowed segments to rewrite (default: 10s)
    pub reorg_interval: Duration,

    /// How often to log metrics (default: 5s)
    pub metrics_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            records_per_page: 64,
            pages_per_segment: 4,
            memtable_flush_threshold: 64 * 1024 * 1024, // 64MB
            io_threshold: 1,
            max_deferrals: 0,
            search_radius: 2,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            reorg_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Set page record capacity
    pub fn records_per_page(mut self, records: usize) -> Self {
        self.records_per_page = records;
        self
    }

    /// Set the number of pages grouped into one segment
    pub fn pages_per_segment(mut self, pages: usize) -> Self {
        self.pages_per_segment = pages;
        self
    }

    /// Set the memtable flush threshold
    pub fn memtable_flush_threshold(mut self, bytes: usize) -> Self {
        self.memtable_flush_threshold = bytes;
        self
    }

    /// Set the per-page I/O threshold
    pub fn io_threshold(mut self, entries: u64) -> Self {
        self.io_threshold = entries;
        self
    }

    /// Set the deferral cap
    pub fn max_deferrals(mut self, deferrals: u64) -> Self {
        self.max_deferrals = deferrals;
        self
    }

    /// Set the rewrite-region search radius
    pub fn search_radius(mut self, segments: u32) -> Self {
        self.search_radius = segments;
        self
    }

    /// Configure scheduler settings
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl SchedulerConfig {
    /// Set flush check interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set reorg check interval
    pub fn reorg_interval(mut self, interval: Duration) -> Self {
        self.reorg_interval = interval;
        self
    }

    /// Set metrics logging interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}
