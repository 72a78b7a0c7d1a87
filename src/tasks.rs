use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::metrics;
use crate::reorg;
use crate::scheduler::BackgroundTask;
use crate::store::SplineStore;

/// Flushes the memtable once it crosses the size threshold.
pub struct FlushTask {
    store: Arc<SplineStore>,
}

impl FlushTask {
    pub fn new(store: Arc<SplineStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "memtable-flush"
    }

    fn interval(&self) -> Duration {
        self.store.config().scheduler.flush_interval
    }

    async fn tick(&self) -> Result<()> {
        if self.store.memtable_usage() >= self.store.config().memtable_flush_threshold {
            self.store.flush()?;
        }
        Ok(())
    }
}

/// Rewrites overflowed segments.
pub struct ReorgTask {
    store: Arc<SplineStore>,
}

impl ReorgTask {
    pub fn new(store: Arc<SplineStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for ReorgTask {
    fn name(&self) -> &'static str {
        "segment-reorg"
    }

    fn interval(&self) -> Duration {
        self.store.config().scheduler.reorg_interval
    }

    async fn tick(&self) -> Result<()> {
        for base in self.store.segments().overflowed_segment_bases() {
            // An earlier rewrite this tick may have absorbed the segment.
            if !self.store.segments().contains_base(base) {
                continue;
            }
            if !reorg::rewrite_region(&self.store, base)? {
                tracing::debug!(base, "rewrite region lost to a concurrent reorg");
            }
        }
        Ok(())
    }
}

/// Logs metrics.
pub struct MetricsTask {
    store: Arc<SplineStore>,
}

impl MetricsTask {
    pub fn new(store: Arc<SplineStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.store.config().scheduler.metrics_interval
    }

    async fn tick(&self) -> Result<()> {
        metrics::collect(&self.store)
    }
}
