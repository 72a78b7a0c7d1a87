use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// A periodic background job owned by the scheduler.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// Tick interval.
    fn interval(&self) -> Duration;

    /// Run one tick.
    async fn tick(&self) -> Result<()>;
}

/// Drives registered background tasks on their intervals and stops them
/// together on shutdown.
pub struct Scheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            handles: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Register a periodic task. A tick that overruns its interval is not
    /// stacked behind the next one; the ticker skips ahead.
    pub fn register(&self, task: Arc<dyn BackgroundTask>) {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.tick().await {
                            tracing::error!(task = task.name(), error = %e, "background task tick failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::info!(task = task.name(), "background task stopped");
                        break;
                    }
                }
            }
        });
        self.handles.lock().unwrap().push(handle);
    }

    /// Signal shutdown and wait for every task to stop.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        interval: Duration,
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn tick(&self) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_task_ticks_on_its_interval() -> Result<()> {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            ticks: ticks.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(ticks.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_ticking() -> Result<()> {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            ticks: ticks.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.shutdown().await?;

        let after_shutdown = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);

        Ok(())
    }
}
