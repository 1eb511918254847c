use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::events::EventBus;
use crate::monitor::ExertionMonitor;
use crate::provider::ProviderResolver;
use crate::space::ExertionSpace;

use super::builder::WorkerPoolBuilder;
use super::worker::{worker_loop, WorkerConfig, WorkerContext};

/// Pool of space workers sharing one configuration.
///
/// Workers are spawned by [`WorkerPool::start`] and stopped by
/// [`WorkerPool::shutdown`], which waits for in-flight tasks to finish
/// within the configured bound.
pub struct WorkerPool {
    config: WorkerConfig,
    parallelism: usize,
    space: Arc<dyn ExertionSpace>,
    resolver: Arc<dyn ProviderResolver>,
    events: Option<EventBus>,
    monitor: Option<(ExertionMonitor, Duration)>,
    shutdown_token: CancelToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("parallelism", &self.parallelism)
            .field("running", &self.handles.lock().len())
            .field("events_set", &self.events.is_some())
            .field("monitor_set", &self.monitor.is_some())
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }

    pub(crate) fn new(
        config: WorkerConfig,
        parallelism: usize,
        space: Arc<dyn ExertionSpace>,
        resolver: Arc<dyn ProviderResolver>,
        events: Option<EventBus>,
        monitor: Option<(ExertionMonitor, Duration)>,
    ) -> Self {
        Self {
            config,
            parallelism,
            space,
            resolver,
            events,
            monitor,
            shutdown_token: CancelToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Ids of the workers this pool spawns.
    pub fn worker_ids(&self) -> Vec<String> {
        (0..self.parallelism).map(|i| self.config.worker_id(i)).collect()
    }

    /// Number of spawned tasks still held, sweeper included.
    pub fn running(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Spawn the workers, plus the monitor's lease sweeper if one is set.
    ///
    /// Calling `start` on a running pool does nothing.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() || self.shutdown_token.is_cancelled() {
            return;
        }

        let ctx = WorkerContext {
            space: Arc::clone(&self.space),
            resolver: Arc::clone(&self.resolver),
            events: self.events.clone(),
            template: self.config.template(),
            poll_interval: self.config.poll_interval(),
        };
        for worker_id in self.worker_ids() {
            let ctx = ctx.clone();
            let shutdown = self.shutdown_token.clone();
            handles.push(tokio::spawn(worker_loop(worker_id, ctx, shutdown)));
        }

        if let Some((monitor, interval)) = &self.monitor {
            handles.push(monitor.spawn_sweeper(*interval, self.shutdown_token.child()));
        }
        tracing::info!(group = %self.config.group, workers = self.parallelism, "worker pool started");
    }

    /// Signal every worker to stop and join them, each within the
    /// configured shutdown timeout.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!(group = %self.config.group, "initiating graceful shutdown of worker pool");

        self.shutdown_token.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        let bound = self.config.shutdown_timeout();
        let mut timed_out = 0usize;
        for handle in handles {
            match tokio::time::timeout(bound, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = ?e, "worker task failed"),
                Err(_) => {
                    timed_out += 1;
                    tracing::warn!("worker task timed out during shutdown");
                }
            }
        }

        tracing::info!(group = %self.config.group, timed_out, "worker pool shutdown complete");
        if timed_out > 0 {
            anyhow::bail!("{timed_out} worker(s) did not stop within {bound:?}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderRegistry;
    use crate::space::InMemorySpace;

    fn pool(parallelism: usize) -> WorkerPool {
        WorkerPool::builder()
            .with_config(WorkerConfig::new("test").with_poll_interval(5))
            .with_parallelism(parallelism)
            .with_space(Arc::new(InMemorySpace::new()))
            .with_resolver(Arc::new(ProviderRegistry::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_spawns_configured_workers() {
        let pool = pool(3);
        assert_eq!(pool.worker_ids(), vec!["test-w0", "test-w1", "test-w2"]);
        pool.start();
        assert_eq!(pool.running(), 3);

        // Idempotent.
        pool.start();
        assert_eq!(pool.running(), 3);

        pool.shutdown().await.unwrap();
        assert_eq!(pool.running(), 0);
        assert!(pool.is_shutting_down());
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_ignored() {
        let pool = pool(1);
        pool.shutdown().await.unwrap();
        pool.start();
        assert_eq!(pool.running(), 0);
    }
}
