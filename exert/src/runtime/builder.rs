use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::events::EventBus;
use crate::monitor::ExertionMonitor;
use crate::provider::ProviderResolver;
use crate::space::ExertionSpace;

use super::supervisor::WorkerPool;
use super::worker::WorkerConfig;

/// Builder for a [`WorkerPool`] with explicit dependencies.
///
/// # Example
///
/// ```ignore
/// use exert::*;
///
/// let pool = WorkerPool::builder()
///     .with_config(WorkerConfig::new("adders").for_capability("Adder"))
///     .with_parallelism(4)
///     .with_space(space)
///     .with_resolver(registry)
///     .build()?;
/// pool.start();
/// ```
pub struct WorkerPoolBuilder {
    config: WorkerConfig,
    parallelism: usize,
    space: Option<Arc<dyn ExertionSpace>>,
    resolver: Option<Arc<dyn ProviderResolver>>,
    events: Option<EventBus>,
    monitor: Option<(ExertionMonitor, Duration)>,
}

impl fmt::Debug for WorkerPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolBuilder")
            .field("config", &self.config)
            .field("parallelism", &self.parallelism)
            .field("space_set", &self.space.is_some())
            .field("resolver_set", &self.resolver.is_some())
            .field("events_set", &self.events.is_some())
            .field("monitor_set", &self.monitor.is_some())
            .finish()
    }
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPoolBuilder {
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            parallelism: 1,
            space: None,
            resolver: None,
            events: None,
            monitor: None,
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of workers.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the space workers claim from.
    pub fn with_space(mut self, space: Arc<dyn ExertionSpace>) -> Self {
        self.space = Some(space);
        self
    }

    /// Set the resolver workers invoke providers through.
    pub fn with_resolver(mut self, resolver: Arc<dyn ProviderResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the event bus claims are reported on.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Run the monitor's lease sweeper every `interval` alongside the
    /// workers.
    pub fn with_monitor(mut self, monitor: ExertionMonitor, interval: Duration) -> Self {
        self.monitor = Some((monitor, interval));
        self
    }

    /// Build the pool. Workers are not spawned until
    /// [`WorkerPool::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the space or resolver is missing, or
    /// parallelism is zero.
    pub fn build(self) -> anyhow::Result<WorkerPool> {
        let space = self
            .space
            .ok_or_else(|| anyhow::anyhow!("space dependency missing"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| anyhow::anyhow!("resolver dependency missing"))?;
        if self.parallelism == 0 {
            anyhow::bail!("parallelism must be at least 1");
        }

        Ok(WorkerPool::new(
            self.config,
            self.parallelism,
            space,
            resolver,
            self.events,
            self.monitor,
        ))
    }
}
