use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::monitor::ExertionMonitor;
use crate::provider::ProviderResolver;
use crate::space::ExertionSpace;

use super::{Dispatcher, DispatcherInner};

/// Builder for a [`Dispatcher`] with explicit dependencies.
///
/// Only the provider resolver is required. Without a space, pull exertions
/// fail with `NoSpace`; without a monitor, `monitored` is ignored.
///
/// # Example
///
/// ```ignore
/// use exert::*;
///
/// let dispatcher = Dispatcher::builder()
///     .with_resolver(Arc::new(registry))
///     .with_space(Arc::new(InMemorySpace::new()))
///     .with_events(EventBus::new(256))
///     .build()?;
/// ```
#[derive(Default)]
pub struct DispatcherBuilder {
    config: EngineConfig,
    resolver: Option<Arc<dyn ProviderResolver>>,
    space: Option<Arc<dyn ExertionSpace>>,
    events: Option<EventBus>,
    monitor: Option<ExertionMonitor>,
}

impl fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("config", &self.config)
            .field("resolver_set", &self.resolver.is_some())
            .field("space_set", &self.space.is_some())
            .field("events_set", &self.events.is_some())
            .field("monitor_set", &self.monitor.is_some())
            .finish()
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine configuration. Defaults to [`EngineConfig::default`].
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the provider resolver used for push tasks.
    pub fn with_resolver(mut self, resolver: Arc<dyn ProviderResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the exertion space used for pull dispatch.
    pub fn with_space(mut self, space: Arc<dyn ExertionSpace>) -> Self {
        self.space = Some(space);
        self
    }

    /// Set the event bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the monitor that leases monitored exertions.
    pub fn with_monitor(mut self, monitor: ExertionMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Build the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver is missing.
    pub fn build(self) -> anyhow::Result<Dispatcher> {
        let resolver = self
            .resolver
            .ok_or_else(|| anyhow::anyhow!("resolver dependency missing"))?;

        Ok(Dispatcher {
            inner: Arc::new(DispatcherInner {
                resolver,
                space: self.space,
                events: self.events,
                monitor: self.monitor,
                config: self.config,
                detached: Default::default(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderRegistry;
    use crate::space::InMemorySpace;

    #[test]
    fn test_build_requires_resolver() {
        let err = DispatcherBuilder::new().build().unwrap_err();
        assert_eq!(err.to_string(), "resolver dependency missing");
    }

    #[test]
    fn test_debug_reports_configured_dependencies() {
        let builder = DispatcherBuilder::new()
            .with_resolver(Arc::new(ProviderRegistry::new()))
            .with_space(Arc::new(InMemorySpace::new()));
        let debug = format!("{builder:?}");
        assert!(debug.contains("resolver_set: true"));
        assert!(debug.contains("space_set: true"));
        assert!(debug.contains("monitor_set: false"));

        let dispatcher = builder.build().unwrap();
        assert!(dispatcher.space().is_some());
        assert!(dispatcher.monitor().is_none());
    }
}
