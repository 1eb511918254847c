use std::sync::Arc;
use std::sync::Once;

use exert::{
    Context, Dispatcher, EngineConfig, ExertionSpace, ProviderRegistry, Signature, Task,
};

use crate::providers::{Arithmetic, InvocationLog};

static TRACING: Once = Once::new();

/// Install a test subscriber once per process. Honors `RUST_LOG`.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = exert::telemetry::init_tracing();
    });
}

/// Context with inputs `arg/x1`, `arg/x2` and output `result/y` as its
/// return path.
pub fn arithmetic_context(name: &str, x1: f64, x2: f64) -> Context {
    Context::new(name)
        .with_input("arg/x1", x1)
        .with_input("arg/x2", x2)
        .with_output("result/y")
        .with_return_path("result/y")
}

/// Task `name` running `capability#selector` over [`arithmetic_context`].
pub fn arithmetic_task(name: &str, capability: &str, selector: &str, x1: f64, x2: f64) -> Task {
    Task::new(
        name,
        Signature::new(capability, selector),
        arithmetic_context(name, x1, x2),
    )
}

/// Registry serving `Adder`, `Subtractor`, `Multiplier`, `Divider` and
/// `Averager` with one [`Arithmetic`] provider each.
pub fn arithmetic_registry() -> ProviderRegistry {
    arithmetic_registry_with(|name| Arithmetic::new(name))
}

/// Like [`arithmetic_registry`], recording every invocation in `log`.
pub fn logged_registry(log: &InvocationLog) -> ProviderRegistry {
    arithmetic_registry_with(|name| Arithmetic::new(name).with_log(log.clone()))
}

pub fn arithmetic_registry_with<F>(make: F) -> ProviderRegistry
where
    F: Fn(&str) -> Arithmetic,
{
    [
        ("Adder", "adder"),
        ("Subtractor", "subtractor"),
        ("Multiplier", "multiplier"),
        ("Divider", "divider"),
        ("Averager", "averager"),
    ]
    .into_iter()
    .fold(ProviderRegistry::new(), |registry, (capability, name)| {
        registry.with(capability, Arc::new(make(name)))
    })
}

/// Push-only dispatcher over `registry` with a short poll interval.
pub fn dispatcher(registry: ProviderRegistry) -> Dispatcher {
    dispatcher_with(registry, None, test_config())
}

pub fn dispatcher_with(
    registry: ProviderRegistry,
    space: Option<Arc<dyn ExertionSpace>>,
    config: EngineConfig,
) -> Dispatcher {
    let mut builder = Dispatcher::builder()
        .with_resolver(Arc::new(registry))
        .with_config(config);
    if let Some(space) = space {
        builder = builder.with_space(space);
    }
    builder.build().expect("dispatcher with resolver builds")
}

/// Engine config tuned for tests: 10 ms polling, 2 s dispatch timeout.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 10,
        dispatch_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
}
