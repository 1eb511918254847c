//! Arithmetic job over push and pull dispatch.
//!
//! Builds the classic `f1(f2, f3)` composition: `f2` adds, `f3` multiplies
//! through the exertion space, and `f1` subtracts their results once both
//! are mapped into its context. A While loop then counts five steps up
//! from the result.
//!
//! Run with `RUST_LOG=debug cargo run --example arithmetic_job` to see the
//! dispatch spans.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use exert::*;
use serde_json::Value;

/// Folds every `arg/*` input with one arithmetic operator.
struct Calculator {
    name: String,
}

impl Calculator {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Provider for Calculator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, selector: &str, context: &mut Context) -> anyhow::Result<Option<Value>> {
        let mut args = Vec::new();
        for path in context.input_paths() {
            if path.starts_with("arg/") {
                args.push(context.get_f64(path)?);
            }
        }
        let (first, rest) = args.split_first().context("no arguments")?;
        let result = rest.iter().fold(*first, |acc, x| match selector {
            "add" => acc + x,
            "subtract" => acc - x,
            "multiply" => acc * x,
            _ => acc,
        });
        println!("[{}] {selector}{args:?} = {result}", self.name);
        Ok(Some(result.into()))
    }
}

fn task(name: &str, capability: &str, selector: &str, x1: f64, x2: f64) -> Task {
    let context = Context::new(name)
        .with_input("arg/x1", x1)
        .with_input("arg/x2", x2)
        .with_output("result/y")
        .with_return_path("result/y");
    Task::new(name, Signature::new(capability, selector), context)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    exert::telemetry::init_tracing()?;
    let config = EngineConfig::from_env()?;

    let registry = Arc::new(ProviderRegistry::new());
    registry.register("Adder", Calculator::new("adder"));
    registry.register("Multiplier", Calculator::new("multiplier"));
    registry.register("Subtractor", Calculator::new("subtractor"));

    let space: Arc<dyn ExertionSpace> = Arc::new(InMemorySpace::new());
    let events = EventBus::new(256);
    let monitor = ExertionMonitor::with_events(LeasePolicy::from_config(&config), events.clone())
        .with_retention(config.monitor_retention());

    let pool = WorkerPool::builder()
        .with_config(WorkerConfig::new("multipliers").for_capability("Multiplier"))
        .with_parallelism(2)
        .with_space(space.clone())
        .with_resolver(registry.clone())
        .with_events(events.clone())
        .with_monitor(monitor.clone(), config.lease_sweep_interval())
        .build()?;
    pool.start();

    let dispatcher = Dispatcher::builder()
        .with_config(config)
        .with_resolver(registry)
        .with_space(space)
        .with_events(events.clone())
        .with_monitor(monitor)
        .build()?;

    let mut log = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = log.recv().await {
            println!("[event] {} {:?}", event.meta.exertion_id, event.payload);
        }
    });

    let mut job = Job::new("f1").with_strategy(ControlStrategy::par().monitored(true));
    let f2 = job.add(task("f2", "Adder", "add", 10.0, 20.0));
    let f3 = job.add(
        task("f3", "Multiplier", "multiply", 10.0, 20.0)
            .with_strategy(ControlStrategy::pull()),
    );
    let f1 = job.add(Task::new(
        "f1-sub",
        Signature::new("Subtractor", "subtract"),
        Context::new("f1-sub")
            .with_input("arg/x4", 0.0)
            .with_input("arg/x5", 0.0)
            .with_output("result/y")
            .with_return_path("result/y"),
    ));
    job.map(f3, "result/y", f1, "arg/x4");
    job.map(f2, "result/y", f1, "arg/x5");
    let job = job.with_master(f1);

    let done = dispatcher.exert(job).await;
    println!(
        "{} -> {:?}: {:?} (trace {:?})",
        done.name(),
        done.state(),
        done.context().return_value()?,
        done.control().trace()
    );
    for fault in done.exceptions() {
        println!("fault: {fault:?}");
    }

    let start = done.context().get_f64("result/y")?;
    let counting = WhileExertion::new(
        "count",
        Condition::new(format!("X < {}", start + 5.0)).bind("X", "arg/x1"),
        task("step", "Adder", "add", start, 1.0),
    )
    .with_increment("X", 1.0);
    let Exertion::While(counting) = dispatcher.exert(counting).await else {
        anyhow::bail!("dispatcher returned a different exertion kind");
    };
    println!(
        "counted {} times: {:?}",
        counting.iterations,
        counting.context.get("result/y")?
    );

    pool.shutdown().await
}
