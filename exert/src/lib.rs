//! Exert - federated exertion engine.
//!
//! Work is expressed as *exertions*: tasks that invoke a provider operation
//! on a context of path-addressed data, jobs that compose other exertions,
//! and If/While wrappers that add control flow. A [`Dispatcher`] runs them
//! either by invoking providers directly (push) or by publishing tasks to an
//! [`ExertionSpace`] where a [`WorkerPool`] claims them (pull).
//!
//! # Core Concepts
//!
//! - **Context**: [`Context`] is a tree of `/`-separated paths carrying
//!   directional entries, links into other contexts and mappings.
//!
//! - **Exertion**: [`Exertion`] is a [`Task`], [`Job`], [`IfExertion`] or
//!   [`WhileExertion`], each with a [`ControlStrategy`] and a runtime
//!   [`ControlContext`] that records state and faults.
//!
//! - **Dispatch**: [`Dispatcher::exert`] never fails; failures are recorded
//!   on the returned exertion. SEQ jobs run children in order, PAR jobs run
//!   them concurrently subject to mapping dependencies.
//!
//! - **Leases**: [`LeaseManager`] grants and expires time-bounded leases;
//!   [`ExertionMonitor`] uses them to supervise monitored exertions.
//!
//! - **Events**: [`EventBus`] broadcasts lifecycle events.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use exert::*;
//!
//! let registry = ProviderRegistry::new().with("Adder", Arc::new(MyAdder));
//! let dispatcher = Dispatcher::builder()
//!     .with_resolver(Arc::new(registry))
//!     .build()?;
//!
//! let context = Context::new("add")
//!     .with_input("arg/x1", 20.0)
//!     .with_input("arg/x2", 80.0)
//!     .with_output("result/y")
//!     .with_return_path("result/y");
//! let task = Task::new("t1", Signature::new("Adder", "add"), context);
//!
//! let done = dispatcher.exert(task).await;
//! assert_eq!(done.state(), ExecState::Done);
//! ```

/// Cooperative cancellation shared by dispatch, workers and the monitor.
pub mod cancel;

/// Engine configuration loaded from `EXERT_*` environment variables.
pub mod config;

/// Path-addressed contexts with directions, links and mappings.
pub mod context;

/// Conditions for If and While exertions.
pub mod control;

/// Push and pull dispatch of exertions.
pub mod dispatch;

/// Error types recorded on exertions and returned by fallible APIs.
pub mod error;

/// Lifecycle events and the in-process event bus.
pub mod events;

/// Task, Job, If and While exertions.
pub mod exertion;

/// Time-bounded leases with expiry callbacks.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus metrics registry and collectors.
pub mod metrics;

/// Lease-backed supervision of monitored exertions.
pub mod monitor;

/// Providers and capability-based provider resolution.
pub mod provider;

/// Space worker pools.
pub mod runtime;

/// Provider operation signatures.
pub mod signature;

/// Exertion space used for pull dispatch.
pub mod space;

/// Execution strategy and per-exertion runtime state.
pub mod strategy;

/// Tracing setup and metric hooks.
pub mod telemetry;

pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use context::{
    validate_path, Context, ContextEntry, ContextId, Direction, PathMapping, Resolved,
    SharedContext,
};
pub use control::{BindingScope, Condition, VarBinding};
pub use dispatch::{execute_task, Dispatcher, DispatcherBuilder};
pub use error::*;
pub use events::*;
pub use exertion::*;
pub use lease::*;
pub use monitor::{ExertionMonitor, MonitorSession, Renewer};
pub use provider::{Provider, ProviderRegistry, ProviderResolver};
pub use runtime::{WorkerConfig, WorkerPool, WorkerPoolBuilder};
pub use signature::Signature;
pub use space::{Envelope, EnvelopeTemplate, ExertionSpace, InMemorySpace};
pub use strategy::*;
