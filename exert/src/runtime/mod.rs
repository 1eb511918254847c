/// Builder for worker pools.
pub mod builder;
/// Worker pool lifecycle: start and graceful shutdown.
pub mod supervisor;
/// Worker configuration and the claim loop.
pub mod worker;

pub use builder::WorkerPoolBuilder;
pub use supervisor::WorkerPool;
pub use worker::WorkerConfig;
