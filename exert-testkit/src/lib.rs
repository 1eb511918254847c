//! Test providers, fixtures and space wrappers for exercising the exert
//! engine.

mod fixtures;
mod providers;
mod space;

pub use fixtures::*;
pub use providers::*;
pub use space::*;
