//! Application layer: wires services into a runnable scheduler.

pub mod runtime;

pub use runtime::{RuntimeState, SchedulerRuntime};
