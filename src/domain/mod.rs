//! Domain layer for the crown scheduler
//!
//! This module contains the scheduling state machines, domain models and the
//! port traits adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
