//! CLI command implementations.

pub mod config;
pub mod crown;
pub mod run;
pub mod status;
pub mod tick;
