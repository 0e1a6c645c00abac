//! Runtime switches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Externally toggled switches shared by the loops and the CLI.
#[derive(Debug, Clone)]
pub struct ControlFlags {
    paused: Arc<AtomicBool>,
    spawning_enabled: Arc<AtomicBool>,
}

impl ControlFlags {
    /// Unpaused, with spawning as given.
    pub fn new(spawning_enabled: bool) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            spawning_enabled: Arc::new(AtomicBool::new(spawning_enabled)),
        }
    }

    /// Short-circuits whole ticks.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Pause or resume ticking.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Gates only the assignment phase.
    pub fn spawning_enabled(&self) -> bool {
        self.spawning_enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable dispatching.
    pub fn set_spawning_enabled(&self, enabled: bool) {
        self.spawning_enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new(true)
    }
}
