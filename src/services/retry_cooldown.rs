//! Exponential backoff gate for task reassignment.
//!
//! `cooldown(r) = min(base * multiplier^r, cap)`. The tracker only remembers
//! when each task last failed; losing it (restart) makes tasks eligible early,
//! never late.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::models::{RetryConfig, Task};

/// Per-task backoff tracker shared by assignment, completion and crown.
pub struct RetryCooldown {
    config: RetryConfig,
    last_failed: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl RetryCooldown {
    /// Tracker using the `retry` config section.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            last_failed: Mutex::new(HashMap::new()),
        }
    }

    /// Backoff window in milliseconds for a task that has failed `retry_count` times.
    pub fn cooldown_ms(&self, retry_count: u32) -> u64 {
        let factor = u64::from(self.config.multiplier).saturating_pow(retry_count);
        self.config
            .base_ms
            .saturating_mul(factor)
            .min(self.config.cap_ms)
    }

    /// [`RetryCooldown::cooldown_ms`] as a duration.
    pub fn cooldown(&self, retry_count: u32) -> Duration {
        Duration::milliseconds(i64::try_from(self.cooldown_ms(retry_count)).unwrap_or(i64::MAX))
    }

    /// Record a failure at `at`, restarting the window.
    pub async fn record_failure(&self, task_id: Uuid, at: DateTime<Utc>) {
        self.last_failed.lock().await.insert(task_id, at);
    }

    /// Whether the task may be reassigned at `now`. Expired entries are
    /// dropped here.
    pub async fn is_eligible(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if task.retry_count == 0 {
            return true;
        }
        let mut last_failed = self.last_failed.lock().await;
        let Some(&failed_at) = last_failed.get(&task.id) else {
            return true;
        };
        if now - failed_at >= self.cooldown(task.retry_count) {
            last_failed.remove(&task.id);
            true
        } else {
            false
        }
    }

    /// Stop tracking a task that will not be retried (completed or blocked).
    pub async fn forget(&self, task_id: Uuid) {
        self.last_failed.lock().await.remove(&task_id);
    }

    /// Number of tracked tasks.
    pub async fn tracked(&self) -> usize {
        self.last_failed.lock().await.len()
    }
}

impl Default for RetryCooldown {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
