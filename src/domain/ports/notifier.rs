//! Alert delivery port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// Best-effort alert sink. Callers log and drop errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `message` to `channel`.
    async fn notify(&self, channel: &str, message: &str) -> DomainResult<()>;
}

/// Notifier that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _channel: &str, _message: &str) -> DomainResult<()> {
        Ok(())
    }
}
