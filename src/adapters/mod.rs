//! Infrastructure adapters for external systems.

pub mod dispatch;
pub mod memory;
pub mod notify;
pub mod sqlite;

pub use dispatch::CommandDispatcher;
pub use memory::InMemoryStore;
pub use notify::{notifier_from_config, LogNotifier, WebhookNotifier};
pub use sqlite::SqliteStore;
