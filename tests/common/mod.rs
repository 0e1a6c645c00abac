//! Common test utilities for integration tests
//!
//! Shared fixtures: a migrated SQLite store, a scripted worker dispatcher and
//! a runtime wired against both.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crown::adapters::sqlite::create_migrated_test_pool;
use crown::domain::models::Config;
use crown::domain::ports::{
    DispatchFailure, DispatchHandle, NullNotifier, SpawnRequest, WorkerDispatcher, WorkerOutcome,
};
use crown::services::SchedulerEvent;
use crown::{SchedulerRuntime, SqliteStore};

/// What the next spawn does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Start and never finish
    Hang,
    Succeed(Option<String>),
    Fail(String),
    FailBeforeStart(String),
}

/// Dispatcher that plays back scripted outcomes in spawn order.
#[derive(Default)]
pub struct MockDispatcher {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<SpawnRequest>>,
    held: Mutex<Vec<oneshot::Sender<WorkerOutcome>>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scripts(scripts: impl IntoIterator<Item = Script>) -> Self {
        let dispatcher = Self::default();
        dispatcher.scripts.lock().unwrap().extend(scripts);
        dispatcher
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerDispatcher for MockDispatcher {
    async fn spawn(&self, request: SpawnRequest) -> Result<DispatchHandle, DispatchFailure> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Hang);
        let (tx, rx) = oneshot::channel();
        match script {
            Script::Hang => self.held.lock().unwrap().push(tx),
            Script::Succeed(output) => {
                let _ = tx.send(WorkerOutcome::Succeeded { output });
            }
            Script::Fail(error) => {
                let _ = tx.send(WorkerOutcome::Failed {
                    error,
                    output: None,
                });
            }
            Script::FailBeforeStart(error) => return Err(DispatchFailure::before_start(error)),
        }
        Ok(DispatchHandle {
            session_id: Uuid::new_v4(),
            completion: rx,
        })
    }
}

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Defaults with the optional phases and diagnosis switched off.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.scheduler.planning_enabled = false;
    config.scheduler.qa_enabled = false;
    config.crown.diagnosis_enabled = false;
    config
}

pub async fn sqlite_store() -> Arc<SqliteStore> {
    let pool = create_migrated_test_pool()
        .await
        .expect("failed to create test pool");
    Arc::new(SqliteStore::new(pool))
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub dispatcher: Arc<MockDispatcher>,
    pub runtime: SchedulerRuntime,
}

impl Harness {
    pub async fn new(config: &Config, dispatcher: MockDispatcher) -> Self {
        let store = sqlite_store().await;
        let dispatcher = Arc::new(dispatcher);
        let runtime = SchedulerRuntime::new(
            config,
            store.clone(),
            dispatcher.clone(),
            Arc::new(NullNotifier),
        );
        Self {
            store,
            dispatcher,
            runtime,
        }
    }
}

/// Drain already published events and return those of one kind.
pub fn drain_kind(rx: &mut broadcast::Receiver<SchedulerEvent>, kind: &str) -> Vec<SchedulerEvent> {
    let mut found = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.payload.kind() == kind {
            found.push(event);
        }
    }
    found
}
