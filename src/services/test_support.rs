//! Scripted dispatcher shared by the service unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::domain::ports::{
    DispatchFailure, DispatchHandle, SpawnRequest, WorkerDispatcher, WorkerOutcome,
};

#[derive(Debug, Clone)]
pub enum Script {
    /// Start and never finish
    Hang,
    Succeed(Option<String>),
    Fail(String),
    FailBeforeStart(String),
    FailAfterStart(String),
}

#[derive(Default)]
pub struct ScriptedDispatcher {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<SpawnRequest>>,
    held: Mutex<Vec<oneshot::Sender<WorkerOutcome>>>,
}

impl ScriptedDispatcher {
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
impl WorkerDispatcher for ScriptedDispatcher {
    async fn spawn(&self, request: SpawnRequest) -> Result<DispatchHandle, DispatchFailure> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script::Hang);
        let session_id = Uuid::new_v4();
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
            Script::FailAfterStart(error) => {
                return Err(DispatchFailure::after_start(session_id, error))
            }
        }
        Ok(DispatchHandle {
            session_id,
            completion: rx,
        })
    }
}
