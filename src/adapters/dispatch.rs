//! Worker dispatcher that launches a configured executable per request.
//!
//! Task workers are started as `<command> <args..> task <task-id>` with the
//! task, agent and session ids in the environment. Diagnostic workers get
//! `<command> <args..> diagnose --model <model> --label <label>` and read the
//! prompt from stdin. The exit status decides success.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::DispatchConfig;
use crate::domain::ports::{
    DispatchFailure, DispatchHandle, SpawnRequest, WorkerDispatcher, WorkerOutcome,
};

/// Time a worker gets to exit after SIGTERM before it is abandoned.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Launches workers as child processes of the configured command.
pub struct CommandDispatcher {
    config: DispatchConfig,
}

impl CommandDispatcher {
    /// Create a dispatcher for the given `dispatch` config section.
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        cmd
    }

    fn start(&self, mut cmd: Command, stdin: Option<String>) -> Result<Child, DispatchFailure> {
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        let mut child = cmd.spawn().map_err(|e| {
            DispatchFailure::before_start(format!("failed to start {}: {e}", self.config.command))
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    warn!(error = %e, "failed to write worker stdin");
                }
            });
        }
        Ok(child)
    }

    fn watch(&self, child: Child, session_id: Uuid, limit: Duration) -> DispatchHandle {
        let (tx, rx) = oneshot::channel();
        let tail_bytes = self.config.output_tail_bytes;

        tokio::spawn(async move {
            let outcome = wait_for_outcome(child, limit, tail_bytes).await;
            debug!(%session_id, success = outcome.is_success(), "worker finished");
            let _ = tx.send(outcome);
        });

        DispatchHandle {
            session_id,
            completion: rx,
        }
    }
}

#[async_trait]
impl WorkerDispatcher for CommandDispatcher {
    async fn spawn(&self, request: SpawnRequest) -> Result<DispatchHandle, DispatchFailure> {
        let session_id = Uuid::new_v4();
        match request {
            SpawnRequest::Task { task_id, agent_id } => {
                let mut cmd = self.base_command();
                cmd.arg("task")
                    .arg(task_id.to_string())
                    .env("CROWN_TASK_ID", task_id.to_string())
                    .env("CROWN_AGENT_ID", agent_id.to_string())
                    .env("CROWN_SESSION_ID", session_id.to_string());
                let child = self.start(cmd, None)?;
                info!(%task_id, %agent_id, %session_id, pid = ?child.id(), "worker started");
                Ok(self.watch(
                    child,
                    session_id,
                    Duration::from_secs(self.config.task_timeout_secs),
                ))
            }
            SpawnRequest::Diagnostic {
                prompt,
                model,
                timeout_secs,
                label,
            } => {
                let mut cmd = self.base_command();
                cmd.args(["diagnose", "--model", &model, "--label", &label])
                    .env("CROWN_SESSION_ID", session_id.to_string());
                let child = self.start(cmd, Some(prompt))?;
                info!(%label, %session_id, "diagnostic worker started");
                Ok(self.watch(child, session_id, Duration::from_secs(timeout_secs)))
            }
        }
    }
}

async fn wait_for_outcome(mut child: Child, limit: Duration, tail_bytes: usize) -> WorkerOutcome {
    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(read_tail(pipe, tail_bytes)));
    let stderr = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(read_tail(pipe, tail_bytes)));

    let status = match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(?pid, limit_secs = limit.as_secs(), "worker exceeded time limit");
            terminate(pid);
            if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
                warn!(?pid, "worker ignored SIGTERM, abandoning it");
            }
            return WorkerOutcome::Failed {
                error: format!("timed out after {}s", limit.as_secs()),
                output: collect_tail(stdout, stderr, tail_bytes).await,
            };
        }
    };

    let output = collect_tail(stdout, stderr, tail_bytes).await;
    match status {
        Ok(status) if status.success() => WorkerOutcome::Succeeded { output },
        Ok(status) => WorkerOutcome::Failed {
            error: format!("worker exited with {status}"),
            output,
        },
        Err(e) => WorkerOutcome::Failed {
            error: format!("failed to wait for worker: {e}"),
            output: None,
        },
    }
}

/// Ring buffer holding the last `cap` bytes pushed into it.
struct TailBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(64 * 1024)),
            cap,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let bytes = &bytes[bytes.len().saturating_sub(self.cap)..];
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.cap);
        self.buf.drain(..overflow);
        self.buf.extend(bytes);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf.into()
    }
}

/// Drain a pipe to EOF, keeping only its last `cap` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut pipe: R, cap: usize) -> Vec<u8> {
    let mut tail = TailBuffer::new(cap);
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.push(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "worker output read failed");
                break;
            }
        }
    }
    tail.into_bytes()
}

async fn collect_tail(
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    max_bytes: usize,
) -> Option<String> {
    let mut text = String::new();
    for mut reader in [stdout, stderr].into_iter().flatten() {
        // A grandchild may keep the pipe open after the worker exits.
        match tokio::time::timeout(TERMINATE_GRACE, &mut reader).await {
            Ok(Ok(bytes)) => text.push_str(&String::from_utf8_lossy(&bytes)),
            Ok(Err(e)) => debug!(error = %e, "output reader failed"),
            Err(_) => reader.abort(),
        }
    }
    let text = tail(&text, max_bytes);
    (!text.trim().is_empty()).then(|| text.to_string())
}

#[cfg(unix)]
fn terminate(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!(pid = raw, error = %e, "failed to signal worker");
    }
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>) {}

/// Last `max_bytes` of `s`, cut on a char boundary.
pub(crate) fn tail(s: &str, max_bytes: usize) -> &str {
    let start = s.len().saturating_sub(max_bytes);
    let start = (start..=s.len())
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(s.len());
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("héllo", 4), "llo");
        assert_eq!(tail("", 4), "");
    }

    #[test]
    fn test_tail_buffer_keeps_last_bytes() {
        let mut buffer = TailBuffer::new(4);
        buffer.push(b"ab");
        buffer.push(b"cdef");
        assert_eq!(buffer.into_bytes(), b"cdef");

        let mut buffer = TailBuffer::new(4);
        buffer.push(b"0123456789");
        buffer.push(b"x");
        assert_eq!(buffer.into_bytes(), b"789x");

        let mut buffer = TailBuffer::new(0);
        buffer.push(b"dropped");
        assert!(buffer.into_bytes().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_before_start() {
        let dispatcher = CommandDispatcher::new(DispatchConfig {
            command: "/nonexistent/crown-worker".to_string(),
            ..DispatchConfig::default()
        });
        let err = dispatcher
            .spawn(SpawnRequest::Task {
                task_id: Uuid::new_v4(),
                agent_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert!(!err.started());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_decides_outcome() {
        let ok = CommandDispatcher::new(DispatchConfig {
            command: "true".to_string(),
            ..DispatchConfig::default()
        });
        let handle = ok
            .spawn(SpawnRequest::Task {
                task_id: Uuid::new_v4(),
                agent_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        assert!(handle.completion.await.unwrap().is_success());

        let failing = CommandDispatcher::new(DispatchConfig {
            command: "false".to_string(),
            ..DispatchConfig::default()
        });
        let handle = failing
            .spawn(SpawnRequest::Task {
                task_id: Uuid::new_v4(),
                agent_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        assert!(!handle.completion.await.unwrap().is_success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_output_is_cut_to_tail() {
        let dispatcher = CommandDispatcher::new(DispatchConfig {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "head -c 200000 /dev/zero | tr '\\0' a; printf END".to_string(),
            ],
            output_tail_bytes: 16,
            ..DispatchConfig::default()
        });
        let handle = dispatcher
            .spawn(SpawnRequest::Task {
                task_id: Uuid::new_v4(),
                agent_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        match handle.completion.await.unwrap() {
            WorkerOutcome::Succeeded { output: Some(output) } => {
                assert_eq!(output.len(), 16);
                assert!(output.ends_with("aaaEND"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
