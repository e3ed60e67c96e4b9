//! Managed Worker - one worker process hosting the module
//!
//! The worker is spawned as `<program> <args..> <module path>` with:
//! - stdin carrying outbound protocol lines
//! - stdout decoded line by line into protocol messages
//! - stderr inherited, so module output reaches the terminal as-is
//! - a waiter that classifies the exit and reports it tagged with the
//!   spawn generation, so signals from a replaced worker can be told apart

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

use super::process::{self, ExitKind};
use crate::config::WorkerCommand;
use crate::protocol::{self, Inbound, Outbound, ProtocolError};

/// How long stdout may stay open after the worker exited.
/// A grandchild that inherited the pipe would otherwise hold it forever.
const STDOUT_DRAIN: Duration = Duration::from_millis(250);

/// Reports from a worker to its unit
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerSignal {
    Message { generation: u64, message: Inbound },
    Exited { generation: u64, crashed: bool },
}

impl WorkerSignal {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Message { generation, .. } | Self::Exited { generation, .. } => *generation,
        }
    }
}

/// Lifecycle of one worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Starting,
    Ready,
    Exited,
}

pub struct ManagedWorker {
    stdin_tx: mpsc::UnboundedSender<String>,
    pub pid: u32,
    ready: bool,
    stop_requested: Arc<AtomicBool>,
    running_rx: watch::Receiver<bool>,
}

impl ManagedWorker {
    /// Spawn a worker for the module at `module_path`.
    ///
    /// Everything the worker says, and finally its exit, is sent on `events`.
    pub fn spawn(
        command: &WorkerCommand,
        module_path: &Path,
        generation: u64,
        events: mpsc::UnboundedSender<WorkerSignal>,
    ) -> Result<Self> {
        let mut child = crate::utils::worker_command(command, module_path)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn worker '{}': {}", command.program, e))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned worker"))?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (running_tx, running_rx) = watch::channel(true);
        let stop_requested = Arc::new(AtomicBool::new(false));

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();

        // ── stdout reader ────────────────────────────────────
        let mut reader = {
            let events = events.clone();
            tokio::spawn(async move {
                let Some(stdout) = stdout else { return };
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match protocol::decode_line(&line) {
                        Ok(message) => {
                            if events.send(WorkerSignal::Message { generation, message }).is_err() {
                                break;
                            }
                        }
                        Err(ProtocolError::Empty) => {}
                        Err(e) => {
                            tracing::debug!("Ignoring non-protocol worker output ({}): {}", e, line)
                        }
                    }
                }
            })
        };

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin_handle) = stdin {
            tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    if stdin_handle.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let stop = stop_requested.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                // The pid is reaped: no stop request from here on can apply to it
                let stop_requested = stop.load(Ordering::SeqCst);
                let _ = running_tx.send(false);

                let crashed = match status {
                    Ok(status) => {
                        tracing::debug!("Worker (pid: {}) exited with {}", pid, status);
                        process::classify_exit(&status, stop_requested) == ExitKind::Crashed
                    }
                    Err(e) => {
                        tracing::warn!("Failed to wait for worker (pid: {}): {}", pid, e);
                        true
                    }
                };

                if tokio::time::timeout(STDOUT_DRAIN, &mut reader).await.is_err() {
                    tracing::debug!("Worker stdout still open after exit, detaching reader");
                    reader.abort();
                }
                let _ = events.send(WorkerSignal::Exited { generation, crashed });
            });
        }

        tracing::debug!("Worker started with PID {} (generation {})", pid, generation);

        Ok(Self {
            stdin_tx,
            pid,
            ready: false,
            stop_requested,
            running_rx,
        })
    }

    /// Record that the worker announced its module.
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn phase(&self) -> WorkerPhase {
        if !self.is_running() {
            WorkerPhase::Exited
        } else if self.ready {
            WorkerPhase::Ready
        } else {
            WorkerPhase::Starting
        }
    }

    /// Queue a message for the worker's stdin.
    pub fn send(&self, message: &Outbound) -> Result<()> {
        let line = protocol::encode_line(message)?;
        self.stdin_tx
            .send(line)
            .map_err(|_| anyhow::anyhow!("worker stdin closed"))
    }

    /// Ask the worker to stop. Its exit still arrives as a `WorkerSignal`.
    pub fn terminate(&self) {
        if !self.is_running() || self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = process::terminate(self.pid) {
            tracing::warn!("{}", e);
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Terminate and wait until the OS process is gone.
    pub async fn stop(&mut self) {
        self.terminate();
        self.wait_for_exit().await;
    }

    /// Wait until the process exits.
    pub async fn wait_for_exit(&mut self) {
        while self.is_running() {
            if self.running_rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::{InvocationOutcome, ModuleReady, ModuleType};
    use serde_json::json;
    use tempfile::TempDir;

    const ECHO_WORKER: &str = r#"echo '{"kind":"moduleReady","type":"function"}'
while IFS= read -r line; do
  id=${line#*\"correlationId\":}
  id=${id%%,*}
  printf '{"kind":"invocationResult","correlationId":%s,"result":{"error":false,"data":"pong"}}\n' "$id"
done
"#;

    fn script(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("module.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn sh() -> WorkerCommand {
        WorkerCommand {
            program: "sh".to_string(),
            args: Vec::new(),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<WorkerSignal>) -> WorkerSignal {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for worker")
            .expect("worker channel closed")
    }

    #[tokio::test]
    async fn test_ready_invoke_and_requested_stop() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, ECHO_WORKER);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = ManagedWorker::spawn(&sh(), &path, 3, tx).unwrap();
        assert_eq!(worker.phase(), WorkerPhase::Starting);

        assert_eq!(
            next(&mut rx).await,
            WorkerSignal::Message {
                generation: 3,
                message: Inbound::ModuleReady(ModuleReady {
                    module_type: ModuleType::Function,
                    body: None,
                }),
            }
        );

        worker.mark_ready();
        assert_eq!(worker.phase(), WorkerPhase::Ready);

        worker
            .send(&Outbound::Invoke { correlation_id: 11, args: vec![json!(1)] })
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            WorkerSignal::Message {
                generation: 3,
                message: Inbound::InvocationResult {
                    correlation_id: 11,
                    result: InvocationOutcome { error: false, data: json!("pong") },
                },
            }
        );

        worker.stop().await;
        assert_eq!(worker.phase(), WorkerPhase::Exited);
        assert!(worker.stop_requested());
        assert_eq!(next(&mut rx).await, WorkerSignal::Exited { generation: 3, crashed: false });
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_crash() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "echo 'booting'\nexit 1\n");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _worker = ManagedWorker::spawn(&sh(), &path, 0, tx).unwrap();

        // non-protocol output is skipped
        assert_eq!(next(&mut rx).await, WorkerSignal::Exited { generation: 0, crashed: true });
    }

    #[tokio::test]
    async fn test_clean_exit_without_stop() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "exit 0\n");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _worker = ManagedWorker::spawn(&sh(), &path, 1, tx).unwrap();
        assert_eq!(next(&mut rx).await, WorkerSignal::Exited { generation: 1, crashed: false });
    }

    #[tokio::test]
    async fn test_stop_after_signal_death_is_not_requested() {
        let dir = TempDir::new().unwrap();
        // the background sleep holds stdout open past the worker's death
        let path = script(&dir, "sleep 2 &\nkill -KILL $$\n");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = ManagedWorker::spawn(&sh(), &path, 5, tx).unwrap();

        // reported as soon as the pid is reaped, not once stdout drains
        tokio::time::timeout(Duration::from_millis(200), worker.wait_for_exit())
            .await
            .expect("exit not visible while stdout was still open");

        worker.terminate();
        assert!(!worker.stop_requested());
        assert_eq!(next(&mut rx).await, WorkerSignal::Exited { generation: 5, crashed: true });
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let command = WorkerCommand {
            program: "/nonexistent/hotmod-worker".to_string(),
            args: Vec::new(),
        };
        assert!(ManagedWorker::spawn(&command, Path::new("module.js"), 0, tx).is_err());
    }
}
