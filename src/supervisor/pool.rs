//! The process-forking facility the supervisor drives
//!
//! Workers are copies of the current binary started with
//! [`WORKER_ID_ENV`] set. Each worker gets a writer task feeding its stdin and
//! a reader task turning its stdout into [`PoolEvent`]s.

use crate::protocol::{self, SupervisorMessage, WorkerMessage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Environment variable that switches the binary into the worker role
pub const WORKER_ID_ENV: &str = "FRONTGATE_WORKER_ID";

/// Supervisor-assigned worker identity, unique for the life of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A freshly forked worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkedWorker {
    pub id: WorkerId,
    pub pid: Option<u32>,
}

/// Events the pool reports about its workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A worker sent a message
    Message(WorkerId, WorkerMessage),
    /// A worker's listener is bound on `port`
    Listening(WorkerId, u16),
    /// A worker's message channel closed
    Disconnect(WorkerId),
    /// A worker process exited
    Exit {
        id: WorkerId,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl PoolEvent {
    /// Translate an upstream message into the event the supervisor consumes
    pub fn from_message(id: WorkerId, message: WorkerMessage) -> Self {
        match message {
            WorkerMessage::Listening { address } => PoolEvent::Listening(id, address.port),
            other => PoolEvent::Message(id, other),
        }
    }

    pub fn exit(id: WorkerId, status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        PoolEvent::Exit {
            id,
            code: status.code(),
            signal,
        }
    }
}

/// Fork and message primitives the supervisor needs from the OS
pub trait ProcessPool {
    /// Start one worker process
    fn fork(&mut self) -> anyhow::Result<ForkedWorker>;

    /// Queue a message for a worker
    fn send(&mut self, id: WorkerId, message: SupervisorMessage) -> anyhow::Result<()>;

    /// Forget a worker that has exited
    fn release(&mut self, id: WorkerId);
}

/// Process pool backed by real child processes
pub struct ChildProcessPool {
    program: PathBuf,
    args: Vec<String>,
    next_id: u32,
    events: mpsc::UnboundedSender<PoolEvent>,
    channels: HashMap<WorkerId, mpsc::UnboundedSender<SupervisorMessage>>,
}

impl ChildProcessPool {
    /// Create a pool forking the current executable
    pub fn current_exe(events: mpsc::UnboundedSender<PoolEvent>) -> anyhow::Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, events))
    }

    pub fn new(program: PathBuf, events: mpsc::UnboundedSender<PoolEvent>) -> Self {
        Self {
            program,
            args: Vec::new(),
            next_id: 1,
            events,
            channels: HashMap::new(),
        }
    }

    /// Set arguments for forked workers (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl ProcessPool for ChildProcessPool {
    fn fork(&mut self) -> anyhow::Result<ForkedWorker> {
        let id = WorkerId(self.next_id);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.env(WORKER_ID_ENV, id.to_string());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        self.next_id += 1;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Worker {} has no stdin", id))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Worker {} has no stdout", id))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_channel(id, stdin, rx));
        tokio::spawn(read_channel(id, child, stdout, self.events.clone()));
        self.channels.insert(id, tx);

        info!(worker = %id, pid, "Worker process spawned");
        Ok(ForkedWorker { id, pid })
    }

    fn send(&mut self, id: WorkerId, message: SupervisorMessage) -> anyhow::Result<()> {
        let channel = self
            .channels
            .get(&id)
            .ok_or_else(|| anyhow::anyhow!("Unknown worker: {}", id))?;
        channel
            .send(message)
            .map_err(|_| anyhow::anyhow!("Worker {} channel closed", id))
    }

    fn release(&mut self, id: WorkerId) {
        self.channels.remove(&id);
    }
}

/// Forward queued messages to a worker's stdin; dropping the sender closes stdin
async fn write_channel(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<SupervisorMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = protocol::write_message(&mut stdin, &message).await {
            warn!(worker = %id, error = %e, "Failed to write to worker channel");
            break;
        }
    }
    debug!(worker = %id, "Worker channel writer finished");
}

/// Report a worker's messages, then its disconnect, then its exit
async fn read_channel(
    id: WorkerId,
    mut child: Child,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match protocol::decode::<WorkerMessage>(&line) {
                Ok(message) => {
                    let _ = events.send(PoolEvent::from_message(id, message));
                }
                Err(e) => {
                    warn!(worker = %id, error = %e, line = %line, "Undecodable worker message");
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(worker = %id, error = %e, "Failed to read worker channel");
                break;
            }
        }
    }

    let _ = events.send(PoolEvent::Disconnect(id));

    match child.wait().await {
        Ok(status) => {
            let _ = events.send(PoolEvent::exit(id, status));
        }
        Err(e) => {
            warn!(worker = %id, error = %e, "Failed to wait for worker exit");
            let _ = events.send(PoolEvent::Exit {
                id,
                code: None,
                signal: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ListenAddress;

    #[test]
    fn test_listening_message_becomes_listening_event() {
        let event = PoolEvent::from_message(
            WorkerId(3),
            WorkerMessage::Listening {
                address: ListenAddress { port: 8080 },
            },
        );
        assert_eq!(event, PoolEvent::Listening(WorkerId(3), 8080));

        let event = PoolEvent::from_message(WorkerId(3), WorkerMessage::NotifyDevmode);
        assert_eq!(event, PoolEvent::Message(WorkerId(3), WorkerMessage::NotifyDevmode));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_pool_reports_disconnect_then_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pool = ChildProcessPool::new(PathBuf::from("sh"), tx).with_args(vec![
            "-c".to_string(),
            "echo '{\"cmd\":\"listening\",\"address\":{\"port\":4000}}'; exit 3".to_string(),
        ]);

        let worker = pool.fork().unwrap();
        assert_eq!(worker.id, WorkerId(1));

        assert_eq!(rx.recv().await, Some(PoolEvent::Listening(WorkerId(1), 4000)));
        assert_eq!(rx.recv().await, Some(PoolEvent::Disconnect(WorkerId(1))));
        assert_eq!(
            rx.recv().await,
            Some(PoolEvent::Exit {
                id: WorkerId(1),
                code: Some(3),
                signal: None
            })
        );
    }

    #[test]
    fn test_send_to_unknown_worker_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pool = ChildProcessPool::new(PathBuf::from("true"), tx);
        let err = pool.send(WorkerId(9), SupervisorMessage::Close).unwrap_err();
        assert!(err.to_string().contains("Unknown worker"));
    }

    #[tokio::test]
    async fn test_fork_failure_is_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pool = ChildProcessPool::new(PathBuf::from("/nonexistent/frontgate"), tx);
        assert!(pool.fork().is_err());
        assert!(pool.channels.is_empty());
    }
}
