//! The worker process: one HTTP listener driven by supervisor messages
//!
//! A worker moves through `Uninitialized -> Listening -> Closing -> Terminated`.
//! `init` boots the listener, `close` drains it. Reports go upstream on the
//! same line-oriented channel.

pub mod proxy_protocol;
pub mod server;

use crate::config::PoolConfig;
use crate::protocol::{self, ListenAddress, SupervisorMessage, WorkerMessage};
use crate::session::identity::{HttpIdentityService, IdentityService};
use server::FrontendServer;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Listening,
    Closing,
    Terminated,
}

/// Lets in-process callers ask the supervisor for a rolling restart
#[derive(Debug, Clone)]
pub struct RestartHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl RestartHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Request a pool restart; false once the worker has stopped
    pub fn request_restart(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

struct RunningServer {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub struct Worker {
    id: String,
    state: WorkerState,
    identity: Option<Arc<dyn IdentityService>>,
    server: Option<RunningServer>,
}

impl Worker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: WorkerState::Uninitialized,
            identity: None,
            server: None,
        }
    }

    /// Use this identity service instead of the configured one (builder pattern)
    pub fn with_identity(mut self, identity: Arc<dyn IdentityService>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Serve supervisor messages from `input` until closed.
    ///
    /// End of input counts as `close`. A listener that fails to start is
    /// reported as `FATAL_ERROR` and returned as the error.
    pub async fn run<R, W>(
        mut self,
        input: R,
        mut output: W,
        mut restart_rx: mpsc::UnboundedReceiver<()>,
    ) -> anyhow::Result<WorkerState>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let message = match line {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => match protocol::decode::<SupervisorMessage>(&line) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(worker = %self.id, error = %e, "Undecodable supervisor message");
                                continue;
                            }
                        },
                        Ok(None) => {
                            info!(worker = %self.id, "Supervisor channel closed");
                            SupervisorMessage::Close
                        }
                        Err(e) => {
                            warn!(worker = %self.id, error = %e, "Failed to read supervisor channel");
                            SupervisorMessage::Close
                        }
                    };

                    match message {
                        SupervisorMessage::Init { config } => {
                            self.init(*config, &mut output).await?;
                        }
                        SupervisorMessage::Close => {
                            self.close().await;
                            return Ok(self.state);
                        }
                        SupervisorMessage::Unknown => {
                            warn!(worker = %self.id, "Ignoring unknown supervisor message");
                        }
                    }
                }
                Some(()) = restart_rx.recv() => {
                    info!(worker = %self.id, "Requesting pool restart");
                    send(&self.id, &mut output, &WorkerMessage::RestartPool).await;
                }
            }
        }
    }

    async fn init<W>(&mut self, config: PoolConfig, output: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.state != WorkerState::Uninitialized {
            warn!(worker = %self.id, state = ?self.state, "Ignoring repeated init");
            return Ok(());
        }

        match self.start_server(&config).await {
            Ok(port) => {
                self.state = WorkerState::Listening;
                // the pool must be clamped before it sees this worker listening
                if config.server.dev_mode {
                    send(&self.id, output, &WorkerMessage::NotifyDevmode).await;
                }
                send(
                    &self.id,
                    output,
                    &WorkerMessage::Listening {
                        address: ListenAddress { port },
                    },
                )
                .await;
                Ok(())
            }
            Err(e) => {
                error!(worker = %self.id, error = %e, "Failed to start listener");
                send(
                    &self.id,
                    output,
                    &WorkerMessage::FatalError {
                        error: format!("{:#}", e),
                    },
                )
                .await;
                self.state = WorkerState::Terminated;
                Err(e)
            }
        }
    }

    async fn start_server(&mut self, config: &PoolConfig) -> anyhow::Result<u16> {
        let identity = match self.identity {
            Some(ref identity) => Arc::clone(identity),
            None => Arc::new(HttpIdentityService::new(&config.identity)?),
        };

        let server = FrontendServer::bind(config, identity).await?;
        let port = server.local_addr().port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(shutdown_rx));
        self.server = Some(RunningServer { shutdown_tx, handle });
        Ok(port)
    }

    async fn close(&mut self) {
        let Some(server) = self.server.take() else {
            debug!(worker = %self.id, "Close before listening, terminating");
            self.state = WorkerState::Terminated;
            return;
        };

        self.state = WorkerState::Closing;
        info!(worker = %self.id, "Draining connections");
        let _ = server.shutdown_tx.send(true);
        match server.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker = %self.id, error = %e, "Listener stopped with error"),
            Err(e) => warn!(worker = %self.id, error = %e, "Listener task failed"),
        }
        self.state = WorkerState::Terminated;
        info!(worker = %self.id, "Worker terminated");
    }
}

/// Report upstream; a broken channel is logged, never fatal
async fn send<W>(id: &str, output: &mut W, message: &WorkerMessage)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = protocol::write_message(output, message).await {
        warn!(worker = %id, cmd = message.cmd(), error = %e, "Failed to report to supervisor");
    }
}
