//! Messages exchanged between the supervisor and its workers
//!
//! Every message is a JSON object tagged by its `cmd` field and travels as a
//! single line over the worker's stdin (supervisor to worker) or stdout
//! (worker to supervisor).

use crate::config::PoolConfig;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Messages sent by the supervisor to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum SupervisorMessage {
    /// Boot the HTTP listener with this configuration
    #[serde(rename = "init")]
    Init { config: Box<PoolConfig> },
    /// Drain open connections and exit
    #[serde(rename = "close")]
    Close,
    #[serde(other)]
    Unknown,
}

/// Address a worker reports once its listener is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenAddress {
    pub port: u16,
}

/// Messages sent by a worker to the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum WorkerMessage {
    /// The worker's listener is bound and accepting
    #[serde(rename = "listening")]
    Listening { address: ListenAddress },
    /// The worker runs in dev mode and cannot be clustered
    #[serde(rename = "NOTIFY_DEVMODE")]
    NotifyDevmode,
    /// The worker asks for a rolling restart of the whole pool
    #[serde(rename = "WORKER_WANTS_TO_RESTART_THE_POOL")]
    RestartPool,
    /// The worker failed in a way it cannot recover from
    #[serde(rename = "FATAL_ERROR")]
    FatalError { error: String },
    #[serde(other)]
    Unknown,
}

impl WorkerMessage {
    pub fn cmd(&self) -> &'static str {
        match self {
            WorkerMessage::Listening { .. } => "listening",
            WorkerMessage::NotifyDevmode => "NOTIFY_DEVMODE",
            WorkerMessage::RestartPool => "WORKER_WANTS_TO_RESTART_THE_POOL",
            WorkerMessage::FatalError { .. } => "FATAL_ERROR",
            WorkerMessage::Unknown => "unknown",
        }
    }
}

/// Decode one line of the channel
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> anyhow::Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Encode a message as a single newline-terminated line
pub fn encode<T: Serialize>(message: &T) -> anyhow::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Write one message and flush it
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode(message)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
