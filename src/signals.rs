//! OS control signals shared by both process roles

/// What an incoming signal asks the process to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGHUP
    Reload,
    /// SIGTERM or Ctrl+C
    Terminate,
}

pub struct Signals {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    pub fn install() -> anyhow::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                hangup: signal(SignalKind::hangup())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    pub async fn recv(&mut self) -> ControlSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.hangup.recv() => ControlSignal::Reload,
                _ = self.terminate.recv() => ControlSignal::Terminate,
                _ = tokio::signal::ctrl_c() => ControlSignal::Terminate,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            ControlSignal::Terminate
        }
    }
}
