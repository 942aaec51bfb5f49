use frontgate::config::ConfigSource;
use frontgate::supervisor::pool::{ChildProcessPool, WORKER_ID_ENV};
use frontgate::supervisor::Supervisor;
use frontgate::worker::server::{PKG_NAME, VERSION};
use frontgate::worker::{RestartHandle, Worker};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info};

const DEFAULT_CONFIG_SOURCE: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is the worker's message channel, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frontgate=debug".parse().expect("valid log directive")),
        )
        .init();

    match std::env::var(WORKER_ID_ENV) {
        Ok(id) => run_worker(id).await,
        Err(_) => run_supervisor().await,
    }
}

async fn run_supervisor() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let source = ConfigSource::parse(args.first().map(String::as_str).unwrap_or(DEFAULT_CONFIG_SOURCE));

    info!(name = PKG_NAME, version = VERSION, pid = std::process::id(), "Starting supervisor");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pool = ChildProcessPool::current_exe(events_tx)?.with_args(args);
    Supervisor::new(pool).run(source, events_rx).await
}

async fn run_worker(id: String) -> anyhow::Result<()> {
    info!(worker = %id, pid = std::process::id(), "Starting worker");

    let (restart, restart_rx) = RestartHandle::channel();
    spawn_signal_handlers(id.clone(), restart);

    let result = Worker::new(id.clone())
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), restart_rx)
        .await;

    // The blocking stdin reader would keep the runtime alive, so exit directly
    match result {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            error!(worker = %id, error = %format!("{:#}", e), "Worker failed");
            std::process::exit(1)
        }
    }
}

/// SIGHUP asks the supervisor for a pool restart; Ctrl+C is left to the supervisor
fn spawn_signal_handlers(id: String, restart: RestartHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(mut sighup) => {
                let id = id.clone();
                tokio::spawn(async move {
                    while sighup.recv().await.is_some() {
                        info!(worker = %id, "Received SIGHUP");
                        if !restart.request_restart() {
                            break;
                        }
                    }
                });
            }
            Err(e) => error!(worker = %id, error = %e, "Failed to install SIGHUP handler"),
        }
    }
    #[cfg(not(unix))]
    drop(restart);

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!(worker = %id, "Ignoring Ctrl+C, waiting for close from supervisor");
        }
    });
}
