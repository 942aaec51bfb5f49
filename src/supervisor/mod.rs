//! The master process: owns the configuration and keeps the worker pool at size
//!
//! All state lives on [`Supervisor`] and is mutated from a single task, one
//! event at a time. The worker-count and rolling-restart campaigns are stored
//! as explicit values; replacing a campaign is how its pending continuation is
//! deregistered.

pub mod campaign;
pub mod pool;

use crate::config::{ConfigSource, ConfigStore, PoolConfig};
use crate::protocol::{SupervisorMessage, WorkerMessage};
use crate::signals::{ControlSignal, Signals};
use campaign::{CampaignId, MaintainCampaign, RestartCampaign};
use pool::{ForkedWorker, PoolEvent, ProcessPool, WorkerId};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Extra time granted on shutdown beyond the workers' drain timeout
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

/// Supervisor-side handle to a live worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub pid: Option<u32>,
    /// The message channel is still open
    pub connected: bool,
    /// The worker reported listening on the configured port
    pub listening: bool,
    /// A close request has been sent
    pub closing: bool,
}

impl WorkerRecord {
    fn new(forked: ForkedWorker) -> Self {
        Self {
            id: forked.id,
            pid: forked.pid,
            connected: true,
            listening: false,
            closing: false,
        }
    }
}

pub struct Supervisor<P: ProcessPool> {
    pool: P,
    store: ConfigStore,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    maintain: Option<MaintainCampaign>,
    restart: Option<RestartCampaign>,
    next_campaign: u64,
    version: String,
    shutting_down: bool,
}

impl<P: ProcessPool> Supervisor<P> {
    pub fn new(pool: P) -> Self {
        Self {
            pool,
            store: ConfigStore::new(),
            workers: BTreeMap::new(),
            maintain: None,
            restart: None,
            next_campaign: 1,
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutting_down: false,
        }
    }

    /// Set the version tag stamped on distributed configuration (builder pattern)
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn config(&self) -> Option<&PoolConfig> {
        self.store.current()
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    /// Workers whose message channel is still open
    pub fn active_workers(&self) -> usize {
        self.workers.values().filter(|w| w.connected).count()
    }

    pub fn maintain_campaign(&self) -> Option<&MaintainCampaign> {
        self.maintain.as_ref()
    }

    pub fn restart_campaign(&self) -> Option<&RestartCampaign> {
        self.restart.as_ref()
    }

    fn next_campaign_id(&mut self) -> CampaignId {
        let id = CampaignId(self.next_campaign);
        self.next_campaign += 1;
        id
    }

    /// Apply the outcome of a configuration load
    pub fn apply_loaded(&mut self, result: anyhow::Result<PoolConfig>) {
        match result {
            Ok(config) => self.init(config),
            Err(e) => {
                error!(
                    error = %format!("{:#}", e),
                    active = self.active_workers(),
                    "Failed to load configuration; keeping current workers"
                );
            }
        }
    }

    /// Store a new configuration, then cold-start or roll the pool
    pub fn init(&mut self, mut config: PoolConfig) {
        config.version = Some(self.version.clone());
        info!(
            workers = config.worker_count(),
            port = config.port(),
            apps = config.apps.len(),
            version = %self.version,
            "Configuration applied"
        );
        self.store.replace(config);

        if self.active_workers() == 0 {
            self.maintain_worker_count();
        } else {
            self.restart_workers();
        }
    }

    /// Fork one worker and hand it the current configuration
    pub fn start_worker(&mut self) -> Option<WorkerId> {
        let config = match self.store.current() {
            Some(config) => config.clone(),
            None => {
                warn!("Cannot start a worker before configuration is loaded");
                return None;
            }
        };

        let forked = match self.pool.fork() {
            Ok(forked) => forked,
            Err(e) => {
                error!(error = %e, "Failed to fork worker");
                return None;
            }
        };

        self.workers.insert(forked.id, WorkerRecord::new(forked));

        let init = SupervisorMessage::Init {
            config: Box::new(config),
        };
        if let Err(e) = self.pool.send(forked.id, init) {
            warn!(worker = %forked.id, error = %e, "Failed to send init to worker");
        }

        Some(forked.id)
    }

    /// Start workers one at a time until the configured count is reached
    pub fn maintain_worker_count(&mut self) {
        if let Some(previous) = self.maintain.take() {
            debug!(campaign = %previous.id, "Deregistering previous worker-count campaign");
        }
        if self.shutting_down {
            return;
        }

        let Some(port) = self.store.port() else {
            warn!("No configuration loaded; waiting for reload");
            return;
        };
        let target = self.store.worker_count();
        let active = self.active_workers();
        if active >= target {
            debug!(active, target, "Worker count satisfied");
            return;
        }

        let id = self.next_campaign_id();
        info!(campaign = %id, active, target, "Starting workers");
        let pending = self.start_worker();
        self.maintain = Some(MaintainCampaign::new(id, pending, port));
    }

    fn advance_maintain(&mut self, worker: WorkerId, port: u16) {
        let Some(campaign) = self.maintain.as_ref() else {
            return;
        };
        if !campaign.accepts(worker, port) {
            return;
        }

        let campaign_id = campaign.id;
        let target = self.store.worker_count();
        let active = self.active_workers();
        if active < target && !self.shutting_down {
            debug!(campaign = %campaign_id, active, target, "Starting next worker");
            let pending = self.start_worker();
            if let Some(campaign) = self.maintain.as_mut() {
                campaign.pending = pending;
            }
        } else {
            info!(campaign = %campaign_id, active, target, "Worker count reached");
            self.maintain = None;
        }
    }

    /// Replace every active worker, one at a time
    pub fn restart_workers(&mut self) {
        let Some(config) = self.store.current() else {
            warn!("Cannot restart workers before configuration is loaded");
            return;
        };
        let target = config.worker_count();
        let port = config.port();

        let in_flight = self.restart.take().and_then(|previous| {
            info!(
                campaign = %previous.id,
                remaining = previous.queue.len(),
                "Superseding in-flight rolling restart"
            );
            previous.waiting
        });
        if self.shutting_down {
            return;
        }

        let queue: VecDeque<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.connected && !w.closing)
            .map(|w| w.id)
            .collect();
        if queue.is_empty() {
            debug!("No workers to restart");
            return;
        }

        let id = self.next_campaign_id();
        info!(campaign = %id, workers = queue.len(), target, "Starting rolling restart");
        let mut campaign = RestartCampaign::new(id, queue, target, port);

        // A worker is still draining: continue on its trigger, never close a second one now
        if let Some(trigger) = in_flight {
            debug!(campaign = %id, ?trigger, "Waiting for in-flight restart step");
            campaign.waiting = Some(trigger);
            self.restart = Some(campaign);
            return;
        }

        self.restart = Some(campaign);
        self.advance_restart();
    }

    fn advance_restart(&mut self) {
        loop {
            let Some(campaign) = self.restart.as_mut() else {
                return;
            };
            let campaign_id = campaign.id;
            let Some((worker, trigger)) = campaign.next_step() else {
                info!(campaign = %campaign_id, "Rolling restart complete");
                self.restart = None;
                return;
            };

            match self.workers.get_mut(&worker) {
                Some(record) if record.connected && !record.closing => {
                    record.closing = true;
                }
                _ => {
                    debug!(campaign = %campaign_id, worker = %worker, "Queued worker already gone");
                    continue;
                }
            }

            debug!(campaign = %campaign_id, worker = %worker, ?trigger, "Closing worker");
            if let Err(e) = self.pool.send(worker, SupervisorMessage::Close) {
                warn!(worker = %worker, error = %e, "Failed to send close to worker");
            }
            return;
        }
    }

    /// Dispatch a message received from a worker
    pub fn handle_message(&mut self, worker: WorkerId, message: WorkerMessage) {
        match message {
            WorkerMessage::NotifyDevmode => match self.store.clamp_workers(1) {
                Some(previous) if previous > 1 => {
                    warn!(worker = %worker, previous, "Worker runs in dev mode; limiting pool to one worker");
                }
                Some(_) => debug!(worker = %worker, "Dev mode already limits pool to one worker"),
                None => warn!(worker = %worker, "Dev mode notice before configuration was loaded"),
            },
            WorkerMessage::RestartPool => {
                info!(worker = %worker, "Worker requested a pool restart");
                self.restart_workers();
            }
            WorkerMessage::FatalError { error } => {
                error!(worker = %worker, error = %error, "Worker reported a fatal error");
            }
            WorkerMessage::Listening { address } => self.on_listening(worker, address.port),
            WorkerMessage::Unknown => {
                error!(worker = %worker, "Unrecognized worker message");
            }
        }
    }

    pub fn on_listening(&mut self, worker: WorkerId, port: u16) {
        let on_target_port = self.store.port() == Some(port);
        if let Some(record) = self.workers.get_mut(&worker) {
            record.listening = on_target_port;
        }
        info!(worker = %worker, port, "Worker listening");

        self.advance_maintain(worker, port);

        let continues_restart = self
            .restart
            .as_ref()
            .is_some_and(|campaign| campaign.fired_by_listening(port));
        if continues_restart && !self.shutting_down {
            self.advance_restart();
        }
    }

    pub fn on_disconnect(&mut self, worker: WorkerId) {
        if let Some(record) = self.workers.get_mut(&worker) {
            record.connected = false;
            debug!(worker = %worker, "Worker disconnected");
        }
    }

    /// Clean exits are replaced; crashes wait for the next reload or restart
    pub fn on_worker_exit(&mut self, worker: WorkerId, code: Option<i32>, signal: Option<i32>) {
        let pid = self.workers.remove(&worker).and_then(|record| record.pid);
        self.pool.release(worker);

        let clean = code == Some(0) && signal.is_none();
        if clean {
            info!(worker = %worker, ?pid, "Worker exited");
        } else {
            warn!(worker = %worker, ?pid, ?code, ?signal, "Worker crashed; not replacing it");
        }

        if self.shutting_down {
            return;
        }

        if clean {
            self.maintain_worker_count();
        }

        let continues_restart = self
            .restart
            .as_ref()
            .is_some_and(|campaign| campaign.fired_by_exit(worker));
        if continues_restart {
            self.advance_restart();
        }
    }

    pub fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Message(worker, message) => self.handle_message(worker, message),
            PoolEvent::Listening(worker, port) => self.on_listening(worker, port),
            PoolEvent::Disconnect(worker) => self.on_disconnect(worker),
            PoolEvent::Exit { id, code, signal } => self.on_worker_exit(id, code, signal),
        }
    }

    /// Stop replacing workers and ask every live worker to close
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        self.maintain = None;
        self.restart = None;

        let live: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.connected && !w.closing)
            .map(|w| w.id)
            .collect();
        info!(workers = live.len(), "Closing all workers");

        for worker in live {
            if let Some(record) = self.workers.get_mut(&worker) {
                record.closing = true;
            }
            if let Err(e) = self.pool.send(worker, SupervisorMessage::Close) {
                warn!(worker = %worker, error = %e, "Failed to send close to worker");
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Run the supervisor until SIGTERM or Ctrl+C; SIGHUP reloads configuration
    pub async fn run(
        mut self,
        source: ConfigSource,
        mut events: mpsc::UnboundedReceiver<PoolEvent>,
    ) -> anyhow::Result<()> {
        let mut signals = Signals::install()?;
        let (loaded_tx, mut loaded_rx) = mpsc::unbounded_channel();

        info!(source = %source, "Loading configuration");
        spawn_load(&source, &loaded_tx);

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                Some(result) = loaded_rx.recv() => self.apply_loaded(result),
                signal = signals.recv() => match signal {
                    ControlSignal::Reload => {
                        info!(source = %source, "Received SIGHUP, reloading configuration");
                        spawn_load(&source, &loaded_tx);
                    }
                    ControlSignal::Terminate => {
                        info!("Received shutdown signal");
                        break;
                    }
                },
            }
        }

        self.shutdown(&mut events).await;
        Ok(())
    }

    async fn shutdown(&mut self, events: &mut mpsc::UnboundedReceiver<PoolEvent>) {
        let grace = self
            .store
            .current()
            .map(|c| c.server.drain_timeout())
            .unwrap_or_default()
            + Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS);

        self.begin_shutdown();

        let drained = tokio::time::timeout(grace, async {
            while !self.workers.is_empty() {
                match events.recv().await {
                    Some(event) => self.handle_event(event),
                    None => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.workers.len(),
                grace_secs = grace.as_secs(),
                "Workers still running after grace period"
            );
        }
        info!("Supervisor stopped");
    }
}

/// Load configuration in the background; the result comes back through `tx`
fn spawn_load(source: &ConfigSource, tx: &mpsc::UnboundedSender<anyhow::Result<PoolConfig>>) {
    let source = source.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let _ = tx.send(source.load().await);
    });
}
