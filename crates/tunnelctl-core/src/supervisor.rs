//! Process lifecycle supervisor
//!
//! The supervisor owns the registry of running instances and is the only
//! writer of a tunnel's run state. Every mutating operation on one tunnel id
//! runs under that id's async lock; different ids proceed concurrently.
//!
//! Process exits and restart requests from the health prober arrive as
//! [`SupervisorEvent`]s tagged with the instance generation they refer to.
//! Events for a generation that is no longer registered are ignored, which
//! makes them safe to race with explicit stops and restarts.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::health::{HealthProber, DEFAULT_PROBE_TIMEOUT};
use crate::logs::{LogEntry, LogLevel, LogSink};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::model::{Tunnel, TunnelDefinition, TunnelPatch, TunnelStats, TunnelStatus};
use crate::notify::{self, Notifier, TunnelEvent};
use crate::process::{self, CommandTemplate};
use crate::provider::TunnelProvider;
use crate::render::ConfigRenderer;
use crate::store::TunnelStore;
use crate::validation;

type Result<T> = std::result::Result<T, SupervisorError>;

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory for rendered routing documents and credential bundles
    pub config_dir: PathBuf,
    pub command: CommandTemplate,
    /// Pause between stop and start during a restart
    pub restart_grace: Duration,
    /// How long a process gets after SIGTERM before it is killed
    pub stop_timeout: Duration,
    pub probe_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            command: CommandTemplate::default(),
            restart_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// External collaborators
pub struct SupervisorDeps {
    pub store: Arc<dyn TunnelStore>,
    pub provider: Arc<dyn TunnelProvider>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The process of one instance generation exited
    Exited {
        id: String,
        generation: u64,
        code: Option<i32>,
    },
    /// The health prober wants an instance restarted
    ///
    /// Generation 0 refers to an adopted process.
    RestartRequested {
        id: String,
        generation: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOutcome {
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatusReport {
    pub id: String,
    pub name: String,
    pub status: TunnelStatus,
    pub pid: Option<u32>,
    pub port: u16,
    pub hostname: String,
    /// Whether this supervisor holds a direct handle to the process
    pub managed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Running processes taken over without a handle
    pub adopted: Vec<String>,
    /// Records whose process was gone
    pub cleared: Vec<String>,
    pub auto_started: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkResult {
    fn from_result<T>(id: &str, result: Result<T>) -> Self {
        match result {
            Ok(_) => Self {
                id: id.to_string(),
                success: true,
                error: None,
            },
            Err(e) => Self {
                id: id.to_string(),
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Live handle to a spawned process
struct Instance {
    generation: u64,
    pid: u32,
    started_at: DateTime<Utc>,
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Instance {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

pub struct Supervisor {
    config: SupervisorConfig,
    store: Arc<dyn TunnelStore>,
    provider: Arc<dyn TunnelProvider>,
    notifier: Arc<dyn Notifier>,
    renderer: ConfigRenderer,
    logs: Arc<LogSink>,
    metrics: MetricsRecorder,
    prober: HealthProber,
    instances: Mutex<HashMap<String, Instance>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Supervisor {
    /// Build a supervisor and spawn its event loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SupervisorConfig, deps: SupervisorDeps) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let prober = HealthProber::new(
            Arc::clone(&deps.store),
            events.clone(),
            config.probe_timeout,
        );

        let supervisor = Arc::new(Self {
            renderer: ConfigRenderer::new(config.config_dir.clone()),
            config,
            store: deps.store,
            provider: deps.provider,
            notifier: deps.notifier,
            logs: Arc::new(LogSink::new()),
            metrics: MetricsRecorder::new(),
            prober,
            instances: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            events,
        });

        tokio::spawn(Self::run_events(Arc::downgrade(&supervisor), rx));
        supervisor
    }

    async fn run_events(
        supervisor: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };
            // Handlers wait for the id lock, so they must not block the loop
            tokio::spawn(async move {
                match event {
                    SupervisorEvent::Exited {
                        id,
                        generation,
                        code,
                    } => supervisor.handle_exit(&id, generation, code).await,
                    SupervisorEvent::RestartRequested {
                        id,
                        generation,
                        reason,
                    } => {
                        supervisor
                            .handle_restart_request(&id, generation, &reason)
                            .await
                    }
                }
            });
        }
        debug!("Supervisor event loop stopped");
    }

    /// Demote a tunnel whose process exited on its own
    async fn handle_exit(&self, id: &str, generation: u64, code: Option<i32>) {
        let _lock = self.lock_id(id).await;
        {
            let mut instances = guard(&self.instances);
            match instances.get(id) {
                Some(instance) if instance.generation == generation => {
                    instances.remove(id);
                }
                _ => {
                    debug!(
                        "Ignoring exit of {} generation {} (no longer current)",
                        id, generation
                    );
                    return;
                }
            }
        }

        warn!("Tunnel {} exited unexpectedly (code {:?})", id, code);
        self.metrics.stop(id);
        self.prober.cancel(id);

        match self.store.update(id, &mut |t| t.mark_stopped()) {
            Ok(Some(tunnel)) => self.emit(TunnelEvent::Crashed, tunnel),
            Ok(None) => {}
            Err(e) => error!("Failed to record exit of {}: {}", id, e),
        }
    }

    async fn handle_restart_request(&self, id: &str, generation: u64, reason: &str) {
        let _lock = self.lock_id(id).await;

        let current = guard(&self.instances)
            .get(id)
            .filter(|instance| instance.is_live())
            .map(|instance| instance.generation);
        let tunnel = match self.store.load(id) {
            Ok(Some(tunnel)) => tunnel,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to load {} for restart: {}", id, e);
                return;
            }
        };

        let adopted = generation == 0 && current.is_none() && tunnel.is_running();
        if current != Some(generation) && !adopted {
            debug!(
                "Skipping stale restart request for {} generation {}",
                id, generation
            );
            return;
        }

        warn!("Restarting {} after failed health check: {}", tunnel.name, reason);
        self.logs.append(
            id,
            LogLevel::Warning,
            format!("Health check failed ({}), restarting", reason),
        );
        self.emit(TunnelEvent::HealthFailed, tunnel);

        if let Err(e) = self.restart_locked(id).await {
            error!("Auto-restart of {} failed: {}", id, e);
        }
    }

    fn emit(&self, event: TunnelEvent, tunnel: Tunnel) {
        notify::dispatch(&self.notifier, event, tunnel);
    }

    async fn lock_id(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(guard(&self.locks).entry(id.to_string()).or_default());
        lock.lock_owned().await
    }

    fn find_tunnel(&self, id: &str) -> Result<Tunnel> {
        self.store
            .load(id)?
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// Load under the id lock, forgetting the lock if the id is unknown
    ///
    /// The map entry is only dropped when the caller's guard is its sole
    /// other owner; waiters keep it alive.
    fn load_tunnel(&self, id: &str) -> Result<Tunnel> {
        let result = self.find_tunnel(id);
        if let Err(SupervisorError::NotFound(_)) = &result {
            let mut locks = guard(&self.locks);
            if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) <= 2) {
                locks.remove(id);
            }
        }
        result
    }

    fn managed_pid(&self, id: &str) -> Option<u32> {
        guard(&self.instances)
            .get(id)
            .filter(|instance| instance.is_live())
            .map(|instance| instance.pid)
    }

    /// Live handle, or a persisted pid that still refers to a live process
    fn is_live(&self, tunnel: &Tunnel) -> bool {
        self.managed_pid(&tunnel.id).is_some()
            || tunnel
                .pid
                .is_some_and(|pid| process::is_alive(pid, tunnel.pid_fingerprint))
    }

    // ------------------------------------------------------------------
    // Definition management
    // ------------------------------------------------------------------

    /// Validate, provision, route, render and persist a new tunnel
    pub async fn create(&self, definition: TunnelDefinition) -> Result<Tunnel> {
        let mut tunnel = Tunnel {
            id: format!("tunnel_{}", Uuid::new_v4().simple()),
            name: definition.name,
            zone_id: definition.zone_id,
            remote_id: String::new(),
            hostname: definition.hostname,
            port: definition.port,
            services: definition.services,
            environment: definition.environment,
            health_check: definition.health_check,
            auto_restart: definition.auto_restart,
            auto_startup: definition.auto_startup,
            status: TunnelStatus::Stopped,
            pid: None,
            pid_fingerprint: None,
            stats: TunnelStats::default(),
            credentials: Default::default(),
            created_at: Utc::now(),
            updated_at: None,
        };
        validation::validate_tunnel(&tunnel)?;

        let provisioned = self.provider.provision(&tunnel.name).await?;
        tunnel.remote_id = provisioned.remote_id;
        tunnel.credentials = provisioned.credentials;

        if let Err(e) = self
            .provider
            .create_route(&tunnel.zone_id, &tunnel.remote_id, &tunnel.hostname)
            .await
        {
            error!("Failed to route {}: {}", tunnel.hostname, e);
            self.rollback_remote(&tunnel, false).await;
            return Err(e.into());
        }

        let persisted = self
            .renderer
            .render(&tunnel)
            .map_err(SupervisorError::from)
            .and_then(|_| self.store.save(&tunnel).map_err(SupervisorError::from));
        if let Err(e) = persisted {
            error!("Failed to persist tunnel {}: {}", tunnel.name, e);
            if let Err(cleanup) = self.renderer.remove(&tunnel.id) {
                warn!("Failed to remove artifacts of {}: {}", tunnel.id, cleanup);
            }
            self.rollback_remote(&tunnel, true).await;
            return Err(e);
        }

        info!(
            "Created tunnel {} ({}) for {}",
            tunnel.name, tunnel.id, tunnel.hostname
        );
        Ok(tunnel)
    }

    async fn rollback_remote(&self, tunnel: &Tunnel, routed: bool) {
        if routed {
            if let Err(e) = self
                .provider
                .delete_route(&tunnel.zone_id, &tunnel.hostname)
                .await
            {
                warn!("Failed to remove route for {}: {}", tunnel.hostname, e);
            }
        }
        if let Err(e) = self.provider.deprovision(&tunnel.remote_id).await {
            warn!(
                "Failed to clean up remote tunnel {}: {}",
                tunnel.remote_id, e
            );
        }
    }

    /// Merge `patch`, re-render, and restart the tunnel if it is running
    pub async fn update(&self, id: &str, patch: TunnelPatch) -> Result<Tunnel> {
        let _lock = self.lock_id(id).await;
        let existing = self.load_tunnel(id)?;

        let mut merged = existing.clone();
        merged.apply_patch(&patch);
        validation::validate_tunnel(&merged)?;
        self.renderer.render(&merged)?;

        let now = Utc::now();
        let saved = self
            .store
            .update(id, &mut |t| {
                t.apply_patch(&patch);
                t.updated_at = Some(now);
            })?
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        info!("Updated tunnel {} ({})", saved.name, id);

        if self.is_live(&saved) {
            info!("Restarting {} with new configuration", saved.name);
            self.restart_locked(id).await?;
            return self.load_tunnel(id);
        }
        Ok(saved)
    }

    /// Tear down a tunnel and everything that belongs to it
    ///
    /// Only a failed stop aborts; remote and artifact cleanup failures are
    /// logged and the record is removed anyway.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let lock = self.lock_id(id).await;
        let tunnel = self.load_tunnel(id)?;

        if tunnel.is_running() || self.is_live(&tunnel) {
            self.stop_locked(id).await?;
        }

        match self
            .provider
            .delete_route(&tunnel.zone_id, &tunnel.hostname)
            .await
        {
            Ok(count) => info!("Deleted {} DNS record(s) for {}", count, tunnel.hostname),
            Err(e) => warn!("Error deleting DNS record for {}: {}", tunnel.hostname, e),
        }
        if let Err(e) = self.provider.deprovision(&tunnel.remote_id).await {
            warn!("Error deleting remote tunnel {}: {}", tunnel.remote_id, e);
        }
        if let Err(e) = self.renderer.remove(id) {
            warn!("Error deleting config files for {}: {}", id, e);
        }

        self.prober.cancel(id);
        self.logs.clear(id);
        self.metrics.forget(id);
        self.store.remove(id)?;

        drop(lock);
        guard(&self.locks).remove(id);

        info!("Deleted tunnel {} ({})", tunnel.name, id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self, id: &str) -> Result<StartOutcome> {
        let _lock = self.lock_id(id).await;
        self.start_locked(id).await
    }

    async fn start_locked(&self, id: &str) -> Result<StartOutcome> {
        let tunnel = self.load_tunnel(id)?;

        {
            let mut instances = guard(&self.instances);
            if let Some(instance) = instances.get(id) {
                if instance.is_live() {
                    return Err(SupervisorError::AlreadyRunning(id.to_string()));
                }
                instances.remove(id);
            }
        }
        if let Some(pid) = tunnel.pid {
            if process::is_alive(pid, tunnel.pid_fingerprint) {
                return Err(SupervisorError::AlreadyRunning(id.to_string()));
            }
        }

        let paths = self.renderer.render(&tunnel)?;
        let mut child = self
            .config
            .command
            .command(&tunnel, &paths)
            .spawn()
            .map_err(|e| {
                SupervisorError::Process(format!(
                    "Failed to spawn {}: {}",
                    self.config.command.program, e
                ))
            })?;
        let pid = child.id().ok_or_else(|| {
            SupervisorError::Process("Process exited before its pid was known".to_string())
        })?;
        let fingerprint = process::start_fingerprint(pid);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        info!("[{}] Starting tunnel {} (pid {})", tunnel.name, id, pid);
        self.logs
            .append(id, LogLevel::Info, format!("Tunnel started with pid {}", pid));

        if let Some(stdout) = child.stdout.take() {
            self.pump_output(stdout, OutputStream::Stdout, &tunnel);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump_output(stderr, OutputStream::Stderr, &tunnel);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let task = tokio::spawn(watch_process(
            child,
            kill_rx,
            WatchContext {
                id: id.to_string(),
                name: tunnel.name.clone(),
                generation,
                logs: Arc::clone(&self.logs),
                events: self.events.clone(),
                stop_timeout: self.config.stop_timeout,
            },
        ));
        guard(&self.instances).insert(
            id.to_string(),
            Instance {
                generation,
                pid,
                started_at: Utc::now(),
                kill_tx: Some(kill_tx),
                task,
            },
        );

        let started_at = Utc::now();
        let persisted = self.store.update(id, &mut |t| {
            t.mark_running(pid, fingerprint);
            t.stats.last_started = Some(started_at);
            t.stats.restart_count += 1;
        });
        let running = match persisted {
            Ok(Some(tunnel)) => tunnel,
            Ok(None) => {
                self.abort_instance(id).await;
                return Err(SupervisorError::NotFound(id.to_string()));
            }
            Err(e) => {
                error!("Failed to record start of {}: {}", id, e);
                self.abort_instance(id).await;
                return Err(e.into());
            }
        };

        self.metrics.start(id);
        self.prober.register(&running, generation);
        self.emit(TunnelEvent::Started, running);

        Ok(StartOutcome { pid })
    }

    fn pump_output<R>(&self, reader: R, stream: OutputStream, tunnel: &Tunnel)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logs = Arc::clone(&self.logs);
        let id = tunnel.id.clone();
        let name = tunnel.name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                let level = match stream {
                    OutputStream::Stdout => LogLevel::Info,
                    OutputStream::Stderr => LogLevel::classify_stderr(&line),
                };
                match level {
                    LogLevel::Error => error!("[{}] {}", name, line),
                    LogLevel::Warning => warn!("[{}] {}", name, line),
                    LogLevel::Info => debug!("[{}] {}", name, line),
                }
                logs.append(&id, level, line);
            }
        });
    }

    /// Drop and terminate the instance for `id`, if any
    async fn abort_instance(&self, id: &str) {
        let instance = guard(&self.instances).remove(id);
        if let Some(instance) = instance {
            self.terminate_instance(id, instance).await;
        }
    }

    async fn terminate_instance(&self, id: &str, mut instance: Instance) {
        let uptime = Utc::now() - instance.started_at;
        debug!(
            "Terminating {} (pid {}, up {}s)",
            id,
            instance.pid,
            uptime.num_seconds()
        );

        if let Some(kill_tx) = instance.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        let grace = self.config.stop_timeout + Duration::from_secs(2);
        match tokio::time::timeout(grace, &mut instance.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Supervising task for {} failed: {}", id, e),
            Err(_) => warn!("Timed out waiting for {} to exit", id),
        }
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let _lock = self.lock_id(id).await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: &str) -> Result<()> {
        let tunnel = self.load_tunnel(id)?;

        let instance = guard(&self.instances).remove(id);
        if let Some(instance) = instance {
            self.terminate_instance(id, instance).await;
            info!("Stopped tunnel {} via process handle", tunnel.name);
        } else if let Some(pid) = tunnel.pid {
            if process::is_alive(pid, tunnel.pid_fingerprint) {
                self.kill_pid(pid, tunnel.pid_fingerprint).await?;
                info!("Stopped tunnel {} via pid {}", tunnel.name, pid);
            } else {
                debug!("Tunnel {} process {} not running", tunnel.name, pid);
            }
        }

        let stopped = self
            .store
            .update(id, &mut |t| t.mark_stopped())?
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;

        self.metrics.stop(id);
        self.prober.cancel(id);
        self.logs.append(id, LogLevel::Info, "Tunnel stopped");
        self.emit(TunnelEvent::Stopped, stopped);
        Ok(())
    }

    /// SIGTERM a process we have no handle for, escalating to SIGKILL
    async fn kill_pid(&self, pid: u32, fingerprint: Option<u64>) -> Result<()> {
        process::terminate(pid).map_err(|e| {
            SupervisorError::Process(format!("Failed to signal process {}: {}", pid, e))
        })?;
        if process::wait_for_exit(pid, fingerprint, self.config.stop_timeout).await {
            return Ok(());
        }

        warn!("Process {} ignored SIGTERM, sending SIGKILL", pid);
        process::force_kill(pid).map_err(|e| {
            SupervisorError::Process(format!("Failed to kill process {}: {}", pid, e))
        })?;
        if process::wait_for_exit(pid, fingerprint, Duration::from_secs(2)).await {
            Ok(())
        } else {
            Err(SupervisorError::Process(format!(
                "Process {} is still alive after SIGKILL",
                pid
            )))
        }
    }

    pub async fn restart(&self, id: &str) -> Result<StartOutcome> {
        let _lock = self.lock_id(id).await;
        self.restart_locked(id).await
    }

    async fn restart_locked(&self, id: &str) -> Result<StartOutcome> {
        self.stop_locked(id).await?;
        tokio::time::sleep(self.config.restart_grace).await;
        self.start_locked(id).await
    }

    /// Authoritative liveness, repairing the record if the process is gone
    pub async fn status(&self, id: &str) -> Result<TunnelStatusReport> {
        let _lock = self.lock_id(id).await;
        let tunnel = self.load_tunnel(id)?;

        let report = |status, pid, managed| TunnelStatusReport {
            id: tunnel.id.clone(),
            name: tunnel.name.clone(),
            status,
            pid,
            port: tunnel.port,
            hostname: tunnel.hostname.clone(),
            managed,
        };

        if let Some(pid) = self.managed_pid(id) {
            return Ok(report(TunnelStatus::Running, Some(pid), true));
        }

        if let Some(pid) = tunnel.pid {
            if process::is_alive(pid, tunnel.pid_fingerprint) {
                return Ok(report(TunnelStatus::Running, Some(pid), false));
            }
        }

        if tunnel.is_running() || tunnel.pid.is_some() {
            info!("Tunnel {} process is gone, marking stopped", tunnel.name);
            let stopped = self.store.update(id, &mut |t| t.mark_stopped())?;
            // The exit event for this instance arrives stale after removal
            let exited = guard(&self.instances).remove(id).is_some();
            self.metrics.stop(id);
            self.prober.cancel(id);
            if let (true, Some(stopped)) = (exited, stopped) {
                self.emit(TunnelEvent::Crashed, stopped);
            }
        }
        Ok(report(TunnelStatus::Stopped, None, false))
    }

    /// Rebuild run state from persisted records, then auto-start
    ///
    /// Runs once when the daemon boots. Per-tunnel failures are logged and
    /// reported, never propagated; records that fail to repair are not
    /// auto-started.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for tunnel in self.store.load_all()? {
            let _lock = self.lock_id(&tunnel.id).await;
            if self.managed_pid(&tunnel.id).is_some() {
                continue;
            }

            let outcome = match tunnel.pid {
                Some(pid) if process::is_alive(pid, tunnel.pid_fingerprint) => {
                    let fingerprint = tunnel.pid_fingerprint;
                    self.store
                        .update(&tunnel.id, &mut |t| t.mark_running(pid, fingerprint))
                        .map(|adopted| {
                            if let Some(adopted) = adopted {
                                info!("Adopted running tunnel {} (pid {})", adopted.name, pid);
                                self.metrics.start(&adopted.id);
                                self.prober.register(&adopted, 0);
                                report.adopted.push(adopted.id);
                            }
                        })
                }
                Some(pid) => {
                    info!(
                        "Tunnel {} process {} is gone, marking stopped",
                        tunnel.name, pid
                    );
                    self.clear_run_state(&tunnel.id, &mut report)
                }
                None if tunnel.is_running() => self.clear_run_state(&tunnel.id, &mut report),
                None => Ok(()),
            };

            if let Err(e) = outcome {
                error!("Failed to reconcile {}: {}", tunnel.name, e);
                report.failed.push(tunnel.id.clone());
            }
        }

        for tunnel in self.store.load_all()? {
            if report.failed.contains(&tunnel.id) {
                continue;
            }
            if !tunnel.auto_startup || tunnel.is_running() {
                continue;
            }
            match self.start(&tunnel.id).await {
                Ok(outcome) => {
                    info!("Auto-started {} (pid {})", tunnel.name, outcome.pid);
                    report.auto_started.push(tunnel.id);
                }
                Err(e) => {
                    error!("Failed to auto-start {}: {}", tunnel.name, e);
                    report.failed.push(tunnel.id);
                }
            }
        }

        info!(
            "Reconciled: {} adopted, {} cleared, {} auto-started, {} failed",
            report.adopted.len(),
            report.cleared.len(),
            report.auto_started.len(),
            report.failed.len()
        );
        Ok(report)
    }

    fn clear_run_state(
        &self,
        id: &str,
        report: &mut ReconcileReport,
    ) -> std::result::Result<(), crate::store::StoreError> {
        self.store.update(id, &mut |t| t.mark_stopped())?;
        report.cleared.push(id.to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------

    pub async fn bulk_start(&self, ids: &[String]) -> Vec<BulkResult> {
        join_all(ids.iter().map(|id| async move {
            BulkResult::from_result(id, self.start(id).await)
        }))
        .await
    }

    pub async fn bulk_stop(&self, ids: &[String]) -> Vec<BulkResult> {
        join_all(ids.iter().map(|id| async move {
            BulkResult::from_result(id, self.stop(id).await)
        }))
        .await
    }

    pub async fn bulk_delete(&self, ids: &[String]) -> Vec<BulkResult> {
        join_all(ids.iter().map(|id| async move {
            BulkResult::from_result(id, self.delete(id).await)
        }))
        .await
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn list(&self) -> Result<Vec<Tunnel>> {
        Ok(self.store.load_all()?)
    }

    pub fn get(&self, id: &str) -> Result<Tunnel> {
        self.find_tunnel(id)
    }

    pub fn logs(&self, id: &str) -> Vec<LogEntry> {
        self.logs.read(id)
    }

    pub fn metrics(&self, id: &str) -> Result<MetricsSnapshot> {
        let tunnel = self.find_tunnel(id)?;
        Ok(self.metrics.snapshot(id, Some(tunnel.created_at)))
    }

    /// Stop health probing; running processes are left for the next daemon
    pub fn shutdown(&self) {
        self.prober.cancel_all();
        let managed = guard(&self.instances).len();
        info!(
            "Supervisor shutting down, leaving {} managed tunnel(s) running",
            managed
        );
    }
}

struct WatchContext {
    id: String,
    name: String,
    generation: u64,
    logs: Arc<LogSink>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    stop_timeout: Duration,
}

/// Wait for the child to exit (or be told to kill it) and report the exit
async fn watch_process(mut child: Child, mut kill_rx: oneshot::Receiver<()>, ctx: WatchContext) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => terminate_child(&mut child, ctx.stop_timeout, &ctx.name).await,
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("[{}] Failed to wait for process: {}", ctx.name, e);
            None
        }
    };
    let code_text = code.map_or_else(|| "none".to_string(), |c| c.to_string());
    info!("[{}] Tunnel exited with code {}", ctx.name, code_text);
    ctx.logs.append(
        &ctx.id,
        LogLevel::Info,
        format!("Tunnel exited with code {}", code_text),
    );

    let _ = ctx.events.send(SupervisorEvent::Exited {
        id: ctx.id,
        generation: ctx.generation,
        code,
    });
}

async fn terminate_child(
    child: &mut Child,
    timeout: Duration,
    name: &str,
) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        if let Err(e) = process::terminate(pid) {
            debug!("[{}] SIGTERM failed ({}), killing", name, e);
            child.start_kill()?;
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("[{}] Did not exit after {:?}, killing", name, timeout);
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use crate::provider::{ProviderError, ProvisionedTunnel};
    use crate::store::MemoryTunnelStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    type ProviderResult<T> = std::result::Result<T, ProviderError>;

    struct OfflineProvider;

    #[async_trait]
    impl TunnelProvider for OfflineProvider {
        async fn provision(&self, _name: &str) -> ProviderResult<ProvisionedTunnel> {
            Err(ProviderError::MissingCredentials)
        }

        async fn deprovision(&self, _remote_id: &str) -> ProviderResult<()> {
            Err(ProviderError::MissingCredentials)
        }

        async fn create_route(
            &self,
            _zone_id: &str,
            _remote_id: &str,
            _hostname: &str,
        ) -> ProviderResult<()> {
            Err(ProviderError::MissingCredentials)
        }

        async fn delete_route(&self, _zone_id: &str, _hostname: &str) -> ProviderResult<usize> {
            Err(ProviderError::MissingCredentials)
        }
    }

    fn offline_supervisor(dir: &TempDir) -> Arc<Supervisor> {
        Supervisor::new(
            SupervisorConfig::new(dir.path()),
            SupervisorDeps {
                store: Arc::new(MemoryTunnelStore::new()),
                provider: Arc::new(OfflineProvider),
                notifier: Arc::new(NoopNotifier),
            },
        )
    }

    fn is_not_found<T>(result: Result<T>) -> bool {
        matches!(result, Err(SupervisorError::NotFound(_)))
    }

    #[tokio::test]
    async fn test_unknown_ids_leave_no_locks() {
        let dir = TempDir::new().unwrap();
        let supervisor = offline_supervisor(&dir);

        for i in 0..20 {
            let id = format!("tunnel_missing{}", i);
            assert!(is_not_found(supervisor.start(&id).await));
            assert!(is_not_found(supervisor.stop(&id).await));
            assert!(is_not_found(supervisor.restart(&id).await));
            assert!(is_not_found(supervisor.status(&id).await));
            assert!(is_not_found(supervisor.delete(&id).await));
            assert!(is_not_found(
                supervisor.update(&id, TunnelPatch::default()).await
            ));
        }

        assert!(guard(&supervisor.locks).is_empty());
    }

    #[tokio::test]
    async fn test_waiting_callers_keep_the_lock_entry() {
        let dir = TempDir::new().unwrap();
        let supervisor = offline_supervisor(&dir);

        let held = supervisor.lock_id("tunnel_missing").await;
        let waiter = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.stop("tunnel_missing").await })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // The holder sees NotFound while someone is still queued
        assert!(is_not_found(supervisor.load_tunnel("tunnel_missing")));
        assert!(guard(&supervisor.locks).contains_key("tunnel_missing"));

        drop(held);
        assert!(is_not_found(waiter.await.unwrap()));
        assert!(guard(&supervisor.locks).is_empty());
    }

    #[test]
    fn test_bulk_result_from_result() {
        let ok = BulkResult::from_result("tunnel_a", Ok::<_, SupervisorError>(()));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = BulkResult::from_result::<()>(
            "tunnel_b",
            Err(SupervisorError::NotFound("tunnel_b".to_string())),
        );
        assert!(!failed.success);
        assert!(failed.error.unwrap().contains("tunnel_b"));
    }
}
