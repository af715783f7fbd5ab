//! Periodic local health probes
//!
//! Each registered tunnel gets its own timer task. A failing probe asks the
//! supervisor for a restart over the event channel and then ends; the restart
//! registers a fresh timer for the new instance.

use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{HealthStatus, Tunnel};
use crate::store::TunnelStore;
use crate::supervisor::SupervisorEvent;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Any status below 500
    Healthy(u16),
    /// 5xx response
    Unhealthy(u16),
    /// Transport failure or timeout
    Unreachable(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy(_))
    }

    fn health_status(&self) -> HealthStatus {
        if self.is_healthy() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeOutcome::Healthy(code) => write!(f, "healthy (HTTP {})", code),
            ProbeOutcome::Unhealthy(code) => write!(f, "unhealthy (HTTP {})", code),
            ProbeOutcome::Unreachable(e) => write!(f, "unreachable ({})", e),
        }
    }
}

/// GET `http://localhost:<port><path>` with the tunnel hostname as `Host`
pub async fn probe_once(client: &Client, tunnel: &Tunnel, timeout: Duration) -> ProbeOutcome {
    let url = format!(
        "http://localhost:{}{}",
        tunnel.port, tunnel.health_check.path
    );

    let result = client
        .get(&url)
        .header(reqwest::header::HOST, &tunnel.hostname)
        .timeout(timeout)
        .send()
        .await;

    match result {
        Ok(response) => {
            let code = response.status().as_u16();
            if code < 500 {
                ProbeOutcome::Healthy(code)
            } else {
                ProbeOutcome::Unhealthy(code)
            }
        }
        Err(e) => ProbeOutcome::Unreachable(e.to_string()),
    }
}

type Timers = Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>;

fn lock(timers: &Timers) -> std::sync::MutexGuard<'_, HashMap<String, (u64, CancellationToken)>> {
    match timers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct HealthProber {
    client: Client,
    store: Arc<dyn TunnelStore>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    timers: Timers,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(
        store: Arc<dyn TunnelStore>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            store,
            events,
            timers: Arc::default(),
            timeout,
        }
    }

    /// Start the timer for one instance generation, replacing any existing one
    ///
    /// Tunnels without health checks enabled only have their old timer
    /// cancelled.
    pub fn register(&self, tunnel: &Tunnel, generation: u64) {
        self.cancel(&tunnel.id);
        if !tunnel.health_check.enabled {
            return;
        }

        let token = CancellationToken::new();
        lock(&self.timers).insert(tunnel.id.clone(), (generation, token.clone()));

        let probe = ProbeTask {
            client: self.client.clone(),
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            timers: Arc::clone(&self.timers),
            timeout: self.timeout,
            tunnel: tunnel.clone(),
            generation,
            token,
        };
        debug!(
            "Health check registered for {} every {}s (generation {})",
            tunnel.id, tunnel.health_check.interval, generation
        );
        tokio::spawn(probe.run());
    }

    pub fn cancel(&self, id: &str) {
        if let Some((_, token)) = lock(&self.timers).remove(id) {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in lock(&self.timers).drain() {
            token.cancel();
        }
    }

    /// Generation the current timer for `id` was registered with
    #[cfg(test)]
    fn registered_generation(&self, id: &str) -> Option<u64> {
        lock(&self.timers).get(id).map(|(generation, _)| *generation)
    }
}

struct ProbeTask {
    client: Client,
    store: Arc<dyn TunnelStore>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    timers: Timers,
    timeout: Duration,
    tunnel: Tunnel,
    generation: u64,
    token: CancellationToken,
}

impl ProbeTask {
    async fn run(self) {
        let period = Duration::from_secs(self.tunnel.health_check.interval.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = probe_once(&self.client, &self.tunnel, self.timeout).await;
            if self.token.is_cancelled() {
                break;
            }

            let checked_at = Utc::now();
            let status = outcome.health_status();
            let current = match self.store.update(&self.tunnel.id, &mut |t| {
                t.stats.last_health_check = Some(checked_at);
                t.stats.health_status = status;
            }) {
                Ok(Some(tunnel)) => tunnel,
                Ok(None) => {
                    debug!("Tunnel {} no longer exists, ending health check", self.tunnel.id);
                    break;
                }
                Err(e) => {
                    warn!("Failed to persist health status for {}: {}", self.tunnel.id, e);
                    self.tunnel.clone()
                }
            };

            let wants_restart = match &outcome {
                ProbeOutcome::Healthy(_) => false,
                ProbeOutcome::Unhealthy(_) => current.auto_restart,
                ProbeOutcome::Unreachable(_) => current.auto_restart && current.is_running(),
            };

            if !outcome.is_healthy() {
                warn!(
                    "[{}] Health check {}",
                    self.tunnel.name, outcome
                );
            }

            if wants_restart {
                info!(
                    "Requesting restart of {} after failed health check",
                    self.tunnel.id
                );
                let _ = self.events.send(SupervisorEvent::RestartRequested {
                    id: self.tunnel.id.clone(),
                    generation: self.generation,
                    reason: outcome.to_string(),
                });
                break;
            }
        }

        let mut timers = lock(&self.timers);
        if matches!(timers.get(&self.tunnel.id), Some((generation, _)) if *generation == self.generation)
        {
            timers.remove(&self.tunnel.id);
        }
    }
}
