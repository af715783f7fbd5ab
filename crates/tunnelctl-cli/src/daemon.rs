//! Daemon mode hosting the tunnel supervisor
//!
//! Opens the tunnel store, reconciles persisted state with live processes and
//! serves CLI requests over the IPC socket until Ctrl+C or a shutdown request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};
use tunnelctl_core::{
    CloudflareAuth, CloudflareProvider, CommandTemplate, JsonTunnelStore, NoopNotifier, Notifier,
    ProviderError, ProvisionedTunnel, Supervisor, SupervisorConfig, SupervisorDeps,
    SupervisorError, TunnelProvider, TunnelStore, WebhookNotifier,
};

use crate::config::{ConfigManager, TunnelctlConfig};
use crate::ipc::{IpcRequest, IpcResponse};

/// Stand-in provider used until credentials are configured
///
/// Local operations keep working; anything touching the remote API fails
/// with [`ProviderError::MissingCredentials`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredProvider;

#[async_trait]
impl TunnelProvider for UnconfiguredProvider {
    async fn provision(&self, _name: &str) -> Result<ProvisionedTunnel, ProviderError> {
        Err(ProviderError::MissingCredentials)
    }

    async fn deprovision(&self, _remote_id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::MissingCredentials)
    }

    async fn create_route(
        &self,
        _zone_id: &str,
        _remote_id: &str,
        _hostname: &str,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::MissingCredentials)
    }

    async fn delete_route(&self, _zone_id: &str, _hostname: &str) -> Result<usize, ProviderError> {
        Err(ProviderError::MissingCredentials)
    }
}

/// Cloudflare client for the configured credentials, if any
///
/// A token wins over a global key; a key needs the account email too.
pub fn cloudflare_provider(config: &TunnelctlConfig) -> Option<CloudflareProvider> {
    let auth = match (&config.api_token, &config.api_key, &config.email) {
        (Some(token), _, _) => CloudflareAuth::ApiToken(token.clone()),
        (None, Some(key), Some(email)) => CloudflareAuth::ApiKey {
            key: key.clone(),
            email: email.clone(),
        },
        _ => return None,
    };

    let provider = CloudflareProvider::new(auth);
    Some(match &config.account_id {
        Some(account_id) => provider.with_account_id(account_id.clone()),
        None => provider,
    })
}

pub fn build_provider(config: &TunnelctlConfig) -> Arc<dyn TunnelProvider> {
    match cloudflare_provider(config) {
        Some(provider) => Arc::new(provider),
        None => {
            warn!("No Cloudflare credentials configured; create, delete and dns-cleanup will fail");
            Arc::new(UnconfiguredProvider)
        }
    }
}

pub fn build_notifier(config: &TunnelctlConfig) -> Arc<dyn Notifier> {
    match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    }
}

/// Supervisor settings derived from the global config
pub fn supervisor_config(manager: &ConfigManager, config: &TunnelctlConfig) -> SupervisorConfig {
    let mut supervisor_config = SupervisorConfig::new(manager.configs_dir());
    supervisor_config.command = CommandTemplate::cloudflared(config.launcher());
    if let Some(grace) = config.restart_grace() {
        supervisor_config.restart_grace = grace;
    }
    if let Some(timeout) = config.probe_timeout() {
        supervisor_config.probe_timeout = timeout;
    }
    supervisor_config
}

/// Daemon owning one supervisor
pub struct Daemon {
    manager: ConfigManager,
    supervisor: Arc<Supervisor>,
}

impl Daemon {
    /// Build the supervisor from the config and store under the manager's home
    pub fn new(manager: ConfigManager) -> Result<Self> {
        let config = manager.load()?;
        let store = JsonTunnelStore::open(manager.tunnels_dir()).with_context(|| {
            format!("Failed to open tunnel store at {:?}", manager.tunnels_dir())
        })?;
        let store: Arc<dyn TunnelStore> = Arc::new(store);

        let supervisor = Supervisor::new(
            supervisor_config(&manager, &config),
            SupervisorDeps {
                store,
                provider: build_provider(&config),
                notifier: build_notifier(&config),
            },
        );

        Ok(Self {
            manager,
            supervisor,
        })
    }

    /// Wrap an already-built supervisor
    pub fn with_supervisor(manager: ConfigManager, supervisor: Arc<Supervisor>) -> Self {
        Self {
            manager,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Run the daemon until Ctrl+C or an IPC shutdown request
    #[cfg(unix)]
    pub async fn run(self) -> Result<()> {
        use crate::ipc::IpcServer;
        use tokio::sync::mpsc;

        info!("🚀 Daemon starting...");

        // A second daemon must fail here, before it touches any tunnel
        let server = IpcServer::bind_to(&self.manager.socket_path()).await?;
        info!("IPC server listening at {:?}", server.path());

        match self.supervisor.reconcile().await {
            Ok(report) => info!(
                "Reconciled tunnels: {} adopted, {} cleared, {} auto-started, {} failed",
                report.adopted.len(),
                report.cleared.len(),
                report.auto_started.len(),
                report.failed.len()
            ),
            Err(e) => warn!("Failed to reconcile tunnels: {}. Daemon will still run.", e),
        }

        info!("✅ Daemon ready");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                accepted = server.accept() => match accepted {
                    Ok(conn) => {
                        tokio::spawn(serve_connection(
                            conn,
                            self.supervisor.clone(),
                            shutdown_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("IPC accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested via IPC");
                    break;
                }
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
            }
        }

        self.supervisor.shutdown();
        info!("✅ Daemon stopped");
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn run(self) -> Result<()> {
        let _ = (&self.manager, &self.supervisor);
        anyhow::bail!("The tunnelctl daemon is only supported on Unix platforms")
    }
}

/// Answer requests on one connection until the client hangs up
#[cfg(unix)]
async fn serve_connection(
    mut conn: crate::ipc::IpcConnection,
    supervisor: Arc<Supervisor>,
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
) {
    loop {
        let request = match conn.recv().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                warn!("IPC recv error: {}", e);
                let response = IpcResponse::Error {
                    message: format!("{:#}", e),
                };
                let _ = conn.send(&response).await;
                return;
            }
        };

        let is_shutdown = request == IpcRequest::Shutdown;
        let response = handle_request(&supervisor, request).await;

        if let Err(e) = conn.send(&response).await {
            warn!("IPC send error: {}", e);
            return;
        }

        if is_shutdown {
            let _ = shutdown_tx.send(()).await;
            return;
        }
    }
}

fn error_response(e: SupervisorError) -> IpcResponse {
    IpcResponse::Error {
        message: e.to_string(),
    }
}

/// Map one IPC request onto the supervisor
///
/// Tunnels leave the daemon with their credentials redacted.
pub async fn handle_request(supervisor: &Supervisor, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::Pong,

        IpcRequest::List => match supervisor.list() {
            Ok(tunnels) => IpcResponse::Tunnels {
                tunnels: tunnels.iter().map(|t| t.redacted()).collect(),
            },
            Err(e) => error_response(e),
        },

        IpcRequest::Get { id } => match supervisor.get(&id) {
            Ok(tunnel) => IpcResponse::Tunnel {
                tunnel: tunnel.redacted(),
            },
            Err(e) => error_response(e),
        },

        IpcRequest::Create { definition } => match supervisor.create(definition).await {
            Ok(tunnel) => IpcResponse::Tunnel {
                tunnel: tunnel.redacted(),
            },
            Err(e) => error_response(e),
        },

        IpcRequest::Update { id, patch } => match supervisor.update(&id, patch).await {
            Ok(tunnel) => IpcResponse::Tunnel {
                tunnel: tunnel.redacted(),
            },
            Err(e) => error_response(e),
        },

        IpcRequest::Delete { ids } => IpcResponse::Bulk {
            results: supervisor.bulk_delete(&ids).await,
        },

        IpcRequest::Start { ids } => IpcResponse::Bulk {
            results: supervisor.bulk_start(&ids).await,
        },

        IpcRequest::Stop { ids } => IpcResponse::Bulk {
            results: supervisor.bulk_stop(&ids).await,
        },

        IpcRequest::Restart { id } => match supervisor.restart(&id).await {
            Ok(outcome) => IpcResponse::Ok {
                message: Some(format!("Restarted {} (pid {})", id, outcome.pid)),
            },
            Err(e) => error_response(e),
        },

        IpcRequest::Status { id } => match supervisor.status(&id).await {
            Ok(report) => IpcResponse::Status { report },
            Err(e) => error_response(e),
        },

        IpcRequest::Logs { id } => match supervisor.get(&id) {
            Ok(_) => IpcResponse::Logs {
                entries: supervisor.logs(&id),
            },
            Err(e) => error_response(e),
        },

        IpcRequest::Metrics { id } => match supervisor.metrics(&id) {
            Ok(snapshot) => IpcResponse::Metrics { snapshot },
            Err(e) => error_response(e),
        },

        IpcRequest::Shutdown => IpcResponse::Ok {
            message: Some("Daemon shutting down".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_credentials_fall_back() {
        let provider = build_provider(&TunnelctlConfig::default());
        let err = provider.provision("web").await.err().unwrap();
        assert!(matches!(err, ProviderError::MissingCredentials));
    }

    #[tokio::test]
    async fn test_key_without_email_is_unconfigured() {
        let config = TunnelctlConfig {
            api_key: Some("key".to_string()),
            ..Default::default()
        };
        let provider = build_provider(&config);
        let err = provider
            .delete_route("zone", "app.example.com")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::MissingCredentials));
    }

    #[test]
    fn test_supervisor_config_from_settings() {
        let manager = ConfigManager::at("/tmp/tctl");
        let config = TunnelctlConfig {
            cloudflared_path: Some("/opt/cloudflared".to_string()),
            restart_grace_ms: Some(250),
            probe_timeout_secs: Some(2),
            ..Default::default()
        };

        let supervisor_config = supervisor_config(&manager, &config);
        assert_eq!(supervisor_config.config_dir, manager.configs_dir());
        assert_eq!(supervisor_config.command.program, "/opt/cloudflared");
        assert_eq!(
            supervisor_config.restart_grace,
            std::time::Duration::from_millis(250)
        );
        assert_eq!(
            supervisor_config.probe_timeout,
            std::time::Duration::from_secs(2)
        );
    }
}
