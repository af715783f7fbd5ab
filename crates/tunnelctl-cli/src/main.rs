//! tunnelctl - supervise cloudflared tunnels from the command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnelctl_cli::config::{ConfigManager, TunnelctlConfig};
use tunnelctl_cli::ipc::{self, IpcRequest, IpcResponse};
use tunnelctl_cli::{backup, daemon};
use tunnelctl_core::{
    Environment, HealthCheckConfig, JsonTunnelStore, Service, TunnelDefinition, TunnelPatch,
    TunnelProvider,
};

/// Manage cloudflared tunnels through a local supervisor daemon
#[derive(Parser, Debug)]
#[command(name = "tunnelctl")]
#[command(about = "Supervise cloudflared tunnels", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the supervisor daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// Provision a tunnel, route its hostname and save it
    Create {
        /// Tunnel name
        name: String,
        /// DNS zone id the hostname belongs to
        #[arg(long)]
        zone: String,
        /// Public hostname
        #[arg(long)]
        hostname: String,
        /// Local port the hostname forwards to
        #[arg(short, long)]
        port: u16,
        /// Extra route, `/path=PORT` or `host.example.com=PORT` (repeatable)
        #[arg(long = "service", value_parser = parse_service)]
        services: Vec<Service>,
        /// production, staging or development
        #[arg(long, default_value = "production")]
        env: Environment,
        /// Probe the local port and restart on failure
        #[arg(long)]
        health_check: bool,
        /// Probe interval in seconds
        #[arg(long, default_value = "30")]
        health_interval: u64,
        /// Probe path
        #[arg(long, default_value = "/")]
        health_path: String,
        /// Don't restart after a crash or failed probe
        #[arg(long)]
        no_auto_restart: bool,
        /// Start with the daemon
        #[arg(long)]
        auto_startup: bool,
    },
    /// Change a tunnel's settings (restarts it if running)
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        zone: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Replace the extra routes (repeatable)
        #[arg(long = "service", value_parser = parse_service)]
        services: Vec<Service>,
        /// Remove every extra route
        #[arg(long, conflicts_with = "services")]
        clear_services: bool,
        #[arg(long)]
        env: Option<Environment>,
        #[arg(long)]
        health_check: Option<bool>,
        #[arg(long)]
        health_interval: Option<u64>,
        #[arg(long)]
        health_path: Option<String>,
        #[arg(long)]
        auto_restart: Option<bool>,
        #[arg(long)]
        auto_startup: Option<bool>,
    },
    /// Stop, unroute and deprovision tunnels
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Start tunnels
    Start {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Stop tunnels
    Stop {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Stop and start a tunnel
    Restart { id: String },
    /// Show whether a tunnel's process is alive
    Status { id: String },
    /// List all tunnels
    List,
    /// Show tunnel details
    Show { id: String },
    /// Show recent output of a tunnel's process
    Logs {
        id: String,
        /// Only the last N lines
        #[arg(short = 'n', long)]
        tail: Option<usize>,
    },
    /// Show uptime metrics
    Metrics { id: String },
    /// Check the launcher binary, credentials and daemon
    Doctor,
    /// Write every tunnel record, credentials included, as JSON
    Export {
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Restore tunnel records from an export
    Import {
        file: PathBuf,
        /// Replace tunnels whose id already exists
        #[arg(long)]
        overwrite: bool,
    },
    /// Remove DNS routes for a hostname
    DnsCleanup {
        #[arg(long)]
        zone: String,
        #[arg(long)]
        hostname: String,
    },
    /// Manage global CLI configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum DaemonCommands {
    /// Start daemon in foreground
    Start,
    /// Check daemon status
    Status,
    /// Ask the daemon to exit (tunnel processes keep running)
    Stop,
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigCommands {
    /// Show the configuration with secrets masked
    Show,
    /// Use a Cloudflare API token
    SetToken { token: String },
    /// Use a Cloudflare global API key
    SetApiKey { key: String, email: String },
    /// Pin the Cloudflare account id (discovered automatically otherwise)
    SetAccount { account_id: Option<String> },
    /// Set or clear the notification webhook URL
    SetWebhook { url: Option<String> },
    /// Set or clear the cloudflared binary path
    SetLauncher { path: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let manager = ConfigManager::new()?;

    match cli.command {
        Commands::Daemon { command } => handle_daemon_command(&manager, command).await,
        Commands::Create {
            name,
            zone,
            hostname,
            port,
            services,
            env,
            health_check,
            health_interval,
            health_path,
            no_auto_restart,
            auto_startup,
        } => {
            let definition = TunnelDefinition {
                services,
                environment: env,
                health_check: HealthCheckConfig {
                    enabled: health_check,
                    interval: health_interval,
                    path: health_path,
                },
                auto_restart: !no_auto_restart,
                auto_startup,
                ..TunnelDefinition::new(name, zone, hostname, port)
            };
            let tunnel = expect_tunnel(request(&manager, IpcRequest::Create { definition }).await?)?;
            println!("✅ Tunnel '{}' created", tunnel.name);
            println!("   ID: {}", tunnel.id);
            println!("   Hostname: https://{}", tunnel.hostname);
            println!("   Start it with: tunnelctl start {}", tunnel.id);
            Ok(())
        }
        Commands::Update {
            id,
            name,
            zone,
            hostname,
            port,
            services,
            clear_services,
            env,
            health_check,
            health_interval,
            health_path,
            auto_restart,
            auto_startup,
        } => {
            let health_check = if health_check.is_some()
                || health_interval.is_some()
                || health_path.is_some()
            {
                let current = expect_tunnel(request(&manager, IpcRequest::Get { id: id.clone() }).await?)?;
                let mut config = current.health_check;
                if let Some(enabled) = health_check {
                    config.enabled = enabled;
                }
                if let Some(interval) = health_interval {
                    config.interval = interval;
                }
                if let Some(path) = health_path {
                    config.path = path;
                }
                Some(config)
            } else {
                None
            };

            let services = if clear_services {
                Some(Vec::new())
            } else if services.is_empty() {
                None
            } else {
                Some(services)
            };

            let patch = TunnelPatch {
                name,
                zone_id: zone,
                hostname,
                port,
                services,
                environment: env,
                health_check,
                auto_restart,
                auto_startup,
            };
            if patch.is_empty() {
                anyhow::bail!("Nothing to update; pass at least one option");
            }

            let tunnel = expect_tunnel(request(&manager, IpcRequest::Update { id, patch }).await?)?;
            println!("✅ Tunnel '{}' updated", tunnel.name);
            Ok(())
        }
        Commands::Delete { ids } => bulk(&manager, "Deleted", IpcRequest::Delete { ids }).await,
        Commands::Start { ids } => bulk(&manager, "Started", IpcRequest::Start { ids }).await,
        Commands::Stop { ids } => bulk(&manager, "Stopped", IpcRequest::Stop { ids }).await,
        Commands::Restart { id } => match request(&manager, IpcRequest::Restart { id }).await? {
            IpcResponse::Ok { message } => {
                println!("✅ {}", message.unwrap_or_else(|| "Restarted".to_string()));
                Ok(())
            }
            other => unexpected(other),
        },
        Commands::Status { id } => match request(&manager, IpcRequest::Status { id }).await? {
            IpcResponse::Status { report } => {
                println!("{} ({})", report.name, report.id);
                println!("   Status: {}", report.status);
                if let Some(pid) = report.pid {
                    let owner = if report.managed { "managed" } else { "adopted" };
                    println!("   PID: {} ({})", pid, owner);
                }
                println!("   Hostname: {}", report.hostname);
                println!("   Port: {}", report.port);
                Ok(())
            }
            other => unexpected(other),
        },
        Commands::List => match request(&manager, IpcRequest::List).await? {
            IpcResponse::Tunnels { tunnels } => {
                ipc::print_tunnel_table(&tunnels);
                Ok(())
            }
            other => unexpected(other),
        },
        Commands::Show { id } => {
            let tunnel = expect_tunnel(request(&manager, IpcRequest::Get { id }).await?)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&tunnel).context("Failed to format tunnel")?
            );
            Ok(())
        }
        Commands::Logs { id, tail } => match request(&manager, IpcRequest::Logs { id }).await? {
            IpcResponse::Logs { entries } => {
                let skip = tail.map_or(0, |n| entries.len().saturating_sub(n));
                for entry in entries.iter().skip(skip) {
                    println!(
                        "{} {:<5} {}",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.level,
                        entry.message
                    );
                }
                Ok(())
            }
            other => unexpected(other),
        },
        Commands::Metrics { id } => match request(&manager, IpcRequest::Metrics { id }).await? {
            IpcResponse::Metrics { snapshot } => {
                println!("   Uptime: {}", ipc::format_duration(snapshot.uptime_ms / 1000));
                println!("   Uptime %: {:.2}", snapshot.uptime_percentage);
                println!("   Requests: {}", snapshot.metrics.requests);
                println!("   Errors: {}", snapshot.metrics.errors);
                println!("   Bandwidth: {} bytes", snapshot.metrics.bandwidth);
                if let Some(last) = snapshot.metrics.last_request {
                    println!("   Last request: {}", last.to_rfc3339());
                }
                Ok(())
            }
            other => unexpected(other),
        },
        Commands::Doctor => handle_doctor(&manager).await,
        Commands::Export { output } => {
            let store = JsonTunnelStore::open(manager.tunnels_dir())?;
            let json = backup::export(&store)?;
            match output {
                Some(path) => {
                    write_private(&path, &json)?;
                    println!("✅ Exported tunnels to {}", path.display());
                }
                None => println!("{}", json),
            }
            Ok(())
        }
        Commands::Import { file, overwrite } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let store = JsonTunnelStore::open(manager.tunnels_dir())?;
            let report = backup::import(&store, &json, overwrite)?;

            for id in &report.imported {
                println!("✅ Imported {}", id);
            }
            for id in &report.skipped {
                println!("⏭  Skipped {} (already exists, use --overwrite)", id);
            }
            for (id, reason) in &report.rejected {
                println!("❌ {}: {}", id, reason);
            }
            Ok(())
        }
        Commands::DnsCleanup { zone, hostname } => {
            let config = manager.load()?;
            let provider = daemon::cloudflare_provider(&config)
                .context("No Cloudflare credentials configured (tunnelctl config set-token)")?;
            let deleted = provider.delete_route(&zone, &hostname).await?;
            println!("✅ Removed {} DNS record(s) for {}", deleted, hostname);
            Ok(())
        }
        Commands::Config { command } => handle_config_command(&manager, command),
    }
}

async fn handle_daemon_command(manager: &ConfigManager, command: DaemonCommands) -> Result<()> {
    match command {
        DaemonCommands::Start => {
            info!("Starting daemon...");
            daemon::Daemon::new(manager.clone())?.run().await
        }
        DaemonCommands::Status => {
            match ipc::send_request(&manager.socket_path(), &IpcRequest::Ping).await {
                Ok(IpcResponse::Pong) => println!("● Daemon is running"),
                Ok(other) => println!("⚠️  Unexpected daemon response: {:?}", other),
                Err(_) => println!("○ Daemon is not running"),
            }
            Ok(())
        }
        DaemonCommands::Stop => match request(manager, IpcRequest::Shutdown).await? {
            IpcResponse::Ok { .. } => {
                println!("✅ Daemon stopping");
                Ok(())
            }
            other => unexpected(other),
        },
    }
}

async fn handle_doctor(manager: &ConfigManager) -> Result<()> {
    let config = manager.load()?;
    let launcher = config.launcher();

    match tokio::process::Command::new(launcher)
        .arg("--version")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            println!("✅ Launcher: {}", version.trim());
        }
        Ok(output) => println!(
            "❌ Launcher '{}' exited with {}: {}",
            launcher,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => println!("❌ Launcher '{}' could not be run: {}", launcher, e),
    }

    match daemon::cloudflare_provider(&config) {
        Some(provider) => match provider.verify().await {
            Ok(account_id) => println!("✅ Cloudflare credentials valid (account {})", account_id),
            Err(e) => println!("❌ Cloudflare credentials rejected: {}", e),
        },
        None => println!("⚠️  No Cloudflare credentials configured"),
    }

    match ipc::send_request(&manager.socket_path(), &IpcRequest::Ping).await {
        Ok(IpcResponse::Pong) => println!("✅ Daemon is running"),
        _ => println!("⚠️  Daemon is not running (tunnelctl daemon start)"),
    }

    Ok(())
}

fn handle_config_command(manager: &ConfigManager, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config: TunnelctlConfig = manager.load()?.redacted();
            println!("📌 {}", manager.config_path().display());
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to format config")?
            );
        }
        ConfigCommands::SetToken { token } => {
            manager.set_token(token)?;
            println!("✅ API token saved to {}", manager.config_path().display());
        }
        ConfigCommands::SetApiKey { key, email } => {
            manager.set_api_key(key, email)?;
            println!("✅ API key saved to {}", manager.config_path().display());
        }
        ConfigCommands::SetAccount { account_id } => {
            manager.set_account(account_id)?;
            println!("✅ Account updated");
        }
        ConfigCommands::SetWebhook { url } => {
            manager.set_webhook(url)?;
            println!("✅ Webhook updated");
        }
        ConfigCommands::SetLauncher { path } => {
            manager.set_launcher(path)?;
            println!("✅ Launcher updated");
        }
    }
    println!("   Restart the daemon for changes to take effect");
    Ok(())
}

/// Send one request, turning an error response into an error
async fn request(manager: &ConfigManager, req: IpcRequest) -> Result<IpcResponse> {
    match ipc::send_request(&manager.socket_path(), &req).await? {
        IpcResponse::Error { message } => anyhow::bail!(message),
        response => Ok(response),
    }
}

async fn bulk(manager: &ConfigManager, action: &str, req: IpcRequest) -> Result<()> {
    match request(manager, req).await? {
        IpcResponse::Bulk { results } => {
            ipc::print_bulk_results(action, &results);
            if results.iter().any(|r| !r.success) {
                std::process::exit(1);
            }
            Ok(())
        }
        other => unexpected(other),
    }
}

fn expect_tunnel(response: IpcResponse) -> Result<tunnelctl_core::Tunnel> {
    match response {
        IpcResponse::Tunnel { tunnel } => Ok(tunnel),
        other => unexpected(other),
    }
}

fn unexpected<T>(response: IpcResponse) -> Result<T> {
    anyhow::bail!("Unexpected daemon response: {:?}", response)
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {}", path.display()))?;
    }
    Ok(())
}

/// Parse `/path=PORT` or `host.example.com=PORT`
fn parse_service(s: &str) -> Result<Service, String> {
    let (target, port) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("Invalid service '{}' (expected /path=PORT or host=PORT)", s))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("Invalid port in service '{}'", s))?;

    if target.is_empty() {
        return Err(format!("Missing path or hostname in service '{}'", s));
    }
    if target.starts_with('/') {
        Ok(Service::path(target, port))
    } else {
        Ok(Service::hostname(target, port))
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
