//! IPC (Inter-Process Communication) module for daemon-CLI communication
//!
//! The daemon listens on a Unix domain socket and the CLI connects to it.
//! Each message is one JSON document terminated by a newline.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tunnelctl_core::{
    BulkResult, LogEntry, MetricsSnapshot, Tunnel, TunnelDefinition, TunnelPatch,
    TunnelStatusReport,
};

#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// IPC request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Ping to check if daemon is alive
    Ping,

    List,

    Get { id: String },

    Create { definition: TunnelDefinition },

    Update { id: String, patch: TunnelPatch },

    /// Delete several tunnels; each id reports its own result
    Delete { ids: Vec<String> },

    Start { ids: Vec<String> },

    Stop { ids: Vec<String> },

    Restart { id: String },

    Status { id: String },

    Logs { id: String },

    Metrics { id: String },

    /// Shutdown the daemon (tunnel processes keep running)
    Shutdown,
}

/// IPC response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Pong response to ping
    Pong,

    /// Success acknowledgment
    Ok { message: Option<String> },

    /// Error response
    Error { message: String },

    /// A single tunnel with credentials redacted
    Tunnel { tunnel: Tunnel },

    Tunnels { tunnels: Vec<Tunnel> },

    Status { report: TunnelStatusReport },

    Logs { entries: Vec<LogEntry> },

    Metrics { snapshot: MetricsSnapshot },

    /// Per-id outcome of a bulk operation
    Bulk { results: Vec<BulkResult> },
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
/// IPC client for CLI to connect to daemon
pub struct IpcClient {
    stream: BufReader<UnixStream>,
}

#[cfg(unix)]
impl IpcClient {
    /// Connect to the daemon socket
    pub async fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.with_context(|| {
            format!(
                "Failed to connect to daemon socket at {:?}. Is `tunnelctl daemon` running?",
                path
            )
        })?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send a request and receive a response
    pub async fn request(&mut self, req: &IpcRequest) -> Result<IpcResponse> {
        let mut json = serde_json::to_string(req)?;
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send request")?;

        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush request")?;

        let mut response_line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut response_line)
            .await
            .context("Failed to read response")?;

        if bytes_read == 0 {
            anyhow::bail!("Daemon closed the connection");
        }

        let response: IpcResponse =
            serde_json::from_str(&response_line).context("Failed to parse response")?;

        Ok(response)
    }
}

#[cfg(unix)]
/// IPC server for daemon to listen for CLI connections
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

#[cfg(unix)]
impl IpcServer {
    /// Bind to a socket path, replacing a stale socket left by a dead daemon
    pub async fn bind_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
        }

        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another daemon is already running (socket at {:?} is active)",
                        path
                    );
                }
                Err(_) => {
                    std::fs::remove_file(path)
                        .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
                }
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind to socket at {:?}", path))?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection {
            stream: BufReader::new(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

#[cfg(unix)]
impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

#[cfg(unix)]
/// A single IPC connection from a client
pub struct IpcConnection {
    stream: BufReader<UnixStream>,
}

#[cfg(unix)]
impl IpcConnection {
    /// Receive the next request, `None` once the client hangs up
    pub async fn recv(&mut self) -> Result<Option<IpcRequest>> {
        let mut line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut line)
            .await
            .context("Failed to read request")?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request: IpcRequest = serde_json::from_str(&line).context("Failed to parse request")?;

        Ok(Some(request))
    }

    /// Send a response to the client
    pub async fn send(&mut self, response: &IpcResponse) -> Result<()> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send response")?;

        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush response")?;

        Ok(())
    }
}

/// Open a connection, send one request and return the response
#[cfg(unix)]
pub async fn send_request(path: &Path, req: &IpcRequest) -> Result<IpcResponse> {
    let mut client = IpcClient::connect_to(path).await?;
    client.request(req).await
}

#[cfg(not(unix))]
pub async fn send_request(_path: &Path, _req: &IpcRequest) -> Result<IpcResponse> {
    anyhow::bail!("The tunnelctl daemon is only supported on Unix platforms")
}

// ============================================================================
// Display helpers
// ============================================================================

/// Format a duration in human-readable form
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}

/// Print tunnels as a table
pub fn print_tunnel_table(tunnels: &[Tunnel]) {
    if tunnels.is_empty() {
        println!("No tunnels configured");
        println!("\nCreate one with: tunnelctl create <name> --zone <zone-id> --hostname <host> --port <port>");
        return;
    }

    println!(
        "{:<40} {:<16} {:<32} {:<6} {:<12} STATUS",
        "ID", "NAME", "HOSTNAME", "PORT", "ENV"
    );

    for tunnel in tunnels {
        let status = match tunnel.pid {
            Some(pid) if tunnel.is_running() => format!("{} (pid {})", tunnel.status, pid),
            _ => tunnel.status.to_string(),
        };

        println!(
            "{:<40} {:<16} {:<32} {:<6} {:<12} {}",
            tunnel.id, tunnel.name, tunnel.hostname, tunnel.port, tunnel.environment, status
        );
    }
}

/// Print a bulk result, one line per id
pub fn print_bulk_results(action: &str, results: &[BulkResult]) {
    for result in results {
        match &result.error {
            None => println!("✅ {} {}", action, result.id),
            Some(e) => println!("❌ {}: {}", result.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelctl_core::LogLevel;

    #[test]
    fn test_ipc_request_serialization() {
        let req = IpcRequest::Ping;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let req = IpcRequest::Start {
            ids: vec!["tunnel_a".to_string()],
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"start","ids":["tunnel_a"]}"#);

        let req = IpcRequest::Restart {
            id: "tunnel_b".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"restart","id":"tunnel_b"}"#);

        let req = IpcRequest::Update {
            id: "tunnel_c".to_string(),
            patch: TunnelPatch {
                port: Some(8080),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"type":"update","id":"tunnel_c","patch":{"port":8080}}"#
        );
    }

    #[test]
    fn test_ipc_request_deserialization() {
        let json = r#"{"type":"create","definition":{"name":"web","zone_id":"z","hostname":"app.example.com","port":3000}}"#;
        let req: IpcRequest = serde_json::from_str(json).unwrap();
        match req {
            IpcRequest::Create { definition } => {
                assert_eq!(definition.name, "web");
                assert_eq!(definition.port, 3000);
                assert!(definition.auto_restart);
                assert!(!definition.auto_startup);
            }
            other => panic!("Expected Create request, got {:?}", other),
        }

        let req: IpcRequest = serde_json::from_str(r#"{"type":"shutdown"}"#).unwrap();
        assert_eq!(req, IpcRequest::Shutdown);
    }

    #[test]
    fn test_ipc_response_serialization() {
        let resp = IpcResponse::Pong;
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let resp = IpcResponse::Error {
            message: "Tunnel not found: x".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"Tunnel not found: x"}"#);

        let resp = IpcResponse::Bulk {
            results: vec![BulkResult {
                id: "tunnel_a".to_string(),
                success: true,
                error: None,
            }],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.starts_with(r#"{"type":"bulk","results":[{"id":"tunnel_a","success":true"#));
    }

    #[test]
    fn test_logs_response_deserialization() {
        let json = r#"{"type":"logs","entries":[{"timestamp":"2024-01-01T00:00:00Z","level":"warning","message":"slow"}]}"#;
        let resp: IpcResponse = serde_json::from_str(json).unwrap();
        match resp {
            IpcResponse::Logs { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].level, LogLevel::Warning);
                assert_eq!(entries[0].message, "slow");
            }
            other => panic!("Expected Logs response, got {:?}", other),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(60), "1m 0s");
        assert_eq!(format_duration(3661), "1h 1m");
        assert_eq!(format_duration(90000), "1d 1h");
    }

    #[cfg(unix)]
    mod unix_tests {
        use super::*;
        use tempfile::TempDir;

        #[tokio::test]
        async fn test_ipc_client_server_roundtrip() {
            let temp_dir = TempDir::new().unwrap();
            let socket_path = temp_dir.path().join("test.sock");

            let server = IpcServer::bind_to(&socket_path).await.unwrap();

            let server_handle = tokio::spawn(async move {
                let mut conn = server.accept().await.unwrap();
                let request = conn.recv().await.unwrap().unwrap();

                let response = match request {
                    IpcRequest::Ping => IpcResponse::Pong,
                    _ => IpcResponse::Error {
                        message: "Unknown request".to_string(),
                    },
                };

                conn.send(&response).await.unwrap();
            });

            let response = send_request(&socket_path, &IpcRequest::Ping).await.unwrap();
            assert_eq!(response, IpcResponse::Pong);

            server_handle.await.unwrap();
        }

        #[tokio::test]
        async fn test_ipc_stale_socket_cleanup() {
            let temp_dir = TempDir::new().unwrap();
            let socket_path = temp_dir.path().join("stale.sock");

            // Not a real socket, nothing listening
            std::fs::write(&socket_path, "stale").unwrap();

            let server = IpcServer::bind_to(&socket_path).await.unwrap();
            assert!(socket_path.exists());

            drop(server);

            assert!(!socket_path.exists());
        }

        #[tokio::test]
        async fn test_ipc_refuses_second_daemon() {
            let temp_dir = TempDir::new().unwrap();
            let socket_path = temp_dir.path().join("active.sock");

            let _server = IpcServer::bind_to(&socket_path).await.unwrap();
            let err = IpcServer::bind_to(&socket_path).await.err().unwrap();
            assert!(err.to_string().contains("Another daemon is already running"));
        }

        #[tokio::test]
        async fn test_ipc_multiple_requests() {
            let temp_dir = TempDir::new().unwrap();
            let socket_path = temp_dir.path().join("multi.sock");

            let server = IpcServer::bind_to(&socket_path).await.unwrap();

            let server_handle = tokio::spawn(async move {
                let mut conn = server.accept().await.unwrap();

                let req1 = conn.recv().await.unwrap().unwrap();
                assert_eq!(req1, IpcRequest::Ping);
                conn.send(&IpcResponse::Pong).await.unwrap();

                let req2 = conn.recv().await.unwrap().unwrap();
                assert_eq!(req2, IpcRequest::List);
                conn.send(&IpcResponse::Tunnels {
                    tunnels: Vec::new(),
                })
                .await
                .unwrap();

                // Client hung up
                assert!(conn.recv().await.unwrap().is_none());
            });

            let mut client = IpcClient::connect_to(&socket_path).await.unwrap();

            let resp1 = client.request(&IpcRequest::Ping).await.unwrap();
            assert_eq!(resp1, IpcResponse::Pong);

            let resp2 = client.request(&IpcRequest::List).await.unwrap();
            assert_eq!(
                resp2,
                IpcResponse::Tunnels {
                    tunnels: Vec::new()
                }
            );

            drop(client);
            server_handle.await.unwrap();
        }

        #[tokio::test]
        async fn test_connect_without_daemon_fails() {
            let temp_dir = TempDir::new().unwrap();
            let err = send_request(&temp_dir.path().join("missing.sock"), &IpcRequest::Ping)
                .await
                .err()
                .unwrap();
            assert!(err.to_string().contains("Failed to connect to daemon socket"));
        }
    }
}
