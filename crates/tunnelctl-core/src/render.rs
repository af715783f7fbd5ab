//! On-disk artifacts consumed by the tunnel process
//!
//! Each tunnel gets a routing document (`<id>.yml`) and a credential bundle
//! (`<id>-credentials.json`) in the renderer's directory.

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::model::Tunnel;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One ingress entry of the routing document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub service: String,
}

#[derive(Debug, Serialize)]
struct RoutingDocument<'a> {
    tunnel: &'a str,
    #[serde(rename = "credentials-file")]
    credentials_file: String,
    ingress: Vec<IngressRule>,
}

#[derive(Debug, Serialize)]
struct CredentialBundle<'a> {
    #[serde(rename = "AccountTag")]
    account_tag: &'a str,
    #[serde(rename = "TunnelSecret")]
    tunnel_secret: &'a str,
    #[serde(rename = "TunnelID")]
    tunnel_id: &'a str,
}

/// Locations of a tunnel's rendered files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub config: PathBuf,
    pub credentials: PathBuf,
}

/// Build the ordered ingress rules for a tunnel
///
/// Services with a path route on the primary hostname, services with a
/// hostname route on that hostname. Without services the primary hostname
/// forwards to the primary port. The catch-all 404 rule is always last.
pub fn ingress_rules(tunnel: &Tunnel) -> Vec<IngressRule> {
    let mut rules: Vec<IngressRule> = if tunnel.services.is_empty() {
        vec![IngressRule {
            hostname: Some(tunnel.hostname.clone()),
            path: None,
            service: format!("http://localhost:{}", tunnel.port),
        }]
    } else {
        tunnel
            .services
            .iter()
            .map(|service| match &service.path {
                Some(path) => IngressRule {
                    hostname: Some(tunnel.hostname.clone()),
                    path: Some(path.clone()),
                    service: format!("http://localhost:{}", service.port),
                },
                None => IngressRule {
                    hostname: Some(
                        service
                            .hostname
                            .clone()
                            .unwrap_or_else(|| tunnel.hostname.clone()),
                    ),
                    path: None,
                    service: format!("http://localhost:{}", service.port),
                },
            })
            .collect()
    };

    rules.push(IngressRule {
        hostname: None,
        path: None,
        service: "http_status:404".to_string(),
    });
    rules
}

/// Writes and removes tunnel artifacts under one directory
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    dir: PathBuf,
}

impl ConfigRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self, id: &str) -> ArtifactPaths {
        ArtifactPaths {
            config: self.dir.join(format!("{}.yml", id)),
            credentials: self.dir.join(format!("{}-credentials.json", id)),
        }
    }

    /// Render both artifacts, overwriting previous versions
    pub fn render(&self, tunnel: &Tunnel) -> Result<ArtifactPaths, RenderError> {
        fs::create_dir_all(&self.dir)?;
        let paths = self.paths(&tunnel.id);

        let bundle = CredentialBundle {
            account_tag: &tunnel.credentials.account_tag,
            tunnel_secret: &tunnel.credentials.secret,
            tunnel_id: &tunnel.remote_id,
        };
        let json = serde_json::to_string_pretty(&bundle)?;
        write_private(&paths.credentials, json.as_bytes())?;

        let document = RoutingDocument {
            tunnel: &tunnel.remote_id,
            credentials_file: paths.credentials.display().to_string(),
            ingress: ingress_rules(tunnel),
        };
        let yaml = serde_yaml::to_string(&document)?;
        fs::write(&paths.config, yaml)?;

        debug!("Rendered config for {} at {:?}", tunnel.id, paths.config);
        Ok(paths)
    }

    /// Delete both artifacts; missing files are not an error
    pub fn remove(&self, id: &str) -> Result<(), RenderError> {
        let paths = self.paths(id);
        for path in [&paths.config, &paths.credentials] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    // An existing file keeps its old mode on open
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Environment, HealthCheckConfig, Service, TunnelCredentials, TunnelStats, TunnelStatus,
    };
    use chrono::Utc;
    use tempfile::TempDir;

    fn tunnel_with(services: Vec<Service>) -> Tunnel {
        Tunnel {
            id: "tunnel_abc".to_string(),
            name: "web".to_string(),
            zone_id: "zone".to_string(),
            remote_id: "6ff42ae2-765d-4adf-8112-31c55c1551ef".to_string(),
            hostname: "app.example.com".to_string(),
            port: 3000,
            services,
            environment: Environment::Production,
            health_check: HealthCheckConfig::default(),
            auto_restart: true,
            auto_startup: false,
            status: TunnelStatus::Stopped,
            pid: None,
            pid_fingerprint: None,
            stats: TunnelStats::default(),
            credentials: TunnelCredentials {
                account_tag: "acct-1".to_string(),
                secret: "c2VjcmV0".to_string(),
            },
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_rules_without_services() {
        let rules = ingress_rules(&tunnel_with(Vec::new()));
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].hostname.as_deref(), Some("app.example.com"));
        assert_eq!(rules[0].service, "http://localhost:3000");
        assert_eq!(rules[1].service, "http_status:404");
        assert!(rules[1].hostname.is_none());
    }

    #[test]
    fn test_rules_with_services() {
        let rules = ingress_rules(&tunnel_with(vec![
            Service::path("/api", 3001),
            Service::hostname("docs.example.com", 3002),
        ]));

        assert_eq!(
            rules,
            vec![
                IngressRule {
                    hostname: Some("app.example.com".to_string()),
                    path: Some("/api".to_string()),
                    service: "http://localhost:3001".to_string(),
                },
                IngressRule {
                    hostname: Some("docs.example.com".to_string()),
                    path: None,
                    service: "http://localhost:3002".to_string(),
                },
                IngressRule {
                    hostname: None,
                    path: None,
                    service: "http_status:404".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_render_writes_both_files() {
        let temp = TempDir::new().unwrap();
        let renderer = ConfigRenderer::new(temp.path().join("configs"));
        let tunnel = tunnel_with(vec![Service::path("/api", 3001)]);

        let paths = renderer.render(&tunnel).unwrap();

        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(&paths.config).unwrap()).unwrap();
        assert_eq!(yaml["tunnel"].as_str(), Some(tunnel.remote_id.as_str()));
        assert_eq!(
            yaml["credentials-file"].as_str(),
            Some(paths.credentials.display().to_string().as_str())
        );
        let ingress = yaml["ingress"].as_sequence().unwrap();
        assert_eq!(ingress.len(), 2);
        assert_eq!(ingress[0]["path"].as_str(), Some("/api"));
        assert_eq!(ingress[1]["service"].as_str(), Some("http_status:404"));

        let creds: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.credentials).unwrap()).unwrap();
        assert_eq!(creds["AccountTag"], "acct-1");
        assert_eq!(creds["TunnelSecret"], "c2VjcmV0");
        assert_eq!(creds["TunnelID"], tunnel.remote_id.as_str());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&paths.credentials).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let renderer = ConfigRenderer::new(temp.path());
        let tunnel = tunnel_with(Vec::new());

        let paths = renderer.render(&tunnel).unwrap();
        renderer.remove(&tunnel.id).unwrap();
        assert!(!paths.config.exists());
        assert!(!paths.credentials.exists());

        renderer.remove(&tunnel.id).unwrap();
    }
}
