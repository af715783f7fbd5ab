//! Tunnel data model
//!
//! `Tunnel` is the persisted entity. `TunnelDefinition` is what a caller
//! supplies on create and `TunnelPatch` what it supplies on update; neither
//! can carry the id, remote id or credentials, which are fixed at creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment label attached to a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Staging => write!(f, "staging"),
            Environment::Development => write!(f, "development"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(format!(
                "Invalid environment '{}' (expected production, staging or development)",
                other
            )),
        }
    }
}

/// Persisted run state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Stopped,
    Running,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Stopped => write!(f, "○ Stopped"),
            TunnelStatus::Running => write!(f, "● Running"),
        }
    }
}

/// Result of the most recent health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// A sub-route of a tunnel
///
/// Exactly one of `path` (routed on the tunnel's primary hostname) or
/// `hostname` (an alternate hostname) is expected to be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub port: u16,
}

impl Service {
    pub fn path(path: impl Into<String>, port: u16) -> Self {
        Self {
            path: Some(path.into()),
            hostname: None,
            port,
        }
    }

    pub fn hostname(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            path: None,
            hostname: Some(hostname.into()),
            port,
        }
    }
}

/// Health probe configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Probe interval in seconds
    pub interval: u64,
    /// Path requested on the tunnel's local port
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 30,
            path: "/".to_string(),
        }
    }
}

/// Runtime counters persisted alongside the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelStats {
    pub last_started: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
}

/// Per-tunnel secret material, opaque to the supervisor
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCredentials {
    pub account_tag: String,
    pub secret: String,
}

impl TunnelCredentials {
    /// Copy safe to show to operators
    pub fn redacted(&self) -> Self {
        let tail: String = self
            .secret
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Self {
            account_tag: self.account_tag.clone(),
            secret: if self.secret.is_empty() {
                String::new()
            } else {
                format!("***{}", tail)
            },
        }
    }
}

impl fmt::Debug for TunnelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelCredentials")
            .field("account_tag", &self.account_tag)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A supervised tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub name: String,
    pub zone_id: String,
    /// Identifier assigned by the provider
    pub remote_id: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    pub auto_restart: bool,
    #[serde(default)]
    pub auto_startup: bool,
    #[serde(default)]
    pub status: TunnelStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Start-time token of `pid`, used to detect pid reuse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_fingerprint: Option<u64>,
    #[serde(default)]
    pub stats: TunnelStats,
    pub credentials: TunnelCredentials,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Tunnel {
    /// Record a freshly spawned (or adopted) process
    pub fn mark_running(&mut self, pid: u32, fingerprint: Option<u64>) {
        self.status = TunnelStatus::Running;
        self.pid = Some(pid);
        self.pid_fingerprint = fingerprint;
    }

    /// Clear process state; safe to call repeatedly
    pub fn mark_stopped(&mut self) {
        self.status = TunnelStatus::Stopped;
        self.pid = None;
        self.pid_fingerprint = None;
    }

    /// `status == running` exactly when a pid is recorded
    pub fn is_consistent(&self) -> bool {
        (self.status == TunnelStatus::Running) == self.pid.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.status == TunnelStatus::Running
    }

    /// Copy with the secret masked
    pub fn redacted(&self) -> Self {
        let mut tunnel = self.clone();
        tunnel.credentials = self.credentials.redacted();
        tunnel
    }

    /// Apply every field present in `patch`
    pub fn apply_patch(&mut self, patch: &TunnelPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(zone_id) = &patch.zone_id {
            self.zone_id = zone_id.clone();
        }
        if let Some(hostname) = &patch.hostname {
            self.hostname = hostname.clone();
        }
        if let Some(port) = patch.port {
            self.port = port;
        }
        if let Some(services) = &patch.services {
            self.services = services.clone();
        }
        if let Some(environment) = patch.environment {
            self.environment = environment;
        }
        if let Some(health_check) = &patch.health_check {
            self.health_check = health_check.clone();
        }
        if let Some(auto_restart) = patch.auto_restart {
            self.auto_restart = auto_restart;
        }
        if let Some(auto_startup) = patch.auto_startup {
            self.auto_startup = auto_startup;
        }
    }
}

fn default_true() -> bool {
    true
}

/// Input for creating a tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelDefinition {
    pub name: String,
    pub zone_id: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default)]
    pub auto_startup: bool,
}

impl TunnelDefinition {
    pub fn new(
        name: impl Into<String>,
        zone_id: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            zone_id: zone_id.into(),
            hostname: hostname.into(),
            port,
            services: Vec::new(),
            environment: Environment::default(),
            health_check: HealthCheckConfig::default(),
            auto_restart: true,
            auto_startup: false,
        }
    }
}

/// Partial update of a tunnel's mutable fields
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TunnelPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<Service>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_restart: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_startup: Option<bool>,
}

impl TunnelPatch {
    pub fn is_empty(&self) -> bool {
        *self == TunnelPatch::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tunnel() -> Tunnel {
        Tunnel {
            id: "tunnel_1".to_string(),
            name: "api".to_string(),
            zone_id: "zone".to_string(),
            remote_id: "remote-1".to_string(),
            hostname: "api.example.com".to_string(),
            port: 8080,
            services: Vec::new(),
            environment: Environment::Production,
            health_check: HealthCheckConfig::default(),
            auto_restart: true,
            auto_startup: false,
            status: TunnelStatus::Stopped,
            pid: None,
            pid_fingerprint: None,
            stats: TunnelStats::default(),
            credentials: TunnelCredentials {
                account_tag: "acct".to_string(),
                secret: "c2VjcmV0LXNlY3JldA==".to_string(),
            },
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_mark_running_and_stopped() {
        let mut tunnel = sample_tunnel();
        assert!(tunnel.is_consistent());

        tunnel.mark_running(4242, Some(99));
        assert!(tunnel.is_running());
        assert_eq!(tunnel.pid, Some(4242));
        assert!(tunnel.is_consistent());

        tunnel.mark_stopped();
        tunnel.mark_stopped();
        assert_eq!(tunnel.status, TunnelStatus::Stopped);
        assert_eq!(tunnel.pid, None);
        assert_eq!(tunnel.pid_fingerprint, None);
        assert!(tunnel.is_consistent());
    }

    #[test]
    fn test_apply_patch_only_touches_present_fields() {
        let mut tunnel = sample_tunnel();
        let patch = TunnelPatch {
            port: Some(9090),
            environment: Some(Environment::Staging),
            ..Default::default()
        };

        tunnel.apply_patch(&patch);

        assert_eq!(tunnel.port, 9090);
        assert_eq!(tunnel.environment, Environment::Staging);
        assert_eq!(tunnel.hostname, "api.example.com");
        assert_eq!(tunnel.remote_id, "remote-1");
        assert!(tunnel.auto_restart);
    }

    #[test]
    fn test_credentials_are_redacted() {
        let tunnel = sample_tunnel();
        let debug = format!("{:?}", tunnel);
        assert!(!debug.contains("c2VjcmV0LXNlY3JldA=="));

        let redacted = tunnel.redacted();
        assert_eq!(redacted.credentials.secret, "***dA==");
        assert_eq!(redacted.credentials.account_tag, "acct");
    }

    #[test]
    fn test_definition_defaults() {
        let json = r#"{"name":"web","zone_id":"z","hostname":"web.example.com","port":3000}"#;
        let definition: TunnelDefinition = serde_json::from_str(json).unwrap();

        assert!(definition.auto_restart);
        assert!(!definition.auto_startup);
        assert_eq!(definition.environment, Environment::Production);
        assert_eq!(definition.health_check.interval, 30);
        assert_eq!(definition.health_check.path, "/");
        assert!(!definition.health_check.enabled);
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("staging".parse::<Environment>(), Ok(Environment::Staging));
        assert_eq!("DEV".parse::<Environment>(), Ok(Environment::Development));
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TunnelStatus::Running).unwrap(),
            r#""running""#
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            r#""unhealthy""#
        );
    }
}
