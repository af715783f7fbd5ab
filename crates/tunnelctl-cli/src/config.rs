//! Global CLI configuration management
//!
//! Stores provider credentials and daemon settings in ~/.tunnelctl/config.json.
//! Set `TUNNELCTL_HOME` to use a different directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the home directory
pub const HOME_ENV: &str = "TUNNELCTL_HOME";

/// Global CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelctlConfig {
    /// Cloudflare API token (preferred over a global key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Cloudflare global API key, used together with `email`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Skip account discovery when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Launcher binary, `cloudflared` from PATH when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudflared_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_grace_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_timeout_secs: Option<u64>,
}

impl TunnelctlConfig {
    pub fn launcher(&self) -> &str {
        self.cloudflared_path.as_deref().unwrap_or("cloudflared")
    }

    pub fn restart_grace(&self) -> Option<Duration> {
        self.restart_grace_ms.map(Duration::from_millis)
    }

    pub fn probe_timeout(&self) -> Option<Duration> {
        self.probe_timeout_secs.map(Duration::from_secs)
    }

    pub fn has_credentials(&self) -> bool {
        self.api_token.is_some() || (self.api_key.is_some() && self.email.is_some())
    }

    /// Copy with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mask = |value: &Option<String>| value.as_ref().map(|_| "********".to_string());
        Self {
            api_token: mask(&self.api_token),
            api_key: mask(&self.api_key),
            ..self.clone()
        }
    }
}

/// Configuration manager rooted at the tunnelctl home directory
#[derive(Debug, Clone)]
pub struct ConfigManager {
    home: PathBuf,
}

impl ConfigManager {
    /// Resolve the home directory from `TUNNELCTL_HOME` or `~/.tunnelctl`
    pub fn new() -> Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV) {
            return Ok(Self::at(home));
        }
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::at(home.join(".tunnelctl")))
    }

    pub fn at(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join("config.json")
    }

    /// Directory holding one JSON record per tunnel
    pub fn tunnels_dir(&self) -> PathBuf {
        self.home.join("tunnels")
    }

    /// Directory holding rendered launcher artifacts
    pub fn configs_dir(&self) -> PathBuf {
        self.home.join("configs")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.home.join("daemon.sock")
    }

    /// Load the configuration from disk
    pub fn load(&self) -> Result<TunnelctlConfig> {
        let path = self.config_path();

        // Return default config if file doesn't exist
        if !path.exists() {
            return Ok(TunnelctlConfig::default());
        }

        let json =
            fs::read_to_string(&path).context(format!("Failed to read config file: {:?}", path))?;

        let config: TunnelctlConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Save the configuration to disk
    pub fn save(&self, config: &TunnelctlConfig) -> Result<()> {
        let path = self.config_path();

        fs::create_dir_all(&self.home)
            .context(format!("Failed to create config directory: {:?}", self.home))?;

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&path, json).context(format!("Failed to write config file: {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .context(format!("Failed to restrict config permissions: {:?}", path))?;
        }

        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut TunnelctlConfig)) -> Result<()> {
        let mut config = self.load()?;
        f(&mut config);
        self.save(&config)
    }

    /// Use an API token, replacing any global key
    pub fn set_token(&self, token: String) -> Result<()> {
        self.modify(|config| {
            config.api_token = Some(token);
            config.api_key = None;
            config.email = None;
        })
    }

    /// Use a global API key and account email, replacing any token
    pub fn set_api_key(&self, key: String, email: String) -> Result<()> {
        self.modify(|config| {
            config.api_key = Some(key);
            config.email = Some(email);
            config.api_token = None;
        })
    }

    pub fn set_account(&self, account_id: Option<String>) -> Result<()> {
        self.modify(|config| config.account_id = account_id)
    }

    pub fn set_webhook(&self, url: Option<String>) -> Result<()> {
        self.modify(|config| config.webhook_url = url)
    }

    pub fn set_launcher(&self, path: Option<String>) -> Result<()> {
        self.modify(|config| config.cloudflared_path = path)
    }
}
