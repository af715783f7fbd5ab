//! Export and import of tunnel records
//!
//! An export is a versioned JSON document holding full tunnel records,
//! credentials included, so that an import can bring tunnels back without
//! provisioning them again.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tunnelctl_core::validation::validate_tunnel;
use tunnelctl_core::{Tunnel, TunnelStore};

pub const BACKUP_VERSION: &str = "1.0";

/// On-disk export format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub version: String,
    pub export_date: DateTime<Utc>,
    pub tunnels: Vec<Tunnel>,
}

/// Outcome of an import, by tunnel id
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: Vec<String>,
    /// Ids already present and not overwritten
    pub skipped: Vec<String>,
    /// Ids rejected with the reason
    pub rejected: Vec<(String, String)>,
}

pub fn export(store: &dyn TunnelStore) -> Result<String> {
    let backup = Backup {
        version: BACKUP_VERSION.to_string(),
        export_date: Utc::now(),
        tunnels: store.load_all().context("Failed to load tunnels")?,
    };
    serde_json::to_string_pretty(&backup).context("Failed to serialize tunnels")
}

/// Import records from an export
///
/// Imported tunnels are always stopped; the daemon starts them on request or
/// on its next boot when `auto_startup` is set.
pub fn import(store: &dyn TunnelStore, json: &str, overwrite: bool) -> Result<ImportReport> {
    let backup: Backup = serde_json::from_str(json).context("Failed to parse export file")?;
    if backup.version != BACKUP_VERSION {
        anyhow::bail!("Unsupported backup version '{}'", backup.version);
    }
    let mut report = ImportReport::default();

    for mut tunnel in backup.tunnels {
        if let Err(e) = validate_tunnel(&tunnel) {
            report.rejected.push((tunnel.id.clone(), e.to_string()));
            continue;
        }

        let existing = match store.load(&tunnel.id) {
            Ok(existing) => existing,
            Err(e) => {
                report.rejected.push((tunnel.id, e.to_string()));
                continue;
            }
        };
        if existing.is_some() && !overwrite {
            report.skipped.push(tunnel.id);
            continue;
        }

        tunnel.mark_stopped();
        match store.save(&tunnel) {
            Ok(()) => report.imported.push(tunnel.id),
            Err(e) => report.rejected.push((tunnel.id, e.to_string())),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelctl_core::{
        Environment, HealthCheckConfig, MemoryTunnelStore, TunnelCredentials, TunnelStats,
        TunnelStatus,
    };

    fn tunnel(id: &str, name: &str) -> Tunnel {
        Tunnel {
            id: id.to_string(),
            name: name.to_string(),
            zone_id: "zone".to_string(),
            remote_id: format!("remote-{}", id),
            hostname: format!("{}.example.com", name),
            port: 3000,
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
                secret: "c2VjcmV0".to_string(),
            },
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn backup_of(tunnels: Vec<Tunnel>) -> String {
        serde_json::to_string(&Backup {
            version: BACKUP_VERSION.to_string(),
            export_date: Utc::now(),
            tunnels,
        })
        .unwrap()
    }

    #[test]
    fn test_export_keeps_credentials() {
        let store = MemoryTunnelStore::new();
        store.save(&tunnel("tunnel_a", "api")).unwrap();

        let json = export(&store).unwrap();
        let parsed: Backup = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, BACKUP_VERSION);
        assert_eq!(parsed.tunnels.len(), 1);
        assert_eq!(parsed.tunnels[0].credentials.secret, "c2VjcmV0");
    }

    #[test]
    fn test_import_skips_existing_without_overwrite() {
        let source = MemoryTunnelStore::new();
        source.save(&tunnel("tunnel_a", "api")).unwrap();
        source.save(&tunnel("tunnel_b", "web")).unwrap();
        let json = export(&source).unwrap();

        let target = MemoryTunnelStore::new();
        let mut existing = tunnel("tunnel_a", "api");
        existing.port = 9999;
        target.save(&existing).unwrap();

        let report = import(&target, &json, false).unwrap();
        assert_eq!(report.imported, vec!["tunnel_b".to_string()]);
        assert_eq!(report.skipped, vec!["tunnel_a".to_string()]);
        assert_eq!(target.load("tunnel_a").unwrap().unwrap().port, 9999);

        let report = import(&target, &json, true).unwrap();
        assert_eq!(report.imported.len(), 2);
        assert_eq!(target.load("tunnel_a").unwrap().unwrap().port, 3000);
    }

    #[test]
    fn test_import_resets_run_state() {
        let mut running = tunnel("tunnel_a", "api");
        running.mark_running(4242, Some(7));
        let json = backup_of(vec![running]);

        let store = MemoryTunnelStore::new();
        import(&store, &json, false).unwrap();

        let stored = store.load("tunnel_a").unwrap().unwrap();
        assert_eq!(stored.status, TunnelStatus::Stopped);
        assert!(stored.pid.is_none());
        assert!(stored.is_consistent());
    }

    #[test]
    fn test_import_rejects_invalid_records() {
        let mut bad = tunnel("tunnel_a", "api");
        bad.hostname = "not a hostname".to_string();
        let json = backup_of(vec![bad, tunnel("../escape", "web")]);

        let store = MemoryTunnelStore::new();
        let report = import(&store, &json, false).unwrap();
        assert!(report.imported.is_empty());
        assert_eq!(report.rejected.len(), 2);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_import_malformed_file() {
        let store = MemoryTunnelStore::new();
        assert!(import(&store, "{not json", false).is_err());
        assert!(import(&store, "[]", false).is_err());
    }

    #[test]
    fn test_import_unknown_version() {
        let mut backup: Backup =
            serde_json::from_str(&backup_of(vec![tunnel("tunnel_a", "api")])).unwrap();
        backup.version = "9.9".to_string();
        let json = serde_json::to_string(&backup).unwrap();

        let store = MemoryTunnelStore::new();
        let err = import(&store, &json, false).unwrap_err();
        assert!(err.to_string().contains("Unsupported backup version"));
    }
}
