//! Tunnel record persistence
//!
//! `JsonTunnelStore` keeps one `<id>.json` file per tunnel in a directory.
//! `MemoryTunnelStore` is used by tests and embedders that don't need
//! durability.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::model::Tunnel;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid tunnel id: {0}")]
    InvalidId(String),
}

/// Synchronous tunnel persistence
///
/// `update` applies the mutation to the freshest stored copy so that
/// concurrent writers touching different fields don't overwrite each other.
pub trait TunnelStore: Send + Sync {
    /// All tunnels, sorted by name
    fn load_all(&self) -> Result<Vec<Tunnel>, StoreError>;

    fn load(&self, id: &str) -> Result<Option<Tunnel>, StoreError>;

    fn save(&self, tunnel: &Tunnel) -> Result<(), StoreError>;

    /// Mutate a stored tunnel in place; `None` if it doesn't exist
    fn update(
        &self,
        id: &str,
        mutation: &mut dyn FnMut(&mut Tunnel),
    ) -> Result<Option<Tunnel>, StoreError>;

    /// Returns whether a record was removed
    fn remove(&self, id: &str) -> Result<bool, StoreError>;
}

/// Validate tunnel id (alphanumeric, hyphens, underscores only)
fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::InvalidId("id cannot be empty".to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(StoreError::InvalidId(format!(
            "'{}' must contain only alphanumeric characters, hyphens, and underscores",
            id
        )));
    }
    Ok(())
}

fn sort_tunnels(tunnels: &mut [Tunnel]) {
    // Sort by name for consistent output
    tunnels.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
}

/// File-backed store
pub struct JsonTunnelStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonTunnelStore {
    /// Open (and create if needed) a store rooted at `base_dir`
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the base directory path (for display purposes)
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn tunnel_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }

    fn read_file(path: &Path) -> Result<Option<Tunnel>, StoreError> {
        match fs::read_to_string(path) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a temp file and rename so readers never see partial JSON
    fn write_file(&self, tunnel: &Tunnel) -> Result<(), StoreError> {
        let path = self.tunnel_path(&tunnel.id);
        let tmp = self.base_dir.join(format!(".{}.json.tmp", tunnel.id));
        let json = serde_json::to_string_pretty(tunnel)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TunnelStore for JsonTunnelStore {
    fn load_all(&self) -> Result<Vec<Tunnel>, StoreError> {
        let mut tunnels = Vec::new();

        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            let is_record = path.extension().and_then(|s| s.to_str()) == Some("json")
                && !path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|name| name.starts_with('.'));

            if !is_record {
                continue;
            }
            match Self::read_file(&path) {
                Ok(Some(tunnel)) => tunnels.push(tunnel),
                Ok(None) => {}
                // One corrupt record must not hide the others
                Err(StoreError::Serde(e)) => {
                    warn!("Skipping unreadable tunnel record {:?}: {}", path, e);
                }
                Err(e) => return Err(e),
            }
        }

        sort_tunnels(&mut tunnels);
        Ok(tunnels)
    }

    fn load(&self, id: &str) -> Result<Option<Tunnel>, StoreError> {
        validate_id(id)?;
        Self::read_file(&self.tunnel_path(id))
    }

    fn save(&self, tunnel: &Tunnel) -> Result<(), StoreError> {
        validate_id(&tunnel.id)?;
        let _guard = self.lock();
        self.write_file(tunnel)
    }

    fn update(
        &self,
        id: &str,
        mutation: &mut dyn FnMut(&mut Tunnel),
    ) -> Result<Option<Tunnel>, StoreError> {
        validate_id(id)?;
        let _guard = self.lock();

        let Some(mut tunnel) = Self::read_file(&self.tunnel_path(id))? else {
            return Ok(None);
        };
        mutation(&mut tunnel);
        self.write_file(&tunnel)?;
        Ok(Some(tunnel))
    }

    fn remove(&self, id: &str) -> Result<bool, StoreError> {
        validate_id(id)?;
        let _guard = self.lock();

        match fs::remove_file(self.tunnel_path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volatile store
#[derive(Debug, Default)]
pub struct MemoryTunnelStore {
    tunnels: Mutex<HashMap<String, Tunnel>>,
}

impl MemoryTunnelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Tunnel>> {
        match self.tunnels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TunnelStore for MemoryTunnelStore {
    fn load_all(&self) -> Result<Vec<Tunnel>, StoreError> {
        let mut tunnels: Vec<Tunnel> = self.lock().values().cloned().collect();
        sort_tunnels(&mut tunnels);
        Ok(tunnels)
    }

    fn load(&self, id: &str) -> Result<Option<Tunnel>, StoreError> {
        Ok(self.lock().get(id).cloned())
    }

    fn save(&self, tunnel: &Tunnel) -> Result<(), StoreError> {
        validate_id(&tunnel.id)?;
        self.lock().insert(tunnel.id.clone(), tunnel.clone());
        Ok(())
    }

    fn update(
        &self,
        id: &str,
        mutation: &mut dyn FnMut(&mut Tunnel),
    ) -> Result<Option<Tunnel>, StoreError> {
        let mut tunnels = self.lock();
        Ok(tunnels.get_mut(id).map(|tunnel| {
            mutation(tunnel);
            tunnel.clone()
        }))
    }

    fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().remove(id).is_some())
    }
}
