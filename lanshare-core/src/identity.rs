//! Instance identity: a random id that survives restarts, plus the announced host name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who this instance is on the LAN. `instance_id` lets discovery drop its own announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub instance_id: Uuid,
    pub host_name: String,
}

impl Identity {
    pub fn generate(host_name: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            host_name: host_name.into(),
        }
    }
}

/// Best-effort system host name.
pub fn system_host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .chain(fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_owned())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| "lanshare".to_owned())
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse identity: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot write identity: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Where an identity persists between runs.
pub trait IdentityStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<Identity>, IdentityError>;
    fn save(&self, identity: &Identity) -> Result<(), IdentityError>;
}

/// TOML file holding `instance_id` and `host_name`.
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> IdentityError {
        IdentityError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<Identity>, IdentityError> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(toml::from_str(&s)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn save(&self, identity: &Identity) -> Result<(), IdentityError> {
        let s = toml::to_string(identity)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }
        fs::write(&self.path, s).map_err(|e| self.io_err(e))
    }
}

/// Keeps the identity in memory only.
#[derive(Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: Identity) -> Self {
        Self {
            slot: Mutex::new(Some(identity)),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<Identity>, IdentityError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, identity: &Identity) -> Result<(), IdentityError> {
        *self.slot.lock() = Some(identity.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdentityStore::new(dir.path().join("nested/identity.toml"));
        assert!(store.load().unwrap().is_none());

        let id = Identity::generate("workbench");
        store.save(&id).unwrap();
        assert_eq!(store.load().unwrap(), Some(id.clone()));

        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains(&id.instance_id.to_string()));
        assert!(text.contains("workbench"));
    }

    #[test]
    fn garbage_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.toml");
        fs::write(&path, "instance_id = 5").unwrap();
        let store = FileIdentityStore::new(path);
        assert!(matches!(store.load(), Err(IdentityError::Parse(_))));
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(
            Identity::generate("a").instance_id,
            Identity::generate("a").instance_id
        );
    }
}
