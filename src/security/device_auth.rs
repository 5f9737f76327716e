//! Device token cache
//!
//! Stores the rotated token a gateway issues after a successful handshake,
//! keyed by (device id, role). One file per install.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::identity::write_private_file;
use crate::Result;
use crate::protocol::now_ms;

const STORE_VERSION: u32 = 1;

/// Cached token for one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthEntry {
    pub token: String,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    version: u32,
    device_id: String,
    #[serde(default)]
    tokens: BTreeMap<String, DeviceAuthEntry>,
}

/// File-backed device token store
#[derive(Debug, Clone)]
pub struct DeviceAuthStore {
    path: PathBuf,
}

impl DeviceAuthStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default store path next to the device identity
    #[must_use]
    pub fn default_path() -> PathBuf {
        super::DeviceIdentity::default_path().with_file_name("device-auth.json")
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached token for `(device_id, role)`
    #[must_use]
    pub fn load(&self, device_id: &str, role: &str) -> Option<DeviceAuthEntry> {
        let store = self.read()?;
        if store.device_id != device_id {
            return None;
        }
        store.tokens.get(role).cloned()
    }

    /// Persist a token, discarding entries recorded for another device
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn store(
        &self,
        device_id: &str,
        role: &str,
        token: &str,
        scopes: &[String],
    ) -> Result<DeviceAuthEntry> {
        let mut store = self
            .read()
            .filter(|s| s.device_id == device_id)
            .unwrap_or_else(|| StoreFile {
                version: STORE_VERSION,
                device_id: device_id.to_string(),
                tokens: BTreeMap::new(),
            });

        let mut scopes = scopes.to_vec();
        scopes.sort();
        scopes.dedup();

        let entry = DeviceAuthEntry {
            token: token.to_string(),
            role: role.to_string(),
            scopes,
            updated_at_ms: now_ms(),
        };
        store.tokens.insert(role.to_string(), entry.clone());
        self.write(&store)?;

        tracing::debug!(role = %role, "stored device token");
        Ok(entry)
    }

    /// Remove the token for `(device_id, role)`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn clear(&self, device_id: &str, role: &str) -> Result<()> {
        let Some(mut store) = self.read() else {
            return Ok(());
        };
        if store.device_id != device_id || store.tokens.remove(role).is_none() {
            return Ok(());
        }
        self.write(&store)?;
        tracing::debug!(role = %role, "cleared device token");
        Ok(())
    }

    fn read(&self) -> Option<StoreFile> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<StoreFile>(&content) {
            Ok(store) if store.version == STORE_VERSION => Some(store),
            Ok(store) => {
                tracing::warn!(version = store.version, "ignoring device auth store with unknown version");
                None
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable device auth store");
                None
            }
        }
    }

    fn write(&self, store: &StoreFile) -> Result<()> {
        let content = serde_json::to_string_pretty(store)?;
        write_private_file(&self.path, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, DeviceAuthStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceAuthStore::new(dir.path().join("device-auth.json"));
        (dir, store)
    }

    #[test]
    fn store_and_load() {
        let (_dir, store) = temp_store();
        assert!(store.load("dev", "operator").is_none());

        store
            .store("dev", "operator", "tok-1", &["operator.read".to_string()])
            .unwrap();
        let entry = store.load("dev", "operator").unwrap();
        assert_eq!(entry.token, "tok-1");
        assert_eq!(entry.scopes, vec!["operator.read"]);
        assert!(store.load("dev", "node").is_none());
    }

    #[test]
    fn other_device_is_treated_as_empty() {
        let (_dir, store) = temp_store();
        store.store("dev-a", "operator", "tok-a", &[]).unwrap();
        assert!(store.load("dev-b", "operator").is_none());

        store.store("dev-b", "node", "tok-b", &[]).unwrap();
        assert!(store.load("dev-a", "operator").is_none());
        assert_eq!(store.load("dev-b", "node").unwrap().token, "tok-b");
    }

    #[test]
    fn clear_removes_only_role() {
        let (_dir, store) = temp_store();
        store.store("dev", "operator", "tok-op", &[]).unwrap();
        store.store("dev", "node", "tok-node", &[]).unwrap();

        store.clear("dev", "operator").unwrap();
        assert!(store.load("dev", "operator").is_none());
        assert_eq!(store.load("dev", "node").unwrap().token, "tok-node");

        // Clearing something absent is fine
        store.clear("dev", "operator").unwrap();
        store.clear("other", "node").unwrap();
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let (_dir, store) = temp_store();
        fs::write(store.path(), "not json").unwrap();
        assert!(store.load("dev", "operator").is_none());
        store.store("dev", "operator", "tok", &[]).unwrap();
        assert!(store.load("dev", "operator").is_some());
    }
}
