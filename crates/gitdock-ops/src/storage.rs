//! Durable storage for the registry's handle table.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use gitdock_core::{RepoError, RepoResult, RepositoryHandle};
use serde::{Deserialize, Serialize};
use tracing::debug;

const FORMAT_VERSION: u32 = 1;

/// One row of the handle table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub handle: RepositoryHandle,

    /// Last successful fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<SystemTime>,
}

impl RegistryEntry {
    pub fn new(handle: RepositoryHandle) -> Self {
        Self {
            handle,
            last_sync: None,
        }
    }
}

/// On-disk layout of `registry.json`.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    repositories: Vec<RegistryEntry>,
}

/// Durable mapping from handle id to `{path, remote_url, last_sync}`.
pub trait RegistryStorage: Send + Sync {
    /// Entries in insertion order; empty when nothing was saved yet.
    fn load(&self) -> RepoResult<Vec<RegistryEntry>>;

    /// Replace the stored table.
    fn save(&self, entries: &[RegistryEntry]) -> RepoResult<()>;
}

/// Stores the table as pretty JSON, replacing the file atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl RegistryStorage for JsonFileStorage {
    fn load(&self) -> RepoResult<Vec<RegistryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let file: RegistryFile =
            serde_json::from_str(&contents).map_err(|e| RepoError::CorruptObject {
                message: format!("{}: {}", self.path.display(), e),
            })?;
        if file.version > FORMAT_VERSION {
            return Err(RepoError::CorruptObject {
                message: format!(
                    "{}: unsupported registry version {}",
                    self.path.display(),
                    file.version
                ),
            });
        }
        debug!(path = %self.path.display(), count = file.repositories.len(), "loaded registry");
        Ok(file.repositories)
    }

    fn save(&self, entries: &[RegistryEntry]) -> RepoResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = RegistryFile {
            version: FORMAT_VERSION,
            repositories: entries.to_vec(),
        };
        let contents =
            serde_json::to_string_pretty(&file).map_err(|e| RepoError::io(e.to_string()))?;

        let temp = self.temp_path();
        std::fs::write(&temp, contents)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

/// Volatile storage; can be told to fail to exercise degraded persistence.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<Vec<RegistryEntry>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// What was last saved successfully.
    pub fn saved(&self) -> Vec<RegistryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl RegistryStorage for MemoryStorage {
    fn load(&self) -> RepoResult<Vec<RegistryEntry>> {
        Ok(self.saved())
    }

    fn save(&self, entries: &[RegistryEntry]) -> RepoResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepoError::io("storage unavailable"));
        }
        *self.entries.lock().unwrap_or_else(|e| e.into_inner()) = entries.to_vec();
        Ok(())
    }
}
