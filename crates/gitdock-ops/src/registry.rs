//! Process-wide table of managed repositories.
//!
//! The in-memory table is authoritative for the running process; storage
//! provides durability. When a save fails the change is kept, the caller
//! gets a [`RepoError::PersistenceDegraded`] warning and a background task
//! keeps retrying until the table is durable again.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::SystemTime;

use gitdock_core::{HandleId, RepoError, RepoResult, RepositoryHandle};
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::storage::{MemoryStorage, RegistryEntry, RegistryStorage};

/// A result whose durability may lag behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persisted<T> {
    pub value: T,
    /// `PersistenceDegraded` when the change is held in memory only.
    pub warning: Option<RepoError>,
}

impl<T> Persisted<T> {
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn is_durable(&self) -> bool {
        self.warning.is_none()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Persisted<U> {
        Persisted {
            value: f(self.value),
            warning: self.warning,
        }
    }
}

/// Outcome of [`Registry::unregister`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    pub handle: RepositoryHandle,
    /// Whether the working tree was removed from disk.
    pub files_removed: bool,
    /// Why removing files failed; deregistration happened regardless.
    pub delete_error: Option<RepoError>,
}

struct Inner {
    entries: Mutex<Vec<RegistryEntry>>,
    storage: Arc<dyn RegistryStorage>,
    degraded: AtomicBool,
    retrying: AtomicBool,
    retry: RetryPolicy,
}

/// Registry of repositories known on this device.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.lock().len())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

/// Absolute, lexically normalized form of `path`, resolving symlinks of the
/// longest existing prefix.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other.as_os_str()),
        }
    }

    // Canonicalize the deepest existing ancestor and re-append the rest.
    let mut existing = lexical.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            out.extend(rest.iter().rev());
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return lexical,
        }
    }
}

impl Registry {
    /// Load the table from `storage`.
    pub fn open(storage: Arc<dyn RegistryStorage>, retry: RetryPolicy) -> RepoResult<Self> {
        let entries = storage.load()?;
        info!(count = entries.len(), "registry loaded");
        Ok(Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(entries),
                storage,
                degraded: AtomicBool::new(false),
                retrying: AtomicBool::new(false),
                retry,
            }),
        })
    }

    /// Empty registry backed by [`MemoryStorage`].
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                storage: Arc::new(MemoryStorage::new()),
                degraded: AtomicBool::new(false),
                retrying: AtomicBool::new(false),
                retry: RetryPolicy::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RegistryEntry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new repository location.
    pub fn register(
        &self,
        path: &Path,
        remote_url: Option<String>,
    ) -> RepoResult<Persisted<RepositoryHandle>> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| RepoError::invalid_location(path, e.to_string()))?;
        if !metadata.is_dir() {
            return Err(RepoError::invalid_location(path, "not a directory"));
        }
        std::fs::read_dir(path).map_err(|e| RepoError::invalid_location(path, e.to_string()))?;

        let path = normalize_path(path);
        let mut entries = self.lock();
        if entries.iter().any(|entry| entry.handle.path == path) {
            return Err(RepoError::AlreadyRegistered { path });
        }

        let handle = RepositoryHandle {
            id: HandleId::new(),
            path,
            remote_url,
        };
        entries.push(RegistryEntry::new(handle.clone()));
        let warning = self.persist(&entries);
        drop(entries);

        info!(handle = %handle.id, path = %handle.path.display(), "registered repository");
        Ok(Persisted {
            value: handle,
            warning,
        })
    }

    /// Stop tracking a repository, optionally deleting its working tree.
    ///
    /// A second call for the same handle reports `UnknownHandle` and has no
    /// side effects.
    pub fn unregister(
        &self,
        id: HandleId,
        delete_files: bool,
    ) -> RepoResult<Persisted<Unregistered>> {
        let mut entries = self.lock();
        let index = entries
            .iter()
            .position(|entry| entry.handle.id == id)
            .ok_or(RepoError::UnknownHandle { id })?;
        let entry = entries.remove(index);
        let warning = self.persist(&entries);
        drop(entries);

        info!(handle = %id, path = %entry.handle.path.display(), delete_files, "unregistered repository");

        let mut removed = Unregistered {
            handle: entry.handle,
            files_removed: false,
            delete_error: None,
        };
        if delete_files {
            match std::fs::remove_dir_all(&removed.handle.path) {
                Ok(()) => removed.files_removed = true,
                Err(e) => {
                    warn!(path = %removed.handle.path.display(), error = %e, "failed to delete repository files");
                    removed.delete_error = Some(RepoError::from(e));
                }
            }
        }

        Ok(Persisted {
            value: removed,
            warning,
        })
    }

    /// Handles in insertion order.
    pub fn list(&self) -> Vec<RepositoryHandle> {
        self.lock()
            .iter()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.lock().clone()
    }

    pub fn get(&self, id: HandleId) -> RepoResult<RepositoryHandle> {
        self.entry(id).map(|entry| entry.handle)
    }

    pub fn entry(&self, id: HandleId) -> RepoResult<RegistryEntry> {
        self.lock()
            .iter()
            .find(|entry| entry.handle.id == id)
            .cloned()
            .ok_or(RepoError::UnknownHandle { id })
    }

    pub fn find_by_path(&self, path: &Path) -> Option<RepositoryHandle> {
        let path = normalize_path(path);
        self.lock()
            .iter()
            .find(|entry| entry.handle.path == path)
            .map(|entry| entry.handle.clone())
    }

    /// Record a successful fetch.
    pub fn record_sync(&self, id: HandleId, at: SystemTime) -> RepoResult<Persisted<()>> {
        let mut entries = self.lock();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.handle.id == id)
            .ok_or(RepoError::UnknownHandle { id })?;
        if entry.last_sync == Some(at) {
            return Ok(Persisted {
                value: (),
                warning: None,
            });
        }
        entry.last_sync = Some(at);
        let warning = self.persist(&entries);
        Ok(Persisted { value: (), warning })
    }

    /// The latest change has not reached storage yet.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    /// Save `entries`; called with the table lock held so saves are ordered.
    fn persist(&self, entries: &[RegistryEntry]) -> Option<RepoError> {
        match self.inner.storage.save(entries) {
            Ok(()) => {
                self.inner.degraded.store(false, Ordering::SeqCst);
                None
            }
            Err(e) => {
                warn!(error = %e, "registry persistence degraded");
                self.inner.degraded.store(true, Ordering::SeqCst);
                self.schedule_retry();
                Some(RepoError::PersistenceDegraded {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Spawn the durability retry loop unless one is already running.
    fn schedule_retry(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime; registry will be saved on the next change");
            return;
        };
        if self.inner.retrying.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let policy = self.inner.retry;
        runtime.spawn(async move {
            let mut attempt = 1u32;
            loop {
                let delay = policy
                    .base_delay
                    .saturating_mul(1 << attempt.saturating_sub(1).min(16))
                    .min(policy.max_delay);
                tokio::time::sleep(delay).await;

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.degraded.load(Ordering::SeqCst) {
                    inner.retrying.store(false, Ordering::SeqCst);
                    return;
                }

                let saved = {
                    let entries = inner.entries.lock().unwrap_or_else(|e| e.into_inner());
                    inner.storage.save(&entries)
                };
                match saved {
                    Ok(()) => {
                        inner.degraded.store(false, Ordering::SeqCst);
                        inner.retrying.store(false, Ordering::SeqCst);
                        info!(attempt, "registry persisted after retry");
                        return;
                    }
                    Err(e) => debug!(attempt, error = %e, "registry save retry failed"),
                }
                attempt = attempt.saturating_add(1);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::storage::JsonFileStorage;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_register_and_list_in_order() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let registry = Registry::in_memory();

        let a = registry.register(dirs[0].path(), None).unwrap().into_value();
        let b = registry
            .register(dirs[1].path(), Some("https://github.com/o/r".into()))
            .unwrap()
            .into_value();

        let ids: Vec<HandleId> = registry.list().into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(registry.get(b.id).unwrap().remote_url.as_deref(), Some("https://github.com/o/r"));
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_paths() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::in_memory();
        registry.register(dir.path(), None).unwrap();

        let dotted = dir.path().join(".");
        assert!(matches!(
            registry.register(&dotted, None),
            Err(RepoError::AlreadyRegistered { .. })
        ));

        let missing = dir.path().join("missing");
        assert!(matches!(
            registry.register(&missing, None),
            Err(RepoError::InvalidLocation { .. })
        ));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(
            registry.register(&file, None),
            Err(RepoError::InvalidLocation { .. })
        ));
    }

    #[test]
    fn test_unregister_twice_reports_unknown_handle() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::in_memory();
        let handle = registry.register(dir.path(), None).unwrap().into_value();

        let removed = registry.unregister(handle.id, false).unwrap().into_value();
        assert!(!removed.files_removed);
        assert!(dir.path().exists());

        assert_eq!(
            registry.unregister(handle.id, false).unwrap_err(),
            RepoError::UnknownHandle { id: handle.id }
        );
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_unregister_deletes_files_when_asked() {
        let parent = TempDir::new().unwrap();
        let repo = parent.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        std::fs::write(repo.join("README"), "hi").unwrap();

        let registry = Registry::in_memory();
        let handle = registry.register(&repo, None).unwrap().into_value();
        let removed = registry.unregister(handle.id, true).unwrap().into_value();

        assert!(removed.files_removed);
        assert!(removed.delete_error.is_none());
        assert!(!repo.exists());
    }

    #[test]
    fn test_table_survives_restart() {
        let data = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let storage = Arc::new(JsonFileStorage::new(data.path().join("registry.json")));

        let registry = Registry::open(storage.clone(), fast_retry()).unwrap();
        let handle = registry.register(repo.path(), None).unwrap().into_value();
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        registry.record_sync(handle.id, at).unwrap();

        let reopened = Registry::open(storage, fast_retry()).unwrap();
        let entry = reopened.entry(handle.id).unwrap();
        assert_eq!(entry.handle, handle);
        assert_eq!(entry.last_sync, Some(at));
    }

    #[tokio::test]
    async fn test_degraded_persistence_keeps_change_and_recovers() {
        let repo = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let registry = Registry::open(storage.clone(), fast_retry()).unwrap();

        storage.set_failing(true);
        let result = registry.register(repo.path(), None).unwrap();
        assert!(matches!(
            result.warning,
            Some(RepoError::PersistenceDegraded { .. })
        ));
        assert!(registry.is_degraded());
        assert_eq!(registry.list().len(), 1);
        assert!(storage.saved().is_empty());

        storage.set_failing(false);
        for _ in 0..100 {
            if !registry.is_degraded() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!registry.is_degraded());
        assert_eq!(storage.saved().len(), 1);
    }

    #[test]
    fn test_normalize_path_resolves_dots() {
        let dir = TempDir::new().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let messy = dir.path().join("a").join("..").join("b");
        assert_eq!(normalize_path(&messy), canonical.join("b"));
    }
}
