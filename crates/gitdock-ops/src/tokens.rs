//! Per-repository operation slots.
//!
//! At most one [`OperationToken`] exists per normalized repository path.
//! Slots are keyed by path rather than handle so a clone, which has no
//! handle yet, is covered too. Dropping the token frees the slot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use gitdock_core::{HandleId, OperationKind, RepoError, RepoResult};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Slot {
    kind: OperationKind,
    handle: Option<HandleId>,
    cancel: CancellationToken,
}

type Slots = Arc<Mutex<HashMap<PathBuf, Slot>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

/// Table of live operations.
#[derive(Debug, Clone, Default)]
pub struct OperationTable {
    slots: Slots,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `path`; fails with `OperationInProgress` while
    /// another token holds it.
    pub fn acquire(
        &self,
        path: &Path,
        handle: Option<HandleId>,
        kind: OperationKind,
    ) -> RepoResult<OperationToken> {
        let mut slots = lock(&self.slots);
        if let Some(live) = slots.get(path) {
            return Err(RepoError::OperationInProgress {
                path: path.to_path_buf(),
                operation: Some(live.kind),
            });
        }

        let cancel = CancellationToken::new();
        slots.insert(
            path.to_path_buf(),
            Slot {
                kind,
                handle,
                cancel: cancel.clone(),
            },
        );
        debug!(path = %path.display(), operation = %kind, "operation token acquired");

        Ok(OperationToken {
            slots: self.slots.clone(),
            path: path.to_path_buf(),
            kind,
            cancel,
        })
    }

    /// Kind of the live operation on `path`, if any.
    pub fn live(&self, path: &Path) -> Option<OperationKind> {
        lock(&self.slots).get(path).map(|slot| slot.kind)
    }

    /// Request cancellation of the live operation on `path`.
    pub fn cancel(&self, path: &Path) -> bool {
        match lock(&self.slots).get(path) {
            Some(slot) => {
                debug!(path = %path.display(), operation = %slot.kind, handle = ?slot.handle, "cancelling operation");
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live tokens.
    pub fn live_count(&self) -> usize {
        lock(&self.slots).len()
    }
}

/// Exclusive right to mutate one repository.
#[derive(Debug)]
pub struct OperationToken {
    slots: Slots,
    path: PathBuf,
    kind: OperationKind,
    cancel: CancellationToken,
}

impl OperationToken {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for OperationToken {
    fn drop(&mut self) {
        lock(&self.slots).remove(&self.path);
        debug!(path = %self.path.display(), operation = %self.kind, "operation token released");
    }
}
