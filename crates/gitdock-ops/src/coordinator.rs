//! Repository coordinator.
//!
//! Every mutating operation follows the same path:
//!
//! 1. claim the repository's [`OperationToken`] (rejecting with
//!    `OperationInProgress` while another operation is live)
//! 2. publish the last committed snapshot marked `Busy`
//! 3. run the git work on the blocking pool behind a checkpoint, retrying
//!    transient network failures and honouring timeout and cancellation
//! 4. roll back to the checkpoint if the work failed or was interrupted
//! 5. re-project the snapshot from disk, publish it, release the token
//!
//! The blocking worker holds a lease on the token. When a timed-out worker
//! does not stop within [`CANCEL_GRACE`], the timeout is reported anyway and
//! the repository stays busy until the worker has rolled back and exited.
//!
//! The merge gate is read from the repository itself, so a conflicted merge
//! left behind by a previous run is still enforced after a restart.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use gitdock_core::{
    Activity, CommitInfo, Credential, DiffTarget, ErrorRecord, FileDiff, HandleId, OperationKind,
    Page, PageToken, RemoteRepositoryInfo, RemoteView, RepoError, RepoResult, RepositoryHandle,
    RepositorySnapshot, StashEntry, TagInfo,
};
use gitdock_git::{Head, MergeOutcome, ObjectRepo, ObjectStore, WorkingTreeStatus};
use gitdock_remote::{parse_remote_url, RemoteCatalog};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credentials::CredentialSource;
use crate::projector::{carry_forward, project, read_disk_state, DiskState, ProjectionInput};
use crate::registry::{normalize_path, Persisted, Registry, Unregistered};
use crate::retry::RetryPolicy;
use crate::tokens::{OperationTable, OperationToken};

/// Id of the empty tree; an unborn branch "changes" only when the staged
/// tree differs from it.
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// How long a cancelled worker may take to stop before the caller is
/// answered without it.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Per-call options for network-facing operations.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    /// Overrides the credential source for this call.
    pub credential: Option<Credential>,
    /// Overrides the configured timeout.
    pub timeout: Option<Duration>,
}

impl OperationOptions {
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Tunables taken from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Default timeout of network-facing operations.
    pub timeout: Duration,
    /// Maximum commits visited when computing ahead/behind.
    pub ancestry_depth: usize,
    /// How long cached remote metadata counts as fresh.
    pub remote_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.operation_timeout(),
            ancestry_depth: config.ancestry_depth,
            remote_ttl: config.remote_info_ttl(),
            retry: config.retry_policy(),
        }
    }
}

/// What a failed or interrupted operation is rolled back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rollback {
    /// Nothing to restore.
    None,
    /// Refs and HEAD only; the working tree is left alone.
    Refs,
    /// Refs, HEAD and the working tree.
    Worktree,
    /// Refs always, the working tree only when cancelled or timed out.
    WorktreeIfInterrupted,
}

impl Rollback {
    fn for_kind(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Merge | OperationKind::Pull => Rollback::Worktree,
            OperationKind::Checkout => Rollback::WorktreeIfInterrupted,
            OperationKind::StashApply | OperationKind::StashPop => Rollback::Worktree,
            OperationKind::AbortMerge
            | OperationKind::Remove
            | OperationKind::Clone
            | OperationKind::Import
            | OperationKind::CreateTag
            | OperationKind::DeleteTag
            | OperationKind::StashSave
            | OperationKind::StashDrop => Rollback::None,
            OperationKind::Fetch
            | OperationKind::Push
            | OperationKind::Commit
            | OperationKind::ResolveMerge
            | OperationKind::CreateBranch
            | OperationKind::DeleteBranch => Rollback::Refs,
        }
    }
}

/// Operations that move the working tree to another commit and therefore
/// refuse to start over uncommitted tracked changes.
fn requires_clean_tree(kind: OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::Merge | OperationKind::Pull | OperationKind::StashApply | OperationKind::StashPop
    )
}

/// Operations whose conflicts leave a merge for the user to conclude.
/// Any other conflicting operation is rolled back.
fn keeps_conflicts(kind: OperationKind) -> bool {
    matches!(kind, OperationKind::Merge | OperationKind::Pull)
}

/// How a settled operation affects `last_error`.
#[derive(Debug)]
enum Outcome {
    /// A plain re-read; `last_error` is kept.
    Refresh,
    Completed,
    Failed {
        operation: Option<OperationKind>,
        error: RepoError,
    },
}

#[derive(Debug, Clone)]
struct CachedRemote {
    info: RemoteRepositoryInfo,
    fetched_at: SystemTime,
    /// The latest refresh attempt failed.
    failed: bool,
}

impl CachedRemote {
    fn is_fresh(&self, now: SystemTime, ttl: Duration) -> bool {
        !self.failed
            && now
                .duration_since(self.fetched_at)
                .map(|age| age < ttl)
                .unwrap_or(true)
    }

    fn view(&self, now: SystemTime, ttl: Duration) -> RemoteView {
        RemoteView {
            info: self.info.clone(),
            fetched_at: self.fetched_at,
            stale: !self.is_fresh(now, ttl),
        }
    }
}

/// Published state of one handle.
#[derive(Debug)]
struct View {
    /// Last settled snapshot, never `Busy`.
    committed: RepositorySnapshot,
    tx: watch::Sender<RepositorySnapshot>,
    last_error: Option<ErrorRecord>,
    remote: Option<CachedRemote>,
}

/// Serializes mutating operations per repository and publishes snapshots.
pub struct Coordinator {
    registry: Registry,
    store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn RemoteCatalog>,
    credentials: Arc<dyn CredentialSource>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
    tokens: OperationTable,
    views: Mutex<HashMap<HandleId, View>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("registry", &self.registry)
            .field("catalog_host", &self.catalog.host())
            .field("settings", &self.settings)
            .field("live_operations", &self.tokens.live_count())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(
        registry: Registry,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn RemoteCatalog>,
        credentials: Arc<dyn CredentialSource>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            registry,
            store,
            catalog,
            credentials,
            clock: Arc::new(SystemClock),
            settings,
            tokens: OperationTable::new(),
            views: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the wall clock used for sync times and cache expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    fn views(&self) -> MutexGuard<'_, HashMap<HandleId, View>> {
        self.views.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Read API
    // =========================================================================

    /// Handles in registration order.
    pub fn list_handles(&self) -> Vec<RepositoryHandle> {
        self.registry.list()
    }

    /// Latest published snapshot; reads the disk the first time a handle is
    /// asked for.
    pub async fn snapshot(&self, id: HandleId) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        if let Some(published) = self.published(id) {
            // Left busy by a worker that outlived its caller.
            let orphaned = matches!(published.activity, Activity::Busy { .. })
                && self.tokens.live(&handle.path).is_none();
            if !orphaned {
                return Ok(published);
            }
        }
        self.refresh_handle(&handle).await
    }

    /// Subscribe to every snapshot published for `id`.
    pub async fn observe_snapshot(
        &self,
        id: HandleId,
    ) -> RepoResult<watch::Receiver<RepositorySnapshot>> {
        let handle = self.registry.get(id)?;
        self.ensure_view(&handle).await?;
        self.views()
            .get(&id)
            .map(|view| view.tx.subscribe())
            .ok_or(RepoError::UnknownHandle { id })
    }

    /// Re-project the snapshot from disk. While an operation is live the
    /// last committed snapshot is returned, marked `Busy`.
    pub async fn refresh(&self, id: HandleId) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        self.refresh_handle(&handle).await
    }

    async fn refresh_handle(&self, handle: &RepositoryHandle) -> RepoResult<RepositorySnapshot> {
        if let Some(operation) = self.tokens.live(&handle.path) {
            if let Some(busy) = self.committed_as_busy(handle.id, operation) {
                return Ok(busy);
            }
        }
        let disk = self.read_disk(&handle.path).await;
        self.settle(handle, Outcome::Refresh, disk)
    }

    fn published(&self, id: HandleId) -> Option<RepositorySnapshot> {
        self.views().get(&id).map(|view| view.tx.borrow().clone())
    }

    fn committed_as_busy(&self, id: HandleId, operation: OperationKind) -> Option<RepositorySnapshot> {
        self.views().get(&id).map(|view| {
            let mut busy = view.committed.clone();
            busy.activity = Activity::Busy { operation };
            busy
        })
    }

    /// Request cancellation of the live operation on `id`.
    pub fn cancel(&self, id: HandleId) -> bool {
        match self.registry.get(id) {
            Ok(handle) => self.tokens.cancel(&handle.path),
            Err(_) => false,
        }
    }

    /// Request cancellation of a clone into `target`; clones have no
    /// handle until they finish.
    pub fn cancel_clone(&self, target: &Path) -> bool {
        self.tokens.cancel(&normalize_path(target))
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Clone `url` into `target` and register the result.
    ///
    /// All-or-nothing: on failure, cancellation or timeout the partially
    /// written directory is removed (an empty target that existed before
    /// is recreated empty).
    pub async fn clone_repository(
        &self,
        target: &Path,
        url: &str,
        options: OperationOptions,
    ) -> RepoResult<RepositorySnapshot> {
        let url = url.trim().to_string();
        if url.is_empty() {
            return Err(RepoError::invalid_request("remote URL is empty"));
        }

        let path = normalize_path(target);
        if self.registry.find_by_path(&path).is_some() {
            return Err(RepoError::AlreadyRegistered { path });
        }
        let existed = check_clone_target(&path)?;

        let token = Arc::new(self.tokens.acquire(&path, None, OperationKind::Clone)?);
        let cancel = token.cancellation().clone();
        let credential = self.credential_for(Some(&url), options.credential);
        let limit = options.timeout.unwrap_or(self.settings.timeout);

        info!(url = %url, path = %path.display(), "clone started");
        let transfer = async {
            self.settings
                .retry
                .run(&cancel, || {
                    self.spawn_clone(
                        url.clone(),
                        path.clone(),
                        existed,
                        credential.clone(),
                        token.clone(),
                    )
                })
                .await
                .map_err(clone_failure)
        };
        if let Err(e) = with_deadline(&cancel, Some(limit), transfer).await {
            if Arc::strong_count(&token) > 1 {
                warn!(path = %path.display(), "clone worker still running, it removes the target when it stops");
            }
            warn!(url = %url, path = %path.display(), error = %e, "clone failed");
            return Err(e);
        }

        let registered = self.registry.register(&path, Some(url))?;
        log_degraded(&registered);
        let handle = registered.into_value();

        let disk = self.read_disk(&handle.path).await;
        let snapshot = self.settle(&handle, Outcome::Completed, disk)?;
        drop(token);

        info!(handle = %handle.id, path = %handle.path.display(), "clone finished");
        Ok(snapshot)
    }

    fn spawn_clone(
        &self,
        url: String,
        path: PathBuf,
        existed: bool,
        credential: Option<Credential>,
        lease: Arc<OperationToken>,
    ) -> impl Future<Output = RepoResult<()>> + Send + 'static {
        let store = self.store.clone();
        async move {
            tokio::task::spawn_blocking(move || {
                let cancel = lease.cancellation();
                let result = if cancel.is_cancelled() {
                    Err(RepoError::Cancelled)
                } else {
                    store.clone_repository(&url, &path, credential.as_ref(), cancel)
                };
                let result = match result {
                    Ok(()) if cancel.is_cancelled() => Err(RepoError::Cancelled),
                    other => other,
                };
                if result.is_err() {
                    discard_partial_clone(&path, existed);
                }
                result
            })
            .await
            .map_err(worker_failed)?
        }
    }

    /// Register an existing local repository.
    ///
    /// Holds the path's token until the first snapshot is published, so a
    /// directory that a clone is still writing cannot be imported.
    pub async fn import(&self, path: &Path) -> RepoResult<RepositorySnapshot> {
        let path = normalize_path(path);
        if let Some(existing) = self.registry.find_by_path(&path) {
            return Err(RepoError::AlreadyRegistered {
                path: existing.path,
            });
        }
        let token = self.tokens.acquire(&path, None, OperationKind::Import)?;

        let store = self.store.clone();
        let location = path.clone();
        let remote_url = tokio::task::spawn_blocking(move || store.open(&location)?.remote_url())
            .await
            .map_err(worker_failed)??;

        let registered = self.registry.register(&path, remote_url)?;
        log_degraded(&registered);
        let handle = registered.into_value();
        info!(handle = %handle.id, path = %handle.path.display(), "imported repository");

        let disk = self.read_disk(&handle.path).await;
        let snapshot = self.settle(&handle, Outcome::Refresh, disk);
        drop(token);
        snapshot
    }

    /// Stop managing a repository, optionally deleting its working tree.
    /// Accepted while the repository is merging.
    pub async fn remove(
        &self,
        id: HandleId,
        delete_files: bool,
    ) -> RepoResult<Persisted<Unregistered>> {
        let handle = self.registry.get(id)?;
        let token = self
            .tokens
            .acquire(&handle.path, Some(id), OperationKind::Remove)?;

        let registry = self.registry.clone();
        let removed = tokio::task::spawn_blocking(move || registry.unregister(id, delete_files))
            .await
            .map_err(worker_failed)??;

        self.views().remove(&id);
        drop(token);
        Ok(removed)
    }

    // =========================================================================
    // Network operations
    // =========================================================================

    /// Download new objects and refs from `origin`; the working tree is not
    /// touched.
    pub async fn fetch(
        &self,
        id: HandleId,
        options: OperationOptions,
    ) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        let credential = self.credential_for(handle.remote_url.as_deref(), options.credential.clone());

        self.execute(handle, OperationKind::Fetch, &options, move |repo, cancel| {
            repo.fetch(credential.as_ref(), cancel)
        })
        .await
    }

    /// Fetch, then merge the current branch's upstream.
    pub async fn pull(
        &self,
        id: HandleId,
        options: OperationOptions,
    ) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        let credential = self.credential_for(handle.remote_url.as_deref(), options.credential.clone());

        self.execute(handle, OperationKind::Pull, &options, move |repo, cancel| {
            let branch = match repo.read_head()? {
                Head::Branch { name, .. } | Head::Unborn { branch: name } => name,
                Head::Detached { .. } => {
                    return Err(RepoError::invalid_request("HEAD is detached"));
                }
            };

            repo.fetch(credential.as_ref(), cancel)?;
            if cancel.is_cancelled() {
                return Err(RepoError::Cancelled);
            }

            let (upstream, _) = repo.upstream(&branch)?.ok_or_else(|| {
                RepoError::invalid_request(format!("branch {branch} has no upstream"))
            })?;
            merge_into_head(repo, &upstream)
        })
        .await
    }

    /// Push the current branch to `origin`.
    pub async fn push(
        &self,
        id: HandleId,
        options: OperationOptions,
    ) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        let credential = self.credential_for(handle.remote_url.as_deref(), options.credential.clone());

        self.execute(handle, OperationKind::Push, &options, move |repo, cancel| {
            match repo.read_head()? {
                Head::Branch { name, .. } => repo.push(&name, credential.as_ref(), cancel),
                Head::Unborn { branch } => Err(RepoError::invalid_request(format!(
                    "branch {branch} has no commits to push"
                ))),
                Head::Detached { .. } => Err(RepoError::invalid_request("HEAD is detached")),
            }
        })
        .await
    }

    // =========================================================================
    // Local operations
    // =========================================================================

    /// Commit `paths` (every tracked change when empty).
    pub async fn commit(
        &self,
        id: HandleId,
        message: &str,
        paths: Vec<PathBuf>,
    ) -> RepoResult<RepositorySnapshot> {
        if message.trim().is_empty() {
            return Err(RepoError::invalid_request("commit message is empty"));
        }
        let handle = self.registry.get(id)?;
        let message = message.to_string();

        self.execute(handle, OperationKind::Commit, &OperationOptions::default(), move |repo, _| {
            let tree = repo.stage(&paths)?;
            let unchanged = match repo.head_tree()? {
                Some(head) => head == tree,
                None => tree.as_str() == EMPTY_TREE,
            };
            if unchanged {
                return Err(RepoError::NothingToCommit);
            }

            let parent = repo.read_head()?.commit().cloned();
            let commit = repo.write_commit(&tree, parent.as_slice(), &message, None)?;
            debug!(commit = %commit.short(), "committed");
            Ok(())
        })
        .await
    }

    /// Merge `source` (a branch or revision) into the current branch.
    ///
    /// On conflict the repository is left merging and `MergeConflict` is
    /// returned after the merging snapshot has been published.
    pub async fn merge(&self, id: HandleId, source: &str) -> RepoResult<RepositorySnapshot> {
        if source.trim().is_empty() {
            return Err(RepoError::invalid_request("merge source is empty"));
        }
        let handle = self.registry.get(id)?;
        let source = source.trim().to_string();

        self.execute(handle, OperationKind::Merge, &OperationOptions::default(), move |repo, _| {
            merge_into_head(repo, &source)
        })
        .await
    }

    /// Stage the resolved conflicts and write the merge commit.
    pub async fn resolve_merge(&self, id: HandleId, message: &str) -> RepoResult<RepositorySnapshot> {
        if message.trim().is_empty() {
            return Err(RepoError::invalid_request("commit message is empty"));
        }
        let handle = self.registry.get(id)?;
        let message = message.to_string();

        self.execute(
            handle,
            OperationKind::ResolveMerge,
            &OperationOptions::default(),
            move |repo, _| repo.conclude_merge(&message, None).map(|_| ()),
        )
        .await
    }

    /// Abandon the merge and restore the pre-merge working tree.
    pub async fn abort_merge(&self, id: HandleId) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        self.execute(
            handle,
            OperationKind::AbortMerge,
            &OperationOptions::default(),
            |repo, _| repo.abort_merge(),
        )
        .await
    }

    pub async fn create_branch(
        &self,
        id: HandleId,
        name: &str,
        start_point: Option<&str>,
    ) -> RepoResult<RepositorySnapshot> {
        let name = branch_name(name)?;
        let handle = self.registry.get(id)?;
        let start_point = start_point.map(str::to_string);

        self.execute(
            handle,
            OperationKind::CreateBranch,
            &OperationOptions::default(),
            move |repo, _| repo.create_branch(&name, start_point.as_deref()),
        )
        .await
    }

    /// Delete a local branch; the checked-out branch cannot be deleted.
    pub async fn delete_branch(&self, id: HandleId, name: &str) -> RepoResult<RepositorySnapshot> {
        let name = branch_name(name)?;
        let handle = self.registry.get(id)?;

        self.execute(
            handle,
            OperationKind::DeleteBranch,
            &OperationOptions::default(),
            move |repo, _| {
                if repo.read_head()?.branch() == Some(name.as_str()) {
                    return Err(RepoError::invalid_request(format!(
                        "cannot delete the checked-out branch {name}"
                    )));
                }
                repo.delete_branch(&name)
            },
        )
        .await
    }

    /// Switch to `name`. Without `force`, uncommitted tracked changes are
    /// reported instead of overwritten.
    pub async fn checkout(
        &self,
        id: HandleId,
        name: &str,
        force: bool,
    ) -> RepoResult<RepositorySnapshot> {
        let name = branch_name(name)?;
        let handle = self.registry.get(id)?;

        self.execute(
            handle,
            OperationKind::Checkout,
            &OperationOptions::default(),
            move |repo, _| {
                if !force {
                    let status = repo.status()?;
                    if status.has_tracked_changes() {
                        return Err(RepoError::UncommittedChanges {
                            paths: tracked_changes(&status),
                        });
                    }
                }
                repo.checkout(&name, force)
            },
        )
        .await
    }

    // =========================================================================
    // History, tags and stashes
    // =========================================================================

    /// Up to `limit` commits reachable from `start` (HEAD when `None`),
    /// newest first.
    pub async fn history(
        &self,
        id: HandleId,
        start: Option<&str>,
        limit: usize,
    ) -> RepoResult<Vec<CommitInfo>> {
        let start = start.map(str::to_string);
        self.read_repo(id, move |repo| repo.history(start.as_deref(), limit))
            .await
    }

    pub async fn tags(&self, id: HandleId) -> RepoResult<Vec<TagInfo>> {
        self.read_repo(id, |repo| repo.tags()).await
    }

    pub async fn stashes(&self, id: HandleId) -> RepoResult<Vec<StashEntry>> {
        self.read_repo(id, |repo| repo.stashes()).await
    }

    pub async fn diff(&self, id: HandleId, target: DiffTarget) -> RepoResult<Vec<FileDiff>> {
        self.read_repo(id, move |repo| repo.diff(&target)).await
    }

    /// Tag `target` (HEAD when `None`); annotated when `message` is given.
    pub async fn create_tag(
        &self,
        id: HandleId,
        name: &str,
        target: Option<&str>,
        message: Option<&str>,
    ) -> RepoResult<RepositorySnapshot> {
        let name = ref_name("tag", name)?;
        let handle = self.registry.get(id)?;
        let target = target.map(str::to_string);
        let message = message.map(str::to_string);

        self.execute(
            handle,
            OperationKind::CreateTag,
            &OperationOptions::default(),
            move |repo, _| repo.create_tag(&name, target.as_deref(), message.as_deref()),
        )
        .await
    }

    pub async fn delete_tag(&self, id: HandleId, name: &str) -> RepoResult<RepositorySnapshot> {
        let name = ref_name("tag", name)?;
        let handle = self.registry.get(id)?;

        self.execute(
            handle,
            OperationKind::DeleteTag,
            &OperationOptions::default(),
            move |repo, _| repo.delete_tag(&name),
        )
        .await
    }

    /// Move uncommitted changes onto the stash, leaving the tree clean.
    pub async fn stash_save(
        &self,
        id: HandleId,
        message: Option<&str>,
        include_untracked: bool,
    ) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        let message = message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        self.execute(
            handle,
            OperationKind::StashSave,
            &OperationOptions::default(),
            move |repo, _| {
                repo.stash_save(message.as_deref(), include_untracked)
                    .map(|_| ())
            },
        )
        .await
    }

    /// Reapply stash `index` onto a clean tree. A conflicting apply is
    /// rolled back and the stash kept.
    pub async fn stash_apply(&self, id: HandleId, index: usize) -> RepoResult<RepositorySnapshot> {
        self.unstash(id, index, OperationKind::StashApply).await
    }

    /// Like [`Self::stash_apply`], dropping the entry once it applied.
    pub async fn stash_pop(&self, id: HandleId, index: usize) -> RepoResult<RepositorySnapshot> {
        self.unstash(id, index, OperationKind::StashPop).await
    }

    pub async fn stash_drop(&self, id: HandleId, index: usize) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        self.execute(
            handle,
            OperationKind::StashDrop,
            &OperationOptions::default(),
            move |repo, _| repo.stash_drop(index),
        )
        .await
    }

    async fn unstash(
        &self,
        id: HandleId,
        index: usize,
        kind: OperationKind,
    ) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        let pop = kind == OperationKind::StashPop;
        self.execute(handle, kind, &OperationOptions::default(), move |repo, _| {
            repo.stash_apply(index, pop)
        })
        .await
    }

    /// Run a read against the repository on the blocking pool. Reads take
    /// no token and do not publish.
    async fn read_repo<T, F>(&self, id: HandleId, read: F) -> RepoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ObjectRepo) -> RepoResult<T> + Send + 'static,
    {
        let handle = self.registry.get(id)?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let repo = store.open(&handle.path)?;
            read(repo.as_ref())
        })
        .await
        .map_err(worker_failed)?
    }

    // =========================================================================
    // Remote catalog
    // =========================================================================

    /// Refresh the hosting-service metadata of a handle.
    ///
    /// A cached value younger than the configured TTL is returned without a
    /// request. On failure the last known value stays on the snapshot,
    /// flagged stale.
    pub async fn refresh_remote(
        &self,
        id: HandleId,
        options: OperationOptions,
    ) -> RepoResult<RepositorySnapshot> {
        let handle = self.registry.get(id)?;
        let url = handle
            .remote_url
            .clone()
            .ok_or_else(|| RepoError::invalid_request("repository has no remote"))?;
        let location = parse_remote_url(&url)
            .ok_or_else(|| RepoError::invalid_request(format!("unsupported remote URL {url}")))?;
        if !self.catalog.serves_host(&location.host) {
            return Err(RepoError::invalid_request(format!(
                "{} is not served by {}",
                location.host,
                self.catalog.host()
            )));
        }

        self.ensure_view(&handle).await?;
        if self.remote_is_fresh(id) {
            debug!(handle = %id, "remote metadata is fresh");
            return self.snapshot(id).await;
        }

        let credential = options
            .credential
            .or_else(|| self.credentials.current_credential(&location.host));
        let cancel = CancellationToken::new();
        let lookup = self.settings.retry.run(&cancel, || {
            self.catalog
                .get_repository(&location.owner, &location.name, credential.as_ref())
        });
        let limit = options.timeout.unwrap_or(self.settings.timeout);
        let result = tokio::time::timeout(limit, lookup)
            .await
            .unwrap_or_else(|_| Err(timed_out(limit)));

        let outcome = match &result {
            Ok(info) => {
                self.store_remote(id, info.clone());
                Outcome::Completed
            }
            Err(error) => {
                warn!(handle = %id, error = %error, "remote metadata refresh failed");
                self.mark_remote_failed(id);
                Outcome::Failed {
                    operation: None,
                    error: error.clone(),
                }
            }
        };

        let disk = self.read_disk(&handle.path).await;
        let snapshot = self.settle(&handle, outcome, disk)?;
        result.map(|_| snapshot)
    }

    /// One page of `owner`'s repositories on the hosting service.
    pub async fn list_remote(
        &self,
        owner: &str,
        page: Option<PageToken>,
        options: OperationOptions,
    ) -> RepoResult<Page<RemoteRepositoryInfo>> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(RepoError::invalid_request("owner is empty"));
        }

        let credential = options
            .credential
            .or_else(|| self.credentials.current_credential(self.catalog.host()));
        let cancel = CancellationToken::new();
        let listing = self.settings.retry.run(&cancel, || {
            self.catalog
                .list_repositories(owner, page.as_ref(), credential.as_ref())
        });
        let limit = options.timeout.unwrap_or(self.settings.timeout);
        tokio::time::timeout(limit, listing)
            .await
            .unwrap_or_else(|_| Err(timed_out(limit)))
    }

    fn remote_is_fresh(&self, id: HandleId) -> bool {
        let now = self.clock.now();
        self.views()
            .get(&id)
            .and_then(|view| view.remote.as_ref())
            .is_some_and(|cached| cached.is_fresh(now, self.settings.remote_ttl))
    }

    fn store_remote(&self, id: HandleId, info: RemoteRepositoryInfo) {
        let fetched_at = self.clock.now();
        if let Some(view) = self.views().get_mut(&id) {
            view.remote = Some(CachedRemote {
                info,
                fetched_at,
                failed: false,
            });
        }
    }

    fn mark_remote_failed(&self, id: HandleId) {
        if let Some(cached) = self
            .views()
            .get_mut(&id)
            .and_then(|view| view.remote.as_mut())
        {
            cached.failed = true;
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run `work` against `handle` under its operation token.
    async fn execute<F>(
        &self,
        handle: RepositoryHandle,
        kind: OperationKind,
        options: &OperationOptions,
        work: F,
    ) -> RepoResult<RepositorySnapshot>
    where
        F: Fn(&dyn ObjectRepo, &CancellationToken) -> RepoResult<()> + Send + Sync + 'static,
    {
        let id = handle.id;
        let token = Arc::new(self.tokens.acquire(&handle.path, Some(id), kind)?);
        let cancel = token.cancellation().clone();

        self.ensure_view(&handle).await?;
        self.mark_busy(id, kind);
        info!(handle = %id, operation = %kind, "operation started");

        let policy = if kind.is_network() {
            self.settings.retry
        } else {
            RetryPolicy::none()
        };
        let limit = options
            .timeout
            .or_else(|| kind.is_network().then_some(self.settings.timeout));

        let work = Arc::new(work);
        let attempts = policy.run(&cancel, || {
            self.spawn_work(handle.path.clone(), kind, token.clone(), work.clone())
        });
        let result = with_deadline(&cancel, limit, attempts).await;

        if let Err(error) = &result {
            if Arc::strong_count(&token) > 1 {
                // The disk is still being written; it is read once the
                // worker has rolled back and released the token.
                warn!(handle = %id, operation = %kind, error = %error, "worker still running, repository stays busy");
                self.publish_interrupted(id, kind, error.clone());
                return Err(error.clone());
            }
        }

        if result.is_ok() && matches!(kind, OperationKind::Fetch | OperationKind::Pull) {
            match self.registry.record_sync(id, self.clock.now()) {
                Ok(persisted) => log_degraded(&persisted),
                Err(e) => warn!(handle = %id, error = %e, "failed to record sync time"),
            }
        }

        let outcome = match &result {
            Ok(()) => Outcome::Completed,
            Err(error) if is_rejection(error) => Outcome::Refresh,
            Err(error) => Outcome::Failed {
                operation: Some(kind),
                error: error.clone(),
            },
        };
        let disk = self.read_disk(&handle.path).await;
        let snapshot = self.settle(&handle, outcome, disk)?;
        drop(token);

        match result {
            Ok(()) => {
                info!(handle = %id, operation = %kind, version = snapshot.version, "operation finished");
                Ok(snapshot)
            }
            Err(e) => {
                warn!(handle = %id, operation = %kind, error = %e, "operation failed");
                Err(e)
            }
        }
    }

    fn spawn_work<F>(
        &self,
        path: PathBuf,
        kind: OperationKind,
        lease: Arc<OperationToken>,
        work: Arc<F>,
    ) -> impl Future<Output = RepoResult<()>> + Send + 'static
    where
        F: Fn(&dyn ObjectRepo, &CancellationToken) -> RepoResult<()> + Send + Sync + 'static,
    {
        let store = self.store.clone();
        async move {
            tokio::task::spawn_blocking(move || {
                run_work(store.as_ref(), &path, kind, lease.cancellation(), work.as_ref())
            })
            .await
            .map_err(worker_failed)?
        }
    }

    async fn read_disk(&self, path: &Path) -> RepoResult<DiskState> {
        let store = self.store.clone();
        let path = path.to_path_buf();
        let depth = self.settings.ancestry_depth;
        tokio::task::spawn_blocking(move || {
            let repo = store.open(&path)?;
            read_disk_state(repo.as_ref(), depth)
        })
        .await
        .map_err(worker_failed)?
    }

    async fn ensure_view(&self, handle: &RepositoryHandle) -> RepoResult<()> {
        let known = self.views().contains_key(&handle.id);
        if !known {
            let disk = self.read_disk(&handle.path).await;
            self.settle(handle, Outcome::Refresh, disk)?;
        }
        Ok(())
    }

    /// Publish a timeout whose worker is still running. The committed view
    /// is kept and shown busy until the next refresh after the worker exits.
    fn publish_interrupted(&self, id: HandleId, operation: OperationKind, error: RepoError) {
        let now = self.clock.now();
        if let Some(view) = self.views().get_mut(&id) {
            let record = ErrorRecord {
                operation: Some(operation),
                error,
                at: now,
            };
            let mut busy = view.committed.clone();
            busy.activity = Activity::Busy { operation };
            busy.last_error = Some(record.clone());
            view.last_error = Some(record);
            view.tx.send_replace(busy);
        }
    }

    fn mark_busy(&self, id: HandleId, operation: OperationKind) {
        if let Some(view) = self.views().get(&id) {
            let mut busy = view.committed.clone();
            busy.activity = Activity::Busy { operation };
            view.tx.send_replace(busy);
        }
    }

    /// Project and publish a snapshot. The version only moves when the view
    /// differs from the last committed one.
    fn settle(
        &self,
        handle: &RepositoryHandle,
        outcome: Outcome,
        disk: RepoResult<DiskState>,
    ) -> RepoResult<RepositorySnapshot> {
        let entry = self.registry.entry(handle.id)?;
        let now = self.clock.now();
        let degraded = self.registry.is_degraded();

        let mut views = self.views();
        let previous = views.get(&handle.id);

        let (mut last_error, failed) = match outcome {
            Outcome::Refresh => (previous.and_then(|view| view.last_error.clone()), false),
            Outcome::Completed => (None, false),
            Outcome::Failed { operation, error } => (
                Some(ErrorRecord {
                    operation,
                    error,
                    at: now,
                }),
                true,
            ),
        };
        let remote = previous
            .and_then(|view| view.remote.as_ref())
            .map(|cached| cached.view(now, self.settings.remote_ttl));

        let mut snapshot = match &disk {
            Ok(disk) => project(ProjectionInput {
                entry: &entry,
                disk,
                remote,
                last_error: last_error.clone(),
                persistence_degraded: degraded,
            }),
            Err(error) => {
                warn!(handle = %handle.id, error = %error, "failed to read repository state");
                if !failed {
                    last_error = Some(ErrorRecord {
                        operation: None,
                        error: error.clone(),
                        at: now,
                    });
                }
                carry_forward(
                    previous.map(|view| &view.committed),
                    &entry,
                    remote,
                    last_error.clone(),
                    degraded,
                )
            }
        };

        match views.get_mut(&handle.id) {
            Some(view) => {
                snapshot.version = if snapshot.same_view(&view.committed) {
                    view.committed.version
                } else {
                    view.committed.version + 1
                };
                view.committed = snapshot.clone();
                view.last_error = last_error;
                view.tx.send_replace(snapshot.clone());
            }
            None => {
                snapshot.version = 1;
                let (tx, _) = watch::channel(snapshot.clone());
                views.insert(
                    handle.id,
                    View {
                        committed: snapshot.clone(),
                        tx,
                        last_error,
                        remote: None,
                    },
                );
            }
        }

        debug!(handle = %handle.id, version = snapshot.version, "snapshot published");
        Ok(snapshot)
    }

    fn credential_for(&self, remote_url: Option<&str>, explicit: Option<Credential>) -> Option<Credential> {
        explicit.or_else(|| {
            remote_url
                .and_then(parse_remote_url)
                .and_then(|location| self.credentials.current_credential(&location.host))
        })
    }
}

/// Blocking body of a mutating operation.
fn run_work<F>(
    store: &dyn ObjectStore,
    path: &Path,
    kind: OperationKind,
    cancel: &CancellationToken,
    work: &F,
) -> RepoResult<()>
where
    F: Fn(&dyn ObjectRepo, &CancellationToken) -> RepoResult<()> + ?Sized,
{
    if cancel.is_cancelled() {
        return Err(RepoError::Cancelled);
    }

    let repo = store.open(path)?;
    check_gate(repo.as_ref(), path, kind)?;

    let rollback = Rollback::for_kind(kind);
    let checkpoint = match rollback {
        Rollback::None => None,
        _ => Some(repo.checkpoint()?),
    };

    let result = work(repo.as_ref(), cancel);
    let interrupted = cancel.is_cancelled();
    // A merge conflict is a result: the merging state is kept for resolve/abort.
    let failed = match &result {
        Err(RepoError::MergeConflict { .. }) => !keeps_conflicts(kind),
        Err(_) => true,
        Ok(()) => false,
    };

    if let Some(checkpoint) = &checkpoint {
        if interrupted || failed {
            let worktree = match rollback {
                Rollback::Worktree => true,
                Rollback::WorktreeIfInterrupted => interrupted,
                Rollback::Refs | Rollback::None => false,
            };
            match repo.restore(checkpoint, worktree) {
                Ok(()) => debug!(path = %path.display(), operation = %kind, worktree, "rolled back"),
                Err(e) => {
                    warn!(path = %path.display(), operation = %kind, error = %e, "rollback failed")
                }
            }
        }
    }

    if interrupted {
        return Err(RepoError::Cancelled);
    }
    result
}

/// Admission rules that depend on the repository's on-disk state.
fn check_gate(repo: &dyn ObjectRepo, path: &Path, kind: OperationKind) -> RepoResult<()> {
    let merging = !repo.merge_state()?.is_clean();
    match (merging, kind) {
        (false, kind) if kind.resolves_merge() => {
            return Err(RepoError::invalid_request("no merge in progress"));
        }
        (true, kind) if kind.resolves_merge() => return Ok(()),
        (true, OperationKind::Commit) => return Err(RepoError::DirtyMergeState),
        (true, _) => {
            return Err(RepoError::OperationInProgress {
                path: path.to_path_buf(),
                operation: None,
            });
        }
        (false, _) => {}
    }

    if requires_clean_tree(kind) {
        let status = repo.status()?;
        if status.has_tracked_changes() {
            return Err(RepoError::UncommittedChanges {
                paths: tracked_changes(&status),
            });
        }
    }
    Ok(())
}

fn merge_into_head(repo: &dyn ObjectRepo, source: &str) -> RepoResult<()> {
    match repo.apply_merge(source)? {
        MergeOutcome::Conflicted(paths) => Err(RepoError::MergeConflict { paths }),
        MergeOutcome::UpToDate => {
            debug!(source, "already up to date");
            Ok(())
        }
        MergeOutcome::FastForward(id) | MergeOutcome::Merged(id) => {
            debug!(source, head = %id.short(), "merged");
            Ok(())
        }
    }
}

fn tracked_changes(status: &WorkingTreeStatus) -> Vec<PathBuf> {
    status
        .changed
        .iter()
        .chain(&status.conflicted)
        .cloned()
        .collect()
}

fn branch_name(name: &str) -> RepoResult<String> {
    ref_name("branch", name)
}

fn ref_name(what: &str, name: &str) -> RepoResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RepoError::invalid_request(format!("{what} name is empty")));
    }
    Ok(name.to_string())
}

/// The target must be absent or an empty directory. Returns whether it
/// already existed.
fn check_clone_target(path: &Path) -> RepoResult<bool> {
    match std::fs::metadata(path) {
        Ok(metadata) if !metadata.is_dir() => {
            Err(RepoError::invalid_location(path, "not a directory"))
        }
        Ok(_) => {
            let mut entries = std::fs::read_dir(path)
                .map_err(|e| RepoError::invalid_location(path, e.to_string()))?;
            if entries.next().is_some() {
                return Err(RepoError::invalid_location(path, "directory is not empty"));
            }
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RepoError::invalid_location(path, e.to_string())),
    }
}

fn discard_partial_clone(path: &Path, existed: bool) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial clone"),
    }
    if existed {
        if let Err(e) = std::fs::create_dir_all(path) {
            warn!(path = %path.display(), error = %e, "failed to recreate clone target");
        }
    }
    debug!(path = %path.display(), "discarded partial clone");
}

fn clone_failure(err: RepoError) -> RepoError {
    match err {
        RepoError::Cancelled | RepoError::AuthRejected { .. } | RepoError::CloneFailed { .. } => {
            err
        }
        other => RepoError::CloneFailed {
            reason: other.to_string(),
        },
    }
}

/// Rejections leave the repository and its recorded error untouched.
fn is_rejection(err: &RepoError) -> bool {
    matches!(
        err,
        RepoError::OperationInProgress { .. } | RepoError::UnknownHandle { .. }
    )
}

/// Await `fut`, cancelling it once `limit` elapses. After cancelling, the
/// future gets [`CANCEL_GRACE`] to stop and roll back; a worker that does
/// not stop in time is detached and the timeout reported without it.
async fn with_deadline<T, Fut>(
    cancel: &CancellationToken,
    limit: Option<Duration>,
    fut: Fut,
) -> RepoResult<T>
where
    Fut: Future<Output = RepoResult<T>>,
{
    let Some(limit) = limit else {
        return fut.await;
    };

    tokio::pin!(fut);
    tokio::select! {
        result = &mut fut => result,
        _ = tokio::time::sleep(limit) => {
            warn!(timeout = ?limit, "operation timed out, cancelling");
            cancel.cancel();
            match tokio::time::timeout(CANCEL_GRACE, &mut fut).await {
                Ok(Err(RepoError::Cancelled)) => Err(timed_out(limit)),
                Ok(other) => other,
                Err(_) => {
                    warn!(grace = ?CANCEL_GRACE, "worker ignored cancellation, detaching");
                    Err(timed_out(limit))
                }
            }
        }
    }
}

fn timed_out(limit: Duration) -> RepoError {
    RepoError::network(format!("timed out after {limit:?}"))
}

fn worker_failed(err: tokio::task::JoinError) -> RepoError {
    RepoError::io(format!("blocking task failed: {err}"))
}

fn log_degraded<T>(persisted: &Persisted<T>) {
    if let Some(warning) = &persisted.warning {
        warn!(warning = %warning, "registry change is not durable yet");
    }
}
