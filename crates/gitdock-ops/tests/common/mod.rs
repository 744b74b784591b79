//! Shared fixtures for the gitdock-ops integration tests.
//!
//! Repositories are real: a bare `file://` remote seeded with one commit on
//! `main`, cloned through the coordinator. No network is involved.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use git2::build::RepoBuilder;
use git2::{IndexAddOption, Repository, RepositoryInitOptions, Signature};
use gitdock_core::ancestry::Lineage;
use gitdock_core::{
    BranchInfo, CommitInfo, Credential, DiffTarget, FileDiff, ObjectId, Page, PageToken,
    RemoteRepositoryInfo, RepoError, RepoResult, StashEntry, TagInfo, Visibility,
};
use gitdock_git::{
    Author, Checkpoint, Git2Store, Head, MergeOutcome, MergeState, ObjectRepo, ObjectStore,
    RefEntry, TreeEntry, WorkingTreeStatus,
};
use gitdock_ops::{
    Coordinator, CoordinatorSettings, CredentialSource, FixedClock, NoCredentials, Registry,
    RetryPolicy,
};
use gitdock_remote::RemoteCatalog;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Git helpers
// =============================================================================

pub fn init_repo(path: &Path) -> Repository {
    let mut options = RepositoryInitOptions::new();
    options.initial_head("main");
    let repo = Repository::init_opts(path, &options).unwrap();
    set_identity(&repo);
    repo
}

pub fn set_identity(repo: &Repository) {
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "Test").unwrap();
    config.set_str("user.email", "test@example.com").unwrap();
}

pub fn write_file(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

/// Stage everything and commit on HEAD.
pub fn commit_all(repo: &Repository, message: &str) -> ObjectId {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let signature = Signature::now("Test", "test@example.com").unwrap();
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo
        .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .unwrap();
    ObjectId::new(oid.to_string())
}

/// Commit `name` with `contents` in the working tree at `dir`.
pub fn commit_file(dir: &Path, name: &str, contents: &str, message: &str) -> ObjectId {
    let repo = Repository::open(dir).unwrap();
    write_file(dir, name, contents);
    commit_all(&repo, message)
}

/// Every file of the working tree, `.git` excluded.
pub fn tree_digest(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.file_name().is_some_and(|name| name == ".git") {
                continue;
            }
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                out.insert(relative, fs::read(&path).unwrap());
            }
        }
    }

    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

/// Every reference with its target.
pub fn refs(dir: &Path) -> BTreeMap<String, String> {
    let repo = Repository::open(dir).unwrap();
    let references = repo.references().unwrap();
    references
        .filter_map(|reference| {
            let reference = reference.ok()?;
            Some((reference.name()?.to_string(), reference.target()?.to_string()))
        })
        .collect()
}

pub fn head_commit(dir: &Path) -> ObjectId {
    let repo = Repository::open(dir).unwrap();
    let oid = repo.head().unwrap().peel_to_commit().unwrap().id();
    ObjectId::new(oid.to_string())
}

pub fn parent_count(dir: &Path) -> usize {
    let repo = Repository::open(dir).unwrap();
    let commit = repo.head().unwrap().peel_to_commit().unwrap();
    commit.parent_count()
}

/// A bare repository standing in for the hosting service.
pub struct Remote {
    _dir: TempDir,
    pub path: PathBuf,
    pub url: String,
}

impl Remote {
    /// Bare remote with `README.md` committed on `main`.
    pub fn seeded() -> Self {
        let dir = TempDir::new().unwrap();
        let seed = dir.path().join("seed");
        let repo = init_repo(&seed);
        write_file(&seed, "README.md", "hello\n");
        commit_all(&repo, "initial");

        let path = dir.path().join("remote.git");
        RepoBuilder::new()
            .bare(true)
            .clone(seed.to_str().unwrap(), &path)
            .unwrap();
        let url = format!("file://{}", path.display());

        Self {
            _dir: dir,
            path,
            url,
        }
    }

    /// Advance `main` on the remote by one commit made elsewhere.
    pub fn push_commit(&self, name: &str, contents: &str, message: &str) -> ObjectId {
        let work = TempDir::new().unwrap();
        let repo = RepoBuilder::new().clone(&self.url, work.path()).unwrap();
        set_identity(&repo);
        write_file(work.path(), name, contents);
        let id = commit_all(&repo, message);
        repo.find_remote("origin")
            .unwrap()
            .push(&["refs/heads/main:refs/heads/main"], None)
            .unwrap();
        id
    }

    pub fn head(&self) -> ObjectId {
        let repo = Repository::open_bare(&self.path).unwrap();
        ObjectId::new(repo.refname_to_id("refs/heads/main").unwrap().to_string())
    }
}

// =============================================================================
// Instrumented store
// =============================================================================

/// Holds the first caller until released.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    entered: bool,
    released: bool,
}

impl Gate {
    /// Block the first caller until [`Gate::release`] or until `cancel`
    /// fires; later callers pass straight through.
    fn pass(&self, cancel: Option<&CancellationToken>) {
        let mut state = self.state.lock().unwrap();
        if state.entered {
            return;
        }
        state.entered = true;
        self.changed.notify_all();
        while !state.released && !cancel.is_some_and(|cancel| cancel.is_cancelled()) {
            state = self
                .changed
                .wait_timeout(state, Duration::from_millis(5))
                .unwrap()
                .0;
        }
    }

    /// Wait (blocking) until a caller is held.
    pub fn wait_entered(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.entered {
            state = self
                .changed
                .wait_timeout(state, Duration::from_millis(5))
                .unwrap()
                .0;
        }
    }

    pub fn release(&self) {
        self.state.lock().unwrap().released = true;
        self.changed.notify_all();
    }
}

/// Which adapter call the gate holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gated {
    /// After the merge has been applied.
    Merge,
    /// Before the fetch starts; released early by cancellation.
    Fetch,
    /// Before the fetch starts; deaf to cancellation, like a transfer
    /// blocked on a silent server.
    StalledFetch,
    /// Before the clone starts; released early by cancellation.
    Clone,
}

/// Counts concurrent mutating adapter calls per repository path.
#[derive(Debug, Default)]
pub struct WriteTracker {
    active: Mutex<HashMap<PathBuf, usize>>,
    max_per_path: AtomicUsize,
    calls: AtomicUsize,
}

impl WriteTracker {
    fn enter(self: &Arc<Self>, path: &Path) -> WriteGuard {
        let active = {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(path.to_path_buf()).or_insert(0);
            *count += 1;
            *count
        };
        self.max_per_path.fetch_max(active, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which an overlapping writer would be seen.
        std::thread::sleep(Duration::from_millis(1));
        WriteGuard {
            writes: self.clone(),
            path: path.to_path_buf(),
        }
    }

    pub fn max_per_path(&self) -> usize {
        self.max_per_path.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct WriteGuard {
    writes: Arc<WriteTracker>,
    path: PathBuf,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Some(count) = self.writes.active.lock().unwrap().get_mut(&self.path) {
            *count -= 1;
        }
    }
}

/// [`Git2Store`] wrapper that records writers and can hold one call.
#[derive(Debug, Default)]
pub struct InstrumentedStore {
    inner: Git2Store,
    pub writes: Arc<WriteTracker>,
    gate: Option<(Gated, Arc<Gate>)>,
}

impl InstrumentedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(on: Gated, gate: Arc<Gate>) -> Self {
        Self {
            gate: Some((on, gate)),
            ..Self::default()
        }
    }
}

impl ObjectStore for InstrumentedStore {
    fn clone_repository(
        &self,
        url: &str,
        dest: &Path,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> RepoResult<()> {
        let _guard = self.writes.enter(dest);
        if let Some((Gated::Clone, gate)) = &self.gate {
            gate.pass(Some(cancel));
        }
        self.inner.clone_repository(url, dest, credential, cancel)
    }

    fn open(&self, path: &Path) -> RepoResult<Box<dyn ObjectRepo>> {
        Ok(Box::new(InstrumentedRepo {
            inner: self.inner.open(path)?,
            writes: self.writes.clone(),
            gate: self.gate.clone(),
        }))
    }
}

struct InstrumentedRepo {
    inner: Box<dyn ObjectRepo>,
    writes: Arc<WriteTracker>,
    gate: Option<(Gated, Arc<Gate>)>,
}

impl InstrumentedRepo {
    fn write(&self) -> WriteGuard {
        self.writes.enter(self.inner.path())
    }

    fn gate(&self, at: Gated, cancel: Option<&CancellationToken>) {
        if let Some((on, gate)) = &self.gate {
            if *on == at {
                gate.pass(cancel);
            }
        }
    }
}

impl ObjectRepo for InstrumentedRepo {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn remote_url(&self) -> RepoResult<Option<String>> {
        self.inner.remote_url()
    }

    fn read_head(&self) -> RepoResult<Head> {
        self.inner.read_head()
    }

    fn read_refs(&self) -> RepoResult<Vec<RefEntry>> {
        self.inner.read_refs()
    }

    fn branches(&self) -> RepoResult<Vec<BranchInfo>> {
        self.inner.branches()
    }

    fn upstream(&self, branch: &str) -> RepoResult<Option<(String, ObjectId)>> {
        self.inner.upstream(branch)
    }

    fn lineage(&self, commit: &ObjectId) -> RepoResult<Lineage> {
        self.inner.lineage(commit)
    }

    fn read_tree(&self, commit: &ObjectId) -> RepoResult<Vec<TreeEntry>> {
        self.inner.read_tree(commit)
    }

    fn write_blob(&self, bytes: &[u8]) -> RepoResult<ObjectId> {
        let _guard = self.write();
        self.inner.write_blob(bytes)
    }

    fn stage(&self, paths: &[PathBuf]) -> RepoResult<ObjectId> {
        let _guard = self.write();
        self.inner.stage(paths)
    }

    fn head_tree(&self) -> RepoResult<Option<ObjectId>> {
        self.inner.head_tree()
    }

    fn write_commit(
        &self,
        tree: &ObjectId,
        parents: &[ObjectId],
        message: &str,
        author: Option<&Author>,
    ) -> RepoResult<ObjectId> {
        let _guard = self.write();
        self.inner.write_commit(tree, parents, message, author)
    }

    fn status(&self) -> RepoResult<WorkingTreeStatus> {
        self.inner.status()
    }

    fn merge_state(&self) -> RepoResult<MergeState> {
        self.inner.merge_state()
    }

    fn apply_merge(&self, source: &str) -> RepoResult<MergeOutcome> {
        let _guard = self.write();
        let outcome = self.inner.apply_merge(source);
        self.gate(Gated::Merge, None);
        outcome
    }

    fn conclude_merge(&self, message: &str, author: Option<&Author>) -> RepoResult<ObjectId> {
        let _guard = self.write();
        self.inner.conclude_merge(message, author)
    }

    fn abort_merge(&self) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.abort_merge()
    }

    fn reset_working_tree(&self, target: &ObjectId) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.reset_working_tree(target)
    }

    fn create_branch(&self, name: &str, start_point: Option<&str>) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.create_branch(name, start_point)
    }

    fn delete_branch(&self, name: &str) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.delete_branch(name)
    }

    fn checkout(&self, name: &str, force: bool) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.checkout(name, force)
    }

    fn fetch(&self, credential: Option<&Credential>, cancel: &CancellationToken) -> RepoResult<()> {
        let _guard = self.write();
        self.gate(Gated::Fetch, Some(cancel));
        self.gate(Gated::StalledFetch, None);
        self.inner.fetch(credential, cancel)
    }

    fn push(
        &self,
        branch: &str,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.push(branch, credential, cancel)
    }

    fn checkpoint(&self) -> RepoResult<Checkpoint> {
        self.inner.checkpoint()
    }

    fn restore(&self, checkpoint: &Checkpoint, worktree: bool) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.restore(checkpoint, worktree)
    }

    fn history(&self, start: Option<&str>, limit: usize) -> RepoResult<Vec<CommitInfo>> {
        self.inner.history(start, limit)
    }

    fn tags(&self) -> RepoResult<Vec<TagInfo>> {
        self.inner.tags()
    }

    fn create_tag(&self, name: &str, target: Option<&str>, message: Option<&str>) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.create_tag(name, target, message)
    }

    fn delete_tag(&self, name: &str) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.delete_tag(name)
    }

    fn stashes(&self) -> RepoResult<Vec<StashEntry>> {
        self.inner.stashes()
    }

    fn stash_save(&self, message: Option<&str>, include_untracked: bool) -> RepoResult<ObjectId> {
        let _guard = self.write();
        self.inner.stash_save(message, include_untracked)
    }

    fn stash_apply(&self, index: usize, pop: bool) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.stash_apply(index, pop)
    }

    fn stash_drop(&self, index: usize) -> RepoResult<()> {
        let _guard = self.write();
        self.inner.stash_drop(index)
    }

    fn diff(&self, target: &DiffTarget) -> RepoResult<Vec<FileDiff>> {
        self.inner.diff(target)
    }
}

// =============================================================================
// Fake catalog
// =============================================================================

pub fn remote_info(owner: &str, name: &str) -> RemoteRepositoryInfo {
    RemoteRepositoryInfo {
        name: name.to_string(),
        owner: owner.to_string(),
        default_branch: Some("main".into()),
        visibility: Visibility::Public,
        clone_url: Some(format!("https://github.com/{owner}/{name}.git")),
        description: None,
        html_url: Some(format!("https://github.com/{owner}/{name}")),
    }
}

/// Scripted catalog for github.com.
#[derive(Debug, Default)]
pub struct FakeCatalog {
    /// Answer for every `get_repository` call.
    pub repository: Mutex<Option<RepoResult<RemoteRepositoryInfo>>>,
    /// Answers for `list_repositories`, consumed in order.
    pub pages: Mutex<VecDeque<RepoResult<Page<RemoteRepositoryInfo>>>>,
    pub get_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub saw_credential: Mutex<Option<bool>>,
}

impl FakeCatalog {
    pub fn answer(&self, result: RepoResult<RemoteRepositoryInfo>) {
        *self.repository.lock().unwrap() = Some(result);
    }

    pub fn queue_page(&self, result: RepoResult<Page<RemoteRepositoryInfo>>) {
        self.pages.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl RemoteCatalog for FakeCatalog {
    async fn list_repositories(
        &self,
        owner: &str,
        _page: Option<&PageToken>,
        credential: Option<&Credential>,
    ) -> RepoResult<Page<RemoteRepositoryInfo>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        *self.saw_credential.lock().unwrap() = Some(credential.is_some());
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RepoError::NotFound { what: owner.into() }))
    }

    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
        credential: Option<&Credential>,
    ) -> RepoResult<RemoteRepositoryInfo> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        *self.saw_credential.lock().unwrap() = Some(credential.is_some());
        self.repository
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(remote_info(owner, name)))
    }

    fn host(&self) -> &str {
        "github.com"
    }
}

// =============================================================================
// Coordinator harness
// =============================================================================

pub fn fast_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        timeout: Duration::from_secs(30),
        ancestry_depth: 10_000,
        remote_ttl: Duration::from_secs(300),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
    }
}

pub struct Harness {
    pub root: TempDir,
    pub remote: Remote,
    pub coordinator: Arc<Coordinator>,
    pub clock: Arc<FixedClock>,
    pub catalog: Arc<FakeCatalog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InstrumentedStore::new()))
    }

    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_parts(store, Arc::new(NoCredentials))
    }

    pub fn with_parts(store: Arc<dyn ObjectStore>, credentials: Arc<dyn CredentialSource>) -> Self {
        let clock = Arc::new(FixedClock::new(
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        ));
        let catalog = Arc::new(FakeCatalog::default());
        let coordinator = Coordinator::new(
            Registry::in_memory(),
            store,
            catalog.clone(),
            credentials,
            fast_settings(),
        )
        .with_clock(clock.clone());

        Self {
            root: TempDir::new().unwrap(),
            remote: Remote::seeded(),
            coordinator: Arc::new(coordinator),
            clock,
            catalog,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// Clone the seeded remote into `name`.
    pub async fn clone_into(&self, name: &str) -> (gitdock_core::HandleId, PathBuf) {
        let path = self.path(name);
        let snapshot = self
            .coordinator
            .clone_repository(&path, &self.remote.url, Default::default())
            .await
            .unwrap();
        (snapshot.handle, snapshot.path)
    }
}
