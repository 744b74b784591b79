//! Object store contract.
//!
//! [`ObjectStore`] opens or clones repositories; [`ObjectRepo`] is one open
//! repository. Neither applies business policy: the coordinator decides
//! when an operation is allowed, the adapter only performs it.

use std::path::{Path, PathBuf};

use gitdock_core::ancestry::Lineage;
use gitdock_core::{
    BranchInfo, CommitInfo, Credential, DiffTarget, FileDiff, ObjectId, RepoResult, StashEntry,
    TagInfo,
};
use tokio_util::sync::CancellationToken;

/// Name of the remote every managed repository syncs with.
pub const DEFAULT_REMOTE: &str = "origin";

/// Where HEAD points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    /// Branch exists but has no commits yet.
    Unborn { branch: String },
    Branch { name: String, commit: ObjectId },
    Detached { commit: ObjectId },
}

impl Head {
    pub fn commit(&self) -> Option<&ObjectId> {
        match self {
            Head::Unborn { .. } => None,
            Head::Branch { commit, .. } | Head::Detached { commit } => Some(commit),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            Head::Unborn { branch } => Some(branch),
            Head::Branch { name, .. } => Some(name),
            Head::Detached { .. } => None,
        }
    }
}

/// A direct (non-symbolic) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub name: String,
    pub target: ObjectId,
}

/// A blob reachable from a commit's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: PathBuf,
    pub id: ObjectId,
}

/// Working tree state relative to HEAD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingTreeStatus {
    /// Tracked paths modified in the index or the working tree.
    pub changed: Vec<PathBuf>,
    pub untracked: Vec<PathBuf>,
    pub conflicted: Vec<PathBuf>,
}

impl WorkingTreeStatus {
    pub fn is_dirty(&self) -> bool {
        !self.changed.is_empty() || !self.untracked.is_empty() || !self.conflicted.is_empty()
    }

    /// Tracked changes an operation could overwrite.
    pub fn has_tracked_changes(&self) -> bool {
        !self.changed.is_empty() || !self.conflicted.is_empty()
    }
}

/// In-progress multi-step operation recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeState {
    Clean,
    Merging {
        source: Option<ObjectId>,
        conflicts: Vec<PathBuf>,
    },
    /// Rebase, cherry-pick, revert, bisect... started outside gitdock.
    Other(String),
}

impl MergeState {
    pub fn is_clean(&self) -> bool {
        matches!(self, MergeState::Clean)
    }
}

/// Result of applying a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    UpToDate,
    FastForward(ObjectId),
    Merged(ObjectId),
    /// The merge stopped; the repository is now in the merging state.
    Conflicted(Vec<PathBuf>),
}

/// Commit author; the repository configuration is used when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// Where HEAD pointed when a checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadPointer {
    Symbolic(String),
    Detached(ObjectId),
}

/// Pre-operation state used to roll back a cancelled or failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub head: HeadPointer,
    /// Commit HEAD resolved to, `None` when unborn.
    pub commit: Option<ObjectId>,
    /// Branch and remote-tracking refs.
    pub refs: Vec<RefEntry>,
}

/// Opens and clones repositories.
pub trait ObjectStore: Send + Sync {
    /// Clone `url` into `dest`. On error `dest` may hold partial content;
    /// removing it is the caller's job.
    fn clone_repository(
        &self,
        url: &str,
        dest: &Path,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> RepoResult<()>;

    /// Open an existing working-tree repository.
    fn open(&self, path: &Path) -> RepoResult<Box<dyn ObjectRepo>>;
}

/// One open repository.
pub trait ObjectRepo: Send {
    fn path(&self) -> &Path;

    /// URL of the default remote, if configured.
    fn remote_url(&self) -> RepoResult<Option<String>>;

    fn read_head(&self) -> RepoResult<Head>;

    fn read_refs(&self) -> RepoResult<Vec<RefEntry>>;

    /// Local branches sorted by name.
    fn branches(&self) -> RepoResult<Vec<BranchInfo>>;

    /// Upstream short name and tip of a local branch.
    fn upstream(&self, branch: &str) -> RepoResult<Option<(String, ObjectId)>>;

    /// Commit time and parents, for ancestry walks.
    fn lineage(&self, commit: &ObjectId) -> RepoResult<Lineage>;

    fn read_tree(&self, commit: &ObjectId) -> RepoResult<Vec<TreeEntry>>;

    fn write_blob(&self, bytes: &[u8]) -> RepoResult<ObjectId>;

    /// Stage `paths` (all tracked changes when empty) and return the index tree.
    fn stage(&self, paths: &[PathBuf]) -> RepoResult<ObjectId>;

    /// Tree of the HEAD commit, `None` when unborn.
    fn head_tree(&self) -> RepoResult<Option<ObjectId>>;

    /// Write a commit and advance HEAD to it.
    fn write_commit(
        &self,
        tree: &ObjectId,
        parents: &[ObjectId],
        message: &str,
        author: Option<&Author>,
    ) -> RepoResult<ObjectId>;

    fn status(&self) -> RepoResult<WorkingTreeStatus>;

    fn merge_state(&self) -> RepoResult<MergeState>;

    /// Merge a local or remote-tracking branch into HEAD.
    fn apply_merge(&self, source: &str) -> RepoResult<MergeOutcome>;

    /// Commit the resolved merge; fails with `MergeConflict` while
    /// conflicts remain.
    fn conclude_merge(&self, message: &str, author: Option<&Author>) -> RepoResult<ObjectId>;

    /// Reset index and working tree to HEAD and leave the merging state.
    fn abort_merge(&self) -> RepoResult<()>;

    /// Hard reset to `target`.
    fn reset_working_tree(&self, target: &ObjectId) -> RepoResult<()>;

    fn create_branch(&self, name: &str, start_point: Option<&str>) -> RepoResult<()>;

    fn delete_branch(&self, name: &str) -> RepoResult<()>;

    /// Switch branches; `force` discards local modifications.
    fn checkout(&self, name: &str, force: bool) -> RepoResult<()>;

    /// Fetch from the default remote; never touches the working tree.
    fn fetch(&self, credential: Option<&Credential>, cancel: &CancellationToken)
        -> RepoResult<()>;

    /// Push `branch` to the default remote.
    fn push(
        &self,
        branch: &str,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> RepoResult<()>;

    fn checkpoint(&self) -> RepoResult<Checkpoint>;

    /// Restore refs (and, with `worktree`, HEAD content) to a checkpoint.
    fn restore(&self, checkpoint: &Checkpoint, worktree: bool) -> RepoResult<()>;

    /// Up to `limit` commits reachable from `start` (HEAD when `None`),
    /// newest first. Empty for an unborn HEAD.
    fn history(&self, start: Option<&str>, limit: usize) -> RepoResult<Vec<CommitInfo>>;

    /// Tags sorted by name.
    fn tags(&self) -> RepoResult<Vec<TagInfo>>;

    /// Tag `target` (HEAD when `None`). A `message` makes it annotated.
    fn create_tag(&self, name: &str, target: Option<&str>, message: Option<&str>)
        -> RepoResult<()>;

    fn delete_tag(&self, name: &str) -> RepoResult<()>;

    /// Saved stashes, most recent first.
    fn stashes(&self) -> RepoResult<Vec<StashEntry>>;

    /// Stash local changes and reset the working tree to HEAD. Fails with
    /// `NothingToStash` on a clean tree.
    fn stash_save(&self, message: Option<&str>, include_untracked: bool) -> RepoResult<ObjectId>;

    /// Apply stash `index`; with `pop` it is dropped once applied without
    /// conflicts. Conflicts are left in the index and reported as
    /// `MergeConflict`.
    fn stash_apply(&self, index: usize, pop: bool) -> RepoResult<()>;

    fn stash_drop(&self, index: usize) -> RepoResult<()>;

    fn diff(&self, target: &DiffTarget) -> RepoResult<Vec<FileDiff>>;
}
