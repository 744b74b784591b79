//! Domain model: handles, snapshots, remote metadata and credentials.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RepoError;

// =============================================================================
// Identity
// =============================================================================

/// Stable identifier of a managed repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub Uuid);

impl HandleId {
    /// Allocate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in listings (first 8 hex digits).
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for HandleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A repository known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryHandle {
    /// Stable id.
    pub id: HandleId,
    /// Absolute, normalized path of the working tree.
    pub path: PathBuf,
    /// URL of the `origin` remote, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

/// Hex-encoded object id (commit, tree or blob).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for display.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(7)]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Kinds of mutating operations guarded by an operation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Clone,
    Fetch,
    Pull,
    Push,
    Commit,
    Merge,
    ResolveMerge,
    AbortMerge,
    CreateBranch,
    DeleteBranch,
    Checkout,
    Remove,
    Import,
    CreateTag,
    DeleteTag,
    StashSave,
    StashApply,
    StashPop,
    StashDrop,
}

impl OperationKind {
    /// Operations that talk to a remote and therefore carry a timeout.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Clone | Self::Fetch | Self::Pull | Self::Push)
    }

    /// Operations accepted while the repository is merging.
    pub fn resolves_merge(&self) -> bool {
        matches!(self, Self::ResolveMerge | Self::AbortMerge)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Clone => "clone",
            Self::Fetch => "fetch",
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Commit => "commit",
            Self::Merge => "merge",
            Self::ResolveMerge => "resolve merge",
            Self::AbortMerge => "abort merge",
            Self::CreateBranch => "create branch",
            Self::DeleteBranch => "delete branch",
            Self::Checkout => "checkout",
            Self::Remove => "remove",
            Self::Import => "import",
            Self::CreateTag => "create tag",
            Self::DeleteTag => "delete tag",
            Self::StashSave => "stash",
            Self::StashApply => "stash apply",
            Self::StashPop => "stash pop",
            Self::StashDrop => "stash drop",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Ahead/behind relation between the local head and its upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Divergence {
    /// The current branch has no upstream (or HEAD is detached/unborn).
    NoUpstream,
    /// Counts relative to the merge base.
    Known { ahead: usize, behind: usize },
    /// No common ancestor found within the traversal bound.
    Unknown,
}

impl Divergence {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// `(ahead, behind)` when known.
    pub fn counts(&self) -> Option<(usize, usize)> {
        match self {
            Self::Known { ahead, behind } => Some((*ahead, *behind)),
            _ => None,
        }
    }
}

/// What the repository is doing right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Activity {
    Idle,
    Busy {
        operation: OperationKind,
    },
    /// A merge stopped on conflicts; only resolve or abort are accepted.
    Merging {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ObjectId>,
        conflicts: Vec<PathBuf>,
    },
}

/// A local branch as seen by the projector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub head: ObjectId,
    pub is_current: bool,
    /// Short name of the tracked remote branch, e.g. `origin/main`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

/// Failure recorded on the snapshot so consumers can show current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub operation: Option<OperationKind>,
    pub error: RepoError,
    pub at: SystemTime,
}

/// Cached remote metadata as exposed on a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteView {
    pub info: RemoteRepositoryInfo,
    pub fetched_at: SystemTime,
    /// Past its time-to-live; still shown as last-known-good.
    pub stale: bool,
}

/// Immutable, versioned view of a repository at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub handle: HandleId,
    pub path: PathBuf,
    /// Incremented whenever the repository view changes.
    pub version: u64,
    /// Current branch; `None` when HEAD is detached.
    pub branch: Option<String>,
    /// Head commit; `None` on an unborn branch.
    pub head: Option<ObjectId>,
    pub upstream: Option<String>,
    pub divergence: Divergence,
    pub dirty: bool,
    pub branches: Vec<BranchInfo>,
    pub activity: Activity,
    pub last_fetch: Option<SystemTime>,
    pub last_error: Option<ErrorRecord>,
    pub remote: Option<RemoteView>,
    /// The registry could not persist its latest change yet.
    pub persistence_degraded: bool,
}

impl RepositorySnapshot {
    /// No common ancestor was found within the walk bound.
    pub fn divergence_unknown(&self) -> bool {
        self.divergence.is_unknown()
    }

    pub fn is_merging(&self) -> bool {
        matches!(self.activity, Activity::Merging { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.activity, Activity::Busy { .. })
    }

    /// Equal ignoring `version` and transient `Busy` activity.
    pub fn same_view(&self, other: &Self) -> bool {
        fn settled(activity: &Activity) -> Option<&Activity> {
            match activity {
                Activity::Busy { .. } => None,
                other => Some(other),
            }
        }

        self.handle == other.handle
            && self.path == other.path
            && self.branch == other.branch
            && self.head == other.head
            && self.upstream == other.upstream
            && self.divergence == other.divergence
            && self.dirty == other.dirty
            && self.branches == other.branches
            && settled(&self.activity) == settled(&other.activity)
            && self.last_fetch == other.last_fetch
            && self.last_error == other.last_error
            && self.remote == other.remote
            && self.persistence_degraded == other.persistence_degraded
    }
}

// =============================================================================
// Remote catalog
// =============================================================================

/// Repository visibility on the hosting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    Internal,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Internal => "internal",
        })
    }
}

/// Metadata fetched from the hosting API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepositoryInfo {
    pub name: String,
    pub owner: String,
    pub default_branch: Option<String>,
    pub visibility: Visibility,
    pub clone_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_url: Option<String>,
}

/// Opaque paging cursor; callers pass it back unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(pub String);

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

// =============================================================================
// Credentials
// =============================================================================

/// Authentication material supplied by an external collaborator.
///
/// Deliberately neither `Serialize` nor `Display`; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Personal access / OAuth token.
    Token(String),
    /// Username and password (or app password).
    UserPass { username: String, password: String },
}

impl Credential {
    /// `(username, secret)` pair for HTTP basic-style transports.
    pub fn userpass(&self) -> (&str, &str) {
        match self {
            Self::Token(token) => ("x-access-token", token.as_str()),
            Self::UserPass { username, password } => (username.as_str(), password.as_str()),
        }
    }

    /// Bearer-style secret for REST APIs.
    pub fn secret(&self) -> &str {
        match self {
            Self::Token(token) => token,
            Self::UserPass { password, .. } => password,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Credential::Token(***)"),
            Self::UserPass { username, .. } => {
                write!(f, "Credential::UserPass({username}, ***)")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> RepositorySnapshot {
        RepositorySnapshot {
            handle: HandleId::new(),
            path: PathBuf::from("/tmp/repo"),
            version: 1,
            branch: Some("main".into()),
            head: Some(ObjectId::new("abc1234def")),
            upstream: Some("origin/main".into()),
            divergence: Divergence::Known {
                ahead: 0,
                behind: 0,
            },
            dirty: false,
            branches: vec![],
            activity: Activity::Idle,
            last_fetch: None,
            last_error: None,
            remote: None,
            persistence_degraded: false,
        }
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let token = Credential::Token("ghp_secret".into());
        assert!(!format!("{:?}", token).contains("ghp_secret"));

        let pass = Credential::UserPass {
            username: "octo".into(),
            password: "hunter2".into(),
        };
        let debug = format!("{:?}", pass);
        assert!(debug.contains("octo"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_same_view_ignores_version_and_busy() {
        let a = sample_snapshot();
        let mut b = a.clone();
        b.version = 7;
        b.activity = Activity::Busy {
            operation: OperationKind::Fetch,
        };
        assert!(a.same_view(&b));

        b.dirty = true;
        assert!(!a.same_view(&b));
    }

    #[test]
    fn test_merging_is_part_of_view() {
        let a = sample_snapshot();
        let mut b = a.clone();
        b.activity = Activity::Merging {
            source: None,
            conflicts: vec![PathBuf::from("README.md")],
        };
        assert!(!a.same_view(&b));
        assert!(b.is_merging());
    }

    #[test]
    fn test_handle_id_roundtrip() {
        let id = HandleId::new();
        let parsed: HandleId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_object_id_short() {
        assert_eq!(ObjectId::new("0123456789abcdef").short(), "0123456");
        assert_eq!(ObjectId::new("abc").short(), "abc");
    }
}
