//! Error taxonomy shared by every gitdock layer.
//!
//! Adapters translate their library errors into [`RepoError`] so that the
//! coordinator and its consumers only ever see this stable set.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{HandleId, OperationKind};

/// Result type for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Errors that can occur in the repository data layer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RepoError {
    /// The path is not a readable directory or not a repository.
    #[error("Invalid location {path}: {reason}")]
    InvalidLocation { path: PathBuf, reason: String },

    /// The path is already tracked by the registry.
    #[error("Repository at {path} is already registered")]
    AlreadyRegistered { path: PathBuf },

    /// No repository with this handle is registered.
    #[error("Unknown repository handle {id}")]
    UnknownHandle { id: HandleId },

    /// Another mutating operation holds the repository, or a merge is pending.
    #[error("Operation in progress on {path}{}", describe_operation(.operation))]
    OperationInProgress {
        path: PathBuf,
        operation: Option<OperationKind>,
    },

    /// The remote could not be reached (includes timeouts).
    #[error("Network unavailable: {message}")]
    NetworkUnavailable { message: String },

    /// The remote rejected the supplied credential.
    #[error("Authentication rejected: {message}")]
    AuthRejected { message: String },

    /// The hosting API asked us to slow down.
    #[error("Rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// The remote branch has commits the local branch does not contain.
    #[error("Push of {branch} rejected: remote has diverged (fetch and merge first)")]
    NonFastForward { branch: String },

    /// A merge stopped with unresolved conflicts.
    #[error("Merge conflict in {} path(s)", .paths.len())]
    MergeConflict { paths: Vec<PathBuf> },

    /// A merge or rebase is in progress and must be resolved first.
    #[error("A merge is in progress; resolve or abort it first")]
    DirtyMergeState,

    /// The working tree has modifications that the operation would discard.
    #[error("Uncommitted changes in {} path(s)", .paths.len())]
    UncommittedChanges { paths: Vec<PathBuf> },

    /// The selected paths produce no tree change.
    #[error("Nothing to commit")]
    NothingToCommit,

    /// The object database returned malformed or missing data.
    #[error("Corrupt object: {message}")]
    CorruptObject { message: String },

    /// A clone could not complete; nothing was left on disk.
    #[error("Clone failed: {reason}")]
    CloneFailed { reason: String },

    /// The registry change is in memory only; durability is being retried.
    #[error("Registry persistence degraded: {message}")]
    PersistenceDegraded { message: String },

    /// Local I/O failure in the object store or filesystem.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// A remote resource (owner, repository) does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The named branch does not exist.
    #[error("Branch {name} not found")]
    BranchNotFound { name: String },

    /// A branch with this name already exists.
    #[error("Branch {name} already exists")]
    BranchExists { name: String },

    /// A tag with this name already exists.
    #[error("Tag {name} already exists")]
    TagExists { name: String },

    /// Stash was asked to save a clean working tree.
    #[error("No local changes to stash")]
    NothingToStash,

    /// The request is well-formed but not allowed in the current state.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The caller cancelled the operation; local state was rolled back.
    #[error("Operation cancelled")]
    Cancelled,
}

fn describe_operation(operation: &Option<OperationKind>) -> String {
    match operation {
        Some(kind) => format!(" ({kind})"),
        None => String::new(),
    }
}

impl RepoError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidLocation { .. } => "invalid_location",
            Self::AlreadyRegistered { .. } => "already_registered",
            Self::UnknownHandle { .. } => "unknown_handle",
            Self::OperationInProgress { .. } => "operation_in_progress",
            Self::NetworkUnavailable { .. } => "network_unavailable",
            Self::AuthRejected { .. } => "auth_rejected",
            Self::RateLimited { .. } => "rate_limited",
            Self::NonFastForward { .. } => "non_fast_forward",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::DirtyMergeState => "dirty_merge_state",
            Self::UncommittedChanges { .. } => "uncommitted_changes",
            Self::NothingToCommit => "nothing_to_commit",
            Self::CorruptObject { .. } => "corrupt_object",
            Self::CloneFailed { .. } => "clone_failed",
            Self::PersistenceDegraded { .. } => "persistence_degraded",
            Self::Io { .. } => "io",
            Self::NotFound { .. } => "not_found",
            Self::BranchNotFound { .. } => "branch_not_found",
            Self::BranchExists { .. } => "branch_exists",
            Self::TagExists { .. } => "tag_exists",
            Self::NothingToStash => "nothing_to_stash",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the error is transient and worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable { .. } | Self::RateLimited { .. }
        )
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkUnavailable {
            message: message.into(),
        }
    }

    /// Create an I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create an invalid-location error.
    pub fn invalid_location(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidLocation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-request error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for RepoError {
    fn from(err: std::io::Error) -> Self {
        RepoError::Io {
            message: err.to_string(),
        }
    }
}
