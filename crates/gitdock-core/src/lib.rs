//! Core domain model for gitdock.
//!
//! Shared by the object-store adapter, the remote catalog client and the
//! operations layer:
//! - [`RepositoryHandle`], [`RepositorySnapshot`] and the remote metadata types
//! - [`RepoError`], the error taxonomy every layer reports in
//! - history types: commits, tags, stashes and diffs
//! - [`ancestry::divergence`], the bounded merge-base walk

pub mod ancestry;
mod error;
mod history;
mod model;

pub use error::{RepoError, RepoResult};
pub use history::{
    ChangeKind, CommitInfo, DiffHunk, DiffLine, DiffLineKind, DiffTarget, FileDiff, Identity,
    StashEntry, TagAnnotation, TagInfo,
};
pub use model::{
    Activity, BranchInfo, Credential, Divergence, ErrorRecord, HandleId, ObjectId, OperationKind,
    Page, PageToken, RemoteRepositoryInfo, RemoteView, RepositoryHandle, RepositorySnapshot,
    Visibility,
};
