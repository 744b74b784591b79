//! Object store adapter for gitdock.
//!
//! Exposes the [`ObjectStore`] / [`ObjectRepo`] contract the operations
//! layer programs against and [`Git2Store`], its libgit2 implementation.
//! All calls are blocking; callers run them off the async executor.

mod classify;
mod git2_store;
mod store;
mod transport;

pub use classify::{classify, classify_transfer};
pub use git2_store::{Git2Repo, Git2Store};
pub use transport::set_transport_timeouts;
pub use store::{
    Author, Checkpoint, Head, HeadPointer, MergeOutcome, MergeState, ObjectRepo, ObjectStore,
    RefEntry, TreeEntry, WorkingTreeStatus, DEFAULT_REMOTE,
};
