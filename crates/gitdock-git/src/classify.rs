//! Translation of libgit2 errors into [`RepoError`].

use git2::{ErrorClass, ErrorCode};
use gitdock_core::{RepoError, RepoResult};
use tokio_util::sync::CancellationToken;

/// Map a libgit2 error onto the shared taxonomy.
pub fn classify(err: git2::Error) -> RepoError {
    let message = err.message().to_string();
    match err.code() {
        ErrorCode::Auth => return RepoError::AuthRejected { message },
        ErrorCode::Certificate | ErrorCode::Timeout => {
            return RepoError::NetworkUnavailable { message }
        }
        ErrorCode::NotFastForward => {
            return RepoError::NonFastForward {
                branch: String::new(),
            }
        }
        ErrorCode::User => return RepoError::Cancelled,
        ErrorCode::Conflict | ErrorCode::Uncommitted | ErrorCode::IndexDirty => {
            return RepoError::UncommittedChanges { paths: Vec::new() }
        }
        ErrorCode::Unmerged | ErrorCode::MergeConflict => return RepoError::DirtyMergeState,
        ErrorCode::HashsumMismatch => return RepoError::CorruptObject { message },
        _ => {}
    }

    match err.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl | ErrorClass::Ssh => {
            RepoError::NetworkUnavailable { message }
        }
        ErrorClass::Odb | ErrorClass::Object | ErrorClass::Zlib | ErrorClass::Tree => {
            RepoError::CorruptObject { message }
        }
        _ => RepoError::Io { message },
    }
}

/// Classify an error raised while talking to a remote.
///
/// Aborts requested through `cancel` surface as generic callback errors in
/// libgit2; the token is the source of truth.
pub fn classify_transfer(err: git2::Error, cancel: &CancellationToken) -> RepoError {
    if cancel.is_cancelled() {
        return RepoError::Cancelled;
    }
    classify(err)
}

/// `?`-friendly conversion for libgit2 results.
pub(crate) trait GitResultExt<T> {
    fn classify(self) -> RepoResult<T>;
}

impl<T> GitResultExt<T> for Result<T, git2::Error> {
    fn classify(self) -> RepoResult<T> {
        self.map_err(classify)
    }
}
