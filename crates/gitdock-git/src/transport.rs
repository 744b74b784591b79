//! Remote callbacks shared by clone, fetch and push.

use std::time::Duration;

use git2::{Cred, CredentialType, ErrorClass, ErrorCode, RemoteCallbacks};
use gitdock_core::{Credential, RepoResult};
use tokio_util::sync::CancellationToken;

use crate::classify::GitResultExt;

/// Bound how long libgit2 waits to connect to a remote and for each read or
/// write on the connection. Cancellation is only seen between progress
/// callbacks, so without this a silent server blocks a transfer forever.
///
/// The setting is process-wide. Call it once at startup, before any
/// transfer runs.
pub fn set_transport_timeouts(timeout: Duration) -> RepoResult<()> {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: both options are plain integers read when a connection opens;
    // they are written here before any transfer thread exists.
    unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis).classify()?;
        git2::opts::set_server_timeout_in_milliseconds(millis).classify()?;
    }
    tracing::debug!(timeout_ms = millis, "transport timeouts set");
    Ok(())
}

/// Build callbacks that authenticate with `credential` and abort the
/// transfer once `cancel` fires.
///
/// libgit2 calls the credential callback again after a rejection; the second
/// call fails with an auth error instead of looping forever.
pub(crate) fn callbacks<'a>(
    credential: Option<&'a Credential>,
    cancel: &'a CancellationToken,
) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0u32;

    callbacks.credentials(move |_url, username_from_url, allowed| {
        attempts += 1;
        if attempts > 1 {
            return Err(git2::Error::new(
                ErrorCode::Auth,
                ErrorClass::Callback,
                "credentials rejected by remote",
            ));
        }

        match credential {
            Some(credential) if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) => {
                let (username, secret) = credential.userpass();
                Cred::userpass_plaintext(username, secret)
            }
            _ if allowed.contains(CredentialType::SSH_KEY) => {
                Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
            }
            _ if allowed.contains(CredentialType::DEFAULT) => Cred::default(),
            _ => Err(git2::Error::new(
                ErrorCode::Auth,
                ErrorClass::Callback,
                "no credential available for remote",
            )),
        }
    });

    callbacks.transfer_progress(move |progress| {
        tracing::trace!(
            received = progress.received_objects(),
            total = progress.total_objects(),
            "transfer progress"
        );
        !cancel.is_cancelled()
    });
    callbacks.sideband_progress(move |_| !cancel.is_cancelled());

    callbacks
}
