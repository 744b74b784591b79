//! Read model projection.
//!
//! [`read_disk_state`] gathers everything the snapshot needs from an open
//! repository; [`project`] turns it, the registry entry and the cached
//! remote metadata into a [`RepositorySnapshot`]. Projection itself is pure:
//! the same inputs always yield the same snapshot.

use gitdock_core::{
    ancestry, Activity, BranchInfo, Divergence, ErrorRecord, ObjectId, RemoteView, RepoResult,
    RepositorySnapshot,
};
use gitdock_git::{Head, MergeState, ObjectRepo, WorkingTreeStatus};

use crate::storage::RegistryEntry;

/// On-disk repository state at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskState {
    pub head: Head,
    pub branches: Vec<BranchInfo>,
    /// Upstream of the current branch: short name and tip.
    pub upstream: Option<(String, ObjectId)>,
    pub divergence: Divergence,
    pub status: WorkingTreeStatus,
    pub merge: MergeState,
}

/// Read the state of `repo`, walking at most `max_depth` commits to compute
/// ahead/behind counts.
pub fn read_disk_state(repo: &dyn ObjectRepo, max_depth: usize) -> RepoResult<DiskState> {
    let head = repo.read_head()?;
    let branches = repo.branches()?;

    let upstream = match &head {
        Head::Branch { name, .. } => repo.upstream(name)?,
        Head::Unborn { .. } | Head::Detached { .. } => None,
    };

    let divergence = match (head.commit(), &upstream) {
        (Some(local), Some((_, remote))) => {
            ancestry::divergence(local, remote, max_depth, |id| repo.lineage(id))?
        }
        _ => Divergence::NoUpstream,
    };

    Ok(DiskState {
        head,
        branches,
        upstream,
        divergence,
        status: repo.status()?,
        merge: repo.merge_state()?,
    })
}

/// Everything a snapshot is derived from.
#[derive(Debug, Clone)]
pub struct ProjectionInput<'a> {
    pub entry: &'a RegistryEntry,
    pub disk: &'a DiskState,
    pub remote: Option<RemoteView>,
    pub last_error: Option<ErrorRecord>,
    pub persistence_degraded: bool,
}

fn activity(merge: &MergeState) -> Activity {
    match merge {
        MergeState::Clean => Activity::Idle,
        MergeState::Merging { source, conflicts } => Activity::Merging {
            source: source.clone(),
            conflicts: conflicts.clone(),
        },
        MergeState::Other(_) => Activity::Merging {
            source: None,
            conflicts: Vec::new(),
        },
    }
}

/// Build a snapshot. `version` is left at zero for the publisher to assign.
pub fn project(input: ProjectionInput<'_>) -> RepositorySnapshot {
    let ProjectionInput {
        entry,
        disk,
        remote,
        last_error,
        persistence_degraded,
    } = input;

    let branch = match &disk.head {
        Head::Detached { .. } => None,
        head => head.branch().map(str::to_string),
    };

    RepositorySnapshot {
        handle: entry.handle.id,
        path: entry.handle.path.clone(),
        version: 0,
        branch,
        head: disk.head.commit().cloned(),
        upstream: disk.upstream.as_ref().map(|(name, _)| name.clone()),
        divergence: disk.divergence.clone(),
        dirty: disk.status.is_dirty(),
        branches: disk.branches.clone(),
        activity: activity(&disk.merge),
        last_fetch: entry.last_sync,
        last_error,
        remote,
        persistence_degraded,
    }
}

/// Snapshot for a repository whose disk state could not be read: the
/// previous view is kept (or an empty one when there is none) and only the
/// ambient fields are refreshed.
pub fn carry_forward(
    previous: Option<&RepositorySnapshot>,
    entry: &RegistryEntry,
    remote: Option<RemoteView>,
    last_error: Option<ErrorRecord>,
    persistence_degraded: bool,
) -> RepositorySnapshot {
    let mut snapshot = match previous {
        Some(previous) => previous.clone(),
        None => RepositorySnapshot {
            handle: entry.handle.id,
            path: entry.handle.path.clone(),
            version: 0,
            branch: None,
            head: None,
            upstream: None,
            divergence: Divergence::NoUpstream,
            dirty: false,
            branches: Vec::new(),
            activity: Activity::Idle,
            last_fetch: None,
            last_error: None,
            remote: None,
            persistence_degraded: false,
        },
    };

    if let Activity::Busy { .. } = snapshot.activity {
        snapshot.activity = Activity::Idle;
    }
    snapshot.last_fetch = entry.last_sync;
    snapshot.last_error = last_error;
    snapshot.remote = remote;
    snapshot.persistence_degraded = persistence_degraded;
    snapshot
}
