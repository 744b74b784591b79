//! libgit2-backed [`ObjectStore`].

use std::fs;
use std::path::{Component, Path, PathBuf};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, Delta, DiffFlags, DiffOptions, Direction, ErrorCode, FetchOptions, ObjectType,
    Oid, Patch, PushOptions, Reference, Repository, RepositoryState, ResetType, Signature, Sort,
    StashFlags, StatusOptions, TreeWalkMode, TreeWalkResult,
};
use gitdock_core::ancestry::Lineage;
use gitdock_core::{
    BranchInfo, ChangeKind, CommitInfo, Credential, DiffHunk, DiffLine, DiffLineKind, DiffTarget,
    FileDiff, Identity, ObjectId, RepoError, RepoResult, StashEntry, TagAnnotation, TagInfo,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::classify::{classify, classify_transfer, GitResultExt};
use crate::store::{
    Author, Checkpoint, Head, HeadPointer, MergeOutcome, MergeState, ObjectRepo, ObjectStore,
    RefEntry, TreeEntry, WorkingTreeStatus, DEFAULT_REMOTE,
};
use crate::transport;

const FALLBACK_NAME: &str = "gitdock";
const FALLBACK_EMAIL: &str = "gitdock@localhost";

/// Object store using libgit2 through the `git2` crate.
#[derive(Debug, Clone, Default)]
pub struct Git2Store;

impl Git2Store {
    pub fn new() -> Self {
        Self
    }
}

impl ObjectStore for Git2Store {
    fn clone_repository(
        &self,
        url: &str,
        dest: &Path,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> RepoResult<()> {
        info!(url = %url, dest = %dest.display(), "cloning");

        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(transport::callbacks(credential, cancel));

        RepoBuilder::new()
            .fetch_options(fetch)
            .clone(url, dest)
            .map_err(|e| classify_transfer(e, cancel))?;
        Ok(())
    }

    fn open(&self, path: &Path) -> RepoResult<Box<dyn ObjectRepo>> {
        let repo = Repository::open(path).map_err(|e| match e.code() {
            ErrorCode::NotFound => RepoError::invalid_location(path, "not a git repository"),
            _ => classify(e),
        })?;
        if repo.is_bare() {
            return Err(RepoError::invalid_location(
                path,
                "bare repositories have no working tree",
            ));
        }
        Ok(Box::new(Git2Repo {
            repo,
            path: path.to_path_buf(),
        }))
    }
}

/// An open repository.
pub struct Git2Repo {
    repo: Repository,
    path: PathBuf,
}

fn object_id(oid: Oid) -> ObjectId {
    ObjectId::new(oid.to_string())
}

fn oid_of(id: &ObjectId) -> RepoResult<Oid> {
    Oid::from_str(id.as_str()).map_err(|e| RepoError::CorruptObject {
        message: format!("invalid object id {id}: {}", e.message()),
    })
}

fn not_found_as_branch(name: &str) -> impl FnOnce(git2::Error) -> RepoError + '_ {
    move |e| match e.code() {
        ErrorCode::NotFound => RepoError::BranchNotFound {
            name: name.to_string(),
        },
        _ => classify(e),
    }
}

fn is_tracked_ref(name: &str) -> bool {
    name.starts_with("refs/heads/") || name.starts_with("refs/remotes/")
}

impl Git2Repo {
    fn workdir(&self) -> RepoResult<&Path> {
        self.repo
            .workdir()
            .ok_or_else(|| RepoError::invalid_location(&self.path, "no working tree"))
    }

    /// Path relative to the working tree; rejects escapes.
    fn relative(&self, path: &Path) -> RepoResult<PathBuf> {
        let relative = if path.is_absolute() {
            path.strip_prefix(self.workdir()?)
                .map_err(|_| {
                    RepoError::invalid_request(format!(
                        "{} is outside the working tree",
                        path.display()
                    ))
                })?
                .to_path_buf()
        } else {
            path.to_path_buf()
        };

        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(RepoError::invalid_request(format!(
                "invalid path {}",
                path.display()
            )));
        }
        Ok(relative)
    }

    fn signature(&self, author: Option<&Author>) -> RepoResult<Signature<'static>> {
        if let Some(author) = author {
            return Signature::now(&author.name, &author.email).classify();
        }
        match self.repo.signature() {
            Ok(signature) => Ok(signature.to_owned()),
            Err(_) => Signature::now(FALLBACK_NAME, FALLBACK_EMAIL).classify(),
        }
    }

    fn head_commit(&self) -> RepoResult<Option<git2::Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => head.peel_to_commit().map(Some).classify(),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(e) => Err(classify(e)),
        }
    }

    fn conflicted_paths(&self) -> RepoResult<Vec<PathBuf>> {
        index_conflicts(&self.repo)
    }

    /// A second handle on the repository for the libgit2 calls that need
    /// exclusive access (the stash family).
    fn reopen(&self) -> RepoResult<Repository> {
        Repository::open(&self.path).classify()
    }

    fn revision(&self, rev: &str) -> RepoResult<git2::Commit<'_>> {
        self.repo
            .revparse_single(rev)
            .and_then(|object| object.peel_to_commit())
            .map_err(|e| match e.code() {
                ErrorCode::NotFound | ErrorCode::Ambiguous | ErrorCode::InvalidSpec => {
                    RepoError::NotFound {
                        what: format!("revision {rev}"),
                    }
                }
                _ => classify(e),
            })
    }

    /// Fail with `NotFound` unless stash `index` exists.
    fn check_stash(&self, repo: &mut Repository, index: usize) -> RepoResult<()> {
        let mut count = 0;
        repo.stash_foreach(|_, _, _| {
            count += 1;
            true
        })
        .classify()?;
        if index >= count {
            return Err(RepoError::NotFound {
                what: format!("stash@{{{index}}}"),
            });
        }
        Ok(())
    }
}

fn index_conflicts(repo: &Repository) -> RepoResult<Vec<PathBuf>> {
    let index = repo.index().classify()?;
    if !index.has_conflicts() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for conflict in index.conflicts().classify()? {
        let conflict = conflict.classify()?;
        let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
        if let Some(entry) = entry {
            paths.push(PathBuf::from(
                String::from_utf8_lossy(&entry.path).into_owned(),
            ));
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

impl Git2Repo {
    fn merge_head(&self) -> Option<ObjectId> {
        let contents = fs::read_to_string(self.repo.path().join("MERGE_HEAD")).ok()?;
        contents
            .lines()
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ObjectId::new)
    }

    /// Resolve a short branch name (`main`, `origin/main`) to a reference.
    fn branch_reference(&self, name: &str) -> RepoResult<Reference<'_>> {
        self.repo
            .resolve_reference_from_short_name(name)
            .map_err(not_found_as_branch(name))
    }

    /// Commit id `refname` currently points to on the default remote.
    fn remote_tip(
        &self,
        remote: &mut git2::Remote<'_>,
        refname: &str,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> RepoResult<Option<Oid>> {
        let connection = remote
            .connect_auth(
                Direction::Push,
                Some(transport::callbacks(credential, cancel)),
                None,
            )
            .map_err(|e| classify_transfer(e, cancel))?;
        let heads = connection
            .list()
            .map_err(|e| classify_transfer(e, cancel))?;
        Ok(heads
            .iter()
            .find(|head| head.name() == refname)
            .map(|head| head.oid()))
    }

    fn find_origin(&self) -> RepoResult<git2::Remote<'_>> {
        self.repo
            .find_remote(DEFAULT_REMOTE)
            .map_err(|e| match e.code() {
                ErrorCode::NotFound => RepoError::invalid_request(format!(
                    "repository has no {DEFAULT_REMOTE} remote"
                )),
                _ => classify(e),
            })
    }

    fn tracked_refs(&self) -> RepoResult<Vec<RefEntry>> {
        Ok(self
            .read_refs()?
            .into_iter()
            .filter(|entry| is_tracked_ref(&entry.name))
            .collect())
    }
}

impl ObjectRepo for Git2Repo {
    fn path(&self) -> &Path {
        &self.path
    }

    fn remote_url(&self) -> RepoResult<Option<String>> {
        match self.repo.find_remote(DEFAULT_REMOTE) {
            Ok(remote) => Ok(remote.url().map(str::to_string)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    fn read_head(&self) -> RepoResult<Head> {
        match self.repo.head() {
            Ok(reference) => {
                let commit = object_id(reference.peel_to_commit().classify()?.id());
                if self.repo.head_detached().classify()? {
                    Ok(Head::Detached { commit })
                } else {
                    let name = reference.shorthand().unwrap_or("HEAD").to_string();
                    Ok(Head::Branch { name, commit })
                }
            }
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                let head = self.repo.find_reference("HEAD").classify()?;
                let target = head.symbolic_target().unwrap_or("refs/heads/main");
                Ok(Head::Unborn {
                    branch: target.trim_start_matches("refs/heads/").to_string(),
                })
            }
            Err(e) => Err(classify(e)),
        }
    }

    fn read_refs(&self) -> RepoResult<Vec<RefEntry>> {
        let mut refs = Vec::new();
        for reference in self.repo.references().classify()? {
            let reference = reference.classify()?;
            let (Some(name), Some(target)) = (reference.name(), reference.target()) else {
                continue;
            };
            refs.push(RefEntry {
                name: name.to_string(),
                target: object_id(target),
            });
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    fn branches(&self) -> RepoResult<Vec<BranchInfo>> {
        let mut branches = Vec::new();
        for item in self.repo.branches(Some(BranchType::Local)).classify()? {
            let (branch, _) = item.classify()?;
            let Some(name) = branch.name().classify()?.map(str::to_string) else {
                continue;
            };
            let Some(target) = branch.get().target() else {
                continue;
            };
            let upstream = match branch.upstream() {
                Ok(upstream) => upstream.name().classify()?.map(str::to_string),
                Err(_) => None,
            };
            branches.push(BranchInfo {
                name,
                head: object_id(target),
                is_current: branch.is_head(),
                upstream,
            });
        }
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    fn upstream(&self, branch: &str) -> RepoResult<Option<(String, ObjectId)>> {
        let local = self
            .repo
            .find_branch(branch, BranchType::Local)
            .map_err(not_found_as_branch(branch))?;
        match local.upstream() {
            Ok(upstream) => {
                let name = upstream.name().classify()?.map(str::to_string);
                let target = upstream.get().target().map(object_id);
                Ok(name.zip(target))
            }
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    fn lineage(&self, commit: &ObjectId) -> RepoResult<Lineage> {
        let commit = self.repo.find_commit(oid_of(commit)?).classify()?;
        Ok(Lineage {
            time: commit.time().seconds(),
            parents: commit.parent_ids().map(object_id).collect(),
        })
    }

    fn read_tree(&self, commit: &ObjectId) -> RepoResult<Vec<TreeEntry>> {
        let commit = self.repo.find_commit(oid_of(commit)?).classify()?;
        let tree = commit.tree().classify()?;

        let mut entries = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    entries.push(TreeEntry {
                        path: PathBuf::from(format!("{root}{name}")),
                        id: object_id(entry.id()),
                    });
                }
            }
            TreeWalkResult::Ok
        })
        .classify()?;
        Ok(entries)
    }

    fn write_blob(&self, bytes: &[u8]) -> RepoResult<ObjectId> {
        self.repo.blob(bytes).map(object_id).classify()
    }

    fn stage(&self, paths: &[PathBuf]) -> RepoResult<ObjectId> {
        let mut index = self.repo.index().classify()?;

        if paths.is_empty() {
            index.update_all(["*"], None).classify()?;
        } else {
            let workdir = self.workdir()?.to_path_buf();
            for path in paths {
                let relative = self.relative(path)?;
                if workdir.join(&relative).is_file() {
                    index.add_path(&relative).classify()?;
                } else {
                    index.remove_path(&relative).classify()?;
                }
            }
        }

        index.write().classify()?;
        index.write_tree().map(object_id).classify()
    }

    fn head_tree(&self) -> RepoResult<Option<ObjectId>> {
        Ok(self
            .head_commit()?
            .map(|commit| object_id(commit.tree_id())))
    }

    fn write_commit(
        &self,
        tree: &ObjectId,
        parents: &[ObjectId],
        message: &str,
        author: Option<&Author>,
    ) -> RepoResult<ObjectId> {
        let tree = self.repo.find_tree(oid_of(tree)?).classify()?;
        let parents = parents
            .iter()
            .map(|id| self.repo.find_commit(oid_of(id)?).classify())
            .collect::<RepoResult<Vec<_>>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

        let signature = self.signature(author)?;
        let oid = self
            .repo
            .commit(
                Some("HEAD"),
                &signature,
                &signature,
                message,
                &tree,
                &parent_refs,
            )
            .classify()?;
        debug!(commit = %oid, "wrote commit");
        Ok(object_id(oid))
    }

    fn status(&self) -> RepoResult<WorkingTreeStatus> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);

        let mut status = WorkingTreeStatus::default();
        for entry in self.repo.statuses(Some(&mut options)).classify()?.iter() {
            let Some(path) = entry.path() else {
                continue;
            };
            let path = PathBuf::from(path);
            let flags = entry.status();

            if flags.is_conflicted() {
                status.conflicted.push(path);
            } else if flags == git2::Status::WT_NEW {
                status.untracked.push(path);
            } else if !flags.is_ignored() && flags != git2::Status::CURRENT {
                status.changed.push(path);
            }
        }
        Ok(status)
    }

    fn merge_state(&self) -> RepoResult<MergeState> {
        match self.repo.state() {
            RepositoryState::Clean => Ok(MergeState::Clean),
            RepositoryState::Merge => Ok(MergeState::Merging {
                source: self.merge_head(),
                conflicts: self.conflicted_paths()?,
            }),
            other => Ok(MergeState::Other(format!("{other:?}").to_lowercase())),
        }
    }

    fn apply_merge(&self, source: &str) -> RepoResult<MergeOutcome> {
        let reference = self.branch_reference(source)?;
        let annotated = self
            .repo
            .reference_to_annotated_commit(&reference)
            .classify()?;
        let (analysis, _) = self.repo.merge_analysis(&[&annotated]).classify()?;
        let target = annotated.id();

        if analysis.is_up_to_date() {
            return Ok(MergeOutcome::UpToDate);
        }

        if analysis.is_fast_forward() || analysis.is_unborn() {
            let commit = self.repo.find_commit(target).classify()?;
            let mut checkout = CheckoutBuilder::new();
            checkout.safe();
            self.repo
                .checkout_tree(commit.as_object(), Some(&mut checkout))
                .classify()?;

            let head = self.repo.find_reference("HEAD").classify()?;
            let branch_ref = match head.symbolic_target() {
                Some(name) => name.to_string(),
                None => {
                    self.repo.set_head_detached(target).classify()?;
                    return Ok(MergeOutcome::FastForward(object_id(target)));
                }
            };
            self.repo
                .reference(
                    &branch_ref,
                    target,
                    true,
                    &format!("merge {source}: fast-forward"),
                )
                .classify()?;
            info!(source, commit = %target, "fast-forwarded");
            return Ok(MergeOutcome::FastForward(object_id(target)));
        }

        self.repo.merge(&[&annotated], None, None).classify()?;

        let mut index = self.repo.index().classify()?;
        if index.has_conflicts() {
            let conflicts = self.conflicted_paths()?;
            info!(source, conflicts = conflicts.len(), "merge stopped on conflicts");
            return Ok(MergeOutcome::Conflicted(conflicts));
        }

        let tree_id = index.write_tree().classify()?;
        let tree = self.repo.find_tree(tree_id).classify()?;
        let ours = self
            .head_commit()?
            .ok_or_else(|| RepoError::invalid_request("cannot merge into an unborn branch"))?;
        let theirs = self.repo.find_commit(target).classify()?;
        let signature = self.signature(None)?;
        let oid = self
            .repo
            .commit(
                Some("HEAD"),
                &signature,
                &signature,
                &format!("Merge branch '{source}'"),
                &tree,
                &[&ours, &theirs],
            )
            .classify()?;
        self.repo.cleanup_state().classify()?;
        info!(source, commit = %oid, "merged");
        Ok(MergeOutcome::Merged(object_id(oid)))
    }

    fn conclude_merge(&self, message: &str, author: Option<&Author>) -> RepoResult<ObjectId> {
        let MergeState::Merging { source, conflicts } = self.merge_state()? else {
            return Err(RepoError::invalid_request("no merge in progress"));
        };
        let source = source.ok_or_else(|| RepoError::CorruptObject {
            message: "MERGE_HEAD is missing".into(),
        })?;

        let workdir = self.workdir()?.to_path_buf();
        let mut index = self.repo.index().classify()?;
        for path in &conflicts {
            if workdir.join(path).is_file() {
                index.add_path(path).classify()?;
            } else {
                index.remove_path(path).classify()?;
            }
        }
        index.write().classify()?;

        if index.has_conflicts() {
            return Err(RepoError::MergeConflict {
                paths: self.conflicted_paths()?,
            });
        }

        let tree_id = index.write_tree().classify()?;
        let tree = self.repo.find_tree(tree_id).classify()?;
        let ours = self
            .head_commit()?
            .ok_or_else(|| RepoError::invalid_request("cannot merge into an unborn branch"))?;
        let theirs = self.repo.find_commit(oid_of(&source)?).classify()?;
        let signature = self.signature(author)?;
        let oid = self
            .repo
            .commit(
                Some("HEAD"),
                &signature,
                &signature,
                message,
                &tree,
                &[&ours, &theirs],
            )
            .classify()?;
        self.repo.cleanup_state().classify()?;
        Ok(object_id(oid))
    }

    fn abort_merge(&self) -> RepoResult<()> {
        if let Some(head) = self.head_commit()? {
            self.repo
                .reset(head.as_object(), ResetType::Hard, None)
                .classify()?;
        }
        self.repo.cleanup_state().classify()
    }

    fn reset_working_tree(&self, target: &ObjectId) -> RepoResult<()> {
        let object = self.repo.find_object(oid_of(target)?, None).classify()?;
        self.repo
            .reset(&object, ResetType::Hard, None)
            .classify()
    }

    fn create_branch(&self, name: &str, start_point: Option<&str>) -> RepoResult<()> {
        if !Reference::is_valid_name(&format!("refs/heads/{name}")) {
            return Err(RepoError::invalid_request(format!(
                "invalid branch name {name:?}"
            )));
        }
        if self.repo.find_branch(name, BranchType::Local).is_ok() {
            return Err(RepoError::BranchExists {
                name: name.to_string(),
            });
        }

        let commit = match start_point {
            Some(start) => self
                .repo
                .revparse_single(start)
                .and_then(|object| object.peel_to_commit())
                .map_err(not_found_as_branch(start))?,
            None => self
                .head_commit()?
                .ok_or_else(|| RepoError::invalid_request("HEAD has no commits yet"))?,
        };
        self.repo.branch(name, &commit, false).classify()?;
        Ok(())
    }

    fn delete_branch(&self, name: &str) -> RepoResult<()> {
        let mut branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(not_found_as_branch(name))?;
        if branch.is_head() {
            return Err(RepoError::invalid_request(format!(
                "cannot delete the checked out branch {name}"
            )));
        }
        branch.delete().classify()
    }

    fn checkout(&self, name: &str, force: bool) -> RepoResult<()> {
        let refname = format!("refs/heads/{name}");
        match self.repo.find_branch(name, BranchType::Local) {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::NotFound => {
                // Create a tracking branch from the remote one, as `git switch` does.
                let remote_name = format!("{DEFAULT_REMOTE}/{name}");
                let remote = self
                    .repo
                    .find_branch(&remote_name, BranchType::Remote)
                    .map_err(not_found_as_branch(name))?;
                let commit = remote.get().peel_to_commit().classify()?;
                let mut local = self.repo.branch(name, &commit, false).classify()?;
                local.set_upstream(Some(remote_name.as_str())).classify()?;
            }
            Err(e) => return Err(classify(e)),
        }

        let target = self.repo.revparse_single(&refname).classify()?;
        let mut checkout = CheckoutBuilder::new();
        if force {
            checkout.force();
        } else {
            checkout.safe();
        }
        self.repo
            .checkout_tree(&target, Some(&mut checkout))
            .classify()?;
        self.repo.set_head(&refname).classify()
    }

    fn fetch(
        &self,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> RepoResult<()> {
        let mut remote = self.find_origin()?;
        let mut options = FetchOptions::new();
        options.remote_callbacks(transport::callbacks(credential, cancel));
        remote
            .fetch(&[] as &[&str], Some(&mut options), None)
            .map_err(|e| classify_transfer(e, cancel))?;
        debug!(path = %self.path.display(), "fetched");
        Ok(())
    }

    fn push(
        &self,
        branch: &str,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> RepoResult<()> {
        let refname = format!("refs/heads/{branch}");
        let local = self
            .repo
            .refname_to_id(&refname)
            .map_err(not_found_as_branch(branch))?;
        let mut remote = self.find_origin()?;

        // Refuse before uploading anything when the remote moved on.
        if let Some(remote_tip) = self.remote_tip(&mut remote, &refname, credential, cancel)? {
            if remote_tip == local {
                return Ok(());
            }
            let known = self.repo.find_commit(remote_tip).is_ok();
            if !known || !self.repo.graph_descendant_of(local, remote_tip).classify()? {
                return Err(RepoError::NonFastForward {
                    branch: branch.to_string(),
                });
            }
        }

        let mut rejected: Option<String> = None;
        {
            let mut callbacks = transport::callbacks(credential, cancel);
            callbacks.push_update_reference(|_refname, status| {
                if let Some(message) = status {
                    rejected = Some(message.to_string());
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);

            let refspec = format!("{refname}:{refname}");
            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(|e| match classify_transfer(e, cancel) {
                    RepoError::NonFastForward { .. } => RepoError::NonFastForward {
                        branch: branch.to_string(),
                    },
                    other => other,
                })?;
        }

        if let Some(message) = rejected {
            return Err(if message.contains("fast-forward") || message.contains("fetch first") {
                RepoError::NonFastForward {
                    branch: branch.to_string(),
                }
            } else {
                RepoError::invalid_request(format!("remote rejected {branch}: {message}"))
            });
        }

        self.repo
            .reference(
                &format!("refs/remotes/{DEFAULT_REMOTE}/{branch}"),
                local,
                true,
                "push: update remote-tracking ref",
            )
            .classify()?;
        info!(branch, commit = %local, "pushed");
        Ok(())
    }

    fn checkpoint(&self) -> RepoResult<Checkpoint> {
        let head_ref = self.repo.find_reference("HEAD").classify()?;
        let head = match head_ref.symbolic_target() {
            Some(target) => HeadPointer::Symbolic(target.to_string()),
            None => match head_ref.target() {
                Some(oid) => HeadPointer::Detached(object_id(oid)),
                None => {
                    return Err(RepoError::CorruptObject {
                        message: "HEAD has no target".into(),
                    })
                }
            },
        };

        Ok(Checkpoint {
            head,
            commit: self.head_commit()?.map(|commit| object_id(commit.id())),
            refs: self.tracked_refs()?,
        })
    }

    fn restore(&self, checkpoint: &Checkpoint, worktree: bool) -> RepoResult<()> {
        for entry in self.tracked_refs()? {
            if checkpoint.refs.iter().any(|saved| saved.name == entry.name) {
                continue;
            }
            if let Ok(mut reference) = self.repo.find_reference(&entry.name) {
                reference.delete().classify()?;
            }
        }
        for entry in &checkpoint.refs {
            self.repo
                .reference(&entry.name, oid_of(&entry.target)?, true, "rollback")
                .classify()?;
        }

        match &checkpoint.head {
            HeadPointer::Symbolic(name) => self.repo.set_head(name).classify()?,
            HeadPointer::Detached(id) => self.repo.set_head_detached(oid_of(id)?).classify()?,
        }

        if worktree {
            if let Some(commit) = &checkpoint.commit {
                self.reset_working_tree(commit)?;
            }
            self.repo.cleanup_state().classify()?;
        }
        debug!(path = %self.path.display(), worktree, "restored checkpoint");
        Ok(())
    }

    fn history(&self, start: Option<&str>, limit: usize) -> RepoResult<Vec<CommitInfo>> {
        let tip = match start {
            Some(rev) => self.revision(rev)?,
            None => match self.head_commit()? {
                Some(commit) => commit,
                None => return Ok(Vec::new()),
            },
        };

        let mut walk = self.repo.revwalk().classify()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME).classify()?;
        walk.push(tip.id()).classify()?;

        let mut commits = Vec::new();
        for oid in walk.take(limit) {
            let commit = self.repo.find_commit(oid.classify()?).classify()?;
            commits.push(commit_info(&commit));
        }
        Ok(commits)
    }

    fn tags(&self) -> RepoResult<Vec<TagInfo>> {
        let mut tags = Vec::new();
        for name in self.repo.tag_names(None).classify()?.iter().flatten() {
            let reference = self
                .repo
                .find_reference(&format!("refs/tags/{name}"))
                .classify()?;
            // Tags of trees or blobs have no place in a commit listing.
            let Ok(commit) = reference.peel_to_commit() else {
                debug!(tag = name, "skipping tag that does not point at a commit");
                continue;
            };
            let annotation = reference.peel_to_tag().ok().map(|tag| TagAnnotation {
                message: tag.message().unwrap_or_default().trim_end().to_string(),
                tagger: tag.tagger().as_ref().map(identity),
            });
            tags.push(TagInfo {
                name: name.to_string(),
                target: object_id(commit.id()),
                annotation,
            });
        }
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    fn create_tag(
        &self,
        name: &str,
        target: Option<&str>,
        message: Option<&str>,
    ) -> RepoResult<()> {
        let refname = format!("refs/tags/{name}");
        if !Reference::is_valid_name(&refname) {
            return Err(RepoError::invalid_request(format!("invalid tag name {name:?}")));
        }
        if self.repo.find_reference(&refname).is_ok() {
            return Err(RepoError::TagExists {
                name: name.to_string(),
            });
        }

        let commit = match target {
            Some(rev) => self.revision(rev)?,
            None => self
                .head_commit()?
                .ok_or_else(|| RepoError::invalid_request("HEAD has no commits yet"))?,
        };
        let object = commit.as_object();
        match message {
            Some(message) => {
                let tagger = self.signature(None)?;
                self.repo.tag(name, object, &tagger, message, false).classify()?;
            }
            None => {
                self.repo.tag_lightweight(name, object, false).classify()?;
            }
        }
        debug!(path = %self.path.display(), tag = name, annotated = message.is_some(), "tag created");
        Ok(())
    }

    fn delete_tag(&self, name: &str) -> RepoResult<()> {
        self.repo.tag_delete(name).map_err(|e| match e.code() {
            ErrorCode::NotFound => RepoError::NotFound {
                what: format!("tag {name}"),
            },
            _ => classify(e),
        })
    }

    fn stashes(&self) -> RepoResult<Vec<StashEntry>> {
        let mut repo = self.reopen()?;
        let mut saved = Vec::new();
        repo.stash_foreach(|index, message, oid| {
            saved.push((index, message.to_string(), *oid));
            true
        })
        .classify()?;

        let mut entries = Vec::with_capacity(saved.len());
        for (index, message, oid) in saved {
            let time = self.repo.find_commit(oid).classify()?.time().seconds();
            entries.push(StashEntry {
                index,
                branch: StashEntry::branch_from_message(&message),
                message,
                id: object_id(oid),
                time,
            });
        }
        Ok(entries)
    }

    fn stash_save(&self, message: Option<&str>, include_untracked: bool) -> RepoResult<ObjectId> {
        let mut repo = self.reopen()?;
        let stasher = self.signature(None)?;
        let flags = if include_untracked {
            StashFlags::INCLUDE_UNTRACKED
        } else {
            StashFlags::DEFAULT
        };
        match repo.stash_save2(&stasher, message, Some(flags)) {
            Ok(oid) => {
                debug!(path = %self.path.display(), stash = %oid, "stashed");
                Ok(object_id(oid))
            }
            Err(e) if e.code() == ErrorCode::NotFound => Err(RepoError::NothingToStash),
            Err(e) => Err(classify(e)),
        }
    }

    fn stash_apply(&self, index: usize, pop: bool) -> RepoResult<()> {
        let mut repo = self.reopen()?;
        self.check_stash(&mut repo, index)?;

        let applied = repo.stash_apply(index, None);
        // libgit2 reports success with conflicts written to the index.
        let conflicts = index_conflicts(&repo)?;
        if !conflicts.is_empty() {
            return Err(RepoError::MergeConflict { paths: conflicts });
        }
        applied.classify()?;

        if pop {
            repo.stash_drop(index).classify()?;
        }
        debug!(path = %self.path.display(), index, pop, "stash applied");
        Ok(())
    }

    fn stash_drop(&self, index: usize) -> RepoResult<()> {
        let mut repo = self.reopen()?;
        self.check_stash(&mut repo, index)?;
        repo.stash_drop(index).classify()
    }

    fn diff(&self, target: &DiffTarget) -> RepoResult<Vec<FileDiff>> {
        let mut options = DiffOptions::new();
        let mut diff = match target {
            DiffTarget::WorkingTree => self.repo.diff_index_to_workdir(None, Some(&mut options)),
            DiffTarget::Staged => {
                let head = self.head_commit()?.map(|commit| commit.tree()).transpose().classify()?;
                self.repo
                    .diff_tree_to_index(head.as_ref(), None, Some(&mut options))
            }
            DiffTarget::Commits { old, new } => {
                let old = self.revision(old)?.tree().classify()?;
                let new = self.revision(new)?.tree().classify()?;
                self.repo
                    .diff_tree_to_tree(Some(&old), Some(&new), Some(&mut options))
            }
        }
        .classify()?;
        diff.find_similar(None).classify()?;

        let mut files = Vec::new();
        for (idx, delta) in diff.deltas().enumerate() {
            let hunks = match Patch::from_diff(&diff, idx).classify()? {
                Some(patch) => patch_hunks(&patch)?,
                None => Vec::new(),
            };
            let change = change_kind(delta.status());
            let old_path = delta.old_file().path().map(Path::to_path_buf);
            let new_path = delta.new_file().path().map(Path::to_path_buf);
            files.push(FileDiff {
                old_path: old_path.filter(|_| change != ChangeKind::Added),
                new_path: new_path.filter(|_| change != ChangeKind::Deleted),
                change,
                binary: delta.flags().contains(DiffFlags::BINARY),
                hunks,
            });
        }
        Ok(files)
    }
}

fn identity(signature: &Signature<'_>) -> Identity {
    Identity {
        name: String::from_utf8_lossy(signature.name_bytes()).into_owned(),
        email: String::from_utf8_lossy(signature.email_bytes()).into_owned(),
        time: signature.when().seconds(),
    }
}

fn commit_info(commit: &git2::Commit<'_>) -> CommitInfo {
    let message = String::from_utf8_lossy(commit.message_bytes()).into_owned();
    CommitInfo {
        id: object_id(commit.id()),
        summary: message.lines().next().unwrap_or_default().to_string(),
        author: identity(&commit.author()),
        committer: identity(&commit.committer()),
        parents: commit.parent_ids().map(object_id).collect(),
        message,
    }
}

fn change_kind(status: Delta) -> ChangeKind {
    match status {
        Delta::Added | Delta::Untracked => ChangeKind::Added,
        Delta::Deleted => ChangeKind::Deleted,
        Delta::Renamed => ChangeKind::Renamed,
        Delta::Copied => ChangeKind::Copied,
        Delta::Typechange => ChangeKind::TypeChanged,
        _ => ChangeKind::Modified,
    }
}

fn patch_hunks(patch: &Patch<'_>) -> RepoResult<Vec<DiffHunk>> {
    let mut hunks = Vec::with_capacity(patch.num_hunks());
    for hunk_idx in 0..patch.num_hunks() {
        let (hunk, line_count) = patch.hunk(hunk_idx).classify()?;
        let mut lines = Vec::with_capacity(line_count);
        for line_idx in 0..line_count {
            let line = patch.line_in_hunk(hunk_idx, line_idx).classify()?;
            let kind = match line.origin() {
                ' ' => DiffLineKind::Context,
                '+' => DiffLineKind::Added,
                '-' => DiffLineKind::Removed,
                // End-of-file newline markers.
                _ => continue,
            };
            lines.push(DiffLine {
                kind,
                content: String::from_utf8_lossy(line.content())
                    .trim_end_matches(['\n', '\r'])
                    .to_string(),
                old_line: line.old_lineno(),
                new_line: line.new_lineno(),
            });
        }
        hunks.push(DiffHunk {
            old_start: hunk.old_start(),
            old_lines: hunk.old_lines(),
            new_start: hunk.new_start(),
            new_lines: hunk.new_lines(),
            header: String::from_utf8_lossy(hunk.header()).trim_end().to_string(),
            lines,
        });
    }
    Ok(hunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, Box<dyn ObjectRepo>) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
        let opened = Git2Store::new().open(dir.path()).unwrap();
        (dir, opened)
    }

    fn commit_file(repo: &dyn ObjectRepo, name: &str, contents: &str, message: &str) -> ObjectId {
        fs::write(repo.path().join(name), contents).unwrap();
        let tree = repo.stage(&[PathBuf::from(name)]).unwrap();
        let parents: Vec<ObjectId> = repo.read_head().unwrap().commit().cloned().into_iter().collect();
        repo.write_commit(&tree, &parents, message, None).unwrap()
    }

    #[test]
    fn test_history_is_newest_first_and_limited() {
        let (_dir, repo) = init_repo();
        assert!(repo.history(None, 10).unwrap().is_empty());

        let first = commit_file(repo.as_ref(), "a.txt", "one\n", "first");
        let second = commit_file(repo.as_ref(), "a.txt", "two\n", "second\n\nwith a body");
        let third = commit_file(repo.as_ref(), "b.txt", "three\n", "third");

        let history = repo.history(None, 10).unwrap();
        let ids: Vec<_> = history.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![third.clone(), second.clone(), first.clone()]);
        assert_eq!(history[1].summary, "second");
        assert_eq!(history[1].parents, vec![first.clone()]);
        assert_eq!(history[0].author.email, "test@example.com");

        assert_eq!(repo.history(None, 2).unwrap().len(), 2);
        let from_second = repo.history(Some(second.as_str()), 10).unwrap();
        assert_eq!(from_second.len(), 2);
        assert_eq!(from_second[0].id, second);

        assert!(matches!(
            repo.history(Some("no-such-branch"), 10),
            Err(RepoError::NotFound { .. })
        ));
    }

    #[test]
    fn test_tags_lightweight_and_annotated() {
        let (_dir, repo) = init_repo();
        let first = commit_file(repo.as_ref(), "a.txt", "one\n", "first");
        let second = commit_file(repo.as_ref(), "a.txt", "two\n", "second");

        repo.create_tag("v1.0", Some(first.as_str()), None).unwrap();
        repo.create_tag("v2.0", None, Some("Release 2.0\n")).unwrap();

        let tags = repo.tags().unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].name, "v1.0");
        assert_eq!(tags[0].target, first);
        assert!(!tags[0].is_annotated());
        assert_eq!(tags[1].target, second);
        let annotation = tags[1].annotation.as_ref().unwrap();
        assert_eq!(annotation.message, "Release 2.0");
        assert_eq!(annotation.tagger.as_ref().unwrap().name, "Test");

        assert_eq!(
            repo.create_tag("v1.0", None, None),
            Err(RepoError::TagExists {
                name: "v1.0".into()
            })
        );
        assert!(matches!(
            repo.create_tag("bad..name", None, None),
            Err(RepoError::InvalidRequest { .. })
        ));

        repo.delete_tag("v1.0").unwrap();
        assert_eq!(repo.tags().unwrap().len(), 1);
        assert!(matches!(
            repo.delete_tag("v1.0"),
            Err(RepoError::NotFound { .. })
        ));
    }

    #[test]
    fn test_stash_save_list_and_pop() {
        let (dir, repo) = init_repo();
        commit_file(repo.as_ref(), "a.txt", "one\n", "first");
        assert_eq!(repo.stash_save(None, false), Err(RepoError::NothingToStash));

        fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        fs::write(dir.path().join("new.txt"), "new\n").unwrap();
        repo.stash_save(Some("half done"), true).unwrap();
        assert!(!repo.status().unwrap().is_dirty());

        let stashes = repo.stashes().unwrap();
        assert_eq!(stashes.len(), 1);
        assert_eq!(stashes[0].index, 0);
        assert!(stashes[0].message.contains("half done"));
        assert!(stashes[0].branch.is_some());

        repo.stash_apply(0, true).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "changed\n");
        assert!(dir.path().join("new.txt").exists());
        assert!(repo.stashes().unwrap().is_empty());

        assert!(matches!(
            repo.stash_drop(0),
            Err(RepoError::NotFound { .. })
        ));
    }

    #[test]
    fn test_conflicting_stash_pop_keeps_the_entry() {
        let (dir, repo) = init_repo();
        commit_file(repo.as_ref(), "a.txt", "one\n", "first");
        fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        repo.stash_save(None, false).unwrap();
        commit_file(repo.as_ref(), "a.txt", "three\n", "second");

        let err = repo.stash_apply(0, true).unwrap_err();
        assert_eq!(
            err,
            RepoError::MergeConflict {
                paths: vec![PathBuf::from("a.txt")]
            }
        );
        assert_eq!(repo.stashes().unwrap().len(), 1);
    }

    #[test]
    fn test_diff_targets() {
        let (dir, repo) = init_repo();
        let first = commit_file(repo.as_ref(), "a.txt", "one\ntwo\n", "first");
        let second = commit_file(repo.as_ref(), "a.txt", "one\n2\n", "second");

        let between = repo
            .diff(&DiffTarget::Commits {
                old: first.as_str().to_string(),
                new: second.as_str().to_string(),
            })
            .unwrap();
        assert_eq!(between.len(), 1);
        assert_eq!(between[0].change, ChangeKind::Modified);
        assert_eq!(between[0].line_stats(), (1, 1));
        let hunk = &between[0].hunks[0];
        assert!(hunk.header.starts_with("@@"));
        let removed: Vec<_> = hunk
            .lines
            .iter()
            .filter(|line| line.kind == DiffLineKind::Removed)
            .collect();
        assert_eq!(removed[0].content, "two");
        assert_eq!(removed[0].old_line, Some(2));

        fs::write(dir.path().join("a.txt"), "one\n2\nthree\n").unwrap();
        let unstaged = repo.diff(&DiffTarget::WorkingTree).unwrap();
        assert_eq!(unstaged[0].line_stats(), (1, 0));
        assert!(repo.diff(&DiffTarget::Staged).unwrap().is_empty());

        fs::write(dir.path().join("b.txt"), "bee\n").unwrap();
        repo.stage(&[PathBuf::from("b.txt")]).unwrap();
        let staged = repo.diff(&DiffTarget::Staged).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].change, ChangeKind::Added);
        assert_eq!(staged[0].old_path, None);
        assert_eq!(staged[0].path(), Some(&PathBuf::from("b.txt")));
    }

    #[test]
    fn test_unborn_head() {
        let (_dir, repo) = init_repo();
        let head = repo.read_head().unwrap();
        assert!(matches!(head, Head::Unborn { .. }));
        assert!(repo.head_tree().unwrap().is_none());
    }

    #[test]
    fn test_commit_advances_head() {
        let (_dir, repo) = init_repo();
        let first = commit_file(repo.as_ref(), "a.txt", "one\n", "first");
        let second = commit_file(repo.as_ref(), "a.txt", "two\n", "second");

        assert_eq!(repo.read_head().unwrap().commit(), Some(&second));
        assert_eq!(repo.lineage(&second).unwrap().parents, vec![first]);

        let tree = repo.read_tree(&second).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].path, PathBuf::from("a.txt"));
    }

    #[test]
    fn test_status_separates_untracked() {
        let (dir, repo) = init_repo();
        commit_file(repo.as_ref(), "a.txt", "one\n", "first");

        fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        fs::write(dir.path().join("new.txt"), "new\n").unwrap();

        let status = repo.status().unwrap();
        assert_eq!(status.changed, vec![PathBuf::from("a.txt")]);
        assert_eq!(status.untracked, vec![PathBuf::from("new.txt")]);
        assert!(status.is_dirty());
        assert!(status.has_tracked_changes());
    }

    #[test]
    fn test_stage_rejects_escaping_paths() {
        let (_dir, repo) = init_repo();
        let err = repo.stage(&[PathBuf::from("../outside")]).unwrap_err();
        assert!(matches!(err, RepoError::InvalidRequest { .. }));
    }

    #[test]
    fn test_branch_lifecycle() {
        let (_dir, repo) = init_repo();
        commit_file(repo.as_ref(), "a.txt", "one\n", "first");

        repo.create_branch("feature", None).unwrap();
        assert!(matches!(
            repo.create_branch("feature", None),
            Err(RepoError::BranchExists { .. })
        ));

        let names: Vec<String> = repo.branches().unwrap().into_iter().map(|b| b.name).collect();
        assert!(names.contains(&"feature".to_string()));

        repo.checkout("feature", false).unwrap();
        assert_eq!(repo.read_head().unwrap().branch(), Some("feature"));

        // The checked out branch cannot be deleted.
        assert!(repo.delete_branch("feature").is_err());
        assert!(matches!(
            repo.delete_branch("missing"),
            Err(RepoError::BranchNotFound { .. })
        ));
    }

    #[test]
    fn test_checkpoint_restore_drops_new_refs() {
        let (_dir, repo) = init_repo();
        let first = commit_file(repo.as_ref(), "a.txt", "one\n", "first");
        let checkpoint = repo.checkpoint().unwrap();

        commit_file(repo.as_ref(), "a.txt", "two\n", "second");
        repo.create_branch("scratch", None).unwrap();

        repo.restore(&checkpoint, true).unwrap();

        assert_eq!(repo.read_head().unwrap().commit(), Some(&first));
        assert_eq!(fs::read_to_string(repo.path().join("a.txt")).unwrap(), "one\n");
        assert!(repo
            .branches()
            .unwrap()
            .iter()
            .all(|branch| branch.name != "scratch"));
    }

    #[test]
    fn test_merge_conflict_and_abort() {
        let (dir, repo) = init_repo();
        commit_file(repo.as_ref(), "a.txt", "base\n", "base");
        let main = repo.read_head().unwrap().branch().unwrap().to_string();

        repo.create_branch("other", None).unwrap();
        repo.checkout("other", false).unwrap();
        commit_file(repo.as_ref(), "a.txt", "theirs\n", "theirs");

        repo.checkout(&main, false).unwrap();
        let ours = commit_file(repo.as_ref(), "a.txt", "ours\n", "ours");

        let outcome = repo.apply_merge("other").unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Conflicted(vec![PathBuf::from("a.txt")])
        );
        assert!(matches!(repo.merge_state().unwrap(), MergeState::Merging { .. }));

        repo.abort_merge().unwrap();
        assert!(repo.merge_state().unwrap().is_clean());
        assert_eq!(repo.read_head().unwrap().commit(), Some(&ours));
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "ours\n");
    }

    #[test]
    fn test_resolve_merge() {
        let (dir, repo) = init_repo();
        commit_file(repo.as_ref(), "a.txt", "base\n", "base");
        let main = repo.read_head().unwrap().branch().unwrap().to_string();

        repo.create_branch("other", None).unwrap();
        repo.checkout("other", false).unwrap();
        let theirs = commit_file(repo.as_ref(), "a.txt", "theirs\n", "theirs");
        repo.checkout(&main, false).unwrap();
        let ours = commit_file(repo.as_ref(), "a.txt", "ours\n", "ours");

        repo.apply_merge("other").unwrap();
        fs::write(dir.path().join("a.txt"), "both\n").unwrap();

        let merge = repo.conclude_merge("Merge other", None).unwrap();
        assert_eq!(repo.lineage(&merge).unwrap().parents, vec![ours, theirs]);
        assert!(repo.merge_state().unwrap().is_clean());
    }

    #[test]
    fn test_fast_forward_merge() {
        let (_dir, repo) = init_repo();
        commit_file(repo.as_ref(), "a.txt", "one\n", "first");
        let main = repo.read_head().unwrap().branch().unwrap().to_string();

        repo.create_branch("ahead", None).unwrap();
        repo.checkout("ahead", false).unwrap();
        let tip = commit_file(repo.as_ref(), "b.txt", "two\n", "second");
        repo.checkout(&main, false).unwrap();

        assert_eq!(
            repo.apply_merge("ahead").unwrap(),
            MergeOutcome::FastForward(tip.clone())
        );
        assert_eq!(repo.read_head().unwrap().commit(), Some(&tip));
        assert_eq!(repo.apply_merge("ahead").unwrap(), MergeOutcome::UpToDate);
    }

    #[test]
    fn test_open_rejects_plain_directory() {
        let dir = TempDir::new().unwrap();
        let err = Git2Store::new().open(dir.path()).err().unwrap();
        assert!(matches!(err, RepoError::InvalidLocation { .. }));
    }
}
