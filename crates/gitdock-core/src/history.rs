//! Read views of a repository's history: commits, tags, stashes and diffs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::ObjectId;

/// Name, email and time of an author, committer or tagger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub time: i64,
}

/// One commit of a history listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: ObjectId,
    /// First line of the message.
    pub summary: String,
    pub message: String,
    pub author: Identity,
    pub committer: Identity,
    pub parents: Vec<ObjectId>,
}

impl CommitInfo {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

/// Message and tagger of an annotated tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagAnnotation {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagger: Option<Identity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    pub name: String,
    /// Commit the tag points at, through any annotation.
    pub target: ObjectId,
    /// `None` for lightweight tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<TagAnnotation>,
}

impl TagInfo {
    pub fn is_annotated(&self) -> bool {
        self.annotation.is_some()
    }
}

/// A saved stash; index 0 is the most recent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashEntry {
    pub index: usize,
    pub message: String,
    pub id: ObjectId,
    /// Branch the stash was taken on, parsed from its message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Seconds since the Unix epoch.
    pub time: i64,
}

impl StashEntry {
    /// Branch named in a stash message: `WIP on main: ...` or `On main: ...`.
    pub fn branch_from_message(message: &str) -> Option<String> {
        let rest = message
            .strip_prefix("WIP on ")
            .or_else(|| message.strip_prefix("On "))?;
        let (branch, _) = rest.split_once(':')?;
        (!branch.is_empty()).then(|| branch.to_string())
    }
}

/// What a diff compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffTarget {
    /// Index against working tree: changes not yet staged.
    WorkingTree,
    /// HEAD against index: changes staged for the next commit.
    Staged,
    /// Two revisions, `old` to `new`.
    Commits { old: String, new: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    TypeChanged,
}

/// Changes to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// `None` for added files.
    pub old_path: Option<PathBuf>,
    /// `None` for deleted files.
    pub new_path: Option<PathBuf>,
    pub change: ChangeKind,
    /// Binary files carry no hunks.
    pub binary: bool,
    pub hunks: Vec<DiffHunk>,
}

impl FileDiff {
    /// The path to show for this change.
    pub fn path(&self) -> Option<&PathBuf> {
        self.new_path.as_ref().or(self.old_path.as_ref())
    }

    /// Added and removed line counts.
    pub fn line_stats(&self) -> (usize, usize) {
        self.hunks
            .iter()
            .flat_map(|hunk| &hunk.lines)
            .fold((0, 0), |(added, removed), line| match line.kind {
                DiffLineKind::Added => (added + 1, removed),
                DiffLineKind::Removed => (added, removed + 1),
                DiffLineKind::Context => (added, removed),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    /// The `@@ -a,b +c,d @@` line, without its newline.
    pub header: String,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffLineKind {
    Context,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub kind: DiffLineKind,
    /// Line text without its trailing newline.
    pub content: String,
    pub old_line: Option<u32>,
    pub new_line: Option<u32>,
}
