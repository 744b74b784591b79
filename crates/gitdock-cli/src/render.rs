//! Human-readable rendering of snapshots and history.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gitdock_core::{
    Activity, ChangeKind, CommitInfo, DiffLineKind, Divergence, ErrorRecord, FileDiff,
    RepositorySnapshot, StashEntry,
};

pub fn divergence(divergence: &Divergence) -> String {
    match divergence {
        Divergence::NoUpstream => "no upstream".to_string(),
        Divergence::Known { ahead: 0, behind: 0 } => "up to date".to_string(),
        Divergence::Known { ahead, behind } => format!("↑{} ↓{}", ahead, behind),
        Divergence::Unknown => "unknown (history too deep)".to_string(),
    }
}

pub fn activity(activity: &Activity) -> String {
    match activity {
        Activity::Idle => "idle".to_string(),
        Activity::Busy { operation } => format!("busy ({})", operation),
        Activity::Merging { conflicts, .. } => {
            format!("merging ({} conflicted)", conflicts.len())
        }
    }
}

/// "3m ago" style age, relative to now.
pub fn age(at: SystemTime) -> String {
    let secs = SystemTime::now()
        .duration_since(at)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// [`age`] of a git timestamp in seconds since the epoch.
fn git_age(secs: i64) -> String {
    age(UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0)))
}

pub fn commit_line(commit: &CommitInfo) -> String {
    let merge = if commit.is_merge() { " (merge)" } else { "" };
    format!(
        "   {}  {}{}  [{}, {}]",
        commit.id.short(),
        commit.summary,
        merge,
        commit.author.name,
        git_age(commit.author.time)
    )
}

pub fn stash_line(stash: &StashEntry) -> String {
    format!(
        "   stash@{{{}}}  {}  [{}]",
        stash.index,
        stash.message,
        git_age(stash.time)
    )
}

fn change_marker(change: ChangeKind) -> char {
    match change {
        ChangeKind::Added => 'A',
        ChangeKind::Modified => 'M',
        ChangeKind::Deleted => 'D',
        ChangeKind::Renamed => 'R',
        ChangeKind::Copied => 'C',
        ChangeKind::TypeChanged => 'T',
    }
}

fn diff_path(file: &FileDiff) -> String {
    let path = |p: Option<&std::path::PathBuf>| {
        p.map(|p| p.display().to_string()).unwrap_or_default()
    };
    match file.change {
        ChangeKind::Renamed | ChangeKind::Copied => format!(
            "{} → {}",
            path(file.old_path.as_ref()),
            path(file.new_path.as_ref())
        ),
        _ => path(file.path()),
    }
}

/// One line per file: change, path and line counts.
pub fn diff_stat(file: &FileDiff) -> String {
    if file.binary {
        return format!("   {} {}  (binary)", change_marker(file.change), diff_path(file));
    }
    let (added, removed) = file.line_stats();
    format!(
        "   {} {}  +{} -{}",
        change_marker(file.change),
        diff_path(file),
        added,
        removed
    )
}

pub fn file_diff(file: &FileDiff) {
    println!("{}", diff_stat(file));
    for hunk in &file.hunks {
        println!("{}", hunk.header);
        for line in &hunk.lines {
            let sign = match line.kind {
                DiffLineKind::Context => ' ',
                DiffLineKind::Added => '+',
                DiffLineKind::Removed => '-',
            };
            println!("{}{}", sign, line.content);
        }
    }
}

fn error(record: &ErrorRecord) -> String {
    match record.operation {
        Some(operation) => format!("{} failed: {}", operation, record.error),
        None => record.error.to_string(),
    }
}

pub fn snapshot(snapshot: &RepositorySnapshot) {
    println!("📁 {}", snapshot.path.display());
    println!("   Id:        {}", snapshot.handle);
    println!(
        "   Branch:    {}",
        snapshot.branch.as_deref().unwrap_or("(detached)")
    );
    if let Some(head) = &snapshot.head {
        println!("   Head:      {}", head.short());
    }
    if let Some(upstream) = &snapshot.upstream {
        println!("   Upstream:  {}", upstream);
    }
    println!("   Sync:      {}", divergence(&snapshot.divergence));
    println!(
        "   Tree:      {}",
        if snapshot.dirty { "modified" } else { "clean" }
    );
    println!("   State:     {}", activity(&snapshot.activity));
    if let Activity::Merging { conflicts, .. } = &snapshot.activity {
        for path in conflicts {
            println!("      ✗ {}", path.display());
        }
    }
    if let Some(at) = snapshot.last_fetch {
        println!("   Fetched:   {}", age(at));
    }
    if let Some(remote) = &snapshot.remote {
        let stale = if remote.stale { " (stale)" } else { "" };
        println!(
            "   Remote:    {}/{} [{}]{}",
            remote.info.owner, remote.info.name, remote.info.visibility, stale
        );
    }
    if let Some(record) = &snapshot.last_error {
        println!("   ⚠️  {}", error(record));
    }
    if snapshot.persistence_degraded {
        println!("   ⚠️  Registry changes are not yet saved to disk");
    }
}
