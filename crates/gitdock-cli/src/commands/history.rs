//! History commands: log, tags, stashes and diffs.

use anyhow::{Context, Result};
use gitdock_core::{DiffTarget, RepoError};

use crate::app::App;
use crate::render;

pub async fn log(app: &App, reference: &str, start: Option<&str>, limit: usize) -> Result<()> {
    let id = app.resolve(reference)?;
    let commits = app.coordinator.history(id, start, limit).await?;
    if commits.is_empty() {
        println!("No commits yet.");
    }
    for commit in &commits {
        println!("{}", render::commit_line(commit));
    }
    Ok(())
}

pub async fn tag_list(app: &App, reference: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    let tags = app.coordinator.tags(id).await?;
    if tags.is_empty() {
        println!("No tags.");
    }
    for tag in &tags {
        match &tag.annotation {
            Some(annotation) => println!(
                "   {}  {}  {}",
                tag.name,
                tag.target.short(),
                annotation.message.lines().next().unwrap_or_default()
            ),
            None => println!("   {}  {}", tag.name, tag.target.short()),
        }
    }
    Ok(())
}

pub async fn tag_create(
    app: &App,
    reference: &str,
    name: &str,
    at: Option<&str>,
    message: Option<&str>,
) -> Result<()> {
    let id = app.resolve(reference)?;
    app.coordinator.create_tag(id, name, at, message).await?;
    println!("✅ Created tag {}", name);
    Ok(())
}

pub async fn tag_delete(app: &App, reference: &str, name: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    app.coordinator.delete_tag(id, name).await?;
    println!("✅ Deleted tag {}", name);
    Ok(())
}

pub async fn stash_list(app: &App, reference: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    let stashes = app.coordinator.stashes(id).await?;
    if stashes.is_empty() {
        println!("No stashes.");
    }
    for stash in &stashes {
        println!("{}", render::stash_line(stash));
    }
    Ok(())
}

pub async fn stash_save(
    app: &App,
    reference: &str,
    message: Option<&str>,
    include_untracked: bool,
) -> Result<()> {
    let id = app.resolve(reference)?;
    app.coordinator
        .stash_save(id, message, include_untracked)
        .await?;
    println!("✅ Stashed local changes");
    Ok(())
}

pub async fn stash_apply(app: &App, reference: &str, index: usize, pop: bool) -> Result<()> {
    let id = app.resolve(reference)?;
    let result = if pop {
        app.coordinator.stash_pop(id, index).await
    } else {
        app.coordinator.stash_apply(id, index).await
    };
    match result {
        Ok(_) => {
            println!("✅ Applied stash@{{{}}}", index);
            Ok(())
        }
        Err(RepoError::MergeConflict { paths }) => {
            for path in &paths {
                println!("   ✗ {}", path.display());
            }
            Err(RepoError::MergeConflict { paths })
                .context("The stash conflicts with HEAD and was not applied; it is still saved")
        }
        Err(RepoError::UncommittedChanges { paths }) => Err(RepoError::UncommittedChanges { paths })
            .context("Commit or stash your changes first"),
        Err(err) => Err(err.into()),
    }
}

pub async fn stash_drop(app: &App, reference: &str, index: usize) -> Result<()> {
    let id = app.resolve(reference)?;
    app.coordinator.stash_drop(id, index).await?;
    println!("✅ Dropped stash@{{{}}}", index);
    Ok(())
}

/// Unstaged changes by default; `--staged` or two revisions select the
/// other comparisons.
pub async fn diff(
    app: &App,
    reference: &str,
    staged: bool,
    revisions: &[String],
    stat: bool,
) -> Result<()> {
    let target = match revisions {
        [] if staged => DiffTarget::Staged,
        [] => DiffTarget::WorkingTree,
        [old, new] => DiffTarget::Commits {
            old: old.clone(),
            new: new.clone(),
        },
        [old] => DiffTarget::Commits {
            old: old.clone(),
            new: "HEAD".to_string(),
        },
        _ => anyhow::bail!("Expected at most two revisions"),
    };

    let id = app.resolve(reference)?;
    let files = app.coordinator.diff(id, target).await?;
    if files.is_empty() {
        println!("No changes.");
    }
    for file in &files {
        if stat {
            println!("{}", render::diff_stat(file));
        } else {
            render::file_diff(file);
        }
    }
    Ok(())
}
