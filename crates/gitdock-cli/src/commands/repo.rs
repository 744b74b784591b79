//! Repository commands: registration, status and synchronization.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use gitdock_core::{HandleId, RepoError, RepositorySnapshot};
use gitdock_remote::parse_remote_url;
use tracing::info;

use crate::app::App;
use crate::render;

/// List managed repositories.
pub fn list(app: &App) -> Result<()> {
    let handles = app.coordinator.list_handles();
    if handles.is_empty() {
        println!("No repositories managed yet. Use `gd import <path>` or `gd clone <url>`.");
        return Ok(());
    }

    println!("📦 {} repositories", handles.len());
    println!("{:─<50}", "");
    for handle in handles {
        println!(
            "   {}  {}  {}",
            handle.id.short(),
            handle.path.display(),
            handle.remote_url.as_deref().unwrap_or("(no remote)")
        );
    }
    Ok(())
}

pub async fn import(app: &App, path: &Path) -> Result<()> {
    let snapshot = app
        .coordinator
        .import(path)
        .await
        .with_context(|| format!("Failed to import {}", path.display()))?;

    println!("✅ Imported {}", snapshot.path.display());
    render::snapshot(&snapshot);
    Ok(())
}

pub async fn clone(app: &App, url: &str, path: Option<PathBuf>) -> Result<()> {
    let target = match path {
        Some(path) => path,
        None => app.config.clone_root.join(repository_name(url)?),
    };

    println!("📥 Cloning {}", url);
    println!("📍 Clone to: {}", target.display());
    let snapshot = app
        .coordinator
        .clone_repository(&target, url, app.options())
        .await
        .with_context(|| format!("Failed to clone {}", url))?;

    println!("✅ Clone complete");
    render::snapshot(&snapshot);
    Ok(())
}

/// Directory name for a clone of `url`.
fn repository_name(url: &str) -> Result<String> {
    if let Some(location) = parse_remote_url(url) {
        return Ok(location.name);
    }

    let name = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    if name.is_empty() {
        bail!("Cannot derive a directory name from {}; pass a path", url);
    }
    Ok(name.to_string())
}

/// The referenced repository, or every managed one.
fn targets(app: &App, reference: Option<&str>) -> Result<Vec<HandleId>> {
    match reference {
        Some(reference) => Ok(vec![app.resolve(reference)?]),
        None => Ok(app
            .coordinator
            .list_handles()
            .into_iter()
            .map(|handle| handle.id)
            .collect()),
    }
}

pub async fn status(app: &App, reference: Option<&str>, json: bool) -> Result<()> {
    let mut snapshots = Vec::new();
    for id in targets(app, reference)? {
        snapshots.push(app.coordinator.snapshot(id).await?);
    }

    if json {
        let rendered = match (reference, snapshots.as_slice()) {
            (Some(_), [snapshot]) => serde_json::to_string_pretty(snapshot)?,
            _ => serde_json::to_string_pretty(&snapshots)?,
        };
        println!("{}", rendered);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("No repositories managed yet.");
    }
    for (i, snapshot) in snapshots.iter().enumerate() {
        if i > 0 {
            println!();
        }
        render::snapshot(snapshot);
    }
    Ok(())
}

/// Fetch one repository, or all of them. Failures of individual
/// repositories are reported and do not stop the others.
pub async fn fetch(app: &App, reference: Option<&str>) -> Result<()> {
    if let Some(reference) = reference {
        let id = app.resolve(reference)?;
        let snapshot = app.coordinator.fetch(id, app.options()).await?;
        println!("✅ Fetched: {}", render::divergence(&snapshot.divergence));
        return Ok(());
    }

    let handles = app.coordinator.list_handles();
    let mut failed = 0;
    for handle in &handles {
        match app.coordinator.fetch(handle.id, app.options()).await {
            Ok(snapshot) => println!(
                "   ✓ {}  {}",
                handle.path.display(),
                render::divergence(&snapshot.divergence)
            ),
            Err(err) => {
                failed += 1;
                println!("   ✗ {}  {}", handle.path.display(), err);
            }
        }
    }
    info!(total = handles.len(), failed, "fetch finished");

    if failed > 0 {
        bail!("{} of {} repositories failed to fetch", failed, handles.len());
    }
    println!("✅ Fetched {} repositories", handles.len());
    Ok(())
}

pub async fn pull(app: &App, reference: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    let snapshot = app.coordinator.pull(id, app.options()).await.map_err(hint)?;
    println!("✅ Pulled");
    render::snapshot(&snapshot);
    Ok(())
}

pub async fn push(app: &App, reference: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    let snapshot = app.coordinator.push(id, app.options()).await.map_err(hint)?;
    println!(
        "✅ Pushed {}",
        snapshot.branch.as_deref().unwrap_or("HEAD")
    );
    Ok(())
}

pub async fn commit(app: &App, reference: &str, message: &str, paths: Vec<PathBuf>) -> Result<()> {
    let id = app.resolve(reference)?;
    let snapshot = app.coordinator.commit(id, message, paths).await?;
    print_head("✅ Committed", &snapshot);
    Ok(())
}

pub async fn merge(app: &App, reference: &str, source: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    let snapshot = app.coordinator.merge(id, source).await.map_err(hint)?;
    print_head("✅ Merged", &snapshot);
    Ok(())
}

pub async fn resolve(app: &App, reference: &str, message: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    let snapshot = app.coordinator.resolve_merge(id, message).await?;
    print_head("✅ Merge concluded", &snapshot);
    Ok(())
}

pub async fn abort_merge(app: &App, reference: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    let snapshot = app.coordinator.abort_merge(id).await?;
    print_head("✅ Merge aborted", &snapshot);
    Ok(())
}

pub async fn remove(app: &App, reference: &str, delete_files: bool) -> Result<()> {
    let id = app.resolve(reference)?;
    let removed = app.coordinator.remove(id, delete_files).await?;
    if let Some(warning) = &removed.warning {
        println!("⚠️  {}", warning);
    }

    let unregistered = removed.into_value();
    println!("✅ Removed {}", unregistered.handle.path.display());
    if unregistered.files_removed {
        println!("   Working tree deleted");
    }
    if let Some(err) = unregistered.delete_error {
        println!("⚠️  Could not delete the working tree: {}", err);
    }
    Ok(())
}

fn print_head(label: &str, snapshot: &RepositorySnapshot) {
    match &snapshot.head {
        Some(head) => println!("{} ({})", label, head.short()),
        None => println!("{}", label),
    }
}

/// Attach the next step the user can take to errors that have one.
fn hint(err: RepoError) -> anyhow::Error {
    let next = match &err {
        RepoError::MergeConflict { paths } => {
            for path in paths {
                println!("   ✗ {}", path.display());
            }
            Some("Fix the files, then run `gd resolve`, or `gd abort-merge` to go back")
        }
        RepoError::UncommittedChanges { .. } => Some("Commit or discard your changes first"),
        RepoError::NonFastForward { .. } => Some("Pull the remote changes first"),
        _ => None,
    };
    match next {
        Some(next) => anyhow::Error::new(err).context(next),
        None => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_name_from_hosted_url() {
        assert_eq!(
            repository_name("https://github.com/rust-lang/cargo.git").unwrap(),
            "cargo"
        );
        assert_eq!(
            repository_name("git@github.com:rust-lang/cargo.git").unwrap(),
            "cargo"
        );
    }

    #[test]
    fn test_repository_name_from_local_url() {
        assert_eq!(repository_name("file:///srv/git/tools.git").unwrap(), "tools");
        assert_eq!(repository_name("/srv/git/tools/").unwrap(), "tools");
        assert!(repository_name("/").is_err());
    }

    #[test]
    fn test_conflict_hint_keeps_the_error() {
        let err = hint(RepoError::MergeConflict {
            paths: vec![PathBuf::from("README.md")],
        });
        assert!(err.to_string().contains("gd resolve"));
        assert!(matches!(
            err.downcast_ref::<RepoError>(),
            Some(RepoError::MergeConflict { .. })
        ));
    }
}
