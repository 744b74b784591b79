//! Hosting-service commands.

use anyhow::{Context, Result};
use gitdock_core::RemoteRepositoryInfo;

use crate::app::App;
use crate::render;

/// Pages fetched at most with `--all`.
const MAX_PAGES: usize = 50;

/// List repositories of a GitHub user or organization.
pub async fn list(app: &App, owner: &str, all: bool) -> Result<()> {
    if !app.config.has_github_token() {
        println!("⚠️  GITHUB_TOKEN not set; only public repositories are listed");
    }
    println!("🏢 Owner: {}", owner);

    let mut repos: Vec<RemoteRepositoryInfo> = Vec::new();
    let mut next = None;
    for _ in 0..MAX_PAGES {
        let page = app
            .coordinator
            .list_remote(owner, next.take(), app.options())
            .await
            .with_context(|| format!("Failed to list repositories of {}", owner))?;
        repos.extend(page.items);
        next = page.next;
        if !all || next.is_none() {
            break;
        }
    }

    println!("📋 Found {} repositories", repos.len());
    for repo in &repos {
        match &repo.description {
            Some(description) => println!(
                "   • {} [{}] {}",
                repo.name, repo.visibility, description
            ),
            None => println!("   • {} [{}]", repo.name, repo.visibility),
        }
    }
    if next.is_some() {
        println!("   … more available (use --all)");
    }
    Ok(())
}

/// Show hosting metadata for a managed repository.
pub async fn show(app: &App, reference: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    let snapshot = app.coordinator.refresh_remote(id, app.options()).await;

    // A failed refresh still carries the last known metadata.
    let snapshot = match snapshot {
        Ok(snapshot) => snapshot,
        Err(err) => {
            let snapshot = app.coordinator.snapshot(id).await?;
            if snapshot.remote.is_none() {
                return Err(err.into());
            }
            println!("⚠️  {}", err);
            snapshot
        }
    };

    let Some(remote) = &snapshot.remote else {
        anyhow::bail!("No remote metadata for {}", snapshot.path.display());
    };
    let info = &remote.info;

    println!("📡 {}/{}", info.owner, info.name);
    println!("{:─<50}", "");
    println!("   Visibility:     {}", info.visibility);
    if let Some(branch) = &info.default_branch {
        println!("   Default branch: {}", branch);
    }
    if let Some(description) = &info.description {
        println!("   Description:    {}", description);
    }
    if let Some(url) = &info.html_url {
        println!("   Web:            {}", url);
    }
    if let Some(url) = &info.clone_url {
        println!("   Clone:          {}", url);
    }
    println!(
        "   Fetched:        {}{}",
        render::age(remote.fetched_at),
        if remote.stale { " (stale)" } else { "" }
    );
    Ok(())
}
