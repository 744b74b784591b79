//! Branch commands.

use anyhow::{Context, Result};
use gitdock_core::RepoError;

use crate::app::App;

pub async fn create(app: &App, reference: &str, name: &str, from: Option<&str>) -> Result<()> {
    let id = app.resolve(reference)?;
    app.coordinator.create_branch(id, name, from).await?;
    println!("✅ Created branch {}", name);
    Ok(())
}

pub async fn delete(app: &App, reference: &str, name: &str) -> Result<()> {
    let id = app.resolve(reference)?;
    app.coordinator.delete_branch(id, name).await?;
    println!("✅ Deleted branch {}", name);
    Ok(())
}

pub async fn checkout(app: &App, reference: &str, name: &str, force: bool) -> Result<()> {
    let id = app.resolve(reference)?;
    match app.coordinator.checkout(id, name, force).await {
        Ok(_) => {
            println!("✅ Switched to {}", name);
            Ok(())
        }
        Err(RepoError::UncommittedChanges { paths }) => {
            for path in &paths {
                println!("   M {}", path.display());
            }
            Err(RepoError::UncommittedChanges { paths })
                .context("Commit your changes or pass --force to discard them")
        }
        Err(err) => Err(err.into()),
    }
}
