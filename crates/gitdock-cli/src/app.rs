//! Composition root: wires configuration, registry, adapters and the
//! coordinator together, and resolves user-supplied repository references.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use gitdock_core::{HandleId, RepositoryHandle};
use gitdock_git::Git2Store;
use gitdock_ops::{
    Config, Coordinator, CoordinatorSettings, JsonFileStorage, OperationOptions, Registry,
    StaticCredentials,
};
use gitdock_remote::{GitHubCatalog, RemoteCatalog};
use tracing::debug;

/// Everything a command needs.
pub struct App {
    pub config: Config,
    pub coordinator: Arc<Coordinator>,
}

impl App {
    pub fn build(config: Config) -> Result<Self> {
        let registry_path = config.registry_path();
        debug!(path = %registry_path.display(), "opening registry");
        let storage = Arc::new(JsonFileStorage::new(registry_path.clone()));
        let registry = Registry::open(storage, config.retry_policy()).with_context(|| {
            format!("Failed to open registry at {}", registry_path.display())
        })?;

        let mut catalog = GitHubCatalog::new().with_rate_limit_fallback(config.rate_limit_fallback());
        if let Some(api_url) = &config.github_api_url {
            catalog = catalog.with_api_url(api_url.clone());
        }
        let credentials =
            StaticCredentials::github(config.github_token.clone()).for_host(catalog.host());

        let coordinator = Coordinator::new(
            registry,
            Arc::new(Git2Store::new()),
            Arc::new(catalog),
            Arc::new(credentials),
            CoordinatorSettings::from_config(&config),
        );

        Ok(Self {
            config,
            coordinator: Arc::new(coordinator),
        })
    }

    pub fn options(&self) -> OperationOptions {
        OperationOptions::default()
    }

    /// Resolve a full id, an unambiguous id prefix or a repository path.
    pub fn resolve(&self, reference: &str) -> Result<HandleId> {
        let handles = self.coordinator.list_handles();
        resolve_handle(&handles, reference, |path| {
            self.coordinator.registry().find_by_path(path)
        })
    }
}

fn resolve_handle(
    handles: &[RepositoryHandle],
    reference: &str,
    by_path: impl Fn(&Path) -> Option<RepositoryHandle>,
) -> Result<HandleId> {
    let reference = reference.trim();
    if reference.is_empty() {
        bail!("Empty repository reference");
    }

    if let Ok(id) = reference.parse::<HandleId>() {
        if handles.iter().any(|handle| handle.id == id) {
            return Ok(id);
        }
    }

    let path = Path::new(reference);
    if path.exists() {
        if let Some(handle) = by_path(path) {
            return Ok(handle.id);
        }
    }

    let prefix = reference.to_ascii_lowercase().replace('-', "");
    if prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        let matches: Vec<&RepositoryHandle> = handles
            .iter()
            .filter(|handle| handle.id.0.simple().to_string().starts_with(&prefix))
            .collect();
        match matches.as_slice() {
            [handle] => return Ok(handle.id),
            [] => {}
            _ => bail!(
                "Ambiguous repository reference '{}' matches {} repositories",
                reference,
                matches.len()
            ),
        }
    }

    bail!(
        "No managed repository matches '{}'. Run `gd list` to see them.",
        reference
    )
}
