//! gitdock operations layer
//!
//! Owns everything between the adapters and a user interface:
//! - **Registry**: the durable table of managed repositories
//! - **Coordinator**: serializes mutating operations per repository, with
//!   rollback, retry, timeout and cancellation
//! - **Projector**: derives immutable [`RepositorySnapshot`]s from disk state
//! - **Config**: settings file plus environment overrides
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gitdock_git::Git2Store;
//! use gitdock_ops::{
//!     Config, Coordinator, CoordinatorSettings, JsonFileStorage, OperationOptions, Registry,
//!     StaticCredentials,
//! };
//! use gitdock_remote::GitHubCatalog;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load()?;
//!     let storage = Arc::new(JsonFileStorage::new(config.registry_path()));
//!     let registry = Registry::open(storage, config.retry_policy())?;
//!
//!     let coordinator = Coordinator::new(
//!         registry,
//!         Arc::new(Git2Store::new()),
//!         Arc::new(GitHubCatalog::new()),
//!         Arc::new(StaticCredentials::github(config.github_token.clone())),
//!         CoordinatorSettings::from_config(&config),
//!     );
//!
//!     for handle in coordinator.list_handles() {
//!         let snapshot = coordinator.fetch(handle.id, OperationOptions::default()).await?;
//!         println!("{}: {:?}", snapshot.path.display(), snapshot.divergence);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! [`RepositorySnapshot`]: gitdock_core::RepositorySnapshot

mod clock;
mod config;
mod coordinator;
mod credentials;
mod error;
mod projector;
mod registry;
mod retry;
mod storage;
mod tokens;

// Re-export public API
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorSettings, OperationOptions};
pub use credentials::{CredentialSource, NoCredentials, StaticCredentials};
pub use error::{OpsError, OpsResult};
pub use projector::{carry_forward, project, read_disk_state, DiskState, ProjectionInput};
pub use registry::{normalize_path, Persisted, Registry, Unregistered};
pub use retry::RetryPolicy;
pub use storage::{JsonFileStorage, MemoryStorage, RegistryEntry, RegistryStorage};
pub use tokens::{OperationTable, OperationToken};
