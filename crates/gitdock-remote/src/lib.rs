//! Remote catalog client for gitdock.
//!
//! [`RemoteCatalog`] is the contract the operations layer uses to browse a
//! hosting service; [`GitHubCatalog`] implements it with octocrab.

mod catalog;
mod github;
mod url;

pub use catalog::RemoteCatalog;
pub use github::{classify_status, GitHubCatalog};
pub use url::{parse_remote_url, RemoteLocation};
