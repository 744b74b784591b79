use async_trait::async_trait;
use gitdock_core::{Credential, Page, PageToken, RemoteRepositoryInfo, RepoResult};

/// Read-only view of a hosting service's repository catalog.
///
/// Implementations report failures as `AuthRejected`, `RateLimited`,
/// `NotFound` or `NetworkUnavailable`; retry policy belongs to the caller.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// List one page of `owner`'s repositories. `None` requests the first page.
    async fn list_repositories(
        &self,
        owner: &str,
        page: Option<&PageToken>,
        credential: Option<&Credential>,
    ) -> RepoResult<Page<RemoteRepositoryInfo>>;

    /// Fetch metadata for a single repository.
    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
        credential: Option<&Credential>,
    ) -> RepoResult<RemoteRepositoryInfo>;

    /// Host whose clone URLs this catalog describes, e.g. `github.com`.
    fn host(&self) -> &str;

    /// Whether `host` is served by this catalog.
    fn serves_host(&self, host: &str) -> bool {
        host.eq_ignore_ascii_case(self.host())
    }
}
