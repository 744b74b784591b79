//! GitHub implementation of [`RemoteCatalog`] on top of octocrab.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use gitdock_core::{
    Credential, Page, PageToken, RemoteRepositoryInfo, RepoError, RepoResult, Visibility,
};
use octocrab::models::Repository;
use octocrab::service::middleware::retry::RetryConfig;
use octocrab::Octocrab;
use tracing::{debug, info};

use crate::catalog::RemoteCatalog;

const DEFAULT_HOST: &str = "github.com";
const DEFAULT_PER_PAGE: u8 = 50;
const DEFAULT_RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(30);

/// Repository catalog backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubCatalog {
    /// API base URL; `None` for api.github.com.
    api_url: Option<String>,
    /// Host of clone URLs this catalog answers for.
    host: String,
    per_page: u8,
    /// Delay reported when GitHub rate limits without saying for how long.
    rate_limit_fallback: Duration,
}

impl Default for GitHubCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl GitHubCatalog {
    pub fn new() -> Self {
        Self {
            api_url: None,
            host: DEFAULT_HOST.to_string(),
            per_page: DEFAULT_PER_PAGE,
            rate_limit_fallback: DEFAULT_RATE_LIMIT_FALLBACK,
        }
    }

    /// Point the client at a GitHub Enterprise API (`https://ghe.example.com/api/v3`).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into();
        if let Some(host) = api_url
            .split_once("://")
            .and_then(|(_, rest)| rest.split('/').next())
        {
            let host = host.trim_start_matches("api.").to_ascii_lowercase();
            if !host.is_empty() {
                self.host = host;
            }
        }
        self.api_url = Some(api_url);
        self
    }

    pub fn with_per_page(mut self, per_page: u8) -> Self {
        self.per_page = per_page.max(1);
        self
    }

    pub fn with_rate_limit_fallback(mut self, delay: Duration) -> Self {
        self.rate_limit_fallback = delay;
        self
    }

    fn client(&self, credential: Option<&Credential>) -> RepoResult<Octocrab> {
        // Retries belong to the caller's policy; octocrab's own would
        // resend rate-limited requests behind its back.
        let mut builder = Octocrab::builder().add_retry_config(RetryConfig::None);
        if let Some(api_url) = &self.api_url {
            builder = builder
                .base_uri(api_url.as_str())
                .map_err(|e| RepoError::invalid_request(format!("invalid API URL: {e}")))?;
        }
        if let Some(credential) = credential {
            builder = builder.personal_token(credential.secret().to_string());
        }
        builder.build().map_err(|e| RepoError::network(e.to_string()))
    }

    fn map_error(&self, resource: &str, err: octocrab::Error) -> RepoError {
        match err {
            octocrab::Error::GitHub { source, .. } => classify_status(
                source.status_code.as_u16(),
                &source.message,
                resource,
                self.rate_limit_fallback,
            ),
            other => RepoError::network(other.to_string()),
        }
    }

    /// Like [`Self::map_error`], but a rate limit carries the time left
    /// until the quota resets.
    async fn classify(&self, client: &Octocrab, resource: &str, err: octocrab::Error) -> RepoError {
        match self.map_error(resource, err) {
            RepoError::RateLimited { .. } => RepoError::RateLimited {
                retry_after: self.rate_limit_reset(client).await,
            },
            other => other,
        }
    }

    /// octocrab drops response headers from its errors, so the reset time
    /// comes from `/rate_limit`, which is not counted against the quota.
    async fn rate_limit_reset(&self, client: &Octocrab) -> Duration {
        match client.ratelimit().get().await {
            Ok(limits) => {
                let core = limits.resources.core;
                reset_delay(core.remaining, core.reset, SystemTime::now())
                    .unwrap_or(self.rate_limit_fallback)
            }
            Err(e) => {
                debug!(error = %e, "rate limit status unavailable");
                self.rate_limit_fallback
            }
        }
    }

    async fn list_page(
        &self,
        client: &Octocrab,
        owner: &str,
        page: u32,
    ) -> RepoResult<octocrab::Page<Repository>> {
        let org = client
            .orgs(owner)
            .list_repos()
            .per_page(self.per_page)
            .page(page)
            .send()
            .await;

        match org {
            Ok(repos) => Ok(repos),
            // Not an organization: list the user's repositories instead.
            Err(octocrab::Error::GitHub { source, .. }) if source.status_code.as_u16() == 404 => {
                debug!(owner, "owner is not an organization, listing user repositories");
                match client
                    .users(owner)
                    .repos()
                    .per_page(self.per_page)
                    .page(page)
                    .send()
                    .await
                {
                    Ok(repos) => Ok(repos),
                    Err(e) => Err(self.classify(client, owner, e).await),
                }
            }
            Err(e) => Err(self.classify(client, owner, e).await),
        }
    }
}

/// Map an HTTP status returned by GitHub onto the shared taxonomy.
pub fn classify_status(
    status: u16,
    message: &str,
    resource: &str,
    rate_limit_fallback: Duration,
) -> RepoError {
    match status {
        401 => RepoError::AuthRejected {
            message: message.to_string(),
        },
        429 => RepoError::RateLimited {
            retry_after: rate_limit_fallback,
        },
        403 if message.to_ascii_lowercase().contains("rate limit") => RepoError::RateLimited {
            retry_after: rate_limit_fallback,
        },
        403 => RepoError::AuthRejected {
            message: message.to_string(),
        },
        404 => RepoError::NotFound {
            what: resource.to_string(),
        },
        _ => RepoError::network(format!("GitHub returned {status}: {message}")),
    }
}

/// Time until an exhausted quota resets at `reset` (Unix seconds). `None`
/// when quota is left, in which case the limit hit was a secondary one.
pub fn reset_delay(remaining: usize, reset: u64, now: SystemTime) -> Option<Duration> {
    if remaining > 0 {
        return None;
    }
    let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(Duration::from_secs(reset.saturating_sub(now).max(1)))
}

fn to_info(repo: Repository, owner: &str) -> RemoteRepositoryInfo {
    let visibility = match repo.visibility.as_deref() {
        Some("internal") => Visibility::Internal,
        Some("private") => Visibility::Private,
        Some("public") => Visibility::Public,
        _ if repo.private.unwrap_or(false) => Visibility::Private,
        _ => Visibility::Public,
    };

    RemoteRepositoryInfo {
        owner: repo
            .owner
            .as_ref()
            .map(|author| author.login.clone())
            .unwrap_or_else(|| owner.to_string()),
        name: repo.name,
        default_branch: repo.default_branch,
        visibility,
        clone_url: repo.clone_url.map(|url| url.to_string()),
        description: repo.description,
        html_url: repo.html_url.map(|url| url.to_string()),
    }
}

fn parse_page(token: Option<&PageToken>) -> RepoResult<u32> {
    match token {
        None => Ok(1),
        Some(token) => token
            .0
            .parse::<u32>()
            .ok()
            .filter(|page| *page >= 1)
            .ok_or_else(|| RepoError::invalid_request(format!("invalid page token {:?}", token.0))),
    }
}

#[async_trait]
impl RemoteCatalog for GitHubCatalog {
    async fn list_repositories(
        &self,
        owner: &str,
        page: Option<&PageToken>,
        credential: Option<&Credential>,
    ) -> RepoResult<Page<RemoteRepositoryInfo>> {
        let page = parse_page(page)?;
        let client = self.client(credential)?;

        info!(owner, page, "listing remote repositories");
        let repos = self.list_page(&client, owner, page).await?;

        let next = repos
            .next
            .as_ref()
            .map(|_| PageToken((page + 1).to_string()));
        let items = repos
            .items
            .into_iter()
            .map(|repo| to_info(repo, owner))
            .collect();

        Ok(Page { items, next })
    }

    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
        credential: Option<&Credential>,
    ) -> RepoResult<RemoteRepositoryInfo> {
        let client = self.client(credential)?;
        let resource = format!("{owner}/{name}");

        debug!(repository = %resource, "fetching repository metadata");
        match client.repos(owner, name).get().await {
            Ok(repo) => Ok(to_info(repo, owner)),
            Err(e) => Err(self.classify(&client, &resource, e).await),
        }
    }

    fn host(&self) -> &str {
        &self.host
    }
}
