//! Credential sources consulted when a caller passes no credential.

use gitdock_core::Credential;

/// Supplies authentication material for a remote host.
pub trait CredentialSource: Send + Sync {
    fn current_credential(&self, remote_host: &str) -> Option<Credential>;
}

/// Serves one credential for a fixed set of hosts.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    hosts: Vec<String>,
    credential: Option<Credential>,
}

impl StaticCredentials {
    pub fn new(credential: Option<Credential>) -> Self {
        Self {
            hosts: Vec::new(),
            credential,
        }
    }

    /// A GitHub token, served for `github.com` and `api.github.com`.
    pub fn github(token: Option<String>) -> Self {
        Self::new(token.map(Credential::Token))
            .for_host("github.com")
            .for_host("api.github.com")
    }

    pub fn for_host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into().to_ascii_lowercase());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn current_credential(&self, remote_host: &str) -> Option<Credential> {
        let host = remote_host.to_ascii_lowercase();
        if self.hosts.is_empty() || self.hosts.contains(&host) {
            self.credential.clone()
        } else {
            None
        }
    }
}

/// Never supplies a credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn current_credential(&self, _remote_host: &str) -> Option<Credential> {
        None
    }
}
