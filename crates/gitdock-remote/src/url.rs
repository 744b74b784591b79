//! Remote URL parsing.

/// Host and `owner/name` extracted from a remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub host: String,
    pub owner: String,
    pub name: String,
}

/// Parse `https://host/owner/name(.git)`, `ssh://git@host[:port]/owner/name`
/// and scp-style `git@host:owner/name` URLs.
///
/// Returns `None` for local paths and anything without an owner and a name.
pub fn parse_remote_url(url: &str) -> Option<RemoteLocation> {
    let url = url.trim();

    let (authority, path) = if let Some((scheme, rest)) = url.split_once("://") {
        if !matches!(scheme, "https" | "http" | "ssh" | "git") {
            return None;
        }
        rest.split_once('/')?
    } else {
        // scp-like syntax: [user@]host:path
        let (authority, path) = url.split_once(':')?;
        if authority.contains('/') || path.starts_with("//") {
            return None;
        }
        (authority, path)
    };

    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?.to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }

    let mut segments = path.trim_matches('/').split('/');
    let owner = segments.next()?.to_string();
    let name = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    let name = name.strip_suffix(".git").unwrap_or(name).to_string();
    if owner.is_empty() || name.is_empty() {
        return None;
    }

    Some(RemoteLocation { host, owner, name })
}
