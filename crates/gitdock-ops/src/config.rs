//! Configuration for the operations layer.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{OpsError, OpsResult};
use crate::retry::RetryPolicy;

const QUALIFIER: &str = "dev";
const ORGANIZATION: &str = "gitdock";
const APPLICATION: &str = "gitdock";

/// Configuration for gitdock operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding `registry.json`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Default parent directory for new clones.
    #[serde(default = "default_clone_root")]
    pub clone_root: PathBuf,

    /// Timeout for network-facing operations, in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Retries after the first attempt for retryable failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Commits visited at most when computing ahead/behind counts.
    #[serde(default = "default_ancestry_depth")]
    pub ancestry_depth: usize,

    /// Time-to-live of cached remote repository metadata, in seconds.
    #[serde(default = "default_remote_info_ttl_secs")]
    pub remote_info_ttl_secs: u64,

    /// Delay assumed when the API rate limits without a reset time. Capped
    /// at `backoff_max_ms` so such a limit is always retried.
    #[serde(default = "default_rate_limit_fallback_secs")]
    pub rate_limit_fallback_secs: u64,

    /// GitHub API base URL (GitHub Enterprise).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_api_url: Option<String>,

    /// GitHub token for API and HTTPS transport authentication. Never written
    /// to disk.
    #[serde(default, skip_serializing)]
    pub github_token: Option<String>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".gitdock"))
}

fn default_clone_root() -> PathBuf {
    default_data_dir().join("repos")
}

fn default_operation_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_ancestry_depth() -> usize {
    10_000
}

fn default_remote_info_ttl_secs() -> u64 {
    300
}

fn default_rate_limit_fallback_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            clone_root: default_clone_root(),
            operation_timeout_secs: default_operation_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            ancestry_depth: default_ancestry_depth(),
            remote_info_ttl_secs: default_remote_info_ttl_secs(),
            rate_limit_fallback_secs: default_rate_limit_fallback_secs(),
            github_api_url: None,
            github_token: None,
        }
    }
}

impl Config {
    /// Load configuration from disk with environment overrides.
    pub fn load() -> OpsResult<Self> {
        let config = match Self::config_file_path() {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)?;
                serde_json::from_str(&contents)?
            }
            _ => Self::default(),
        };

        config.with_env_overrides()
    }

    /// Apply `GITHUB_TOKEN`, `GITHUB_API_URL`, `GITDOCK_DATA_DIR`,
    /// `GITDOCK_CLONE_ROOT` and `GITDOCK_TIMEOUT_SECS`.
    pub fn with_env_overrides(self) -> OpsResult<Self> {
        let timeout = match std::env::var("GITDOCK_TIMEOUT_SECS") {
            Ok(value) => value.parse().map_err(|_| {
                OpsError::Config(format!("Invalid GITDOCK_TIMEOUT_SECS: {}", value))
            })?,
            Err(_) => self.operation_timeout_secs,
        };

        Ok(Self {
            data_dir: std::env::var_os("GITDOCK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(self.data_dir),
            clone_root: std::env::var_os("GITDOCK_CLONE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(self.clone_root),
            operation_timeout_secs: timeout,
            github_api_url: std::env::var("GITHUB_API_URL").ok().or(self.github_api_url),
            github_token: std::env::var("GITHUB_TOKEN").ok().or(self.github_token),
            ..self
        })
    }

    /// Save configuration to disk.
    pub fn save(&self) -> OpsResult<()> {
        if let Some(path) = Self::config_file_path() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(self)?;
            std::fs::write(&path, contents)?;
        }
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_file_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Path of the persisted registry.
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.json")
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn remote_info_ttl(&self) -> Duration {
        Duration::from_secs(self.remote_info_ttl_secs)
    }

    pub fn rate_limit_fallback(&self) -> Duration {
        Duration::from_secs(self.rate_limit_fallback_secs)
            .min(Duration::from_millis(self.backoff_max_ms))
    }

    /// Retry policy derived from the backoff settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.saturating_add(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    /// Check if a GitHub token is configured.
    pub fn has_github_token(&self) -> bool {
        self.github_token.is_some()
    }

    /// Get a configuration value by key.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "data_dir" => Some(self.data_dir.display().to_string()),
            "clone_root" => Some(self.clone_root.display().to_string()),
            "operation_timeout_secs" => Some(self.operation_timeout_secs.to_string()),
            "max_retries" => Some(self.max_retries.to_string()),
            "backoff_base_ms" => Some(self.backoff_base_ms.to_string()),
            "backoff_max_ms" => Some(self.backoff_max_ms.to_string()),
            "ancestry_depth" => Some(self.ancestry_depth.to_string()),
            "remote_info_ttl_secs" => Some(self.remote_info_ttl_secs.to_string()),
            "rate_limit_fallback_secs" => Some(self.rate_limit_fallback_secs.to_string()),
            "github_api_url" => self.github_api_url.clone(),
            "github_token" => self.github_token.as_ref().map(|_| "***".to_string()),
            _ => None,
        }
    }

    /// Set a configuration value by key.
    pub fn set(&mut self, key: &str, value: &str) -> OpsResult<()> {
        fn number<T: std::str::FromStr>(value: &str) -> OpsResult<T> {
            value
                .parse()
                .map_err(|_| OpsError::Config(format!("Invalid number: {}", value)))
        }

        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "clone_root" => self.clone_root = PathBuf::from(value),
            "operation_timeout_secs" => {
                let secs: u64 = number(value)?;
                if secs == 0 {
                    return Err(OpsError::Config("Timeout must be at least 1s".into()));
                }
                self.operation_timeout_secs = secs;
            }
            "max_retries" => self.max_retries = number(value)?,
            "backoff_base_ms" => self.backoff_base_ms = number(value)?,
            "backoff_max_ms" => self.backoff_max_ms = number(value)?,
            "ancestry_depth" => self.ancestry_depth = number(value)?,
            "remote_info_ttl_secs" => self.remote_info_ttl_secs = number(value)?,
            "rate_limit_fallback_secs" => self.rate_limit_fallback_secs = number(value)?,
            "github_api_url" => self.github_api_url = Some(value.to_string()),
            "github_token" => {
                return Err(OpsError::Config(
                    "github_token is read from GITHUB_TOKEN and never stored".into(),
                ));
            }
            _ => {
                return Err(OpsError::Config(format!("Unknown config key: {}", key)));
            }
        }

        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(OpsError::Config(
                "backoff_base_ms must not exceed backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// Keys accepted by [`Config::get`] and [`Config::set`].
    pub fn keys() -> &'static [&'static str] {
        &[
            "data_dir",
            "clone_root",
            "operation_timeout_secs",
            "max_retries",
            "backoff_base_ms",
            "backoff_max_ms",
            "ancestry_depth",
            "remote_info_ttl_secs",
            "rate_limit_fallback_secs",
            "github_api_url",
            "github_token",
        ]
    }
}
