//! Configuration management for tiercache
//!
//! The TOML file supplies defaults; environment variables and flags (parsed
//! by the CLI) override them. Resolution into concrete endpoints happens
//! here so the rules can be tested without a process environment.

pub mod schema;

pub use schema::Config;

use crate::error::{ProxyError, ProxyResult};
use crate::remote::ApiVersion;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tiercache")
            .join("config.toml")
    }

    /// Default local cache directory
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tiercache")
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub async fn load(&self) -> ProxyResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> ProxyResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ProxyError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| ProxyError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> ProxyResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            ProxyError::io(format!("writing config to {}", self.config_path.display()), e)
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    async fn ensure_config_dir(&self) -> ProxyResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache service settings taken from the job environment
#[derive(Debug, Clone, Default)]
pub struct RemoteEnv {
    pub runtime_token: Option<String>,
    pub cache_url: Option<String>,
    pub results_url: Option<String>,
    pub service_v2: bool,
}

/// Resolved cache service endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub api: ApiVersion,
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

/// Listing credentials taken from the job environment
#[derive(Debug, Clone, Default)]
pub struct ListingEnv {
    pub token: Option<String>,
    pub repository: Option<String>,
    pub git_ref: Option<String>,
    pub api_url: Option<String>,
}

/// Resolved listing source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingSource {
    pub api_url: String,
    pub repository: String,
    pub token: String,
    pub git_ref: Option<String>,
    pub timeout: Duration,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl Config {
    /// Local cache directory, flag or environment first
    pub fn cache_dir(&self, overridden: Option<PathBuf>) -> PathBuf {
        overridden
            .or_else(|| self.cache.dir.clone())
            .unwrap_or_else(ConfigManager::default_cache_dir)
    }

    /// Key namespace, flag or environment first
    pub fn prefix(&self, overridden: Option<String>) -> String {
        overridden.unwrap_or_else(|| self.cache.prefix.clone())
    }

    /// Pick the service generation and URL.
    ///
    /// Without a forced version, `service_v2` selects v2; otherwise a v1
    /// cache URL wins over a results URL.
    pub fn remote_endpoint(&self, env: &RemoteEnv) -> ProxyResult<RemoteEndpoint> {
        let token = present(&env.runtime_token).ok_or(ProxyError::MissingConfig {
            name: "ACTIONS_RUNTIME_TOKEN",
        })?;
        let cache_url = present(&env.cache_url);
        let results_url = present(&env.results_url);

        let api = match self.remote.api {
            Some(api) => api,
            None if env.service_v2 => ApiVersion::V2,
            None if cache_url.is_some() => ApiVersion::V1,
            None if results_url.is_some() => ApiVersion::V2,
            None => {
                return Err(ProxyError::MissingConfig {
                    name: "ACTIONS_CACHE_URL",
                })
            }
        };
        let base_url = match api {
            ApiVersion::V1 => cache_url.ok_or(ProxyError::MissingConfig {
                name: "ACTIONS_CACHE_URL",
            })?,
            ApiVersion::V2 => results_url.ok_or(ProxyError::MissingConfig {
                name: "ACTIONS_RESULTS_URL",
            })?,
        };

        Ok(RemoteEndpoint {
            api,
            base_url: base_url.to_string(),
            token: token.to_string(),
            timeout: Duration::from_secs(self.remote.timeout_secs),
        })
    }

    /// Listing source, or `None` when listing is off or credentials are
    /// missing. A missing listing never stops the daemon.
    pub fn listing_source(&self, env: &ListingEnv) -> Option<ListingSource> {
        if !self.listing.enabled {
            debug!("Remote key listing disabled by configuration");
            return None;
        }
        let (Some(token), Some(repository)) = (present(&env.token), present(&env.repository))
        else {
            debug!("No GITHUB_TOKEN or GITHUB_REPOSITORY, remote key listing disabled");
            return None;
        };

        Some(ListingSource {
            api_url: present(&env.api_url)
                .unwrap_or(&self.listing.api_url)
                .to_string(),
            repository: repository.to_string(),
            token: token.to_string(),
            git_ref: present(&env.git_ref).map(str::to_string),
            timeout: Duration::from_secs(self.listing.timeout_secs),
        })
    }
}
