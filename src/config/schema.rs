//! Configuration schema for tiercache
//!
//! Configuration is stored at `~/.config/tiercache/config.toml`. Every
//! field is optional; the environment and command line override it.

use crate::logging::LogFormat;
use crate::remote::ApiVersion;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Local tier settings
    pub cache: CacheConfig,

    /// Remote tier settings
    pub remote: RemoteConfig,

    /// Remote key listing settings
    pub listing: ListingConfig,
}

/// General application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text", "json" or "github"
    pub log_format: LogFormat,
}

/// Local cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (default: the platform cache dir + `tiercache`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Namespace prepended to every key in both tiers
    pub prefix: String,
}

/// Remote cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Force a service generation; picked from the environment when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiVersion>,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api: None,
            timeout_secs: 300,
        }
    }
}

/// Remote key listing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// Build the remote key index when credentials are available
    pub enabled: bool,

    /// REST API base URL
    pub api_url: String,

    /// Per-page timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "https://api.github.com".to_string(),
            timeout_secs: 30,
        }
    }
}
