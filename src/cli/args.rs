//! CLI argument definitions using clap derive

use crate::logging::LogFormat;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// tiercache - two-tier build cache daemon
///
/// Serves the build tool's cache program protocol on stdin/stdout, backed
/// by a local directory and the GitHub Actions cache.
#[derive(Parser, Debug)]
#[command(name = "tiercache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "TIERCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format (overrides general.log_format)
    #[arg(long, global = true, value_enum, env = "TIERCACHE_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve cache requests on stdin/stdout (use as GOCACHEPROG)
    Serve(ServeArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug, Default)]
pub struct ServeArgs {
    /// Local cache directory
    #[arg(long, env = "TIERCACHE_DIR")]
    pub dir: Option<PathBuf>,

    /// Namespace prepended to every key
    #[arg(long, env = "TIERCACHE_PREFIX")]
    pub prefix: Option<String>,

    /// Actions runtime token
    #[arg(long, env = "ACTIONS_RUNTIME_TOKEN", hide_env_values = true)]
    pub runtime_token: Option<String>,

    /// v1 cache service URL
    #[arg(long, env = "ACTIONS_CACHE_URL")]
    pub cache_url: Option<String>,

    /// v2 results service URL
    #[arg(long, env = "ACTIONS_RESULTS_URL")]
    pub results_url: Option<String>,

    /// Use the v2 cache service
    #[arg(
        long,
        env = "ACTIONS_CACHE_SERVICE_V2",
        value_parser = BoolishValueParser::new(),
        default_value = "false",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub service_v2: bool,

    /// Token for the REST cache listing
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Repository (owner/name) whose caches are listed
    #[arg(long, env = "GITHUB_REPOSITORY")]
    pub repository: Option<String>,

    /// Restrict the listing to caches created for this ref
    #[arg(long = "ref", env = "GITHUB_REF")]
    pub git_ref: Option<String>,

    /// REST API base URL
    #[arg(long, env = "GITHUB_API_URL")]
    pub api_url: Option<String>,

    /// Skip building the remote key index
    #[arg(long)]
    pub no_listing: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}
