//! Runtime configuration, parsed from CLI flags and environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::reconnect::ReconnectPolicy;

/// Minimum lease TTL; provisioning routinely takes tens of seconds.
const MIN_LOCK_TTL: Duration = Duration::from_secs(30);

/// Which compute provider backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Run sandboxes as local shell processes over per-session directories.
    Local,
    /// Remote compute-sandbox provider over its REST API.
    Http,
}

/// Container images used by the provisioner.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Pre-baked image with every supported runtime installed.
    pub universal: Option<String>,
    /// General-purpose image for unknown or missing language hints.
    pub default: String,
}

/// Resource bounds requested for each sandbox.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub cpu: f64,
    pub memory_mb: u64,
    /// Provider-side wall-clock lifetime of a sandbox.
    pub sandbox_timeout: Duration,
}

/// Timeout tiers, one per suspension point.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub lock_wait: Duration,
    pub lock_ttl: Duration,
    pub lock_poll: Duration,
    pub reconnect: Duration,
    pub probe: Duration,
    pub read: Duration,
    pub command: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub provider: ProviderKind,
    pub provider_url: Option<String>,
    pub provider_token: Option<String>,
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub workspace_root: String,
    pub reconnect_policy: ReconnectPolicy,
    pub images: ImageConfig,
    pub terminal_bridge: bool,
    pub limits: ResourceLimits,
    pub timeouts: Timeouts,
    /// Cached handles idle for longer than this are terminated.
    pub idle_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("/tmp/sessionbox");
        Self {
            provider: ProviderKind::Local,
            provider_url: None,
            provider_token: None,
            database: data_dir.join("sessionbox.db"),
            data_dir,
            workspace_root: "/workspace".to_string(),
            reconnect_policy: ReconnectPolicy::Recreate,
            images: ImageConfig {
                universal: None,
                default: "ubuntu:22.04".to_string(),
            },
            terminal_bridge: false,
            limits: ResourceLimits {
                cpu: 1.0,
                memory_mb: 2048,
                sandbox_timeout: Duration::from_secs(3600),
            },
            timeouts: Timeouts {
                lock_wait: Duration::from_secs(60),
                lock_ttl: Duration::from_secs(120),
                lock_poll: Duration::from_millis(250),
                reconnect: Duration::from_secs(10),
                probe: Duration::from_secs(15),
                read: Duration::from_secs(10),
                command: Duration::from_secs(300),
            },
            idle_ttl: Duration::from_secs(1800),
        }
    }
}

/// Command-line flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Compute provider backend
    #[arg(long, value_enum, env = "SESSIONBOX_PROVIDER", default_value = "local")]
    pub provider: ProviderKind,

    /// Base URL of the provider API (http backend)
    #[arg(long, env = "SESSIONBOX_PROVIDER_URL")]
    pub provider_url: Option<String>,

    /// Bearer token for the provider API
    #[arg(long, env = "SESSIONBOX_PROVIDER_TOKEN", hide_env_values = true)]
    pub provider_token: Option<String>,

    /// Data directory for local volumes and the state database
    #[arg(long, env = "SESSIONBOX_DATA_DIR", default_value = "/tmp/sessionbox")]
    pub data_dir: PathBuf,

    /// Lifecycle and lease database path (defaults to DATA_DIR/sessionbox.db)
    #[arg(long, env = "SESSIONBOX_DATABASE")]
    pub database: Option<PathBuf>,

    /// Mount path of the session volume inside each sandbox
    #[arg(long, default_value = "/workspace")]
    pub workspace_root: String,

    /// How previously recorded sandboxes are handled
    #[arg(long, value_enum, default_value = "recreate")]
    pub reconnect_policy: ReconnectPolicy,

    /// Pre-baked image with all runtimes installed
    #[arg(long, env = "SESSIONBOX_UNIVERSAL_IMAGE")]
    pub universal_image: Option<String>,

    /// Image for unknown or missing language hints
    #[arg(long, default_value = "ubuntu:22.04")]
    pub default_image: String,

    /// Start a terminal bridge inside each sandbox
    #[arg(long)]
    pub terminal_bridge: bool,

    /// Seconds to wait for the session lock
    #[arg(long, default_value = "60")]
    pub lock_wait_secs: u64,

    /// Lease TTL in seconds; must exceed worst-case provisioning time
    #[arg(long, default_value = "120")]
    pub lock_ttl_secs: u64,

    /// Seconds allowed to re-acquire a recorded sandbox
    #[arg(long, default_value = "10")]
    pub reconnect_timeout_secs: u64,

    /// Seconds allowed for the liveness probe after reconnecting
    #[arg(long, default_value = "15")]
    pub probe_timeout_secs: u64,

    /// File read timeout in seconds
    #[arg(long, default_value = "10")]
    pub read_timeout_secs: u64,

    /// Command timeout in seconds
    #[arg(long, default_value = "300")]
    pub command_timeout_secs: u64,

    /// Sandbox wall-clock lifetime in seconds
    #[arg(long, default_value = "3600")]
    pub sandbox_timeout_secs: u64,

    /// CPU cores per sandbox
    #[arg(long, default_value = "1.0")]
    pub cpu: f64,

    /// Memory per sandbox in MB
    #[arg(long, default_value = "2048")]
    pub memory_mb: u64,

    /// Seconds before an unused cached sandbox is terminated
    #[arg(long, default_value = "1800")]
    pub idle_ttl_secs: u64,
}

impl From<ConfigArgs> for Config {
    fn from(args: ConfigArgs) -> Self {
        let defaults = Config::default();
        let database = args
            .database
            .unwrap_or_else(|| args.data_dir.join("sessionbox.db"));
        let command = Duration::from_secs(args.command_timeout_secs.max(1));
        let sandbox_timeout = Duration::from_secs(args.sandbox_timeout_secs.max(60));
        Self {
            provider: args.provider,
            provider_url: args.provider_url,
            provider_token: args.provider_token,
            data_dir: args.data_dir,
            database,
            workspace_root: crate::paths::normalize(&args.workspace_root),
            reconnect_policy: args.reconnect_policy,
            images: ImageConfig {
                universal: args.universal_image.filter(|image| !image.trim().is_empty()),
                default: args.default_image,
            },
            terminal_bridge: args.terminal_bridge,
            limits: ResourceLimits {
                cpu: args.cpu,
                memory_mb: args.memory_mb,
                sandbox_timeout,
            },
            timeouts: Timeouts {
                lock_wait: Duration::from_secs(args.lock_wait_secs),
                lock_ttl: Duration::from_secs(args.lock_ttl_secs).max(MIN_LOCK_TTL),
                lock_poll: defaults.timeouts.lock_poll,
                reconnect: Duration::from_secs(args.reconnect_timeout_secs),
                probe: Duration::from_secs(args.probe_timeout_secs),
                read: Duration::from_secs(args.read_timeout_secs),
                // A command can never outlive the sandbox running it.
                command: command.min(sandbox_timeout),
            },
            idle_ttl: Duration::from_secs(args.idle_ttl_secs),
        }
    }
}
