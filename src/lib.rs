//! Per-session sandbox lifecycle management.
//!
//! Each session owns a persistent volume. Sandboxes mounting that volume
//! are created on demand, at most one at a time per session across all
//! processes sharing the lease store, and commands and file operations are
//! run against them.

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod handle;
pub mod http_server;
pub mod lock;
pub mod manager;
pub mod paths;
pub mod provider;
pub mod provisioner;
pub mod reconnect;
pub mod safety;
pub mod state;
pub mod store;
pub mod volume;

pub use config::Config;
pub use error::{ProviderError, SandboxError, StoreError};
pub use executor::{CommandOutput, FileNode, ListOptions, NodeKind, SandboxExecutor};
pub use handle::SandboxHandle;
pub use manager::SandboxManager;
pub use provisioner::Language;
pub use reconnect::ReconnectPolicy;
