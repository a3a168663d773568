//! Compute-sandbox provider abstraction.
//!
//! The manager and executor only ever see these two traits, so tests can
//! swap in a local or fault-injecting backend.

pub mod http;
pub mod local;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ProviderKind};
use crate::error::ProviderError;

/// A provider-managed persistent volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub id: String,
    pub name: String,
}

/// Everything the provider needs to start a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub volume: VolumeRef,
    pub mount_path: String,
    pub cpu: f64,
    pub memory_mb: u64,
    pub timeout_secs: u64,
    /// Ports to expose through the provider's tunnel mechanism.
    pub ports: Vec<u16>,
    /// Session the sandbox belongs to, recorded as a provider label.
    pub session_id: String,
}

/// Bytes a backend keeps from each output stream. One past the executor's
/// limit so that it can still tell the output was cut.
pub const STREAM_CAPTURE_BYTES: usize = crate::executor::MAX_OUTPUT_BYTES + 1;

/// A command to run inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub timeout: Duration,
}

impl ExecRequest {
    /// Run `script` through `sh -c`.
    pub fn shell(script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            argv: vec!["sh".to_string(), "-c".to_string(), script.into()],
            timeout,
        }
    }
}

/// Raw output of a command as the provider reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Providers sometimes omit the exit code for commands that succeeded.
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    /// Only an explicit non-zero code counts as failure.
    pub fn succeeded(&self) -> bool {
        !matches!(self.exit_code, Some(code) if code != 0)
    }
}

/// A live sandbox on the provider side.
#[async_trait]
pub trait RemoteSandbox: Send + Sync + Debug {
    fn id(&self) -> &str;

    /// Absolute mount path of the session volume inside this sandbox.
    fn workspace_root(&self) -> &str;

    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, ProviderError>;

    async fn terminate(&self) -> Result<(), ProviderError>;

    /// Public URL forwarding to `port`, if the provider exposes one.
    async fn tunnel_url(&self, port: u16) -> Result<Option<String>, ProviderError>;
}

/// Provider API used to create volumes and sandboxes.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Look up a volume by name, creating it when missing.
    async fn ensure_volume(&self, name: &str) -> Result<VolumeRef, ProviderError>;

    async fn create_sandbox(&self, spec: &SandboxSpec)
        -> Result<Arc<dyn RemoteSandbox>, ProviderError>;

    /// Obtain a reference to a previously created sandbox.
    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError>;

    /// Terminate a sandbox known only by id.
    async fn terminate(&self, sandbox_id: &str) -> Result<(), ProviderError>;
}

/// Build the provider selected in `config`.
pub fn from_config(config: &Config) -> Result<Arc<dyn ComputeProvider>, String> {
    match config.provider {
        ProviderKind::Local => {
            let provider = local::LocalProvider::new(config.data_dir.join("volumes"))
                .map_err(|e| format!("local provider: {}", e))?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Http => {
            let url = config
                .provider_url
                .as_deref()
                .ok_or_else(|| "--provider-url is required for the http provider".to_string())?;
            let provider = http::HttpProvider::new(
                url,
                config.provider_token.clone(),
                config.workspace_root.clone(),
            )
            .map_err(|e| format!("http provider: {}", e))?;
            Ok(Arc::new(provider))
        }
    }
}
