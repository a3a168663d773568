//! Fresh sandbox creation: volume, image selection, warm-up and terminal bridge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ProviderError;
use crate::handle::SandboxHandle;
use crate::provider::{ComputeProvider, ExecRequest, RemoteSandbox, SandboxSpec};
use crate::volume::VolumeStore;

/// Port the terminal bridge listens on inside the sandbox.
pub const TERMINAL_PORT: u16 = 7681;

const SETUP_TIMEOUT: Duration = Duration::from_secs(30);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

/// Runtime requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Rust,
    Cpp,
    General,
}

/// Tooling that some images lack.
struct ToolingStep {
    probe: &'static str,
    install: &'static str,
    /// Wait for the install before the sandbox is handed out.
    blocking: bool,
}

const PYTHON_TOOLING: &[ToolingStep] = &[ToolingStep {
    probe: "python3 -m pytest --version",
    install: "pip install --quiet --disable-pip-version-check pytest",
    blocking: false,
}];

const JAVASCRIPT_TOOLING: &[ToolingStep] = &[ToolingStep {
    probe: "command -v jest",
    install: "npm install -g --silent jest",
    blocking: false,
}];

const TYPESCRIPT_TOOLING: &[ToolingStep] = &[ToolingStep {
    probe: "command -v ts-node",
    install: "npm install -g --silent typescript ts-node",
    blocking: true,
}];

impl Language {
    /// Lenient parse of a caller-supplied hint. Unknown hints map to
    /// [`Language::General`].
    pub fn parse(hint: &str) -> Self {
        match hint.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Self::Python,
            "javascript" | "js" | "node" | "nodejs" => Self::JavaScript,
            "typescript" | "ts" => Self::TypeScript,
            "go" | "golang" => Self::Go,
            "java" => Self::Java,
            "rust" | "rs" => Self::Rust,
            "cpp" | "c++" | "c" | "cxx" => Self::Cpp,
            _ => Self::General,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::Rust => "rust",
            Self::Cpp => "cpp",
            Self::General => "general",
        }
    }

    fn image(self) -> Option<&'static str> {
        match self {
            Self::Python => Some("python:3.11-slim"),
            Self::JavaScript | Self::TypeScript => Some("node:20-slim"),
            Self::Go => Some("golang:1.22"),
            Self::Java => Some("eclipse-temurin:21-jdk"),
            Self::Rust => Some("rust:1-slim"),
            Self::Cpp => Some("gcc:13"),
            Self::General => None,
        }
    }

    fn tooling(self) -> &'static [ToolingStep] {
        match self {
            Self::Python => PYTHON_TOOLING,
            Self::JavaScript => JAVASCRIPT_TOOLING,
            Self::TypeScript => TYPESCRIPT_TOOLING,
            _ => &[],
        }
    }
}

/// Pick the image for `language`; a configured universal image always wins.
pub fn select_image(config: &Config, language: Language) -> String {
    if let Some(universal) = &config.images.universal {
        return universal.clone();
    }
    language
        .image()
        .map(str::to_string)
        .unwrap_or_else(|| config.images.default.clone())
}

fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

#[derive(Clone)]
pub struct Provisioner {
    provider: Arc<dyn ComputeProvider>,
    volumes: VolumeStore,
    config: Arc<Config>,
}

impl Provisioner {
    pub fn new(provider: Arc<dyn ComputeProvider>, config: Arc<Config>) -> Self {
        Self {
            volumes: VolumeStore::new(provider.clone()),
            provider,
            config,
        }
    }

    /// Create a new sandbox for `session_id` mounted on the session's volume.
    ///
    /// Returns the handle and the volume name.
    pub async fn provision(
        &self,
        session_id: &str,
        language: Language,
    ) -> Result<(SandboxHandle, String), ProviderError> {
        let started = Instant::now();
        let volume = self.volumes.ensure(session_id).await?;
        let image = select_image(&self.config, language);

        let spec = SandboxSpec {
            image: image.clone(),
            volume: volume.clone(),
            mount_path: self.config.workspace_root.clone(),
            cpu: self.config.limits.cpu,
            memory_mb: self.config.limits.memory_mb,
            timeout_secs: self.config.limits.sandbox_timeout.as_secs(),
            ports: if self.config.terminal_bridge {
                vec![TERMINAL_PORT]
            } else {
                Vec::new()
            },
            session_id: session_id.to_string(),
        };
        let sandbox = self.provider.create_sandbox(&spec).await?;

        if let Err(err) = self.prepare_workspace(sandbox.as_ref()).await {
            if let Err(cleanup) = sandbox.terminate().await {
                warn!(sandbox_id = sandbox.id(), error = %cleanup, "failed to terminate unusable sandbox");
            }
            return Err(err);
        }

        if self.config.images.universal.is_none() {
            self.install_missing_tooling(&sandbox, language).await;
        }

        let terminal_url = if self.config.terminal_bridge {
            self.start_terminal_bridge(sandbox.as_ref()).await
        } else {
            None
        };

        info!(
            session_id,
            sandbox_id = sandbox.id(),
            image = %image,
            language = language.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox provisioned"
        );

        let handle = SandboxHandle {
            session_id: session_id.to_string(),
            sandbox,
            volume: volume.clone(),
            image,
            language,
            created_at: Utc::now(),
            terminal_url,
        };
        Ok((handle, volume.name))
    }

    /// The mount point must exist before any file operation runs.
    async fn prepare_workspace(&self, sandbox: &dyn RemoteSandbox) -> Result<(), ProviderError> {
        let script = format!("mkdir -p {}", quote(sandbox.workspace_root()));
        let output = sandbox.exec(&ExecRequest::shell(script, SETUP_TIMEOUT)).await?;
        if output.succeeded() {
            Ok(())
        } else {
            Err(ProviderError::Api {
                status: 500,
                message: format!("workspace setup failed: {}", output.stderr.trim()),
            })
        }
    }

    async fn install_missing_tooling(&self, sandbox: &Arc<dyn RemoteSandbox>, language: Language) {
        for step in language.tooling() {
            let script = format!("{} >/dev/null 2>&1 || {}", step.probe, step.install);
            let request = ExecRequest::shell(script, INSTALL_TIMEOUT);
            if step.blocking {
                match sandbox.exec(&request).await {
                    Ok(output) if output.succeeded() => {}
                    Ok(output) => warn!(
                        sandbox_id = sandbox.id(),
                        install = step.install,
                        stderr = %output.stderr.trim(),
                        "tool install failed"
                    ),
                    Err(err) => warn!(sandbox_id = sandbox.id(), error = %err, "tool install failed"),
                }
            } else {
                let sandbox = sandbox.clone();
                let install = step.install;
                tokio::spawn(async move {
                    match sandbox.exec(&request).await {
                        Ok(output) if output.succeeded() => {
                            debug!(sandbox_id = sandbox.id(), install, "background tool install finished")
                        }
                        Ok(output) => debug!(
                            sandbox_id = sandbox.id(),
                            install,
                            stderr = %output.stderr.trim(),
                            "background tool install failed"
                        ),
                        Err(err) => debug!(sandbox_id = sandbox.id(), error = %err, "background tool install failed"),
                    }
                });
            }
        }
    }

    /// Start a shell bridge and look up its tunnel. Never fatal.
    async fn start_terminal_bridge(&self, sandbox: &dyn RemoteSandbox) -> Option<String> {
        let script = format!(
            "command -v ttyd >/dev/null 2>&1 || exit 127; \
             cd {} && nohup ttyd --port {} --writable bash >/tmp/terminal-bridge.log 2>&1 &",
            quote(sandbox.workspace_root()),
            TERMINAL_PORT
        );
        match sandbox.exec(&ExecRequest::shell(script, SETUP_TIMEOUT)).await {
            Ok(output) if output.succeeded() => {}
            Ok(output) => {
                warn!(
                    sandbox_id = sandbox.id(),
                    exit_code = ?output.exit_code,
                    "terminal bridge unavailable, falling back to command execution"
                );
                return None;
            }
            Err(err) => {
                warn!(sandbox_id = sandbox.id(), error = %err, "failed to start terminal bridge");
                return None;
            }
        }
        match sandbox.tunnel_url(TERMINAL_PORT).await {
            Ok(url) => url,
            Err(err) => {
                warn!(sandbox_id = sandbox.id(), error = %err, "terminal tunnel lookup failed");
                None
            }
        }
    }
}
