//! Local development backend.
//!
//! Volumes are directories under a base dir and a "sandbox" is a logical
//! handle whose commands run through the host shell with the volume
//! directory as workspace root. There is no isolation; use it for
//! development and tests only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use super::{
    ComputeProvider, ExecOutput, ExecRequest, RemoteSandbox, SandboxSpec, VolumeRef,
    STREAM_CAPTURE_BYTES,
};
use crate::error::ProviderError;

type Registry = Mutex<HashMap<String, Arc<LocalSandbox>>>;

pub struct LocalProvider {
    volumes_dir: PathBuf,
    sandboxes: Arc<Registry>,
}

impl LocalProvider {
    /// Create a provider storing volumes under `volumes_dir`.
    pub fn new(volumes_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        std::fs::create_dir_all(volumes_dir.as_ref())?;
        // Canonical so that in-sandbox `realpath` output matches the root.
        let volumes_dir = std::fs::canonicalize(volumes_dir.as_ref())?;
        Ok(Self {
            volumes_dir,
            sandboxes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Host directory backing the named volume.
    pub fn volume_path(&self, name: &str) -> PathBuf {
        self.volumes_dir.join(name)
    }

    /// Number of sandboxes currently alive in this provider.
    pub fn live_sandboxes(&self) -> usize {
        self.sandboxes
            .lock()
            .values()
            .filter(|sandbox| sandbox.alive.load(Ordering::SeqCst))
            .count()
    }
}

fn valid_volume_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[async_trait]
impl ComputeProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn ensure_volume(&self, name: &str) -> Result<VolumeRef, ProviderError> {
        if !valid_volume_name(name) {
            return Err(ProviderError::Api {
                status: 400,
                message: format!("invalid volume name: {}", name),
            });
        }
        let path = self.volume_path(name);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| ProviderError::Transport(format!("mkdir {}: {}", path.display(), e)))?;
        Ok(VolumeRef {
            id: name.to_string(),
            name: name.to_string(),
        })
    }

    async fn create_sandbox(
        &self,
        spec: &SandboxSpec,
    ) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let root = self.volume_path(&spec.volume.name);
        if !root.is_dir() {
            return Err(ProviderError::Api {
                status: 404,
                message: format!("volume {} does not exist", spec.volume.name),
            });
        }
        let id = format!("local-{}", uuid::Uuid::new_v4().simple());
        debug!(
            sandbox_id = %id,
            image = %spec.image,
            mount_path = %spec.mount_path,
            "local sandbox ignores image and mount path"
        );
        let sandbox = Arc::new(LocalSandbox {
            id: id.clone(),
            root_str: root.to_string_lossy().into_owned(),
            root,
            alive: AtomicBool::new(true),
            registry: Arc::downgrade(&self.sandboxes),
        });
        self.sandboxes.lock().insert(id, sandbox.clone());
        Ok(sandbox)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        match self.sandboxes.lock().get(sandbox_id) {
            Some(sandbox) if sandbox.alive.load(Ordering::SeqCst) => Ok(sandbox.clone()),
            _ => Err(ProviderError::Gone(sandbox_id.to_string())),
        }
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        match self.sandboxes.lock().remove(sandbox_id) {
            Some(sandbox) => {
                sandbox.alive.store(false, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ProviderError::Gone(sandbox_id.to_string())),
        }
    }
}

/// Keep the first [`STREAM_CAPTURE_BYTES`] of a pipe and discard the rest,
/// still reading to EOF so the writer never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut kept = Vec::new();
    (&mut reader)
        .take(STREAM_CAPTURE_BYTES as u64)
        .read_to_end(&mut kept)
        .await?;
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(kept)
}

#[derive(Debug)]
pub struct LocalSandbox {
    id: String,
    root: PathBuf,
    root_str: String,
    alive: AtomicBool,
    registry: Weak<Registry>,
}

#[async_trait]
impl RemoteSandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace_root(&self) -> &str {
        &self.root_str
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, ProviderError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ProviderError::Gone(self.id.clone()));
        }
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| ProviderError::Api {
                status: 400,
                message: "empty command".to_string(),
            })?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .env("HOME", &self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Transport(format!("spawn {}: {}", program, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async move {
            let (stdout, stderr, status) =
                tokio::join!(read_capped(stdout), read_capped(stderr), child.wait());
            Ok::<_, std::io::Error>((stdout?, stderr?, status?))
        };
        let (stdout, stderr, status) = tokio::time::timeout(request.timeout, run)
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(|e| ProviderError::Transport(format!("wait: {}", e)))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
        })
    }

    async fn terminate(&self) -> Result<(), ProviderError> {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
        Ok(())
    }

    async fn tunnel_url(&self, _port: u16) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(volume: VolumeRef) -> SandboxSpec {
        SandboxSpec {
            image: "ubuntu:22.04".into(),
            volume,
            mount_path: "/workspace".into(),
            cpu: 1.0,
            memory_mb: 512,
            timeout_secs: 60,
            ports: vec![],
            session_id: "s1".into(),
        }
    }

    #[tokio::test]
    async fn volumes_are_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();
        let first = provider.ensure_volume("volume-s1").await.unwrap();
        let second = provider.ensure_volume("volume-s1").await.unwrap();
        assert_eq!(first, second);
        assert!(provider.volume_path("volume-s1").is_dir());
        assert!(provider.ensure_volume("../escape").await.is_err());
    }

    #[tokio::test]
    async fn exec_runs_in_volume_directory() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();
        let volume = provider.ensure_volume("volume-s1").await.unwrap();
        let sandbox = provider.create_sandbox(&spec(volume)).await.unwrap();

        let output = sandbox
            .exec(&ExecRequest::shell("pwd; exit 3", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), sandbox.workspace_root());
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn terminated_sandboxes_are_gone() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();
        let volume = provider.ensure_volume("volume-s1").await.unwrap();
        let sandbox = provider.create_sandbox(&spec(volume)).await.unwrap();
        let id = sandbox.id().to_string();

        assert!(provider.connect(&id).await.is_ok());
        provider.terminate(&id).await.unwrap();
        assert!(provider.connect(&id).await.unwrap_err().is_gone());
        let err = sandbox
            .exec(&ExecRequest::shell("true", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.is_gone());
        assert_eq!(provider.live_sandboxes(), 0);
    }

    #[tokio::test]
    async fn terminating_through_the_handle_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();
        let volume = provider.ensure_volume("volume-s1").await.unwrap();
        for _ in 0..3 {
            let sandbox = provider.create_sandbox(&spec(volume.clone())).await.unwrap();
            sandbox.terminate().await.unwrap();
            assert!(provider.connect(sandbox.id()).await.unwrap_err().is_gone());
        }
        assert!(provider.sandboxes.lock().is_empty());
    }

    #[tokio::test]
    async fn output_capture_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();
        let volume = provider.ensure_volume("volume-s1").await.unwrap();
        let sandbox = provider.create_sandbox(&spec(volume)).await.unwrap();

        let output = sandbox
            .exec(&ExecRequest::shell(
                "head -c 8000000 /dev/zero | tr '\\0' a; head -c 3000000 /dev/zero >&2; exit 4",
                Duration::from_secs(30),
            ))
            .await
            .unwrap();
        assert_eq!(output.stdout.len(), STREAM_CAPTURE_BYTES);
        assert!(output.stdout.bytes().all(|b| b == b'a'));
        assert_eq!(output.stderr.len(), STREAM_CAPTURE_BYTES);
        // The rest of the stream was drained, so the command ran to its end.
        assert_eq!(output.exit_code, Some(4));
    }

    #[tokio::test]
    async fn exec_honours_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path()).unwrap();
        let volume = provider.ensure_volume("volume-s1").await.unwrap();
        let sandbox = provider.create_sandbox(&spec(volume)).await.unwrap();
        let err = sandbox
            .exec(&ExecRequest::shell("sleep 5", Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
    }
}
