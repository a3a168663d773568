//! Decides whether a recorded sandbox may be reused.

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::provider::{ComputeProvider, ExecRequest, RemoteSandbox};
use crate::store::{run_blocking, LifecycleRecord, LifecycleStore};

const PROBE_TOKEN: &str = "sessionbox-alive";

/// What to do with a sandbox id found in lifecycle persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReconnectPolicy {
    /// Reattach with a short timeout and verify liveness with a probe.
    Strict,
    /// Never reattach; discard the recorded sandbox and provision fresh.
    Recreate,
}

#[derive(Clone)]
pub struct Reconnector {
    provider: Arc<dyn ComputeProvider>,
    lifecycle: Arc<dyn LifecycleStore>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    probe_timeout: Duration,
}

impl Reconnector {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        lifecycle: Arc<dyn LifecycleStore>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            lifecycle,
            policy,
            connect_timeout,
            probe_timeout,
        }
    }

    /// Try to reuse the sandbox recorded in `record`.
    ///
    /// Returns `None` when there is nothing usable. Whenever `None` is
    /// returned for a record that named a sandbox, that sandbox has been
    /// terminated (best effort) and the record cleared.
    pub async fn try_reconnect(
        &self,
        record: &LifecycleRecord,
    ) -> Result<Option<Arc<dyn RemoteSandbox>>, StoreError> {
        let Some(sandbox_id) = record.last_sandbox_id.as_deref() else {
            return Ok(None);
        };

        if self.policy == ReconnectPolicy::Strict {
            if let Some(sandbox) = self.reattach(sandbox_id).await {
                return Ok(Some(sandbox));
            }
        } else {
            debug!(session_id = %record.session_id, sandbox_id, "discarding recorded sandbox");
            self.discard(sandbox_id).await;
        }

        self.forget(&record.session_id, sandbox_id).await?;
        Ok(None)
    }

    async fn reattach(&self, sandbox_id: &str) -> Option<Arc<dyn RemoteSandbox>> {
        let sandbox = match tokio::time::timeout(self.connect_timeout, self.provider.connect(sandbox_id)).await {
            Ok(Ok(sandbox)) => sandbox,
            Ok(Err(err)) if err.is_gone() => {
                info!(sandbox_id, "recorded sandbox no longer exists");
                return None;
            }
            Ok(Err(err)) => {
                info!(sandbox_id, error = %err, "reconnect failed");
                self.discard(sandbox_id).await;
                return None;
            }
            Err(_) => {
                info!(sandbox_id, timeout_ms = self.connect_timeout.as_millis() as u64, "reconnect timed out");
                self.discard(sandbox_id).await;
                return None;
            }
        };

        let probe = ExecRequest::shell(format!("echo {}", PROBE_TOKEN), self.probe_timeout);
        let healthy = match tokio::time::timeout(self.probe_timeout, sandbox.exec(&probe)).await {
            Ok(Ok(output)) => output.succeeded() && output.stdout.trim() == PROBE_TOKEN,
            Ok(Err(err)) => {
                debug!(sandbox_id, error = %err, "liveness probe failed");
                false
            }
            Err(_) => false,
        };
        if healthy {
            info!(sandbox_id, "reconnected to existing sandbox");
            return Some(sandbox);
        }

        info!(sandbox_id, "reconnected sandbox failed liveness probe");
        match tokio::time::timeout(self.connect_timeout, sandbox.terminate()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(sandbox_id, error = %err, "terminate after failed probe"),
            Err(_) => debug!(sandbox_id, "terminate after failed probe timed out"),
        }
        None
    }

    /// Best-effort termination so a stale sandbox cannot stay attached to
    /// the volume.
    async fn discard(&self, sandbox_id: &str) {
        match tokio::time::timeout(self.connect_timeout, self.provider.terminate(sandbox_id)).await {
            Ok(Ok(())) => debug!(sandbox_id, "stale sandbox terminated"),
            Ok(Err(err)) => debug!(sandbox_id, error = %err, "stale sandbox terminate failed"),
            Err(_) => debug!(sandbox_id, "stale sandbox terminate timed out"),
        }
    }

    async fn forget(&self, session_id: &str, sandbox_id: &str) -> Result<(), StoreError> {
        let lifecycle = self.lifecycle.clone();
        let session_id = session_id.to_string();
        let sandbox_id = sandbox_id.to_string();
        run_blocking(move || lifecycle.clear_sandbox(&session_id, Some(&sandbox_id))).await?;
        Ok(())
    }
}
