//! Get-or-create orchestration.
//!
//! Resolution order for a session:
//! 1. handle cached in this process;
//! 2. creation already in flight in this process (joined, never duplicated);
//! 3. under the session's distributed lock: re-check the cache, try the
//!    recorded sandbox through the reconnection policy, otherwise provision
//!    fresh against the same volume and persist the new record before the
//!    lock is released.
//!
//! Creation runs in its own task so that a caller going away mid-creation
//! neither leaks the lock nor strands the other awaiters.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tracing::{debug, info, warn};

use crate::cache::{CreationFuture, Lookup, SandboxCache};
use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::handle::SandboxHandle;
use crate::lock::{DistributedLock, LeaseGuard};
use crate::provider::ComputeProvider;
use crate::provisioner::{select_image, Language, Provisioner};
use crate::reconnect::Reconnector;
use crate::store::{run_blocking, LeaseStore, LifecycleRecord, LifecycleStore};
use crate::volume::VolumeStore;

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(15);

struct Inner {
    config: Arc<Config>,
    provider: Arc<dyn ComputeProvider>,
    lifecycle: Arc<dyn LifecycleStore>,
    cache: SandboxCache,
    lock: DistributedLock,
    volumes: VolumeStore,
    reconnector: Reconnector,
    provisioner: Provisioner,
}

/// Owns the process-wide sandbox state. Construct once and clone freely.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<Inner>,
}

/// Removes the pending-creation entry if the creation task dies before
/// reporting a result.
struct PendingCleanup {
    cache: SandboxCache,
    session_id: String,
    armed: bool,
}

impl PendingCleanup {
    fn finish(mut self, result: &Result<SandboxHandle>) {
        self.armed = false;
        self.cache.complete(&self.session_id, result);
    }
}

impl Drop for PendingCleanup {
    fn drop(&mut self) {
        if self.armed {
            self.cache.complete(
                &self.session_id,
                &Err(SandboxError::Provision("sandbox creation aborted".to_string())),
            );
        }
    }
}

impl SandboxManager {
    pub fn new(
        config: Arc<Config>,
        provider: Arc<dyn ComputeProvider>,
        lifecycle: Arc<dyn LifecycleStore>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        let timeouts = &config.timeouts;
        let lock = DistributedLock::new(leases, timeouts.lock_ttl, timeouts.lock_wait, timeouts.lock_poll);
        let reconnector = Reconnector::new(
            provider.clone(),
            lifecycle.clone(),
            config.reconnect_policy,
            timeouts.reconnect,
            timeouts.probe,
        );
        let provisioner = Provisioner::new(provider.clone(), config.clone());
        Self {
            inner: Arc::new(Inner {
                volumes: VolumeStore::new(provider.clone()),
                cache: SandboxCache::new(),
                config,
                provider,
                lifecycle,
                lock,
                reconnector,
                provisioner,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache(&self) -> &SandboxCache {
        &self.inner.cache
    }

    /// Resolve a ready sandbox for `session_id`, creating one if needed.
    ///
    /// Fails with [`SandboxError::LockTimeout`] when another process holds
    /// the session lock too long, and with [`SandboxError::Provision`] when
    /// the provider cannot create a sandbox.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        language: Option<Language>,
    ) -> Result<SandboxHandle> {
        let lookup = self
            .inner
            .cache
            .lookup_or_start(session_id, || self.start_creation(session_id, language));
        match lookup {
            Lookup::Ready(handle) => {
                debug!(session_id, sandbox_id = handle.id(), "sandbox cache hit");
                Ok(handle)
            }
            Lookup::Pending(creation) => {
                debug!(session_id, "joining pending sandbox creation");
                creation.await
            }
            Lookup::Started(creation) => creation.await,
        }
    }

    fn start_creation(&self, session_id: &str, language: Option<Language>) -> CreationFuture {
        let this = self.clone();
        let session_id = session_id.to_string();
        let cleanup = PendingCleanup {
            cache: self.inner.cache.clone(),
            session_id: session_id.clone(),
            armed: true,
        };
        let task = tokio::spawn(async move {
            let result = this.create_locked(&session_id, language).await;
            cleanup.finish(&result);
            result
        });
        async move {
            task.await.unwrap_or_else(|err| {
                Err(SandboxError::Provision(format!("sandbox creation task failed: {}", err)))
            })
        }
        .boxed()
        .shared()
    }

    async fn create_locked(&self, session_id: &str, language: Option<Language>) -> Result<SandboxHandle> {
        let lease = self.inner.lock.acquire(session_id).await?;
        let result = self.create_under_lease(session_id, language, &lease).await;
        lease.release().await;
        result
    }

    async fn create_under_lease(
        &self,
        session_id: &str,
        language: Option<Language>,
        lease: &LeaseGuard,
    ) -> Result<SandboxHandle> {
        if let Some(handle) = self.inner.cache.get(session_id) {
            return Ok(handle);
        }

        let record = self.load_record(session_id).await?;
        let recorded_language = record
            .as_ref()
            .and_then(|record| record.language.as_deref())
            .map(Language::parse);

        if let Some(record) = &record {
            if let Some(sandbox) = self.inner.reconnector.try_reconnect(record).await? {
                let language = recorded_language.unwrap_or(Language::General);
                let volume = self
                    .inner
                    .volumes
                    .ensure(session_id)
                    .await
                    .map_err(|e| SandboxError::Provision(e.to_string()))?;
                return Ok(SandboxHandle {
                    session_id: session_id.to_string(),
                    image: select_image(&self.inner.config, language),
                    sandbox,
                    volume,
                    language,
                    created_at: record.created_at.unwrap_or_else(Utc::now),
                    terminal_url: None,
                });
            }
        }

        let language = language.or(recorded_language).unwrap_or(Language::General);
        let (handle, volume) = self
            .inner
            .provisioner
            .provision(session_id, language)
            .await
            .map_err(|err| {
                warn!(session_id, error = %err, "sandbox provisioning failed");
                SandboxError::Provision(err.to_string())
            })?;

        if lease.is_lost() {
            // Another holder may already be attached to the volume.
            warn!(session_id, sandbox_id = handle.id(), "sandbox lock lost during creation");
            self.terminate_quietly(&handle).await;
            return Err(SandboxError::Provision(
                "sandbox lock lost during creation".to_string(),
            ));
        }

        let record = LifecycleRecord {
            session_id: session_id.to_string(),
            last_sandbox_id: Some(handle.id().to_string()),
            created_at: Some(handle.created_at),
            language: Some(language.as_str().to_string()),
        };
        if let Err(err) = self.save_record(record).await {
            // Unrecorded sandboxes are invisible to other processes.
            warn!(session_id, sandbox_id = handle.id(), error = %err, "failed to persist sandbox record");
            self.terminate_quietly(&handle).await;
            return Err(err);
        }
        debug!(session_id, sandbox_id = handle.id(), volume = %volume, "sandbox recorded");
        Ok(handle)
    }

    /// Terminate the session's sandbox, if any. The volume is kept.
    pub async fn terminate(&self, session_id: &str) -> bool {
        if let Some(pending) = self.inner.cache.pending(session_id) {
            let _ = pending.await;
        }
        let lease = match self.inner.lock.acquire(session_id).await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(session_id, error = %err, "could not lock session for termination");
                return false;
            }
        };

        let cached = self.inner.cache.remove(session_id);
        let recorded = match self.load_record(session_id).await {
            Ok(record) => record.and_then(|record| record.last_sandbox_id),
            Err(err) => {
                warn!(session_id, error = %err, "failed to load sandbox record");
                None
            }
        };

        let mut terminated = false;
        if let Some(handle) = &cached {
            terminated = self.terminate_quietly(handle).await;
        }
        if let Some(id) = recorded.filter(|id| cached.as_ref().map(|h| h.id()) != Some(id.as_str())) {
            let stopped = tokio::time::timeout(TERMINATE_TIMEOUT, self.inner.provider.terminate(&id)).await;
            terminated |= matches!(stopped, Ok(Ok(())));
        }
        if let Err(err) = self.clear_record(session_id, None).await {
            warn!(session_id, error = %err, "failed to clear sandbox record");
        }
        lease.release().await;

        if terminated {
            info!(session_id, "sandbox terminated");
        }
        terminated
    }

    /// Forget a handle whose sandbox disappeared on the provider side.
    pub async fn evict(&self, handle: &SandboxHandle) {
        if self.inner.cache.remove_if(&handle.session_id, handle.id()).is_some() {
            info!(session_id = %handle.session_id, sandbox_id = handle.id(), "evicted dead sandbox");
        }
        if let Err(err) = self.clear_record(&handle.session_id, Some(handle.id())).await {
            warn!(session_id = %handle.session_id, error = %err, "failed to clear dead sandbox record");
        }
    }

    /// Terminate cached sandboxes unused for longer than the idle TTL.
    pub async fn reap_idle(&self) -> usize {
        let idle = self.inner.cache.take_idle(self.inner.config.idle_ttl);
        let count = idle.len();
        for handle in idle {
            info!(session_id = %handle.session_id, sandbox_id = handle.id(), "terminating idle sandbox");
            self.terminate_quietly(&handle).await;
            if let Err(err) = self.clear_record(&handle.session_id, Some(handle.id())).await {
                warn!(session_id = %handle.session_id, error = %err, "failed to clear idle sandbox record");
            }
        }
        count
    }

    async fn terminate_quietly(&self, handle: &SandboxHandle) -> bool {
        match tokio::time::timeout(TERMINATE_TIMEOUT, handle.sandbox.terminate()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) if err.is_gone() => true,
            Ok(Err(err)) => {
                warn!(sandbox_id = handle.id(), error = %err, "sandbox termination failed");
                false
            }
            Err(_) => {
                warn!(sandbox_id = handle.id(), "sandbox termination timed out");
                false
            }
        }
    }

    async fn load_record(&self, session_id: &str) -> Result<Option<LifecycleRecord>> {
        let lifecycle = self.inner.lifecycle.clone();
        let session_id = session_id.to_string();
        Ok(run_blocking(move || lifecycle.load(&session_id)).await?)
    }

    async fn save_record(&self, record: LifecycleRecord) -> Result<()> {
        let lifecycle = self.inner.lifecycle.clone();
        Ok(run_blocking(move || lifecycle.save(&record)).await?)
    }

    async fn clear_record(&self, session_id: &str, sandbox_id: Option<&str>) -> Result<()> {
        let lifecycle = self.inner.lifecycle.clone();
        let session_id = session_id.to_string();
        let sandbox_id = sandbox_id.map(str::to_string);
        run_blocking(move || lifecycle.clear_sandbox(&session_id, sandbox_id.as_deref())).await?;
        Ok(())
    }
}
