//! Common test utilities.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use sessionbox::config::Config;
use sessionbox::error::ProviderError;
use sessionbox::provider::local::LocalProvider;
use sessionbox::provider::{
    ComputeProvider, ExecOutput, ExecRequest, RemoteSandbox, SandboxSpec, VolumeRef,
};
use sessionbox::reconnect::ReconnectPolicy;
use sessionbox::state::AppState;
use sessionbox::store::SqliteStore;
use sessionbox::{SandboxExecutor, SandboxManager};

/// Call counters shared by the provider and every sandbox it hands out.
#[derive(Default)]
pub struct Counters {
    pub creates: AtomicUsize,
    pub execs: AtomicUsize,
    pub connects: AtomicUsize,
}

/// `LocalProvider` wrapper that counts calls and can slow down or fail
/// sandbox creation.
pub struct CountingProvider {
    pub inner: LocalProvider,
    pub counters: Arc<Counters>,
    create_delay: Duration,
    failing_creates: AtomicUsize,
}

impl CountingProvider {
    pub fn new(volumes_dir: &std::path::Path) -> Self {
        Self {
            inner: LocalProvider::new(volumes_dir).unwrap(),
            counters: Arc::new(Counters::default()),
            create_delay: Duration::ZERO,
            failing_creates: AtomicUsize::new(0),
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Make the next `count` sandbox creations fail.
    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn execs(&self) -> usize {
        self.counters.execs.load(Ordering::SeqCst)
    }

    pub fn live_sandboxes(&self) -> usize {
        self.inner.live_sandboxes()
    }
}

#[async_trait]
impl ComputeProvider for CountingProvider {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn ensure_volume(&self, name: &str) -> Result<VolumeRef, ProviderError> {
        self.inner.ensure_volume(name).await
    }

    async fn create_sandbox(
        &self,
        spec: &SandboxSpec,
    ) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let failing = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ProviderError::Api {
                status: 500,
                message: "injected create failure".into(),
            });
        }
        let sandbox = self.inner.create_sandbox(spec).await?;
        Ok(Arc::new(CountingSandbox {
            inner: sandbox,
            counters: self.counters.clone(),
        }))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let sandbox = self.inner.connect(sandbox_id).await?;
        Ok(Arc::new(CountingSandbox {
            inner: sandbox,
            counters: self.counters.clone(),
        }))
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        self.inner.terminate(sandbox_id).await
    }
}

#[derive(Debug)]
struct CountingSandbox {
    inner: Arc<dyn RemoteSandbox>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters").finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteSandbox for CountingSandbox {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn workspace_root(&self) -> &str {
        self.inner.workspace_root()
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, ProviderError> {
        self.counters.execs.fetch_add(1, Ordering::SeqCst);
        self.inner.exec(request).await
    }

    async fn terminate(&self) -> Result<(), ProviderError> {
        self.inner.terminate().await
    }

    async fn tunnel_url(&self, port: u16) -> Result<Option<String>, ProviderError> {
        self.inner.tunnel_url(port).await
    }
}

/// One shared provider and database, from which any number of
/// independent managers ("processes") can be built.
pub struct Harness {
    pub dir: TempDir,
    pub provider: Arc<CountingProvider>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provider(|volumes| CountingProvider::new(volumes))
    }

    pub fn with_provider(build: impl FnOnce(&std::path::Path) -> CountingProvider) -> Self {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(build(&dir.path().join("volumes")));
        let mut config = Config {
            data_dir: dir.path().to_path_buf(),
            database: dir.path().join("sessionbox.db"),
            ..Config::default()
        };
        config.timeouts.lock_wait = Duration::from_secs(10);
        config.timeouts.lock_poll = Duration::from_millis(10);
        config.timeouts.reconnect = Duration::from_secs(2);
        config.timeouts.probe = Duration::from_secs(2);
        config.timeouts.command = Duration::from_secs(30);
        Self {
            dir,
            provider,
            config,
        }
    }

    /// A manager with its own cache and its own database connection.
    pub fn manager(&self) -> SandboxManager {
        self.manager_with(self.config.clone())
    }

    pub fn manager_with_policy(&self, policy: ReconnectPolicy) -> SandboxManager {
        let mut config = self.config.clone();
        config.reconnect_policy = policy;
        self.manager_with(config)
    }

    pub fn manager_with(&self, config: Config) -> SandboxManager {
        let store = Arc::new(SqliteStore::open(&config.database).unwrap());
        SandboxManager::new(Arc::new(config), self.provider.clone(), store.clone(), store)
    }

    pub fn store(&self) -> SqliteStore {
        SqliteStore::open(&self.config.database).unwrap()
    }

    pub fn executor(&self) -> SandboxExecutor {
        SandboxExecutor::new(self.manager())
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.manager())
    }

    /// Host directory backing the session's volume.
    pub fn volume_dir(&self, session_id: &str) -> std::path::PathBuf {
        self.provider
            .inner
            .volume_path(&sessionbox::volume::volume_name(session_id))
    }
}
