//! Cross-process mutual exclusion keyed by the session's volume.
//!
//! A lock is a TTL lease in the shared [`LeaseStore`]. Acquisition polls
//! with backoff up to a wait bound; while held, a heartbeat renews the
//! lease. The returned [`LeaseGuard`] releases on every exit path: an
//! explicit [`LeaseGuard::release`], or its `Drop` on early return, error
//! or panic. If the lease is taken over or cannot be renewed within its
//! TTL, the guard reports it through [`LeaseGuard::is_lost`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::store::{run_blocking, LeaseStore};
use crate::volume::volume_name;

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LeaseStore>,
    ttl: Duration,
    wait: Duration,
    poll: Duration,
}

/// One lease per volume, so at most one sandbox is ever attached to it.
fn lease_key(session_id: &str) -> String {
    format!("sandbox:{}", volume_name(session_id))
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LeaseStore>, ttl: Duration, wait: Duration, poll: Duration) -> Self {
        Self {
            store,
            ttl,
            wait,
            poll: poll.max(Duration::from_millis(10)),
        }
    }

    /// Acquire the session's lease, waiting at most the configured bound.
    pub async fn acquire(&self, session_id: &str) -> Result<LeaseGuard, SandboxError> {
        let key = lease_key(session_id);
        let owner = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + self.wait;
        let mut interval = self.poll;
        let mut attempts: u32 = 0;

        loop {
            let acquired = {
                let store = self.store.clone();
                let (key, owner, ttl) = (key.clone(), owner.clone(), self.ttl);
                run_blocking(move || store.try_acquire(&key, &owner, ttl)).await?
            };
            if acquired {
                if attempts > 0 {
                    info!(
                        session_id,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "sandbox lock acquired after waiting"
                    );
                } else {
                    debug!(session_id, "sandbox lock acquired");
                }
                let lost = Arc::new(AtomicBool::new(false));
                let heartbeat = self.spawn_heartbeat(key.clone(), owner.clone(), lost.clone());
                return Ok(LeaseGuard {
                    store: self.store.clone(),
                    key,
                    owner,
                    heartbeat: Some(heartbeat),
                    lost,
                    released: false,
                });
            }

            attempts += 1;
            let now = Instant::now();
            if now >= deadline {
                return Err(SandboxError::LockTimeout {
                    session_id: session_id.to_string(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    fn spawn_heartbeat(&self, key: String, owner: String, lost: Arc<AtomicBool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let ttl = self.ttl;
        let period = (ttl / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut renewed_at = Instant::now();
            loop {
                tokio::time::sleep(period).await;
                let renewed = {
                    let store = store.clone();
                    let (key, owner) = (key.clone(), owner.clone());
                    run_blocking(move || store.renew(&key, &owner, ttl)).await
                };
                match renewed {
                    Ok(true) => renewed_at = Instant::now(),
                    Ok(false) => {
                        warn!(lease = %key, "sandbox lock lease lost before release");
                        lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(err) if renewed_at.elapsed() >= ttl => {
                        warn!(lease = %key, error = %err, "sandbox lock expired without renewal");
                        lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(err) => warn!(lease = %key, error = %err, "sandbox lock renewal failed"),
                }
            }
        })
    }
}

/// A held lease. Released exactly once.
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    key: String,
    owner: String,
    heartbeat: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
    released: bool,
}

impl LeaseGuard {
    /// Whether another holder may own the lease by now. Work started under
    /// this guard must not be published once this returns true.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Release the lease and wait for the store to confirm.
    pub async fn release(mut self) {
        self.released = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let store = self.store.clone();
        let (key, owner) = (self.key.clone(), self.owner.clone());
        match run_blocking(move || store.release(&key, &owner)).await {
            Ok(true) => debug!(lease = %self.key, "sandbox lock released"),
            Ok(false) => warn!(lease = %self.key, "sandbox lock had already expired"),
            Err(err) => warn!(lease = %self.key, error = %err, "failed to release sandbox lock"),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if self.released {
            return;
        }
        let store = self.store.clone();
        let (key, owner) = (self.key.clone(), self.owner.clone());
        let release = move || {
            if let Err(err) = store.release(&key, &owner) {
                warn!(lease = %key, error = %err, "failed to release sandbox lock on drop");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}
