//! Per-process handle cache and pending-creation registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::error::SandboxError;
use crate::handle::SandboxHandle;

/// A creation in flight, awaitable by any number of callers.
pub type CreationFuture = Shared<BoxFuture<'static, Result<SandboxHandle, SandboxError>>>;

/// Outcome of [`SandboxCache::lookup_or_start`].
pub enum Lookup {
    /// A live handle is cached.
    Ready(SandboxHandle),
    /// Another caller already started creation; await this instead.
    Pending(CreationFuture),
    /// This caller registered a new creation.
    Started(CreationFuture),
}

struct Entry {
    handle: SandboxHandle,
    last_used: Instant,
}

#[derive(Default)]
struct Inner {
    ready: HashMap<String, Entry>,
    pending: HashMap<String, CreationFuture>,
}

/// Both maps sit behind one mutex so that "check cache, check pending,
/// register pending" is a single atomic step.
#[derive(Clone, Default)]
pub struct SandboxCache {
    inner: Arc<Mutex<Inner>>,
}

impl SandboxCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached handle for `session_id`, marking it as used.
    pub fn get(&self, session_id: &str) -> Option<SandboxHandle> {
        let mut inner = self.inner.lock();
        inner.ready.get_mut(session_id).map(|entry| {
            entry.last_used = Instant::now();
            entry.handle.clone()
        })
    }

    /// Return the cached handle or the pending creation, or register the
    /// creation produced by `start`. `start` runs under the cache lock and
    /// must not block.
    pub fn lookup_or_start<F>(&self, session_id: &str, start: F) -> Lookup
    where
        F: FnOnce() -> CreationFuture,
    {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.ready.get_mut(session_id) {
            entry.last_used = Instant::now();
            return Lookup::Ready(entry.handle.clone());
        }
        if let Some(pending) = inner.pending.get(session_id) {
            return Lookup::Pending(pending.clone());
        }
        let creation = start();
        inner.pending.insert(session_id.to_string(), creation.clone());
        Lookup::Started(creation)
    }

    /// The pending creation for `session_id`, if any.
    pub fn pending(&self, session_id: &str) -> Option<CreationFuture> {
        self.inner.lock().pending.get(session_id).cloned()
    }

    /// Record the outcome of a creation: the pending entry is always
    /// removed, a successful handle is cached.
    pub fn complete(&self, session_id: &str, result: &Result<SandboxHandle, SandboxError>) {
        let mut inner = self.inner.lock();
        inner.pending.remove(session_id);
        if let Ok(handle) = result {
            inner.ready.insert(
                session_id.to_string(),
                Entry {
                    handle: handle.clone(),
                    last_used: Instant::now(),
                },
            );
        }
    }

    /// Drop the cached handle for `session_id`.
    pub fn remove(&self, session_id: &str) -> Option<SandboxHandle> {
        self.inner.lock().ready.remove(session_id).map(|entry| entry.handle)
    }

    /// Drop the cached handle only if it still refers to `sandbox_id`.
    pub fn remove_if(&self, session_id: &str, sandbox_id: &str) -> Option<SandboxHandle> {
        let mut inner = self.inner.lock();
        match inner.ready.get(session_id) {
            Some(entry) if entry.handle.id() == sandbox_id => {
                inner.ready.remove(session_id).map(|entry| entry.handle)
            }
            _ => None,
        }
    }

    /// Remove and return handles unused for longer than `ttl`.
    pub fn take_idle(&self, ttl: Duration) -> Vec<SandboxHandle> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .ready
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| inner.ready.remove(&id).map(|entry| entry.handle))
            .collect()
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.inner.lock().pending.contains_key(session_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn ready_count(&self) -> usize {
        self.inner.lock().ready.len()
    }
}
