//! Integration tests for get-or-create, locking and reconnection.

use std::sync::Arc;
use std::time::Duration;

use sessionbox::lock::DistributedLock;
use sessionbox::provider::ComputeProvider;
use sessionbox::store::{LifecycleStore, SqliteStore};
use sessionbox::{Language, ReconnectPolicy, SandboxError};

mod common;

use common::{CountingProvider, Harness};

fn slow_harness() -> Harness {
    Harness::with_provider(|volumes| {
        CountingProvider::new(volumes).with_create_delay(Duration::from_millis(200))
    })
}

#[tokio::test]
async fn concurrent_calls_provision_once() {
    let harness = slow_harness();
    let manager = harness.manager();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_or_create("s1", None).await })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().id().to_string());
    }
    assert_eq!(harness.provider.creates(), 1);
    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(manager.cache().pending_count(), 0);
}

#[tokio::test]
async fn two_processes_never_hold_two_sandboxes() {
    let harness = slow_harness();
    let first = harness.manager_with_policy(ReconnectPolicy::Strict);
    let second = harness.manager_with_policy(ReconnectPolicy::Strict);

    let (a, b) = tokio::join!(
        first.get_or_create("s1", None),
        second.get_or_create("s1", None)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // The loser of the lock race reattached to the winner's sandbox.
    assert_eq!(a.id(), b.id());
    assert_eq!(harness.provider.creates(), 1);
    assert_eq!(harness.provider.live_sandboxes(), 1);
}

#[tokio::test]
async fn recreate_policy_replaces_the_recorded_sandbox() {
    let harness = Harness::new();
    let first = harness.manager_with_policy(ReconnectPolicy::Recreate);
    let second = harness.manager_with_policy(ReconnectPolicy::Recreate);

    let a = first.get_or_create("s1", Some(Language::Go)).await.unwrap();
    let b = second.get_or_create("s1", None).await.unwrap();

    assert_ne!(a.id(), b.id());
    assert_eq!(harness.provider.creates(), 2);
    // The stale sandbox was terminated rather than left on the volume.
    assert_eq!(harness.provider.live_sandboxes(), 1);
    // With no hint, the recorded language is reused.
    assert_eq!(b.language, Language::Go);

    let record = harness.store().load("s1").unwrap().unwrap();
    assert_eq!(record.last_sandbox_id.as_deref(), Some(b.id()));
    assert_eq!(record.language.as_deref(), Some("go"));
}

#[tokio::test]
async fn strict_policy_falls_back_when_sandbox_is_dead() {
    let harness = Harness::new();
    let first = harness.manager_with_policy(ReconnectPolicy::Strict);
    let a = first.get_or_create("s1", None).await.unwrap();
    harness.provider.inner.terminate(a.id()).await.unwrap();

    let second = harness.manager_with_policy(ReconnectPolicy::Strict);
    let b = second.get_or_create("s1", None).await.unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(harness.provider.creates(), 2);

    let record = harness.store().load("s1").unwrap().unwrap();
    assert_eq!(record.last_sandbox_id.as_deref(), Some(b.id()));
}

#[tokio::test]
async fn lock_timeout_is_distinct_and_leaves_nothing_pending() {
    let harness = Harness::new();
    let mut config = harness.config.clone();
    config.timeouts.lock_wait = Duration::from_millis(100);
    let manager = harness.manager_with(config);

    // Another process holds the session lock.
    let other = DistributedLock::new(
        Arc::new(SqliteStore::open(&harness.config.database).unwrap()),
        Duration::from_secs(60),
        Duration::from_secs(1),
        Duration::from_millis(10),
    );
    let held = other.acquire("s1").await.unwrap();

    let err = manager.get_or_create("s1", None).await.unwrap_err();
    assert!(matches!(err, SandboxError::LockTimeout { .. }), "got {err:?}");
    assert_eq!(manager.cache().pending_count(), 0);
    assert_eq!(harness.provider.creates(), 0);

    held.release().await;
    manager.get_or_create("s1", None).await.unwrap();
    assert_eq!(harness.provider.creates(), 1);
}

#[tokio::test]
async fn lost_lease_never_publishes_the_sandbox() {
    let harness = slow_harness();
    let mut config = harness.config.clone();
    config.timeouts.lock_ttl = Duration::from_millis(90);
    let manager = harness.manager_with(config);

    let creation = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get_or_create("s1", None).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;

    // The lease vanishes mid-creation and another process takes it.
    rusqlite::Connection::open(&harness.config.database)
        .unwrap()
        .execute("DELETE FROM sandbox_leases", [])
        .unwrap();
    let other = DistributedLock::new(
        Arc::new(SqliteStore::open(&harness.config.database).unwrap()),
        Duration::from_secs(60),
        Duration::from_secs(1),
        Duration::from_millis(10),
    );
    let held = other.acquire("s1").await.unwrap();

    let err = creation.await.unwrap().unwrap_err();
    assert!(matches!(err, SandboxError::Provision(_)), "got {err:?}");
    assert_eq!(harness.provider.creates(), 1);
    assert_eq!(harness.provider.live_sandboxes(), 0);
    let recorded = harness.store().load("s1").unwrap().and_then(|r| r.last_sandbox_id);
    assert_eq!(recorded, None);
    assert_eq!(manager.cache().ready_count(), 0);

    held.release().await;
    manager.get_or_create("s1", None).await.unwrap();
    assert_eq!(harness.provider.creates(), 2);
}

#[tokio::test]
async fn provisioning_failure_is_retried_cleanly() {
    let harness = Harness::new();
    let manager = harness.manager();
    harness.provider.fail_next_creates(1);

    let err = manager.get_or_create("s1", None).await.unwrap_err();
    assert!(matches!(err, SandboxError::Provision(_)), "got {err:?}");
    assert_eq!(err.public_message(), sessionbox::error::UNAVAILABLE_MESSAGE);
    assert_eq!(manager.cache().pending_count(), 0);

    let handle = manager.get_or_create("s1", None).await.unwrap();
    assert_eq!(harness.provider.creates(), 2);
    assert_eq!(manager.get_or_create("s1", None).await.unwrap().id(), handle.id());
}

#[tokio::test]
async fn cancelled_caller_does_not_strand_creation() {
    let harness = slow_harness();
    let manager = harness.manager();

    let caller = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get_or_create("s1", None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    caller.abort();

    // The creation keeps running and later callers join or reuse it.
    let handle = manager.get_or_create("s1", None).await.unwrap();
    assert_eq!(harness.provider.creates(), 1);
    assert_eq!(manager.cache().pending_count(), 0);
    assert_eq!(manager.get_or_create("s1", None).await.unwrap().id(), handle.id());
}

#[tokio::test]
async fn terminate_keeps_volume_and_clears_record() {
    let harness = Harness::new();
    let manager = harness.manager();
    let first = manager.get_or_create("s1", None).await.unwrap();

    assert!(manager.terminate("s1").await);
    assert_eq!(harness.provider.live_sandboxes(), 0);
    assert!(harness.volume_dir("s1").is_dir());
    let record = harness.store().load("s1").unwrap().unwrap();
    assert_eq!(record.last_sandbox_id, None);

    assert!(!manager.terminate("s1").await);

    let second = manager.get_or_create("s1", None).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(first.volume, second.volume);
}

#[tokio::test]
async fn idle_sandboxes_are_reaped() {
    let harness = Harness::new();
    let mut config = harness.config.clone();
    config.idle_ttl = Duration::from_millis(20);
    let manager = harness.manager_with(config);

    manager.get_or_create("s1", None).await.unwrap();
    assert_eq!(manager.reap_idle().await, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.reap_idle().await, 1);

    assert_eq!(manager.cache().ready_count(), 0);
    assert_eq!(harness.provider.live_sandboxes(), 0);
    assert_eq!(harness.store().load("s1").unwrap().unwrap().last_sandbox_id, None);
}

#[tokio::test]
async fn sessions_are_independent() {
    let harness = slow_harness();
    let manager = harness.manager();
    let (a, b) = tokio::join!(
        manager.get_or_create("s1", None),
        manager.get_or_create("s2", None)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.id(), b.id());
    assert_ne!(a.volume, b.volume);
    assert_eq!(harness.provider.creates(), 2);
}
