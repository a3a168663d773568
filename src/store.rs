//! SQLite persistence for lifecycle records and lock leases.
//!
//! Calls are synchronous; async callers go through [`run_blocking`].
//! Two stores opened on the same database file coordinate exactly like two
//! processes would.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;

use crate::error::StoreError;

/// Last known sandbox for a session. Only ever a hint for reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    pub session_id: String,
    pub last_sandbox_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub language: Option<String>,
}

impl LifecycleRecord {
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_sandbox_id: None,
            created_at: None,
            language: None,
        }
    }
}

/// One row per session.
pub trait LifecycleStore: Send + Sync {
    fn load(&self, session_id: &str) -> Result<Option<LifecycleRecord>, StoreError>;

    fn save(&self, record: &LifecycleRecord) -> Result<(), StoreError>;

    /// Forget the recorded sandbox. When `sandbox_id` is given only that id
    /// is cleared, so a newer record written by another process survives.
    fn clear_sandbox(&self, session_id: &str, sandbox_id: Option<&str>)
        -> Result<bool, StoreError>;
}

/// TTL-bound mutual exclusion records.
pub trait LeaseStore: Send + Sync {
    /// Take the lease if it is free or expired.
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Extend a lease still held by `owner`.
    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop a lease still held by `owner`.
    fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError>;
}

/// Run a blocking store call off the async runtime.
pub async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sandbox_sessions (
    session_id TEXT PRIMARY KEY,
    last_sandbox_id TEXT,
    created_at INTEGER,
    language TEXT,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sandbox_leases (
    lease_key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sandbox_leases_expires ON sandbox_leases (expires_at);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and initialize) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    /// Private in-memory database, mainly for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2).max(1)
}

fn from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

impl LifecycleStore for SqliteStore {
    fn load(&self, session_id: &str) -> Result<Option<LifecycleRecord>, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT session_id, last_sandbox_id, created_at, language
                 FROM sandbox_sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(LifecycleRecord {
                        session_id: row.get(0)?,
                        last_sandbox_id: row.get(1)?,
                        created_at: from_ms(row.get(2)?),
                        language: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn save(&self, record: &LifecycleRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sandbox_sessions (session_id, last_sandbox_id, created_at, language, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                last_sandbox_id = excluded.last_sandbox_id,
                created_at = excluded.created_at,
                language = excluded.language,
                updated_at = excluded.updated_at",
            params![
                record.session_id,
                record.last_sandbox_id,
                record.created_at.map(|t| t.timestamp_millis()),
                record.language,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    fn clear_sandbox(
        &self,
        session_id: &str,
        sandbox_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = match sandbox_id {
            Some(id) => conn.execute(
                "UPDATE sandbox_sessions SET last_sandbox_id = NULL, created_at = NULL, updated_at = ?1
                 WHERE session_id = ?2 AND last_sandbox_id = ?3",
                params![now_ms(), session_id, id],
            )?,
            None => conn.execute(
                "UPDATE sandbox_sessions SET last_sandbox_id = NULL, created_at = NULL, updated_at = ?1
                 WHERE session_id = ?2 AND last_sandbox_id IS NOT NULL",
                params![now_ms(), session_id],
            )?,
        };
        Ok(changed > 0)
    }
}

impl LeaseStore for SqliteStore {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let now = now_ms();
        let result = conn.execute(
            "INSERT INTO sandbox_leases (lease_key, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(lease_key) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
             WHERE sandbox_leases.expires_at <= ?4",
            params![key, owner, now + ttl_ms(ttl), now],
        );
        match result {
            Ok(changed) => Ok(changed == 1),
            // Another writer holds the database; treat as contended.
            Err(err) if is_busy(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sandbox_leases SET expires_at = ?1 WHERE lease_key = ?2 AND owner = ?3",
            params![now_ms() + ttl_ms(ttl), key, owner],
        )?;
        Ok(changed == 1)
    }

    fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM sandbox_leases WHERE lease_key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
        Ok(changed == 1)
    }
}
