//! Named locks serializing registry mutations across application instances.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::error::{Error, Result, StoreError};
use crate::sharding::DatabaseType;

/// Lock name guarding the sharding registry and its backup.
pub const SHARDING_LOCK_NAME: &str = "Sharding!";

/// A lock that is currently held.
#[async_trait]
pub trait HeldLock: Send {
    /// Releases the lock.
    async fn release(self: Box<Self>) -> std::result::Result<(), StoreError>;
}

/// Scoped handle to an acquired lock.
///
/// [`LockGuard::release`] releases explicitly. A guard dropped without
/// release (for example while unwinding) drops its held lock, which process
/// locks release immediately and session-level database locks release when
/// their connection closes.
pub struct LockGuard {
    held: Option<Box<dyn HeldLock>>,
}

impl LockGuard {
    /// Wraps a held lock.
    pub fn new(held: Box<dyn HeldLock>) -> Self {
        Self { held: Some(held) }
    }

    /// Guard for a lock that was never taken.
    pub fn unlocked() -> Self {
        Self { held: None }
    }

    /// Releases the lock.
    pub async fn release(mut self) -> Result<()> {
        match self.held.take() {
            Some(held) => held.release().await.map_err(Error::from),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.held.is_some())
            .finish()
    }
}

/// A named mutual-exclusion lock.
#[async_trait]
pub trait NamedLock: Send + Sync {
    /// Waits until the lock called `name` is acquired.
    async fn acquire(&self, name: &str) -> Result<LockGuard>;
}

/// Runs `action` while holding the lock called `name`.
///
/// The lock is released on every exit path before the action's result is
/// returned. A failed release after a successful action is reported as an
/// error; after a failed action it is logged and the action's error wins.
pub async fn with_lock<L, F, Fut, T>(lock: &L, name: &str, action: F) -> Result<T>
where
    L: NamedLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let guard = lock.acquire(name).await?;
    debug!(lock = name, "lock acquired");
    let result = action().await;
    let released = guard.release().await;
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            warn!(lock = name, error = %release_err, "failed to release lock after error");
            Err(err)
        }
    }
}

/// Lock for embedded stores and single-instance deployments: never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

#[async_trait]
impl NamedLock for NoLock {
    async fn acquire(&self, _name: &str) -> Result<LockGuard> {
        Ok(LockGuard::unlocked())
    }
}

/// Named locks shared by the tasks and threads of one process.
#[derive(Debug, Default, Clone)]
pub struct ProcessLock {
    slots: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ProcessLock {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex for `name`, dropping idle mutexes of other names.
    ///
    /// A slot whose only reference is the table is neither held nor awaited.
    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.slots.lock().expect("poisoned lock");
        guard.retain(|key, slot| key == name || Arc::strong_count(slot) > 1);
        guard.entry(name.to_string()).or_default().clone()
    }

    /// Runs `action` on the current thread while holding the lock.
    ///
    /// Must not be called from inside an async runtime. The lock is released
    /// when this returns or unwinds.
    pub fn with_lock_blocking<T>(&self, name: &str, action: impl FnOnce() -> T) -> T {
        let slot = self.slot(name);
        let _guard = slot.blocking_lock();
        action()
    }
}

struct ProcessHeld(OwnedMutexGuard<()>);

#[async_trait]
impl HeldLock for ProcessHeld {
    async fn release(self: Box<Self>) -> std::result::Result<(), StoreError> {
        let ProcessHeld(guard) = *self;
        drop(guard);
        Ok(())
    }
}

#[async_trait]
impl NamedLock for ProcessLock {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let guard = self.slot(name).lock_owned().await;
        Ok(LockGuard::new(Box::new(ProcessHeld(guard))))
    }
}

/// A dedicated database session used to hold an advisory lock.
#[async_trait]
pub trait LockConnection: Send + 'static {
    /// Executes `sql` with `lock_name` bound as its only parameter and
    /// returns the first column of the first row, if any.
    async fn execute(
        &mut self,
        sql: &str,
        lock_name: &str,
    ) -> std::result::Result<Option<i64>, StoreError>;
}

/// Opens sessions for [`SqlAdvisoryLock`].
#[async_trait]
pub trait LockConnector: Send + Sync {
    /// Session type.
    type Connection: LockConnection;

    /// Opens a new session.
    async fn connect(&self) -> std::result::Result<Self::Connection, StoreError>;
}

/// Statements that take and release an advisory lock on one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatements {
    /// Blocks until the lock is granted.
    pub acquire: &'static str,
    /// Releases the lock.
    pub release: &'static str,
}

/// Returns the advisory lock statements of an engine, or `None` for embedded engines.
pub fn lock_statements(database_type: DatabaseType) -> Option<LockStatements> {
    match database_type {
        DatabaseType::Postgres => Some(LockStatements {
            acquire: "SELECT pg_advisory_lock(hashtext($1))",
            release: "SELECT CASE WHEN pg_advisory_unlock(hashtext($1)) THEN 0 ELSE -1 END",
        }),
        DatabaseType::SqlServer => Some(LockStatements {
            acquire: "DECLARE @result int; \
                      EXEC @result = sp_getapplock @Resource = @p1, @LockMode = 'Exclusive', \
                      @LockOwner = 'Session', @LockTimeout = -1; \
                      SELECT @result",
            release: "DECLARE @result int; \
                      EXEC @result = sp_releaseapplock @Resource = @p1, @LockOwner = 'Session'; \
                      SELECT @result",
        }),
        DatabaseType::Sqlite | DatabaseType::InMemory => None,
    }
}

/// Advisory lock held on a dedicated session of a server database.
///
/// Embedded engines have a single process, so acquisition is a no-op there.
#[derive(Debug, Clone)]
pub struct SqlAdvisoryLock<C> {
    connector: C,
    database_type: DatabaseType,
    acquire_timeout: Duration,
}

impl<C> SqlAdvisoryLock<C> {
    /// Creates a lock for the given engine.
    pub fn new(connector: C, database_type: DatabaseType) -> Self {
        Self {
            connector,
            database_type,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Sets how long acquisition may wait.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

struct SqlHeld<Conn> {
    connection: Conn,
    name: String,
    release_sql: &'static str,
}

#[async_trait]
impl<Conn: LockConnection> HeldLock for SqlHeld<Conn> {
    async fn release(self: Box<Self>) -> std::result::Result<(), StoreError> {
        let mut this = *self;
        let result = this.connection.execute(this.release_sql, &this.name).await?;
        if matches!(result, Some(code) if code < 0) {
            return Err(format!("lock '{}' was not held at release", this.name).into());
        }
        Ok(())
    }
}

#[async_trait]
impl<C: LockConnector> NamedLock for SqlAdvisoryLock<C> {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let Some(statements) = lock_statements(self.database_type) else {
            return Ok(LockGuard::unlocked());
        };
        let mut connection = self.connector.connect().await?;
        let acquired =
            tokio::time::timeout(self.acquire_timeout, connection.execute(statements.acquire, name))
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "waited {:?} for the lock '{name}'",
                        self.acquire_timeout
                    ))
                })??;
        if let Some(code) = acquired
            && code < 0
        {
            return Err(Error::System(format!(
                "the database refused the lock '{name}' (code {code})"
            )));
        }
        Ok(LockGuard::new(Box::new(SqlHeld {
            connection,
            name: name.to_string(),
            release_sql: statements.release,
        })))
    }
}
