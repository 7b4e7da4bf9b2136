use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::data::{
    DataConnector, DataTransaction, MigrationRunner, TenantDatabase, TenantRow, remap_references,
};
use crate::error::StoreError;
use crate::registry::DatabaseTarget;
use crate::store::IsolationLevel;
use crate::tenant::DataKeyFilter;

/// Errors raised by the in-memory tenant databases.
#[derive(Debug, Error)]
pub enum MemoryDataError {
    /// A serializable transaction saw a concurrent commit.
    #[error("could not serialize access due to a concurrent update")]
    SerializationConflict,
    /// The database was dropped.
    #[error("database '{0}' does not exist")]
    Dropped(String),
    /// Failure requested through [`MemoryDataConnector::fail_next_delete`].
    #[error("injected delete failure in '{0}'")]
    InjectedFailure(String),
}

/// In-memory tenant databases keyed by connection string.
///
/// Opening an unknown connection string creates an empty database. Clones
/// share the same databases.
#[derive(Debug, Default, Clone)]
pub struct MemoryDataConnector {
    inner: Arc<Mutex<Databases>>,
}

#[derive(Debug, Default)]
struct Databases {
    by_connection: BTreeMap<String, Arc<Mutex<DbState>>>,
    migrated: BTreeSet<String>,
    failing_deletes: BTreeSet<String>,
    latency: Option<Duration>,
}

#[derive(Debug, Default, Clone)]
struct DbState {
    rows: Vec<TenantRow>,
    next_key: i64,
    version: u64,
    dropped: bool,
}

impl MemoryDataConnector {
    /// Creates a connector with no databases.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts rows directly, assigning keys.
    pub fn seed(&self, connection_string: &str, rows: Vec<TenantRow>) {
        let db = self.database(connection_string);
        let mut state = db.lock().expect("poisoned lock");
        for mut row in rows {
            state.next_key += 1;
            row.key = Some(state.next_key);
            state.rows.push(row);
        }
        state.version += 1;
    }

    /// Returns the committed rows of a database.
    pub fn rows(&self, connection_string: &str) -> Vec<TenantRow> {
        let guard = self.inner.lock().expect("poisoned lock");
        guard
            .by_connection
            .get(connection_string)
            .map(|db| db.lock().expect("poisoned lock").rows.clone())
            .unwrap_or_default()
    }

    /// Returns true when the database was dropped.
    pub fn is_dropped(&self, connection_string: &str) -> bool {
        let guard = self.inner.lock().expect("poisoned lock");
        guard
            .by_connection
            .get(connection_string)
            .is_some_and(|db| db.lock().expect("poisoned lock").dropped)
    }

    /// Returns the connection strings whose schema was ensured.
    pub fn migrated(&self) -> Vec<String> {
        let guard = self.inner.lock().expect("poisoned lock");
        guard.migrated.iter().cloned().collect()
    }

    /// Makes the next delete in the given database fail.
    pub fn fail_next_delete(&self, connection_string: &str) {
        let mut guard = self.inner.lock().expect("poisoned lock");
        guard.failing_deletes.insert(connection_string.to_string());
    }

    /// Delays every row read, to exercise operation deadlines.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner.lock().expect("poisoned lock").latency = Some(latency);
        self
    }

    fn database(&self, connection_string: &str) -> Arc<Mutex<DbState>> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        guard
            .by_connection
            .entry(connection_string.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl DataConnector for MemoryDataConnector {
    type Database = MemoryDatabase;

    async fn open(&self, target: &DatabaseTarget) -> std::result::Result<MemoryDatabase, StoreError> {
        let state = self.database(&target.connection_string);
        if state.lock().expect("poisoned lock").dropped {
            return Err(Box::new(MemoryDataError::Dropped(target.name.clone())));
        }
        Ok(MemoryDatabase {
            connection_string: target.connection_string.clone(),
            state,
            connector: self.clone(),
        })
    }
}

#[async_trait]
impl MigrationRunner for MemoryDataConnector {
    async fn ensure_schema(&self, target: &DatabaseTarget) -> std::result::Result<(), StoreError> {
        let db = self.database(&target.connection_string);
        db.lock().expect("poisoned lock").dropped = false;
        self.inner
            .lock()
            .expect("poisoned lock")
            .migrated
            .insert(target.connection_string.clone());
        Ok(())
    }
}

/// One in-memory tenant database.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    connection_string: String,
    state: Arc<Mutex<DbState>>,
    connector: MemoryDataConnector,
}

#[async_trait]
impl TenantDatabase for MemoryDatabase {
    type Tx = MemoryDataTransaction;

    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> std::result::Result<MemoryDataTransaction, StoreError> {
        let state = self.state.lock().expect("poisoned lock");
        Ok(MemoryDataTransaction {
            database: self.clone(),
            isolation,
            base_version: state.version,
            working: state.clone(),
            dirty: false,
        })
    }

    async fn drop_database(&self) -> std::result::Result<(), StoreError> {
        let mut state = self.state.lock().expect("poisoned lock");
        state.rows.clear();
        state.dropped = true;
        state.version += 1;
        Ok(())
    }
}

/// Transaction over a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryDataTransaction {
    database: MemoryDatabase,
    isolation: IsolationLevel,
    base_version: u64,
    working: DbState,
    dirty: bool,
}

#[async_trait]
impl DataTransaction for MemoryDataTransaction {
    async fn read_rows(
        &mut self,
        filter: &DataKeyFilter,
    ) -> std::result::Result<Vec<TenantRow>, StoreError> {
        let latency = self.database.connector.inner.lock().expect("poisoned lock").latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(filter.apply(self.working.rows.iter().cloned()))
    }

    async fn insert_rows(&mut self, rows: Vec<TenantRow>) -> std::result::Result<usize, StoreError> {
        let mut assigned = HashMap::new();
        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            self.working.next_key += 1;
            let key = self.working.next_key;
            if let Some(source) = row.source_key.take() {
                assigned.insert((row.table.clone(), source), key);
            }
            row.key = Some(key);
            inserted.push(row);
        }
        remap_references(&mut inserted, &assigned);
        let count = inserted.len();
        self.working.rows.extend(inserted);
        self.dirty = true;
        Ok(count)
    }

    async fn update_data_key(
        &mut self,
        old_data_key: &str,
        new_data_key: &str,
    ) -> std::result::Result<u64, StoreError> {
        let mut count = 0;
        for row in self.working.rows.iter_mut().filter(|row| row.data_key == old_data_key) {
            row.data_key = new_data_key.to_string();
            count += 1;
        }
        self.dirty = true;
        Ok(count)
    }

    async fn delete_rows(&mut self, filter: &DataKeyFilter) -> std::result::Result<u64, StoreError> {
        let failing = self
            .database
            .connector
            .inner
            .lock()
            .expect("poisoned lock")
            .failing_deletes
            .remove(&self.database.connection_string);
        if failing {
            return Err(Box::new(MemoryDataError::InjectedFailure(
                self.database.connection_string.clone(),
            )));
        }
        let before = self.working.rows.len();
        self.working.rows.retain(|row| !filter.matches(row));
        self.dirty = true;
        Ok((before - self.working.rows.len()) as u64)
    }

    async fn commit(self) -> std::result::Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let mut state = self.database.state.lock().expect("poisoned lock");
        if state.dropped {
            return Err(Box::new(MemoryDataError::Dropped(
                self.database.connection_string.clone(),
            )));
        }
        if self.isolation == IsolationLevel::Serializable && state.version != self.base_version {
            return Err(Box::new(MemoryDataError::SerializationConflict));
        }
        let version = state.version + 1;
        *state = DbState {
            version,
            ..self.working
        };
        Ok(())
    }

    async fn rollback(self) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}
