//! Tenant-scoped application data: rows, databases and their transactions.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::registry::DatabaseTarget;
use crate::store::IsolationLevel;
use crate::tenant::{DataKeyFilter, DataKeyed};

/// Reference from one row to another row's primary key.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RowRef {
    /// Referenced table.
    pub table: String,
    /// Referenced primary key.
    pub key: i64,
}

/// One row of tenant-owned application data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TenantRow {
    /// Table name.
    pub table: String,
    /// Primary key; `None` until the database assigns one.
    pub key: Option<i64>,
    /// Owning tenant's data key.
    pub data_key: String,
    /// Column values.
    pub values: serde_json::Map<String, serde_json::Value>,
    /// Foreign keys by column name.
    #[serde(default)]
    pub references: BTreeMap<String, RowRef>,
    /// Key the row had in its source database before [`TenantRow::reset_keys`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<i64>,
}

impl TenantRow {
    /// Creates a row with no key.
    pub fn new(table: impl Into<String>, data_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: None,
            data_key: data_key.into(),
            values: serde_json::Map::new(),
            references: BTreeMap::new(),
            source_key: None,
        }
    }

    /// Sets a column value.
    pub fn with_value(mut self, column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    /// Adds a foreign key.
    pub fn with_reference(mut self, column: impl Into<String>, table: impl Into<String>, key: i64) -> Self {
        self.references.insert(
            column.into(),
            RowRef {
                table: table.into(),
                key,
            },
        );
        self
    }

    /// Clears the primary key so the row can be inserted into another database.
    ///
    /// The old key is kept in `source_key`; foreign keys keep their old values
    /// and are remapped by the inserting transaction.
    pub fn reset_keys(&mut self) {
        if let Some(key) = self.key.take() {
            self.source_key = Some(key);
        }
    }
}

impl DataKeyed for TenantRow {
    fn data_key(&self) -> &str {
        &self.data_key
    }
}

/// Remaps the foreign keys of freshly keyed rows.
///
/// `assigned` maps `(table, source_key)` to the new key. References to rows
/// outside the batch, such as shared lookup tables, are left alone.
pub fn remap_references(rows: &mut [TenantRow], assigned: &HashMap<(String, i64), i64>) {
    for row in rows {
        for reference in row.references.values_mut() {
            if let Some(key) = assigned.get(&(reference.table.clone(), reference.key)) {
                reference.key = *key;
            }
        }
    }
}

/// Opens tenant databases.
#[async_trait]
pub trait DataConnector: Send + Sync {
    /// Database handle type.
    type Database: TenantDatabase;

    /// Opens the database described by `target`.
    async fn open(&self, target: &DatabaseTarget) -> std::result::Result<Self::Database, StoreError>;
}

/// One physical database holding tenant data.
#[async_trait]
pub trait TenantDatabase: Send + Sync {
    /// Transaction type.
    type Tx: DataTransaction;

    /// Begins a transaction.
    async fn begin(&self, isolation: IsolationLevel) -> std::result::Result<Self::Tx, StoreError>;

    /// Drops the whole database.
    async fn drop_database(&self) -> std::result::Result<(), StoreError>;
}

/// Transaction over tenant data.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait DataTransaction: Send {
    /// Reads the rows matching `filter`, parents before the rows referencing them.
    async fn read_rows(&mut self, filter: &DataKeyFilter)
    -> std::result::Result<Vec<TenantRow>, StoreError>;

    /// Inserts rows in order, assigning keys and remapping references within the batch.
    async fn insert_rows(&mut self, rows: Vec<TenantRow>) -> std::result::Result<usize, StoreError>;

    /// `UPDATE ... SET data_key = new WHERE data_key = old` over every table.
    async fn update_data_key(
        &mut self,
        old_data_key: &str,
        new_data_key: &str,
    ) -> std::result::Result<u64, StoreError>;

    /// Deletes the rows matching `filter`.
    async fn delete_rows(&mut self, filter: &DataKeyFilter) -> std::result::Result<u64, StoreError>;

    /// Commits.
    async fn commit(self) -> std::result::Result<(), StoreError>;

    /// Rolls back.
    async fn rollback(self) -> std::result::Result<(), StoreError>;
}

/// Creates or migrates the schema of a database before its first tenant arrives.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    /// Ensures the schema exists in `target`.
    async fn ensure_schema(&self, target: &DatabaseTarget) -> std::result::Result<(), StoreError>;
}

/// Migration runner for databases whose schema is managed elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMigrations;

#[async_trait]
impl MigrationRunner for NoMigrations {
    async fn ensure_schema(&self, _target: &DatabaseTarget) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keys_should_keep_source_key() {
        let mut row = TenantRow::new("Invoice", "1.").with_value("total", 10);
        row.key = Some(7);

        row.reset_keys();

        assert_eq!(row.key, None);
        assert_eq!(row.source_key, Some(7));
    }

    #[test]
    fn remap_should_only_touch_rows_in_the_batch() {
        let mut rows = vec![
            TenantRow::new("Line", "1.")
                .with_reference("invoice_id", "Invoice", 7)
                .with_reference("product_id", "Product", 3),
        ];
        let assigned = HashMap::from([(("Invoice".to_string(), 7), 100)]);

        remap_references(&mut rows, &assigned);

        assert_eq!(rows[0].references["invoice_id"].key, 100);
        assert_eq!(rows[0].references["product_id"].key, 3);
    }

    #[test]
    fn rows_should_respect_data_key_filters() {
        let rows = vec![
            TenantRow::new("T", "1."),
            TenantRow::new("T", "1.2."),
            TenantRow::new("T", "3."),
        ];

        let subtree = DataKeyFilter::for_key("1.", true).apply(rows.clone());
        let exact = DataKeyFilter::for_key("1.", false).apply(rows);

        assert_eq!(subtree.len(), 2);
        assert_eq!(exact.len(), 1);
    }
}
