//! Sharding entries: the databases tenants can be placed in.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_ENTRY_NAME_LEN: usize = 128;

/// Relational engine behind a sharding entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DatabaseType {
    /// Microsoft SQL Server.
    SqlServer,
    /// PostgreSQL.
    Postgres,
    /// SQLite file database.
    Sqlite,
    /// In-process database used by tests.
    InMemory,
}

impl DatabaseType {
    /// Returns true when the engine runs inside the application process.
    ///
    /// Embedded engines serve a single process, so they need no cross-process lock.
    pub fn is_embedded(self) -> bool {
        matches!(self, Self::Sqlite | Self::InMemory)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseType::SqlServer => write!(f, "SqlServer"),
            DatabaseType::Postgres => write!(f, "Postgres"),
            DatabaseType::Sqlite => write!(f, "Sqlite"),
            DatabaseType::InMemory => write!(f, "InMemory"),
        }
    }
}

/// A named database that tenants can be assigned to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShardingEntry {
    /// Unique name, referenced by `Tenant::database_info_name`.
    pub name: String,
    /// Name of a connection string in configuration.
    pub connection_name: String,
    /// Database to use on that connection; `None` keeps the connection's default.
    pub database_name: Option<String>,
    /// Engine type.
    pub database_type: DatabaseType,
}

impl ShardingEntry {
    /// Creates an entry that uses the connection's default database.
    pub fn new(
        name: impl Into<String>,
        connection_name: impl Into<String>,
        database_type: DatabaseType,
    ) -> Self {
        Self {
            name: name.into(),
            connection_name: connection_name.into(),
            database_name: None,
            database_type,
        }
    }

    /// Sets the database name override.
    pub fn with_database_name(mut self, database_name: impl Into<String>) -> Self {
        self.database_name = Some(database_name.into());
        self
    }

    /// Checks the shape of the entry (not whether its connection resolves).
    pub(crate) fn validate_shape(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::Validation(
                "the sharding entry name must not be empty".to_string(),
            ));
        }
        if name.len() != self.name.len() {
            return Err(Error::Validation(format!(
                "the sharding entry name '{}' must not start or end with whitespace",
                self.name
            )));
        }
        if name.len() > MAX_ENTRY_NAME_LEN {
            return Err(Error::Validation(format!(
                "the sharding entry name must be <= {MAX_ENTRY_NAME_LEN} characters"
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(Error::Validation(
                "the sharding entry name contains control characters".to_string(),
            ));
        }
        if self.connection_name.trim().is_empty() {
            return Err(Error::Validation(format!(
                "the sharding entry '{}' has no connection name",
                self.name
            )));
        }
        if let Some(database) = &self.database_name
            && database.trim().is_empty()
        {
            return Err(Error::Validation(format!(
                "the sharding entry '{}' has an empty database name",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_shape_should_reject_empty_name() {
        let entry = ShardingEntry::new("  ", "DefaultConnection", DatabaseType::Postgres);
        assert!(matches!(entry.validate_shape(), Err(Error::Validation(_))));
    }

    #[test]
    fn validate_shape_should_reject_blank_database_name() {
        let entry = ShardingEntry::new("Shard1", "DefaultConnection", DatabaseType::Postgres)
            .with_database_name(" ");
        assert!(matches!(entry.validate_shape(), Err(Error::Validation(_))));
    }

    #[test]
    fn entry_should_round_trip_through_json() {
        let entry = ShardingEntry::new("Shard1", "Server1", DatabaseType::SqlServer)
            .with_database_name("Shard1Db");
        let json = serde_json::to_string(&entry).unwrap();
        let back: ShardingEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn embedded_types_should_be_detected() {
        assert!(DatabaseType::Sqlite.is_embedded());
        assert!(!DatabaseType::SqlServer.is_embedded());
    }
}
