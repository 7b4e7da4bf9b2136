//! Connection string resolution for sharding entries.

use crate::error::{Error, Result};
use crate::sharding::{DatabaseType, ShardingEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resolves a named connection string plus an optional database override.
pub trait ConnectionStringProvider: Send + Sync {
    /// Returns a literal connection string, or an error when none can be formed.
    fn connection_string(
        &self,
        connection_name: &str,
        database_name: Option<&str>,
        database_type: DatabaseType,
    ) -> Result<String>;

    /// Resolves the connection string of a sharding entry.
    fn for_entry(&self, entry: &ShardingEntry) -> Result<String> {
        self.connection_string(
            &entry.connection_name,
            entry.database_name.as_deref(),
            entry.database_type,
        )
    }
}

/// Connection strings from configuration, keyed by connection name.
///
/// Values use the `key=value;key=value` form shared by SQL Server and
/// PostgreSQL drivers. A database override replaces (or adds) the
/// database key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionStrings {
    entries: BTreeMap<String, String>,
}

impl ConnectionStrings {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named connection string.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(name.into(), value.into());
        self
    }

    /// Returns the configured connection names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl ConnectionStringProvider for ConnectionStrings {
    fn connection_string(
        &self,
        connection_name: &str,
        database_name: Option<&str>,
        database_type: DatabaseType,
    ) -> Result<String> {
        let template = self.entries.get(connection_name).ok_or_else(|| {
            Error::Validation(format!(
                "no connection string named '{connection_name}' is configured"
            ))
        })?;
        let mut pairs = parse_pairs(template).map_err(|reason| {
            Error::Validation(format!(
                "the connection string '{connection_name}' is malformed: {reason}"
            ))
        })?;
        if let Some(database) = database_name {
            let keys = database_keys(database_type);
            pairs.retain(|(k, _)| !keys.iter().any(|key| k.eq_ignore_ascii_case(key)));
            pairs.push((keys[0].to_string(), database.to_string()));
        }
        if database_type != DatabaseType::InMemory && pairs.is_empty() {
            return Err(Error::Validation(format!(
                "the connection string '{connection_name}' is empty"
            )));
        }
        if database_type == DatabaseType::SqlServer
            && !pairs
                .iter()
                .any(|(k, _)| SQL_SERVER_HOST_KEYS.iter().any(|key| k.eq_ignore_ascii_case(key)))
        {
            return Err(Error::Validation(format!(
                "the connection string '{connection_name}' names no server"
            )));
        }
        Ok(pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";"))
    }
}

const SQL_SERVER_HOST_KEYS: [&str; 5] =
    ["Data Source", "Server", "Address", "Addr", "Network Address"];

/// Keys naming the database for each engine; the first is written on override.
fn database_keys(database_type: DatabaseType) -> &'static [&'static str] {
    match database_type {
        DatabaseType::SqlServer => &["Database", "Initial Catalog"],
        DatabaseType::Postgres => &["Database"],
        DatabaseType::Sqlite | DatabaseType::InMemory => &["Data Source"],
    }
}

fn parse_pairs(value: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    for part in value.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, val) = part
            .split_once('=')
            .ok_or_else(|| format!("segment '{part}' is not key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("segment '{part}' has an empty key"));
        }
        pairs.push((key.to_string(), val.trim().to_string()));
    }
    Ok(pairs)
}
