//! The sharding entry registry: cache-resident, backed by a durable table.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::cache::{DistributedCache, DistributedCacheExt, SHARDING_ENTRY_PREFIX, sharding_entry_key};
use crate::config::TenantOptions;
use crate::connection::ConnectionStringProvider;
use crate::error::{Error, Result};
use crate::lock::{NamedLock, NoLock, with_lock};
use crate::sharding::{DatabaseType, ShardingEntry};
use crate::store::{IsolationLevel, Store, StoreTransaction, TenantStore, Transactional};
use crate::tenant::Tenant;

/// A resolved database: where a tenant's rows live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatabaseTarget {
    /// Sharding entry name.
    pub name: String,
    /// Literal connection string.
    pub connection_string: String,
    /// Engine type.
    pub database_type: DatabaseType,
}

/// Resolves sharding entry names into databases.
#[async_trait]
pub trait DatabaseResolver: Send + Sync {
    /// Resolves an entry name; `None` means the hybrid default entry.
    async fn resolve(&self, database_info_name: Option<&str>) -> Result<DatabaseTarget>;
}

#[async_trait]
impl<T: DatabaseResolver + ?Sized> DatabaseResolver for Arc<T> {
    async fn resolve(&self, database_info_name: Option<&str>) -> Result<DatabaseTarget> {
        (**self).resolve(database_info_name).await
    }
}

/// Registry of sharding entries.
///
/// Reads come from the distributed cache. Writes go to the durable backup
/// table first and then to the cache, under the registry lock.
pub struct ShardingRegistry<S, C, L = NoLock> {
    store: S,
    cache: C,
    lock: L,
    connections: Arc<dyn ConnectionStringProvider>,
    options: TenantOptions,
}

/// Builder for [`ShardingRegistry`].
pub struct ShardingRegistryBuilder<S, C, L = NoLock> {
    store: S,
    cache: C,
    lock: L,
    connections: Arc<dyn ConnectionStringProvider>,
    options: TenantOptions,
}

impl<S, C> ShardingRegistryBuilder<S, C, NoLock> {
    /// Creates a builder with no lock and default options.
    pub fn new(
        store: S,
        cache: C,
        connections: impl ConnectionStringProvider + 'static,
    ) -> Self {
        Self {
            store,
            cache,
            lock: NoLock,
            connections: Arc::new(connections),
            options: TenantOptions::default().with_sharding(),
        }
    }
}

impl<S, C, L> ShardingRegistryBuilder<S, C, L> {
    /// Sets the lock serializing mutations across instances.
    pub fn lock<L2: NamedLock>(self, lock: L2) -> ShardingRegistryBuilder<S, C, L2> {
        ShardingRegistryBuilder {
            store: self.store,
            cache: self.cache,
            lock,
            connections: self.connections,
            options: self.options,
        }
    }

    /// Sets the options.
    pub fn options(mut self, options: TenantOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the registry.
    pub fn build(self) -> ShardingRegistry<S, C, L> {
        ShardingRegistry {
            store: self.store,
            cache: self.cache,
            lock: self.lock,
            connections: self.connections,
            options: self.options,
        }
    }
}

impl<S, C, L> std::fmt::Debug for ShardingRegistry<S, C, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardingRegistry")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S, C, L> ShardingRegistry<S, C, L>
where
    S: Store,
    C: DistributedCache,
    L: NamedLock,
{
    /// Returns the relational store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the distributed cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Returns the registry lock.
    pub fn lock(&self) -> &L {
        &self.lock
    }

    /// Returns the options.
    pub fn options(&self) -> &TenantOptions {
        &self.options
    }

    /// Returns every entry: the hybrid default (if any) followed by cached entries by name.
    pub async fn list(&self) -> Result<Vec<ShardingEntry>> {
        let mut entries: Vec<ShardingEntry> = self.options.default_entry.iter().cloned().collect();
        entries.extend(self.cached_entries().await?);
        Ok(entries)
    }

    /// Returns the entries held in the cache, excluding the hybrid default.
    pub(crate) async fn cached_entries(&self) -> Result<Vec<ShardingEntry>> {
        let mut keys = self.cache.keys_with_prefix(SHARDING_ENTRY_PREFIX).await?;
        keys.sort();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.cache.get_class::<ShardingEntry>(&key).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Returns an entry by name.
    pub async fn get_by_name(&self, name: &str) -> Result<ShardingEntry> {
        if let Some(entry) = &self.options.default_entry
            && entry.name == name
        {
            return Ok(entry.clone());
        }
        self.cache
            .get_class::<ShardingEntry>(&sharding_entry_key(name))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no sharding entry named '{name}'")))
    }

    /// Adds an entry.
    pub async fn add(&self, entry: ShardingEntry) -> Result<()> {
        self.check_mutable(&entry)?;
        with_lock(&self.lock, &self.options.lock_name, || async {
            if self.exists(&entry.name).await? {
                return Err(Error::Validation(format!(
                    "the sharding entry name '{}' is already used",
                    entry.name
                )));
            }
            self.check_connection(&entry)?;
            self.write_through(&entry).await?;
            info!(name = %entry.name, connection = %entry.connection_name, "sharding entry added");
            Ok(())
        })
        .await
    }

    /// Replaces an existing entry.
    pub async fn update(&self, entry: ShardingEntry) -> Result<()> {
        self.check_mutable(&entry)?;
        with_lock(&self.lock, &self.options.lock_name, || async {
            if !self.exists(&entry.name).await? {
                return Err(Error::NotFound(format!(
                    "no sharding entry named '{}'",
                    entry.name
                )));
            }
            self.check_connection(&entry)?;
            self.write_through(&entry).await?;
            info!(name = %entry.name, connection = %entry.connection_name, "sharding entry updated");
            Ok(())
        })
        .await
    }

    /// Removes an entry that no tenant references.
    pub async fn remove(&self, name: &str) -> Result<()> {
        if self.options.is_default_entry(name) {
            return Err(Error::Validation(format!(
                "the default sharding entry '{name}' comes from configuration and cannot be removed"
            )));
        }
        with_lock(&self.lock, &self.options.lock_name, || async {
            if !self.exists(name).await? {
                return Err(Error::NotFound(format!("no sharding entry named '{name}'")));
            }
            let tenants = self.store.count_tenants_in_database(name).await?;
            if tenants > 0 {
                return Err(Error::Conflict(format!(
                    "the sharding entry '{name}' is used by {tenants} tenant(s)"
                )));
            }
            let mut tx = self.store.begin(IsolationLevel::ReadCommitted).await?;
            tx.remove_backup(name).await?;
            tx.commit().await?;
            if let Err(err) = self.cache.remove(&sharding_entry_key(name)).await {
                error!(name, error = %err, "backup removed but cache entry remains");
                return Err(Error::System(format!(
                    "the sharding entry '{name}' was removed from the backup but not from the cache"
                )));
            }
            info!(name, "sharding entry removed");
            Ok(())
        })
        .await
    }

    /// Resolves the connection string of an entry.
    pub async fn connection_string(&self, name: &str) -> Result<String> {
        let entry = self.get_by_name(name).await?;
        self.connections.for_entry(&entry)
    }

    /// Resolves the connection string holding a tenant's rows.
    pub async fn connection_string_for_tenant(&self, tenant: &Tenant) -> Result<String> {
        Ok(self
            .resolve(tenant.database_info_name.as_deref())
            .await?
            .connection_string)
    }

    /// Returns true when `name` is cached or is the default entry.
    pub(crate) async fn exists(&self, name: &str) -> Result<bool> {
        if self.options.is_default_entry(name) {
            return Ok(true);
        }
        Ok(self.cache.get(&sharding_entry_key(name)).await?.is_some())
    }

    fn check_mutable(&self, entry: &ShardingEntry) -> Result<()> {
        entry.validate_shape()?;
        if self.options.is_default_entry(&entry.name) {
            return Err(Error::Validation(format!(
                "the default sharding entry '{}' comes from configuration and cannot be changed",
                entry.name
            )));
        }
        Ok(())
    }

    fn check_connection(&self, entry: &ShardingEntry) -> Result<()> {
        self.connections.for_entry(entry).map(|_| ()).map_err(|err| {
            Error::Validation(format!(
                "the sharding entry '{}' cannot form a connection string: {}",
                entry.name,
                err.user_message()
            ))
        })
    }

    async fn write_through(&self, entry: &ShardingEntry) -> Result<()> {
        let mut tx = self.store.begin(IsolationLevel::ReadCommitted).await?;
        tx.upsert_backup(entry).await?;
        tx.commit().await?;
        if let Err(err) = self
            .cache
            .set_class(&sharding_entry_key(&entry.name), entry)
            .await
        {
            error!(name = %entry.name, error = %err, "backup written but cache update failed");
            return Err(Error::System(format!(
                "the sharding entry '{}' was saved to the backup but not to the cache",
                entry.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<S, C, L> DatabaseResolver for ShardingRegistry<S, C, L>
where
    S: Store,
    C: DistributedCache,
    L: NamedLock,
{
    async fn resolve(&self, database_info_name: Option<&str>) -> Result<DatabaseTarget> {
        let entry = match database_info_name {
            Some(name) => self.get_by_name(name).await?,
            None => self.options.default_entry.clone().ok_or_else(|| {
                Error::Validation(
                    "the tenant has no database and no default entry is configured".to_string(),
                )
            })?,
        };
        let connection_string = self.connections.for_entry(&entry)?;
        Ok(DatabaseTarget {
            name: entry.name,
            connection_string,
            database_type: entry.database_type,
        })
    }
}
