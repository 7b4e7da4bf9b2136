//! Multi-tenant authorization with tenant-to-database sharding.
//!
//! Roles carry packed permission codes; each user's effective permissions are
//! cached under `UserPermissions-{user}` and refreshed after every committed
//! role or tenant change. Tenants live in one or more databases described by
//! [`ShardingEntry`] values, kept in a [`DistributedCache`] with a durable
//! backup table in the relational [`Store`]. [`TenantAdmin`] creates, renames,
//! moves and deletes tenants and keeps their application data in step through a
//! [`TenantChangeService`].
//!
//! # Examples
//!
//! Request-time authorization using the in-memory store and cache (enable
//! `memory-store` and `memory-cache`):
//! ```no_run
//! # #[cfg(all(feature = "memory-store", feature = "memory-cache"))]
//! # async fn run() -> rs_tenant_shard::Result<()> {
//! use rs_tenant_shard::{Decision, EngineBuilder, MemoryCache, MemoryStore, Permission, UserId};
//! let engine = EngineBuilder::new(MemoryStore::new())
//!     .cache(MemoryCache::new())
//!     .build();
//! let user = UserId::new("user_1")?;
//! let permission = Permission::new(12)?;
//! if engine.authorize(&user, permission).await? == Decision::Allow {
//!     // serve the request
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Registering a database for sharded tenants:
//! ```no_run
//! # #[cfg(all(feature = "memory-store", feature = "memory-cache"))]
//! # async fn run() -> rs_tenant_shard::Result<()> {
//! use rs_tenant_shard::{
//!     ConnectionStrings, DatabaseType, MemoryCache, MemoryStore, ShardingEntry,
//!     ShardingRegistryBuilder,
//! };
//! let connections = ConnectionStrings::new().with("EastServer", "Server=east;Database=main");
//! let registry =
//!     ShardingRegistryBuilder::new(MemoryStore::new(), MemoryCache::new(), connections).build();
//! registry
//!     .add(ShardingEntry::new("East1", "EastServer", DatabaseType::SqlServer).with_database_name("Db1"))
//!     .await?;
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

mod admin;
mod cache;
mod change;
mod config;
mod connection;
mod data;
mod engine;
mod error;
mod lock;
mod maintenance;
mod permission;
mod reconcile;
mod refresh;
mod registry;
mod role;
mod roles;
mod selection;
mod sharding;
mod store;
mod tenant;
mod types;
mod unit_of_work;

#[cfg(feature = "memory-cache")]
mod memory_cache;

#[cfg(feature = "memory-store")]
mod memory_store;

#[cfg(feature = "memory-store")]
mod memory_data;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::admin::{NewTenantRequest, TenantAdmin};
pub use crate::cache::{
    DistributedCache, DistributedCacheExt, NoCache, SHARDING_ENTRY_PREFIX, TENANT_DOWN_PREFIX,
    USER_PERMISSIONS_PREFIX, sharding_entry_key, tenant_down_key, user_permissions_key,
};
pub use crate::change::{DataTenantChangeService, MoveOutcome, TenantChangeService, TenantSeeder};
pub use crate::config::{DEFAULT_MAX_SHARED_TENANTS, TenantOptions, TenantType};
pub use crate::connection::{ConnectionStringProvider, ConnectionStrings};
pub use crate::data::{
    DataConnector, DataTransaction, MigrationRunner, NoMigrations, RowRef, TenantDatabase,
    TenantRow, remap_references,
};
pub use crate::engine::{Decision, Engine, EngineBuilder};
pub use crate::error::{Error, Result, SYSTEM_ERROR_MESSAGE, StoreError};
pub use crate::lock::{
    HeldLock, LockConnection, LockConnector, LockGuard, LockStatements, NamedLock, NoLock,
    ProcessLock, SHARDING_LOCK_NAME, SqlAdvisoryLock, lock_statements, with_lock,
};
pub use crate::maintenance::Maintenance;
pub use crate::permission::{ACCESS_ALL, PackedPermissions, Permission};
pub use crate::reconcile::ReconcileOutcome;
pub use crate::refresh::{PermissionRefresher, compute_user_permissions};
pub use crate::registry::{
    DatabaseResolver, DatabaseTarget, ShardingRegistry, ShardingRegistryBuilder,
};
pub use crate::role::{AuthUser, Role, RoleType};
pub use crate::roles::RoleAdmin;
pub use crate::selection::pick_database;
pub use crate::sharding::{DatabaseType, ShardingEntry};
pub use crate::store::{
    ChangeSet, DatabaseUsage, IsolationLevel, RoleStore, ShardingBackupStore, Store,
    StoreTransaction, TenantStore, Transactional,
};
pub use crate::tenant::{
    DataKeyFilter, DataKeyed, NO_QUERY_FILTER, NewTenant, TENANT_NAME_DELIMITER, Tenant,
    TenantMove, compose_full_name, compute_data_key, validate_level_name,
};
pub use crate::types::{RoleName, TenantId, UserId};
pub use crate::unit_of_work::{CommitHook, UnitOfWork};

#[cfg(feature = "memory-store")]
pub use crate::memory_store::{MemoryStore, MemoryStoreError, MemoryTransaction};

#[cfg(feature = "memory-store")]
pub use crate::memory_data::{
    MemoryDataConnector, MemoryDataError, MemoryDataTransaction, MemoryDatabase,
};

#[cfg(feature = "memory-cache")]
pub use crate::memory_cache::MemoryCache;
