use crate::error::StoreError;
use crate::role::{AuthUser, Role};
use crate::sharding::ShardingEntry;
use crate::tenant::{NewTenant, Tenant};
use crate::types::{RoleName, TenantId, UserId};
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Transaction isolation requested from a store.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IsolationLevel {
    /// The engine's default level.
    #[default]
    ReadCommitted,
    /// Full serializability, used for tenant data moves and deletes.
    Serializable,
}

/// What a committed transaction changed, for post-commit hooks.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChangeSet {
    /// Roles created, deleted or whose permissions changed.
    pub roles: BTreeSet<RoleName>,
    /// Users created, deleted or whose role assignments changed.
    pub users: BTreeSet<UserId>,
    /// Tenants whose tenant roles changed.
    pub tenant_roles: BTreeSet<TenantId>,
}

impl ChangeSet {
    /// Returns true when nothing permission-related changed.
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.users.is_empty() && self.tenant_roles.is_empty()
    }

    /// Merges another change set into this one.
    pub fn extend(&mut self, other: ChangeSet) {
        self.roles.extend(other.roles);
        self.users.extend(other.users);
        self.tenant_roles.extend(other.tenant_roles);
    }
}

/// Number of tenants placed in one sharding entry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DatabaseUsage {
    /// Sharding entry name.
    pub database_info_name: String,
    /// Tenants referencing the entry.
    pub tenant_count: usize,
    /// Whether one of those tenants owns the database.
    pub has_own_db_tenant: bool,
}

/// Read access to tenant rows.
#[async_trait]
pub trait TenantStore {
    /// Returns a tenant by id.
    async fn tenant(&self, id: TenantId) -> std::result::Result<Option<Tenant>, StoreError>;

    /// Returns a tenant by its full name.
    async fn tenant_by_full_name(
        &self,
        full_name: &str,
    ) -> std::result::Result<Option<Tenant>, StoreError>;

    /// Returns every tenant.
    async fn tenants(&self) -> std::result::Result<Vec<Tenant>, StoreError>;

    /// Counts tenants whose `database_info_name` equals `name`.
    async fn count_tenants_in_database(
        &self,
        name: &str,
    ) -> std::result::Result<usize, StoreError>;

    /// Returns tenant counts grouped by sharding entry.
    async fn database_usage(&self) -> std::result::Result<Vec<DatabaseUsage>, StoreError>;
}

/// Read access to the durable sharding backup table.
#[async_trait]
pub trait ShardingBackupStore {
    /// Returns every backed-up sharding entry.
    async fn backups(&self) -> std::result::Result<Vec<ShardingEntry>, StoreError>;
}

/// Read access to roles and users.
#[async_trait]
pub trait RoleStore {
    /// Returns a role by name.
    async fn role(&self, name: &RoleName) -> std::result::Result<Option<Role>, StoreError>;

    /// Returns a user by id.
    async fn user(&self, id: &UserId) -> std::result::Result<Option<AuthUser>, StoreError>;

    /// Returns users directly assigned `role`.
    async fn users_with_role(
        &self,
        role: &RoleName,
    ) -> std::result::Result<Vec<UserId>, StoreError>;

    /// Returns users belonging to `tenant`.
    async fn users_in_tenant(
        &self,
        tenant: TenantId,
    ) -> std::result::Result<Vec<UserId>, StoreError>;
}

/// Stores that can open write transactions.
#[async_trait]
pub trait Transactional {
    /// Transaction type.
    type Tx: StoreTransaction;

    /// Begins a transaction.
    async fn begin(&self, isolation: IsolationLevel) -> std::result::Result<Self::Tx, StoreError>;
}

/// A write transaction over the authorization tables.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Reads a tenant inside the transaction.
    async fn tenant(&mut self, id: TenantId) -> std::result::Result<Option<Tenant>, StoreError>;

    /// Reads every tenant inside the transaction.
    async fn tenants(&mut self) -> std::result::Result<Vec<Tenant>, StoreError>;

    /// Inserts a tenant and returns it with its assigned id.
    ///
    /// The returned tenant has an empty data key; callers derive it from the id.
    async fn insert_tenant(&mut self, tenant: NewTenant)
    -> std::result::Result<Tenant, StoreError>;

    /// Updates a tenant, checking its concurrency token.
    ///
    /// Returns the stored tenant with its bumped version.
    async fn update_tenant(&mut self, tenant: &Tenant) -> std::result::Result<Tenant, StoreError>;

    /// Deletes a tenant.
    async fn delete_tenant(&mut self, id: TenantId) -> std::result::Result<(), StoreError>;

    /// Inserts or replaces a sharding backup row.
    async fn upsert_backup(&mut self, entry: &ShardingEntry) -> std::result::Result<(), StoreError>;

    /// Removes a sharding backup row.
    async fn remove_backup(&mut self, name: &str) -> std::result::Result<(), StoreError>;

    /// Inserts or replaces a role.
    async fn upsert_role(&mut self, role: &Role) -> std::result::Result<(), StoreError>;

    /// Deletes a role and its user assignments.
    async fn delete_role(&mut self, name: &RoleName) -> std::result::Result<(), StoreError>;

    /// Inserts or replaces a user.
    async fn upsert_user(&mut self, user: &AuthUser) -> std::result::Result<(), StoreError>;

    /// Assigns a role to a user.
    async fn add_user_role(
        &mut self,
        user: &UserId,
        role: &RoleName,
    ) -> std::result::Result<(), StoreError>;

    /// Removes a role from a user.
    async fn remove_user_role(
        &mut self,
        user: &UserId,
        role: &RoleName,
    ) -> std::result::Result<(), StoreError>;

    /// Commits and reports what changed.
    async fn commit(self) -> std::result::Result<ChangeSet, StoreError>;

    /// Discards every write.
    async fn rollback(self) -> std::result::Result<(), StoreError>;
}

/// Composite store trait.
pub trait Store:
    TenantStore + ShardingBackupStore + RoleStore + Transactional + Send + Sync
{
}

impl<T> Store for T where
    T: TenantStore + ShardingBackupStore + RoleStore + Transactional + Send + Sync
{
}
