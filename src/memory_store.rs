use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::StoreError;
use crate::role::{AuthUser, Role};
use crate::sharding::ShardingEntry;
use crate::store::{
    ChangeSet, DatabaseUsage, IsolationLevel, RoleStore, ShardingBackupStore, StoreTransaction,
    TenantStore, Transactional,
};
use crate::tenant::{NewTenant, Tenant};
use crate::types::{RoleName, TenantId, UserId};

/// Errors raised by [`MemoryStore`].
#[derive(Debug, Error)]
pub enum MemoryStoreError {
    /// A serializable transaction saw a concurrent commit.
    #[error("could not serialize access due to a concurrent update")]
    SerializationConflict,
    /// The tenant's concurrency token did not match.
    #[error("tenant {0} was changed by another user")]
    ConcurrencyConflict(TenantId),
    /// Unique index violation on the tenant full name.
    #[error("a tenant named '{0}' already exists")]
    DuplicateTenantName(String),
    /// Referenced tenant is missing.
    #[error("tenant {0} does not exist")]
    UnknownTenant(TenantId),
    /// Referenced user is missing.
    #[error("user {0} does not exist")]
    UnknownUser(UserId),
    /// Referenced role is missing.
    #[error("role {0} does not exist")]
    UnknownRole(RoleName),
    /// Failure requested through [`MemoryStore::fail_next_commit`].
    #[error("injected commit failure")]
    InjectedFailure,
}

/// In-memory relational store for tests and demos.
///
/// Transactions buffer their writes and replay them on commit. Serializable
/// transactions fail on commit when another transaction committed after they
/// began.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<State>,
    next_tenant_id: AtomicU32,
    fail_next_commit: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    version: u64,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    tenants: BTreeMap<TenantId, Tenant>,
    backups: BTreeMap<String, ShardingEntry>,
    roles: BTreeMap<RoleName, Role>,
    users: BTreeMap<UserId, AuthUser>,
}

#[derive(Debug, Clone)]
enum Op {
    InsertTenant(Tenant),
    UpdateTenant(Tenant),
    DeleteTenant(TenantId),
    UpsertBackup(ShardingEntry),
    RemoveBackup(String),
    UpsertRole(Role),
    DeleteRole(RoleName),
    UpsertUser(AuthUser),
    AddUserRole(UserId, RoleName),
    RemoveUserRole(UserId, RoleName),
}

impl Tables {
    fn apply(&mut self, op: &Op) -> std::result::Result<(), MemoryStoreError> {
        match op {
            Op::InsertTenant(tenant) => {
                self.ensure_unique_name(tenant)?;
                self.tenants.insert(tenant.id, tenant.clone());
            }
            Op::UpdateTenant(tenant) => {
                let stored = self
                    .tenants
                    .get(&tenant.id)
                    .ok_or(MemoryStoreError::UnknownTenant(tenant.id))?;
                if stored.version + 1 != tenant.version {
                    return Err(MemoryStoreError::ConcurrencyConflict(tenant.id));
                }
                self.ensure_unique_name(tenant)?;
                self.tenants.insert(tenant.id, tenant.clone());
            }
            Op::DeleteTenant(id) => {
                self.tenants
                    .remove(id)
                    .ok_or(MemoryStoreError::UnknownTenant(*id))?;
            }
            Op::UpsertBackup(entry) => {
                self.backups.insert(entry.name.clone(), entry.clone());
            }
            Op::RemoveBackup(name) => {
                self.backups.remove(name);
            }
            Op::UpsertRole(role) => {
                self.roles.insert(role.name.clone(), role.clone());
            }
            Op::DeleteRole(name) => {
                self.roles.remove(name);
                for user in self.users.values_mut() {
                    user.roles.retain(|role| role != name);
                }
                for tenant in self.tenants.values_mut() {
                    tenant.tenant_roles.retain(|role| role != name);
                }
            }
            Op::UpsertUser(user) => {
                self.users.insert(user.id.clone(), user.clone());
            }
            Op::AddUserRole(user, role) => {
                if !self.roles.contains_key(role) {
                    return Err(MemoryStoreError::UnknownRole(role.clone()));
                }
                let stored = self
                    .users
                    .get_mut(user)
                    .ok_or_else(|| MemoryStoreError::UnknownUser(user.clone()))?;
                if !stored.roles.contains(role) {
                    stored.roles.push(role.clone());
                }
            }
            Op::RemoveUserRole(user, role) => {
                let stored = self
                    .users
                    .get_mut(user)
                    .ok_or_else(|| MemoryStoreError::UnknownUser(user.clone()))?;
                stored.roles.retain(|existing| existing != role);
            }
        }
        Ok(())
    }

    fn ensure_unique_name(&self, tenant: &Tenant) -> std::result::Result<(), MemoryStoreError> {
        let taken = self
            .tenants
            .values()
            .any(|other| other.id != tenant.id && other.full_name == tenant.full_name);
        if taken {
            return Err(MemoryStoreError::DuplicateTenantName(
                tenant.full_name.clone(),
            ));
        }
        Ok(())
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a role without going through a transaction.
    pub fn add_role(&self, role: Role) {
        let mut guard = self.inner.state.write().expect("poisoned lock");
        guard.tables.roles.insert(role.name.clone(), role);
    }

    /// Adds a user without going through a transaction.
    pub fn add_user(&self, user: AuthUser) {
        let mut guard = self.inner.state.write().expect("poisoned lock");
        guard.tables.users.insert(user.id.clone(), user);
    }

    /// Adds a sharding backup row without going through a transaction.
    pub fn add_backup(&self, entry: ShardingEntry) {
        let mut guard = self.inner.state.write().expect("poisoned lock");
        guard.tables.backups.insert(entry.name.clone(), entry);
    }

    /// Makes the next commit fail, as a lost connection would.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let guard = self.inner.state.read().expect("poisoned lock");
        f(&guard.tables)
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn tenant(&self, id: TenantId) -> std::result::Result<Option<Tenant>, StoreError> {
        Ok(self.read(|tables| tables.tenants.get(&id).cloned()))
    }

    async fn tenant_by_full_name(
        &self,
        full_name: &str,
    ) -> std::result::Result<Option<Tenant>, StoreError> {
        Ok(self.read(|tables| {
            tables
                .tenants
                .values()
                .find(|tenant| tenant.full_name == full_name)
                .cloned()
        }))
    }

    async fn tenants(&self) -> std::result::Result<Vec<Tenant>, StoreError> {
        Ok(self.read(|tables| tables.tenants.values().cloned().collect()))
    }

    async fn count_tenants_in_database(
        &self,
        name: &str,
    ) -> std::result::Result<usize, StoreError> {
        Ok(self.read(|tables| {
            tables
                .tenants
                .values()
                .filter(|tenant| tenant.database_info_name.as_deref() == Some(name))
                .count()
        }))
    }

    async fn database_usage(&self) -> std::result::Result<Vec<DatabaseUsage>, StoreError> {
        Ok(self.read(|tables| {
            let mut usage: BTreeMap<&str, DatabaseUsage> = BTreeMap::new();
            for tenant in tables.tenants.values() {
                let Some(name) = tenant.database_info_name.as_deref() else {
                    continue;
                };
                let entry = usage.entry(name).or_insert_with(|| DatabaseUsage {
                    database_info_name: name.to_string(),
                    ..DatabaseUsage::default()
                });
                entry.tenant_count += 1;
                entry.has_own_db_tenant |= tenant.has_own_db;
            }
            usage.into_values().collect()
        }))
    }
}

#[async_trait]
impl ShardingBackupStore for MemoryStore {
    async fn backups(&self) -> std::result::Result<Vec<ShardingEntry>, StoreError> {
        Ok(self.read(|tables| tables.backups.values().cloned().collect()))
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn role(&self, name: &RoleName) -> std::result::Result<Option<Role>, StoreError> {
        Ok(self.read(|tables| tables.roles.get(name).cloned()))
    }

    async fn user(&self, id: &UserId) -> std::result::Result<Option<AuthUser>, StoreError> {
        Ok(self.read(|tables| tables.users.get(id).cloned()))
    }

    async fn users_with_role(
        &self,
        role: &RoleName,
    ) -> std::result::Result<Vec<UserId>, StoreError> {
        Ok(self.read(|tables| {
            tables
                .users
                .values()
                .filter(|user| user.roles.contains(role))
                .map(|user| user.id.clone())
                .collect()
        }))
    }

    async fn users_in_tenant(
        &self,
        tenant: TenantId,
    ) -> std::result::Result<Vec<UserId>, StoreError> {
        Ok(self.read(|tables| {
            tables
                .users
                .values()
                .filter(|user| user.tenant_id == Some(tenant))
                .map(|user| user.id.clone())
                .collect()
        }))
    }
}

#[async_trait]
impl Transactional for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> std::result::Result<MemoryTransaction, StoreError> {
        let guard = self.inner.state.read().expect("poisoned lock");
        Ok(MemoryTransaction {
            inner: self.inner.clone(),
            isolation,
            base_version: guard.version,
            working: guard.tables.clone(),
            ops: Vec::new(),
            changes: ChangeSet::default(),
        })
    }
}

/// Transaction over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    isolation: IsolationLevel,
    base_version: u64,
    working: Tables,
    ops: Vec<Op>,
    changes: ChangeSet,
}

impl MemoryTransaction {
    fn push(&mut self, op: Op) -> std::result::Result<(), StoreError> {
        self.working.apply(&op)?;
        self.ops.push(op);
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn tenant(&mut self, id: TenantId) -> std::result::Result<Option<Tenant>, StoreError> {
        Ok(self.working.tenants.get(&id).cloned())
    }

    async fn tenants(&mut self) -> std::result::Result<Vec<Tenant>, StoreError> {
        Ok(self.working.tenants.values().cloned().collect())
    }

    async fn insert_tenant(
        &mut self,
        tenant: NewTenant,
    ) -> std::result::Result<Tenant, StoreError> {
        let id = TenantId::new(self.inner.next_tenant_id.fetch_add(1, Ordering::SeqCst) + 1);
        let stored = Tenant {
            id,
            full_name: tenant.full_name,
            parent_id: tenant.parent_id,
            is_hierarchical: tenant.is_hierarchical,
            data_key: String::new(),
            database_info_name: tenant.database_info_name,
            has_own_db: tenant.has_own_db,
            tenant_roles: tenant.tenant_roles,
            version: 0,
        };
        self.push(Op::InsertTenant(stored.clone()))?;
        Ok(stored)
    }

    async fn update_tenant(&mut self, tenant: &Tenant) -> std::result::Result<Tenant, StoreError> {
        let previous_roles = self
            .working
            .tenants
            .get(&tenant.id)
            .map(|stored| stored.tenant_roles.clone());
        let mut next = tenant.clone();
        next.version += 1;
        self.push(Op::UpdateTenant(next.clone()))?;
        if previous_roles.as_ref() != Some(&next.tenant_roles) {
            self.changes.tenant_roles.insert(next.id);
        }
        Ok(next)
    }

    async fn delete_tenant(&mut self, id: TenantId) -> std::result::Result<(), StoreError> {
        self.push(Op::DeleteTenant(id))
    }

    async fn upsert_backup(
        &mut self,
        entry: &ShardingEntry,
    ) -> std::result::Result<(), StoreError> {
        self.push(Op::UpsertBackup(entry.clone()))
    }

    async fn remove_backup(&mut self, name: &str) -> std::result::Result<(), StoreError> {
        self.push(Op::RemoveBackup(name.to_string()))
    }

    async fn upsert_role(&mut self, role: &Role) -> std::result::Result<(), StoreError> {
        if self.working.roles.get(&role.name) != Some(role) {
            self.changes.roles.insert(role.name.clone());
        }
        self.push(Op::UpsertRole(role.clone()))
    }

    async fn delete_role(&mut self, name: &RoleName) -> std::result::Result<(), StoreError> {
        if !self.working.roles.contains_key(name) {
            return Err(Box::new(MemoryStoreError::UnknownRole(name.clone())));
        }
        let holders: Vec<UserId> = self
            .working
            .users
            .values()
            .filter(|user| user.roles.contains(name))
            .map(|user| user.id.clone())
            .collect();
        let tenants: Vec<TenantId> = self
            .working
            .tenants
            .values()
            .filter(|tenant| tenant.tenant_roles.contains(name))
            .map(|tenant| tenant.id)
            .collect();
        self.push(Op::DeleteRole(name.clone()))?;
        self.changes.roles.insert(name.clone());
        self.changes.users.extend(holders);
        self.changes.tenant_roles.extend(tenants);
        Ok(())
    }

    async fn upsert_user(&mut self, user: &AuthUser) -> std::result::Result<(), StoreError> {
        if self.working.users.get(&user.id) != Some(user) {
            self.changes.users.insert(user.id.clone());
        }
        self.push(Op::UpsertUser(user.clone()))
    }

    async fn add_user_role(
        &mut self,
        user: &UserId,
        role: &RoleName,
    ) -> std::result::Result<(), StoreError> {
        self.push(Op::AddUserRole(user.clone(), role.clone()))?;
        self.changes.users.insert(user.clone());
        Ok(())
    }

    async fn remove_user_role(
        &mut self,
        user: &UserId,
        role: &RoleName,
    ) -> std::result::Result<(), StoreError> {
        self.push(Op::RemoveUserRole(user.clone(), role.clone()))?;
        self.changes.users.insert(user.clone());
        Ok(())
    }

    async fn commit(self) -> std::result::Result<ChangeSet, StoreError> {
        if self.inner.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(Box::new(MemoryStoreError::InjectedFailure));
        }
        let mut guard = self.inner.state.write().expect("poisoned lock");
        if self.ops.is_empty() {
            return Ok(self.changes);
        }
        if self.isolation == IsolationLevel::Serializable && guard.version != self.base_version {
            return Err(Box::new(MemoryStoreError::SerializationConflict));
        }
        let mut tables = guard.tables.clone();
        for op in &self.ops {
            tables.apply(op)?;
        }
        guard.tables = tables;
        guard.version += 1;
        Ok(self.changes)
    }

    async fn rollback(self) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{PackedPermissions, Permission};
    use futures::executor::block_on;

    fn new_tenant(name: &str) -> NewTenant {
        NewTenant {
            full_name: name.to_string(),
            parent_id: None,
            is_hierarchical: false,
            database_info_name: Some("Shard1".to_string()),
            has_own_db: false,
            tenant_roles: Vec::new(),
        }
    }

    #[test]
    fn rollback_should_discard_writes() {
        let store = MemoryStore::new();
        let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        block_on(tx.insert_tenant(new_tenant("Acme"))).unwrap();
        block_on(tx.rollback()).unwrap();

        assert!(block_on(store.tenants()).unwrap().is_empty());
    }

    #[test]
    fn commit_should_publish_writes() {
        let store = MemoryStore::new();
        let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        let tenant = block_on(tx.insert_tenant(new_tenant("Acme"))).unwrap();
        block_on(tx.commit()).unwrap();

        let stored = block_on(store.tenant(tenant.id)).unwrap().unwrap();
        assert_eq!(stored.full_name, "Acme");
        assert_eq!(block_on(store.count_tenants_in_database("Shard1")).unwrap(), 1);
    }

    #[test]
    fn serializable_commit_should_fail_after_concurrent_commit() {
        let store = MemoryStore::new();
        let mut first = block_on(store.begin(IsolationLevel::Serializable)).unwrap();
        let mut second = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        block_on(second.insert_tenant(new_tenant("B"))).unwrap();
        block_on(second.commit()).unwrap();
        block_on(first.insert_tenant(new_tenant("A"))).unwrap();

        assert!(block_on(first.commit()).is_err());
    }

    #[test]
    fn duplicate_full_name_should_be_rejected() {
        let store = MemoryStore::new();
        let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        block_on(tx.insert_tenant(new_tenant("Acme"))).unwrap();

        assert!(block_on(tx.insert_tenant(new_tenant("Acme"))).is_err());
    }

    #[test]
    fn stale_tenant_update_should_conflict() {
        let store = MemoryStore::new();
        let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        let tenant = block_on(tx.insert_tenant(new_tenant("Acme"))).unwrap();
        let updated = block_on(tx.update_tenant(&tenant)).unwrap();
        assert_eq!(updated.version, 1);

        assert!(block_on(tx.update_tenant(&tenant)).is_err());
    }

    #[test]
    fn change_set_should_track_role_and_user_writes() {
        let store = MemoryStore::new();
        let user = UserId::try_from("user_1").unwrap();
        let role = RoleName::try_from("Reader").unwrap();
        store.add_user(AuthUser::new(user.clone(), "u1@example.com"));

        let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        let perms = PackedPermissions::pack([Permission::new(1).unwrap()]);
        block_on(tx.upsert_role(&Role::new(role.clone(), perms))).unwrap();
        block_on(tx.add_user_role(&user, &role)).unwrap();
        let changes = block_on(tx.commit()).unwrap();

        assert!(changes.roles.contains(&role));
        assert!(changes.users.contains(&user));
        assert_eq!(block_on(store.users_with_role(&role)).unwrap(), vec![user]);
    }

    #[test]
    fn injected_failure_should_fail_commit_once() {
        let store = MemoryStore::new();
        store.fail_next_commit();
        let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        block_on(tx.insert_tenant(new_tenant("Acme"))).unwrap();
        assert!(block_on(tx.commit()).is_err());

        let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        block_on(tx.insert_tenant(new_tenant("Acme"))).unwrap();
        assert!(block_on(tx.commit()).is_ok());
    }
}
