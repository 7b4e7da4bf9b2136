//! Recomputing cached user permissions after role changes commit.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::{DistributedCache, user_permissions_key};
use crate::config::TenantType;
use crate::error::Result;
use crate::permission::PackedPermissions;
use crate::role::{Role, RoleType};
use crate::store::{ChangeSet, RoleStore, TenantStore};
use crate::types::{RoleName, UserId};
use crate::unit_of_work::CommitHook;

/// Computes a user's effective packed permissions.
///
/// Unions the user's roles with the `TenantAutoAdd` roles of the user's
/// tenant when tenants are in use. Returns `None` for unknown or disabled
/// users and for users left without any role.
pub async fn compute_user_permissions<S>(
    store: &S,
    user: &UserId,
    tenant_type: TenantType,
) -> Result<Option<PackedPermissions>>
where
    S: RoleStore + TenantStore + Sync,
{
    let Some(user) = store.user(user).await? else {
        return Ok(None);
    };
    if user.is_disabled {
        return Ok(None);
    }

    let mut roles: Vec<Role> = Vec::new();
    for name in &user.roles {
        if let Some(role) = store.role(name).await? {
            roles.push(role);
        }
    }
    if tenant_type.is_multi_tenant()
        && let Some(tenant_id) = user.tenant_id
        && let Some(tenant) = store.tenant(tenant_id).await?
    {
        for name in &tenant.tenant_roles {
            if let Some(role) = store.role(name).await?
                && role.role_type == RoleType::TenantAutoAdd
            {
                roles.push(role);
            }
        }
    }
    if roles.is_empty() {
        return Ok(None);
    }
    Ok(Some(PackedPermissions::union(
        roles.iter().map(|role| &role.permissions),
    )))
}

/// Commit hook rewriting `UserPermissions-{user}` for every affected user.
#[derive(Debug, Clone)]
pub struct PermissionRefresher<S, C> {
    store: S,
    cache: C,
    tenant_type: TenantType,
}

impl<S, C> PermissionRefresher<S, C>
where
    S: RoleStore + TenantStore + Send + Sync,
    C: DistributedCache,
{
    /// Creates a refresher.
    pub fn new(store: S, cache: C, tenant_type: TenantType) -> Self {
        Self {
            store,
            cache,
            tenant_type,
        }
    }

    /// Returns every user whose permissions may have changed.
    pub async fn affected_users(&self, changes: &ChangeSet) -> Result<BTreeSet<UserId>> {
        let mut users = changes.users.clone();
        for role in &changes.roles {
            users.extend(self.store.users_with_role(role).await?);
        }
        if self.tenant_type.is_multi_tenant() {
            let mut tenants = changes.tenant_roles.clone();
            if !changes.roles.is_empty() {
                for tenant in self.store.tenants().await? {
                    if tenant
                        .tenant_roles
                        .iter()
                        .any(|role: &RoleName| changes.roles.contains(role))
                    {
                        tenants.insert(tenant.id);
                    }
                }
            }
            for tenant in tenants {
                users.extend(self.store.users_in_tenant(tenant).await?);
            }
        }
        Ok(users)
    }

    /// Recomputes and caches one user's permissions.
    pub async fn refresh_user(&self, user: &UserId) -> Result<()> {
        let key = user_permissions_key(user.as_str());
        match compute_user_permissions(&self.store, user, self.tenant_type).await? {
            Some(packed) => {
                self.cache.set(&key, packed.as_str().to_string()).await?;
                debug!(user = %user, "user permissions refreshed");
            }
            None => {
                self.cache.remove(&key).await?;
                debug!(user = %user, "user permissions cleared");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S, C> CommitHook for PermissionRefresher<S, C>
where
    S: RoleStore + TenantStore + Send + Sync,
    C: DistributedCache,
{
    async fn after_commit(&self, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        for user in self.affected_users(changes).await? {
            self.refresh_user(&user).await?;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "memory-store", feature = "memory-cache"))]
mod tests {
    use super::*;
    use crate::memory_cache::MemoryCache;
    use crate::memory_store::MemoryStore;
    use crate::permission::Permission;
    use crate::role::AuthUser;
    use crate::store::{IsolationLevel, StoreTransaction, Transactional};
    use crate::tenant::NewTenant;
    use futures::executor::block_on;

    fn packed(codes: &[u16]) -> PackedPermissions {
        PackedPermissions::pack(codes.iter().map(|c| Permission::new(*c).unwrap()))
    }

    #[test]
    fn union_should_include_tenant_auto_add_roles() {
        let store = MemoryStore::new();
        store.add_role(Role::new(RoleName::new("Reader").unwrap(), packed(&[1, 2])));
        store.add_role(
            Role::new(RoleName::new("AutoTenant").unwrap(), packed(&[2, 9]))
                .with_type(RoleType::TenantAutoAdd),
        );
        store.add_role(
            Role::new(RoleName::new("AdminOnly").unwrap(), packed(&[7]))
                .with_type(RoleType::TenantAdminAdd),
        );
        let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
        let tenant = block_on(tx.insert_tenant(NewTenant {
            full_name: "Acme".to_string(),
            parent_id: None,
            is_hierarchical: false,
            database_info_name: None,
            has_own_db: false,
            tenant_roles: vec![
                RoleName::new("AutoTenant").unwrap(),
                RoleName::new("AdminOnly").unwrap(),
            ],
        }))
        .unwrap();
        block_on(tx.commit()).unwrap();
        let mut user =
            AuthUser::new(UserId::new("u1").unwrap(), "u1@example.com").in_tenant(tenant.id);
        user.roles.push(RoleName::new("Reader").unwrap());
        store.add_user(user);
        let id = UserId::new("u1").unwrap();

        let multi =
            block_on(compute_user_permissions(&store, &id, TenantType::SingleLevel)).unwrap();
        let none =
            block_on(compute_user_permissions(&store, &id, TenantType::NotUsingTenants)).unwrap();

        assert_eq!(multi, Some(packed(&[1, 2, 9])));
        assert_eq!(none, Some(packed(&[1, 2])));
    }

    #[test]
    fn disabled_user_should_have_no_permissions() {
        let store = MemoryStore::new();
        store.add_role(Role::new(RoleName::new("Reader").unwrap(), packed(&[1])));
        let mut user = AuthUser::new(UserId::new("u1").unwrap(), "u1@example.com");
        user.roles.push(RoleName::new("Reader").unwrap());
        user.is_disabled = true;
        store.add_user(user);

        let result = block_on(compute_user_permissions(
            &store,
            &UserId::new("u1").unwrap(),
            TenantType::NotUsingTenants,
        ))
        .unwrap();

        assert_eq!(result, None);
    }

    #[test]
    fn refresh_should_clear_entry_of_user_without_roles() {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        store.add_user(AuthUser::new(UserId::new("u1").unwrap(), "u1@example.com"));
        block_on(cache.set(&user_permissions_key("u1"), "stale".to_string())).unwrap();
        let refresher = PermissionRefresher::new(store, cache.clone(), TenantType::SingleLevel);

        block_on(refresher.refresh_user(&UserId::new("u1").unwrap())).unwrap();

        assert!(cache.is_empty());
    }
}
