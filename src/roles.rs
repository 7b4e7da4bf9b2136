//! Role and user-role administration.

use std::sync::Arc;

use tracing::info;

use crate::cache::DistributedCache;
use crate::config::TenantType;
use crate::error::{Error, Result};
use crate::permission::PackedPermissions;
use crate::refresh::PermissionRefresher;
use crate::role::{AuthUser, Role, RoleType};
use crate::store::{IsolationLevel, RoleStore, Store, StoreTransaction, TenantStore};
use crate::tenant::Tenant;
use crate::types::{RoleName, TenantId, UserId};
use crate::unit_of_work::{CommitHook, UnitOfWork};

/// Writes roles, users and tenant roles, refreshing cached permissions after each commit.
pub struct RoleAdmin<S, C> {
    store: S,
    refresher: Arc<PermissionRefresher<S, C>>,
}

impl<S, C> RoleAdmin<S, C>
where
    S: Store + Clone + 'static,
    C: DistributedCache + Clone + 'static,
{
    /// Creates a role admin.
    pub fn new(store: S, cache: C, tenant_type: TenantType) -> Self {
        let refresher = Arc::new(PermissionRefresher::new(store.clone(), cache, tenant_type));
        Self { store, refresher }
    }

    /// Returns the refresher, for registering on other units of work.
    pub fn refresher(&self) -> Arc<PermissionRefresher<S, C>> {
        self.refresher.clone()
    }

    /// Creates a role.
    pub async fn create_role(&self, role: Role) -> Result<()> {
        if self.store.role(&role.name).await?.is_some() {
            return Err(Error::Validation(format!(
                "the role name '{}' is already used",
                role.name
            )));
        }
        let mut uow = self.begin().await?;
        uow.tx().upsert_role(&role).await?;
        uow.commit().await?;
        info!(role = %role.name, "role created");
        Ok(())
    }

    /// Replaces a role's permissions and type.
    pub async fn update_role(&self, role: Role) -> Result<()> {
        self.require_role(&role.name).await?;
        let mut uow = self.begin().await?;
        uow.tx().upsert_role(&role).await?;
        uow.commit().await?;
        info!(role = %role.name, "role updated");
        Ok(())
    }

    /// Replaces a role's permissions.
    pub async fn set_role_permissions(
        &self,
        name: &RoleName,
        permissions: PackedPermissions,
    ) -> Result<()> {
        let role = self.require_role(name).await?;
        self.update_role(Role {
            permissions,
            ..role
        })
        .await
    }

    /// Deletes a role.
    ///
    /// Fails with [`Error::Conflict`] while users hold the role unless
    /// `remove_from_users` is set.
    pub async fn delete_role(&self, name: &RoleName, remove_from_users: bool) -> Result<()> {
        self.require_role(name).await?;
        let holders = self.store.users_with_role(name).await?;
        if !holders.is_empty() && !remove_from_users {
            return Err(Error::Conflict(format!(
                "the role '{name}' is used by {} user(s)",
                holders.len()
            )));
        }
        let mut uow = self.begin().await?;
        uow.tx().delete_role(name).await?;
        uow.commit().await?;
        info!(role = %name, users = holders.len(), "role deleted");
        Ok(())
    }

    /// Adds or replaces a user.
    pub async fn save_user(&self, user: AuthUser) -> Result<()> {
        for role in &user.roles {
            self.check_assignable(&user, role).await?;
        }
        let mut uow = self.begin().await?;
        uow.tx().upsert_user(&user).await?;
        uow.commit().await?;
        Ok(())
    }

    /// Assigns a role to a user.
    pub async fn add_role_to_user(&self, user: &UserId, role: &RoleName) -> Result<()> {
        let stored = self.require_user(user).await?;
        self.check_assignable(&stored, role).await?;
        let mut uow = self.begin().await?;
        uow.tx().add_user_role(user, role).await?;
        uow.commit().await?;
        info!(user = %user, role = %role, "role added to user");
        Ok(())
    }

    /// Removes a role from a user.
    pub async fn remove_role_from_user(&self, user: &UserId, role: &RoleName) -> Result<()> {
        let stored = self.require_user(user).await?;
        if !stored.roles.contains(role) {
            return Err(Error::NotFound(format!(
                "the user '{user}' does not have the role '{role}'"
            )));
        }
        let mut uow = self.begin().await?;
        uow.tx().remove_user_role(user, role).await?;
        uow.commit().await?;
        info!(user = %user, role = %role, "role removed from user");
        Ok(())
    }

    /// Replaces the roles attached to a tenant.
    pub async fn set_tenant_roles(&self, tenant: TenantId, roles: Vec<RoleName>) -> Result<()> {
        for name in &roles {
            let role = self.require_role(name).await?;
            if role.role_type == RoleType::Normal {
                return Err(Error::Validation(format!(
                    "the role '{name}' is not a tenant role"
                )));
            }
        }
        let mut uow = self.begin().await?;
        let stored = uow
            .tx()
            .tenant(tenant)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no tenant with id {tenant}")))?;
        uow.tx()
            .update_tenant(&Tenant {
                tenant_roles: roles,
                ..stored
            })
            .await?;
        uow.commit().await?;
        info!(tenant = %tenant, "tenant roles updated");
        Ok(())
    }

    async fn begin(&self) -> Result<UnitOfWork<S::Tx>> {
        let hook: Arc<dyn CommitHook> = self.refresher.clone();
        Ok(UnitOfWork::begin(&self.store, IsolationLevel::ReadCommitted)
            .await?
            .with_hook(hook))
    }

    async fn require_role(&self, name: &RoleName) -> Result<Role> {
        self.store
            .role(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no role named '{name}'")))
    }

    async fn require_user(&self, id: &UserId) -> Result<AuthUser> {
        self.store
            .user(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no user '{id}'")))
    }

    /// Normal roles go to anyone; `TenantAdminAdd` roles only to users of a
    /// tenant carrying the role; `TenantAutoAdd` roles are never assigned directly.
    async fn check_assignable(&self, user: &AuthUser, name: &RoleName) -> Result<()> {
        let role = self.require_role(name).await?;
        match role.role_type {
            RoleType::Normal => Ok(()),
            RoleType::TenantAutoAdd => Err(Error::Validation(format!(
                "the role '{name}' is added automatically through the user's tenant"
            ))),
            RoleType::TenantAdminAdd => {
                let tenant = match user.tenant_id {
                    Some(id) => self.store.tenant(id).await?,
                    None => None,
                };
                if tenant.is_some_and(|t| t.tenant_roles.contains(name)) {
                    Ok(())
                } else {
                    Err(Error::Validation(format!(
                        "the role '{name}' is not available in the user's tenant"
                    )))
                }
            }
        }
    }
}

#[cfg(all(test, feature = "memory-store", feature = "memory-cache"))]
mod tests {
    use super::*;
    use crate::cache::{DistributedCache, user_permissions_key};
    use crate::memory_cache::MemoryCache;
    use crate::memory_store::MemoryStore;
    use crate::permission::Permission;
    use futures::executor::block_on;

    fn packed(codes: &[u16]) -> PackedPermissions {
        PackedPermissions::pack(codes.iter().map(|c| Permission::new(*c).unwrap()))
    }

    fn setup() -> (RoleAdmin<MemoryStore, MemoryCache>, MemoryCache) {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        store.add_user(AuthUser::new(UserId::new("u1").unwrap(), "u1@example.com"));
        let admin = RoleAdmin::new(store, cache.clone(), TenantType::SingleLevel);
        (admin, cache)
    }

    fn cached(cache: &MemoryCache) -> Option<String> {
        block_on(cache.get(&user_permissions_key("u1"))).unwrap()
    }

    #[test]
    fn adding_a_role_should_publish_permissions() {
        let (admin, cache) = setup();
        let reader = RoleName::new("Reader").unwrap();
        block_on(admin.create_role(Role::new(reader.clone(), packed(&[1, 2])))).unwrap();

        block_on(admin.add_role_to_user(&UserId::new("u1").unwrap(), &reader)).unwrap();

        assert_eq!(cached(&cache), Some(packed(&[1, 2]).as_str().to_string()));
    }

    #[test]
    fn changing_role_permissions_should_overwrite_holders() {
        let (admin, cache) = setup();
        let reader = RoleName::new("Reader").unwrap();
        block_on(admin.create_role(Role::new(reader.clone(), packed(&[1])))).unwrap();
        block_on(admin.add_role_to_user(&UserId::new("u1").unwrap(), &reader)).unwrap();

        block_on(admin.set_role_permissions(&reader, packed(&[4, 5]))).unwrap();

        assert_eq!(cached(&cache), Some(packed(&[4, 5]).as_str().to_string()));
    }

    #[test]
    fn removing_only_role_should_clear_entry() {
        let (admin, cache) = setup();
        let reader = RoleName::new("Reader").unwrap();
        block_on(admin.create_role(Role::new(reader.clone(), packed(&[1])))).unwrap();
        block_on(admin.add_role_to_user(&UserId::new("u1").unwrap(), &reader)).unwrap();

        block_on(admin.remove_role_from_user(&UserId::new("u1").unwrap(), &reader)).unwrap();

        assert_eq!(cached(&cache), None);
    }

    #[test]
    fn deleting_held_role_should_conflict_unless_forced() {
        let (admin, cache) = setup();
        let reader = RoleName::new("Reader").unwrap();
        block_on(admin.create_role(Role::new(reader.clone(), packed(&[1])))).unwrap();
        block_on(admin.add_role_to_user(&UserId::new("u1").unwrap(), &reader)).unwrap();

        let err = block_on(admin.delete_role(&reader, false)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        block_on(admin.delete_role(&reader, true)).unwrap();
        assert_eq!(cached(&cache), None);
    }

    #[test]
    fn tenant_auto_add_roles_should_not_be_assigned_directly() {
        let (admin, _cache) = setup();
        let auto = RoleName::new("Auto").unwrap();
        block_on(admin.create_role(
            Role::new(auto.clone(), packed(&[1])).with_type(RoleType::TenantAutoAdd),
        ))
        .unwrap();

        let err = block_on(admin.add_role_to_user(&UserId::new("u1").unwrap(), &auto)).unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
    }
}
