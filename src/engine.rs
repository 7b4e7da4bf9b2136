use crate::cache::{DistributedCache, NoCache, user_permissions_key};
use crate::config::TenantType;
use crate::error::{Error, Result};
use crate::maintenance::Maintenance;
use crate::permission::{PackedPermissions, Permission};
use crate::refresh::compute_user_permissions;
use crate::store::{RoleStore, TenantStore};
use crate::types::UserId;
use tracing::{debug, warn};

/// Authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Permission is granted.
    Allow,
    /// Permission is denied.
    Deny,
}

/// Request-time authorization engine.
///
/// Reads the packed permissions cached under `UserPermissions-{user}` and
/// recomputes them from the store on a miss.
#[derive(Debug)]
pub struct Engine<S, C = NoCache> {
    store: S,
    cache: C,
    tenant_type: TenantType,
    cache_on_miss: bool,
}

/// Builder for [`Engine`].
pub struct EngineBuilder<S, C = NoCache> {
    store: S,
    cache: C,
    tenant_type: TenantType,
    cache_on_miss: bool,
}

impl<S> EngineBuilder<S, NoCache> {
    /// Creates a new builder with default configuration.
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: NoCache,
            tenant_type: TenantType::NotUsingTenants,
            cache_on_miss: true,
        }
    }
}

impl<S, C> EngineBuilder<S, C> {
    /// Sets how tenants contribute roles.
    pub fn tenant_type(mut self, tenant_type: TenantType) -> Self {
        self.tenant_type = tenant_type;
        self
    }

    /// Writes recomputed permissions back to the cache on a miss.
    pub fn cache_on_miss(mut self, on: bool) -> Self {
        self.cache_on_miss = on;
        self
    }

    /// Sets the cache implementation.
    pub fn cache<C2: DistributedCache>(self, cache: C2) -> EngineBuilder<S, C2> {
        EngineBuilder {
            store: self.store,
            cache,
            tenant_type: self.tenant_type,
            cache_on_miss: self.cache_on_miss,
        }
    }

    /// Builds the engine.
    pub fn build(self) -> Engine<S, C> {
        Engine {
            store: self.store,
            cache: self.cache,
            tenant_type: self.tenant_type,
            cache_on_miss: self.cache_on_miss,
        }
    }
}

impl<S, C> Engine<S, C>
where
    S: RoleStore + TenantStore + Send + Sync,
    C: DistributedCache,
{
    /// Authorizes a user for a permission.
    pub async fn authorize(&self, user: &UserId, permission: Permission) -> Result<Decision> {
        let allowed = self
            .permissions(user)
            .await?
            .is_some_and(|packed| packed.grants(permission));
        Ok(if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        })
    }

    /// Returns the user's packed permissions, or `None` when the user holds none.
    pub async fn permissions(&self, user: &UserId) -> Result<Option<PackedPermissions>> {
        let key = user_permissions_key(user.as_str());
        match self.cache.get(&key).await {
            Ok(Some(raw)) => return Ok(Some(PackedPermissions::from_string(raw))),
            Ok(None) => {}
            Err(err) => warn!(user = %user, error = %err, "permission cache read failed"),
        }

        let computed = compute_user_permissions(&self.store, user, self.tenant_type).await?;
        if self.cache_on_miss
            && let Some(packed) = &computed
        {
            if let Err(err) = self.cache.set(&key, packed.as_str().to_string()).await {
                warn!(user = %user, error = %err, "permission cache write failed");
            } else {
                debug!(user = %user, "user permissions cached");
            }
        }
        Ok(computed)
    }

    /// Returns true when the user's tenant, or one of its ancestors, is down
    /// for maintenance.
    pub async fn is_tenant_down(&self, user: &UserId) -> Result<bool> {
        if !self.tenant_type.is_multi_tenant() {
            return Ok(false);
        }
        let Some(tenant_id) = self.store.user(user).await?.and_then(|u| u.tenant_id) else {
            return Ok(false);
        };
        let tenant = self
            .store
            .tenant(tenant_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no tenant with id {tenant_id}")))?;
        Maintenance::new(&self.cache).is_down(&tenant.data_key).await
    }
}
