//! Tenant administration: create, rename, move and delete tenants.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::cache::DistributedCache;
use crate::change::TenantChangeService;
use crate::config::{TenantOptions, TenantType};
use crate::data::{MigrationRunner, NoMigrations};
use crate::error::{Error, Result};
use crate::lock::{NamedLock, with_lock};
use crate::maintenance::Maintenance;
use crate::registry::{DatabaseResolver, ShardingRegistry};
use crate::role::RoleType;
use crate::sharding::ShardingEntry;
use crate::store::{IsolationLevel, RoleStore, Store, StoreTransaction, TenantStore, Transactional};
use crate::tenant::{
    NewTenant, Tenant, TenantMove, TenantTree, compose_full_name, compute_data_key,
    reparent_subtree, validate_level_name,
};
use crate::types::{RoleName, TenantId};

/// Input for creating a tenant.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NewTenantRequest {
    /// Level name of the new tenant.
    pub name: String,
    /// Parent of a hierarchical tenant.
    pub parent_id: Option<TenantId>,
    /// Whether the tenant gets a database of its own.
    pub has_own_db: bool,
    /// Explicit sharding entry; selected automatically when absent.
    pub database_info_name: Option<String>,
    /// Region used by automatic selection.
    pub region: Option<String>,
    /// Tenant roles (`TenantAutoAdd` or `TenantAdminAdd`).
    pub tenant_roles: Vec<RoleName>,
}

impl NewTenantRequest {
    /// Creates a request for a shared, top-level tenant.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Places the tenant under `parent`.
    pub fn under(mut self, parent: TenantId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Gives the tenant its own database.
    pub fn own_db(mut self) -> Self {
        self.has_own_db = true;
        self
    }

    /// Uses an explicit sharding entry.
    pub fn in_database(mut self, name: impl Into<String>) -> Self {
        self.database_info_name = Some(name.into());
        self
    }

    /// Restricts automatic selection to a region.
    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Attaches tenant roles.
    pub fn with_tenant_roles(mut self, roles: Vec<RoleName>) -> Self {
        self.tenant_roles = roles;
        self
    }
}

/// Coordinates tenant rows, the sharding registry and tenant application data.
pub struct TenantAdmin<S, C, L, T, M = NoMigrations> {
    registry: Arc<ShardingRegistry<S, C, L>>,
    change_service: T,
    migrations: M,
}

impl<S, C, L, T> TenantAdmin<S, C, L, T, NoMigrations> {
    /// Creates an admin with no migration runner.
    pub fn new(registry: Arc<ShardingRegistry<S, C, L>>, change_service: T) -> Self {
        Self {
            registry,
            change_service,
            migrations: NoMigrations,
        }
    }
}

impl<S, C, L, T, M> TenantAdmin<S, C, L, T, M> {
    /// Sets the runner preparing newly used databases.
    pub fn with_migrations<M2: MigrationRunner>(self, migrations: M2) -> TenantAdmin<S, C, L, T, M2> {
        TenantAdmin {
            registry: self.registry,
            change_service: self.change_service,
            migrations,
        }
    }
}

impl<S, C, L, T, M> TenantAdmin<S, C, L, T, M>
where
    S: Store,
    C: DistributedCache,
    L: NamedLock,
    T: TenantChangeService,
    M: MigrationRunner,
{
    fn options(&self) -> &TenantOptions {
        self.registry.options()
    }

    fn store(&self) -> &S {
        self.registry.store()
    }

    /// Returns a tenant.
    pub async fn tenant(&self, id: TenantId) -> Result<Tenant> {
        self.store()
            .tenant(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no tenant with id {id}")))
    }

    /// Returns every tenant ordered by full name.
    pub async fn tenants(&self) -> Result<Vec<Tenant>> {
        let mut tenants = self.store().tenants().await?;
        tenants.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        Ok(tenants)
    }

    /// Creates a single-level tenant.
    pub async fn create_single_tenant(&self, request: NewTenantRequest) -> Result<Tenant> {
        if self.options().tenant_type != TenantType::SingleLevel {
            return Err(Error::Validation(
                "single-level tenants are not enabled".to_string(),
            ));
        }
        if request.parent_id.is_some() {
            return Err(Error::Validation(
                "single-level tenants cannot have a parent".to_string(),
            ));
        }
        self.create(request, None).await
    }

    /// Creates a hierarchical tenant, at the top level or under `request.parent_id`.
    ///
    /// A child tenant always lives in its parent's database.
    pub async fn create_hierarchical_tenant(&self, request: NewTenantRequest) -> Result<Tenant> {
        if !self.options().tenant_type.is_hierarchical() {
            return Err(Error::Validation(
                "hierarchical tenants are not enabled".to_string(),
            ));
        }
        let parent = match request.parent_id {
            Some(id) => Some(self.tenant(id).await?),
            None => None,
        };
        self.create(request, parent).await
    }

    /// Registers `entry` and creates a tenant owning that new database.
    ///
    /// The entry is removed again when the tenant cannot be created.
    pub async fn create_tenant_and_database(
        &self,
        request: NewTenantRequest,
        entry: ShardingEntry,
    ) -> Result<Tenant> {
        if !self.options().sharding {
            return Err(Error::Validation("sharding is not enabled".to_string()));
        }
        if request.parent_id.is_some() {
            return Err(Error::Validation(
                "only top-level tenants can get a new database".to_string(),
            ));
        }
        let name = entry.name.clone();
        self.registry.add(entry).await?;
        let request = NewTenantRequest {
            has_own_db: true,
            database_info_name: Some(name.clone()),
            ..request
        };
        let created = if self.options().tenant_type.is_hierarchical() {
            self.create_hierarchical_tenant(request).await
        } else {
            self.create_single_tenant(request).await
        };
        match created {
            Ok(tenant) => Ok(tenant),
            Err(err) => {
                if let Err(remove_err) = self.registry.remove(&name).await {
                    error!(
                        database = %name,
                        error = %remove_err,
                        "failed to remove the sharding entry of a tenant that was not created"
                    );
                    return Err(Error::System(format!(
                        "the tenant was not created ({}) and the new sharding entry '{name}' \
                         could not be removed",
                        err.user_message()
                    )));
                }
                Err(err)
            }
        }
    }

    /// Renames a tenant, recomputing the full names of its descendants.
    pub async fn rename_tenant(&self, id: TenantId, new_level_name: &str) -> Result<Tenant> {
        let level = validate_level_name(new_level_name)?;
        let mut tx = self.store().begin(IsolationLevel::ReadCommitted).await?;
        let result: Result<Tenant> = async {
            let tenants = tx.tenants().await?;
            let tree = TenantTree::new(tenants.clone());
            let tenant = tree
                .get(id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("no tenant with id {id}")))?;
            let parent = tenant.parent_id.and_then(|p| tree.get(p).cloned());
            let mut subtree = if tenant.is_hierarchical {
                tree.subtree_parent_first(id)
            } else {
                vec![tenant.clone()]
            };
            subtree[0].full_name =
                compose_full_name(parent.as_ref().map(|p| p.full_name.as_str()), &level);
            let (renamed, _) = reparent_subtree(&subtree, parent.as_ref());
            ensure_unique_names(&tenants, &renamed)?;

            let mut saved = Vec::with_capacity(renamed.len());
            for tenant in &renamed {
                saved.push(tx.update_tenant(tenant).await?);
            }
            if tenant.is_hierarchical {
                self.change_service
                    .hierarchical_tenant_update_name(&saved)
                    .await?;
            } else {
                self.change_service.single_tenant_update_name(&saved[0]).await?;
            }
            Ok(saved.swap_remove(0))
        }
        .await;
        let tenant = finish(tx, result).await?;
        info!(tenant = %tenant.id, full_name = %tenant.full_name, "tenant renamed");
        Ok(tenant)
    }

    /// Moves a hierarchical tenant and its descendants under `new_parent`, or to the top level.
    ///
    /// Returns the data key changes, parent first.
    pub async fn move_hierarchical_tenant(
        &self,
        id: TenantId,
        new_parent: Option<TenantId>,
    ) -> Result<Vec<TenantMove>> {
        if !self.options().tenant_type.is_hierarchical() {
            return Err(Error::Validation(
                "hierarchical tenants are not enabled".to_string(),
            ));
        }
        let current = self.tenant(id).await?;
        let moves = self
            .while_down(&current.data_key, || async {
                let mut tx = self.store().begin(IsolationLevel::ReadCommitted).await?;
                let result: Result<Vec<TenantMove>> = async {
                    let tenants = tx.tenants().await?;
                    let tree = TenantTree::new(tenants.clone());
                    let tenant = tree
                        .get(id)
                        .cloned()
                        .ok_or_else(|| Error::NotFound(format!("no tenant with id {id}")))?;
                    let parent = match new_parent {
                        Some(parent_id) => {
                            if tree.is_in_subtree(id, parent_id) {
                                return Err(Error::Validation(
                                    "a tenant cannot be moved under itself or one of its children"
                                        .to_string(),
                                ));
                            }
                            Some(tree.get(parent_id).cloned().ok_or_else(|| {
                                Error::NotFound(format!("no tenant with id {parent_id}"))
                            })?)
                        }
                        None => None,
                    };
                    if self.options().sharding
                        && let Some(parent) = &parent
                        && parent.database_info_name != tenant.database_info_name
                    {
                        return Err(Error::Validation(format!(
                            "the tenant '{}' is in a different database from '{}'",
                            tenant.full_name, parent.full_name
                        )));
                    }

                    let subtree = tree.subtree_parent_first(id);
                    let (updated, moves) = reparent_subtree(&subtree, parent.as_ref());
                    ensure_unique_names(&tenants, &updated)?;
                    let mut saved = Vec::with_capacity(updated.len());
                    for tenant in &updated {
                        saved.push(tx.update_tenant(tenant).await?);
                    }
                    self.change_service
                        .move_hierarchical_tenant_data(&saved[0], &moves)
                        .await?;
                    Ok(moves)
                }
                .await;
                finish(tx, result).await
            })
            .await?;
        info!(tenant = %id, count = moves.len(), "hierarchical tenant moved");
        Ok(moves)
    }

    /// Deletes a tenant and, for hierarchical tenants, all its descendants.
    pub async fn delete_tenant(&self, id: TenantId) -> Result<()> {
        let current = self.tenant(id).await?;
        let deleted = self
            .while_down(&current.data_key, || async {
                let mut tx = self.store().begin(IsolationLevel::ReadCommitted).await?;
                let result: Result<Tenant> = async {
                    let tenants = tx.tenants().await?;
                    let tree = TenantTree::new(tenants);
                    let tenant = tree
                        .get(id)
                        .cloned()
                        .ok_or_else(|| Error::NotFound(format!("no tenant with id {id}")))?;
                    let doomed = if tenant.is_hierarchical {
                        tree.subtree_children_first(id)
                    } else {
                        vec![tenant.clone()]
                    };
                    for tenant in &doomed {
                        let users = self.store().users_in_tenant(tenant.id).await?;
                        if !users.is_empty() {
                            return Err(Error::Conflict(format!(
                                "the tenant '{}' still has {} user(s); remove them first",
                                tenant.full_name,
                                users.len()
                            )));
                        }
                    }
                    for tenant in &doomed {
                        tx.delete_tenant(tenant.id).await?;
                    }
                    if tenant.is_hierarchical {
                        self.change_service.hierarchical_tenant_delete(&doomed).await?;
                    } else {
                        self.change_service.single_tenant_delete(&tenant).await?;
                    }
                    Ok(tenant)
                }
                .await;
                finish(tx, result).await
            })
            .await?;
        info!(tenant = %id, full_name = %deleted.full_name, "tenant deleted");

        if self.options().sharding
            && self.options().remove_entry_on_delete
            && deleted.has_own_db
            && let Some(name) = deleted.database_info_name.as_deref()
            && !self.options().is_default_entry(name)
            && let Err(err) = self.registry.remove(name).await
        {
            error!(database = name, error = %err, "tenant deleted but its sharding entry remains");
            return Err(Error::System(format!(
                "the tenant '{}' was deleted but its sharding entry '{name}' could not be removed",
                deleted.full_name
            )));
        }
        Ok(())
    }

    /// Moves a single-level or top-level hierarchical tenant into another database.
    pub async fn move_to_different_database(
        &self,
        id: TenantId,
        has_own_db: bool,
        database_info_name: &str,
    ) -> Result<Tenant> {
        if !self.options().sharding {
            return Err(Error::Validation("sharding is not enabled".to_string()));
        }
        let current = self.tenant(id).await?;
        if current.parent_id.is_some() {
            return Err(Error::Validation(
                "only single-level or top-level tenants can change database".to_string(),
            ));
        }
        let same_database = current.database_info_name.as_deref() == Some(database_info_name);
        if same_database && current.has_own_db == has_own_db {
            return Err(Error::Validation(format!(
                "the tenant '{}' is already in '{database_info_name}'",
                current.full_name
            )));
        }

        let lock_name = &self.options().lock_name;
        let (moved, leftover) = with_lock(self.registry.lock(), lock_name, || async {
            if !self.registry.exists(database_info_name).await? {
                return Err(Error::NotFound(format!(
                    "no sharding entry named '{database_info_name}'"
                )));
            }
            let tenant_count = self
                .store()
                .count_tenants_in_database(database_info_name)
                .await?;
            if !same_database {
                self.check_target(database_info_name, has_own_db, tenant_count)
                    .await?;
            } else if has_own_db {
                // The subtree stays put; only tenants outside it would share the database.
                let tree = TenantTree::new(self.store().tenants().await?);
                let others = tenant_count.saturating_sub(tree.subtree_parent_first(id).len());
                self.check_target(database_info_name, true, others).await?;
            } else if self.options().own_db_only.contains(database_info_name) {
                return Err(Error::Validation(format!(
                    "the database '{database_info_name}' is reserved for own-database tenants"
                )));
            }
            let needs_schema = !same_database && tenant_count == 0;

            self.while_down(&current.data_key, || async {
                let mut tx = self.store().begin(IsolationLevel::ReadCommitted).await?;
                let result: Result<(Tenant, Option<String>)> = async {
                    let tenants = tx.tenants().await?;
                    let tree = TenantTree::new(tenants);
                    let subtree = if current.is_hierarchical {
                        tree.subtree_parent_first(id)
                    } else {
                        tree.get(id).cloned().into_iter().collect()
                    };
                    if subtree.is_empty() {
                        return Err(Error::NotFound(format!("no tenant with id {id}")));
                    }
                    let mut saved = Vec::with_capacity(subtree.len());
                    for tenant in subtree {
                        let updated = Tenant {
                            database_info_name: Some(database_info_name.to_string()),
                            has_own_db,
                            ..tenant
                        };
                        saved.push(tx.update_tenant(&updated).await?);
                    }
                    let moved = saved.swap_remove(0);
                    if needs_schema {
                        self.prepare_database(database_info_name).await?;
                    }
                    let mut leftover = None;
                    if !same_database {
                        let outcome = self
                            .change_service
                            .move_to_different_database(
                                current.database_info_name.as_deref(),
                                &current.data_key,
                                &moved,
                            )
                            .await?;
                        leftover = outcome.leftover;
                    }
                    Ok((moved, leftover))
                }
                .await;
                finish(tx, result).await
            })
            .await
        })
        .await?;
        if let Some(leftover) = leftover {
            return Err(Error::System(leftover));
        }
        info!(
            tenant = %id,
            from = current.database_info_name.as_deref().unwrap_or_default(),
            to = database_info_name,
            "tenant moved to a different database"
        );
        Ok(moved)
    }

    async fn create(&self, request: NewTenantRequest, parent: Option<Tenant>) -> Result<Tenant> {
        let level = validate_level_name(&request.name)?;
        let full_name = compose_full_name(parent.as_ref().map(|p| p.full_name.as_str()), &level);
        self.check_tenant_roles(&request.tenant_roles).await?;
        let is_hierarchical = self.options().tenant_type.is_hierarchical();

        let tenant = if self.options().sharding {
            with_lock(self.registry.lock(), &self.options().lock_name, || async {
                let (database, has_own_db) = match &parent {
                    Some(parent) => (parent.database_info_name.clone(), parent.has_own_db),
                    None => (Some(self.choose_database(&request).await?), request.has_own_db),
                };
                let new = NewTenant {
                    full_name: full_name.clone(),
                    parent_id: parent.as_ref().map(|p| p.id),
                    is_hierarchical,
                    database_info_name: database,
                    has_own_db,
                    tenant_roles: request.tenant_roles.clone(),
                };
                self.insert(new, parent.as_ref()).await
            })
            .await?
        } else {
            let new = NewTenant {
                full_name,
                parent_id: parent.as_ref().map(|p| p.id),
                is_hierarchical,
                database_info_name: None,
                has_own_db: false,
                tenant_roles: request.tenant_roles.clone(),
            };
            self.insert(new, parent.as_ref()).await?
        };
        info!(
            tenant = %tenant.id,
            full_name = %tenant.full_name,
            database = tenant.database_info_name.as_deref().unwrap_or_default(),
            "tenant created"
        );
        Ok(tenant)
    }

    async fn insert(&self, new: NewTenant, parent: Option<&Tenant>) -> Result<Tenant> {
        let needs_schema = match new.database_info_name.as_deref() {
            Some(name) => self.store().count_tenants_in_database(name).await? == 0,
            None => false,
        };
        let mut tx = self.store().begin(IsolationLevel::ReadCommitted).await?;
        let result: Result<Tenant> = async {
            let existing = tx.tenants().await?;
            if existing.iter().any(|t| t.full_name == new.full_name) {
                return Err(Error::Validation(format!(
                    "the tenant name '{}' is already used",
                    new.full_name
                )));
            }
            let database = new.database_info_name.clone();
            let mut tenant = tx.insert_tenant(new).await?;
            tenant.data_key =
                compute_data_key(tenant.id, parent.map(|p| p.data_key.as_str()));
            let tenant = tx.update_tenant(&tenant).await?;
            if needs_schema && let Some(name) = database.as_deref() {
                self.prepare_database(name).await?;
            }
            self.change_service.create_tenant(&tenant).await?;
            Ok(tenant)
        }
        .await;
        finish(tx, result).await
    }

    async fn choose_database(&self, request: &NewTenantRequest) -> Result<String> {
        let Some(name) = request.database_info_name.as_deref() else {
            return self
                .registry
                .select_database(request.has_own_db, request.region.as_deref())
                .await;
        };
        if !self.registry.exists(name).await? {
            return Err(Error::NotFound(format!("no sharding entry named '{name}'")));
        }
        let tenant_count = self.store().count_tenants_in_database(name).await?;
        self.check_target(name, request.has_own_db, tenant_count)
            .await?;
        Ok(name.to_string())
    }

    /// Checks that a database can take one more tenant.
    async fn check_target(&self, name: &str, has_own_db: bool, tenant_count: usize) -> Result<()> {
        if has_own_db {
            if self.options().is_default_entry(name) {
                return Err(Error::Validation(format!(
                    "the default database '{name}' cannot be owned by a tenant"
                )));
            }
            if tenant_count > 0 {
                return Err(Error::Validation(format!(
                    "the database '{name}' already has tenants and cannot be owned by one"
                )));
            }
            return Ok(());
        }
        if self.options().own_db_only.contains(name) {
            return Err(Error::Validation(format!(
                "the database '{name}' is reserved for tenants with their own database"
            )));
        }
        let owned = self
            .store()
            .database_usage()
            .await?
            .iter()
            .any(|usage| usage.database_info_name == name && usage.has_own_db_tenant);
        if owned {
            return Err(Error::Validation(format!(
                "the database '{name}' is owned by another tenant"
            )));
        }
        if tenant_count >= self.options().max_shared_tenants {
            return Err(Error::NoCapacity(format!(
                "the database '{name}' already holds {tenant_count} tenants"
            )));
        }
        Ok(())
    }

    async fn check_tenant_roles(&self, roles: &[RoleName]) -> Result<()> {
        for name in roles {
            let role = self
                .store()
                .role(name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("no role named '{name}'")))?;
            if role.role_type == RoleType::Normal {
                return Err(Error::Validation(format!(
                    "the role '{name}' is not a tenant role"
                )));
            }
        }
        Ok(())
    }

    async fn prepare_database(&self, name: &str) -> Result<()> {
        let target = self.registry.resolve(Some(name)).await?;
        self.migrations.ensure_schema(&target).await.map_err(|err| {
            error!(database = name, error = %err, "database migration failed");
            Error::System(format!("the database '{name}' could not be prepared: {err}"))
        })
    }

    async fn while_down<F, Fut, R>(&self, data_key: &str, action: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if self.options().mark_down_during_changes {
            Maintenance::new(self.registry.cache())
                .with_tenant_down(data_key, action)
                .await
        } else {
            action().await
        }
    }
}

/// Commits `tx` when `result` is a success and rolls it back otherwise.
async fn finish<X: StoreTransaction, R>(tx: X, result: Result<R>) -> Result<R> {
    match result {
        Ok(value) => {
            tx.commit().await.map_err(|err| {
                error!(error = %err, "tenant transaction failed to commit");
                Error::System(format!("the tenant change could not be saved: {err}"))
            })?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "tenant transaction rollback failed");
            }
            Err(err)
        }
    }
}

fn ensure_unique_names(existing: &[Tenant], changed: &[Tenant]) -> Result<()> {
    for tenant in changed {
        let clash = existing.iter().any(|other| {
            other.full_name == tenant.full_name && !changed.iter().any(|c| c.id == other.id)
        });
        if clash {
            return Err(Error::Validation(format!(
                "the tenant name '{}' is already used",
                tenant.full_name
            )));
        }
    }
    Ok(())
}
