//! Callbacks that keep tenant application data in step with tenant changes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info};

use crate::config::TenantOptions;
use crate::data::{DataConnector, DataTransaction, TenantDatabase, TenantRow};
use crate::error::{Error, Result, StoreError};
use crate::registry::{DatabaseResolver, DatabaseTarget};
use crate::store::IsolationLevel;
use crate::tenant::{DataKeyFilter, Tenant, TenantMove};

/// Application callback invoked by the tenant admin around every tenant change.
///
/// Each method runs after the tenant rows have been updated inside the admin's
/// open transaction; returning an error rolls that transaction back.
#[async_trait]
pub trait TenantChangeService: Send + Sync {
    /// Sets up data for a new tenant.
    async fn create_tenant(&self, tenant: &Tenant) -> Result<()>;

    /// Reacts to a single-level tenant rename.
    async fn single_tenant_update_name(&self, tenant: &Tenant) -> Result<()>;

    /// Reacts to a hierarchical rename; `tenants` holds the renamed tenant and its descendants.
    async fn hierarchical_tenant_update_name(&self, tenants: &[Tenant]) -> Result<()>;

    /// Removes a single-level tenant's data.
    async fn single_tenant_delete(&self, tenant: &Tenant) -> Result<()>;

    /// Removes the data of a subtree, given children first.
    async fn hierarchical_tenant_delete(&self, tenants: &[Tenant]) -> Result<()>;

    /// Rewrites data keys after a hierarchical move, given parent first.
    ///
    /// `tenant` is the moved tenant after the move.
    async fn move_hierarchical_tenant_data(&self, tenant: &Tenant, moves: &[TenantMove])
    -> Result<()>;

    /// Moves a tenant's data from its old database into the one now named by `updated`.
    ///
    /// An error means the new database holds none of the data. Once the copy
    /// has committed the call succeeds, and a failure to clear the old rows is
    /// reported through [`MoveOutcome::leftover`].
    async fn move_to_different_database(
        &self,
        old_database_info_name: Option<&str>,
        old_data_key: &str,
        updated: &Tenant,
    ) -> Result<MoveOutcome>;
}

/// What a committed cross-database move left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveOutcome {
    /// Rows copied into the new database.
    pub rows_copied: usize,
    /// Describes old rows that could not be deleted and now need manual cleanup.
    pub leftover: Option<String>,
}

/// Rows written for every new tenant.
pub trait TenantSeeder: Send + Sync {
    /// Returns the initial rows of `tenant`.
    fn rows_for(&self, tenant: &Tenant) -> Vec<TenantRow>;
}

/// [`TenantChangeService`] over [`DataConnector`] databases.
pub struct DataTenantChangeService<D, R> {
    connector: D,
    resolver: R,
    seeder: Option<Arc<dyn TenantSeeder>>,
    move_timeout: Duration,
    drop_own_database: bool,
}

impl<D, R> DataTenantChangeService<D, R>
where
    D: DataConnector,
    R: DatabaseResolver,
{
    /// Creates the service with default options.
    pub fn new(connector: D, resolver: R) -> Self {
        let options = TenantOptions::default();
        Self {
            connector,
            resolver,
            seeder: None,
            move_timeout: options.move_timeout_duration(),
            drop_own_database: options.drop_own_database_on_delete,
        }
    }

    /// Applies the data move deadline and database drop policy from `options`.
    pub fn with_options(mut self, options: &TenantOptions) -> Self {
        self.move_timeout = options.move_timeout_duration();
        self.drop_own_database = options.drop_own_database_on_delete;
        self
    }

    /// Overrides the data move deadline.
    pub fn move_timeout(mut self, timeout: Duration) -> Self {
        self.move_timeout = timeout;
        self
    }

    /// Seeds rows for new tenants.
    pub fn with_seeder(mut self, seeder: Arc<dyn TenantSeeder>) -> Self {
        self.seeder = Some(seeder);
        self
    }

    async fn open(&self, database_info_name: Option<&str>) -> Result<(DatabaseTarget, D::Database)> {
        let target = self.resolver.resolve(database_info_name).await?;
        let database = self
            .connector
            .open(&target)
            .await
            .map_err(|err| system("open the database", &target.name, err))?;
        Ok((target, database))
    }

    /// Deletes the rows of `tenants`, all of which live in one database.
    async fn delete_in_database(&self, tenants: &[Tenant]) -> Result<()> {
        let Some(first) = tenants.first() else {
            return Ok(());
        };
        let (target, database) = self.open(first.database_info_name.as_deref()).await?;

        if first.has_own_db && self.drop_own_database {
            database
                .drop_database()
                .await
                .map_err(|err| system("drop the database", &target.name, err))?;
            info!(tenant = %first.id, database = %target.name, "tenant database dropped");
            return Ok(());
        }

        let mut tx = database
            .begin(IsolationLevel::Serializable)
            .await
            .map_err(|err| system("begin a transaction", &target.name, err))?;
        for tenant in tenants {
            let filter = if tenant.has_own_db {
                DataKeyFilter::All
            } else {
                DataKeyFilter::Exact(tenant.data_key.clone())
            };
            if let Err(err) = tx.delete_rows(&filter).await {
                rollback(tx, &target.name).await;
                return Err(system("delete tenant data", &target.name, err));
            }
        }
        tx.commit()
            .await
            .map_err(|err| system("commit the delete", &target.name, err))?;
        info!(count = tenants.len(), database = %target.name, "tenant data deleted");
        Ok(())
    }
}

#[async_trait]
impl<D, R> TenantChangeService for DataTenantChangeService<D, R>
where
    D: DataConnector,
    R: DatabaseResolver,
{
    async fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        let (target, database) = self.open(tenant.database_info_name.as_deref()).await?;
        let Some(seeder) = &self.seeder else {
            return Ok(());
        };
        let rows = seeder.rows_for(tenant);
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = database
            .begin(IsolationLevel::ReadCommitted)
            .await
            .map_err(|err| system("begin a transaction", &target.name, err))?;
        if let Err(err) = tx.insert_rows(rows).await {
            rollback(tx, &target.name).await;
            return Err(system("seed tenant data", &target.name, err));
        }
        tx.commit()
            .await
            .map_err(|err| system("commit tenant data", &target.name, err))
    }

    async fn single_tenant_update_name(&self, _tenant: &Tenant) -> Result<()> {
        Ok(())
    }

    async fn hierarchical_tenant_update_name(&self, _tenants: &[Tenant]) -> Result<()> {
        Ok(())
    }

    async fn single_tenant_delete(&self, tenant: &Tenant) -> Result<()> {
        self.delete_in_database(std::slice::from_ref(tenant)).await
    }

    async fn hierarchical_tenant_delete(&self, tenants: &[Tenant]) -> Result<()> {
        // Keep children-first order inside each database.
        let mut groups: Vec<(Option<&str>, Vec<Tenant>)> = Vec::new();
        for tenant in tenants {
            let name = tenant.database_info_name.as_deref();
            match groups.iter_mut().find(|(group, _)| *group == name) {
                Some((_, members)) => members.push(tenant.clone()),
                None => groups.push((name, vec![tenant.clone()])),
            }
        }
        for (_, members) in groups {
            self.delete_in_database(&members).await?;
        }
        Ok(())
    }

    async fn move_hierarchical_tenant_data(
        &self,
        tenant: &Tenant,
        moves: &[TenantMove],
    ) -> Result<()> {
        let (target, database) = self.open(tenant.database_info_name.as_deref()).await?;
        let mut tx = database
            .begin(IsolationLevel::ReadCommitted)
            .await
            .map_err(|err| system("begin a transaction", &target.name, err))?;
        for change in moves {
            if let Err(err) = tx
                .update_data_key(&change.old_data_key, &change.new_data_key)
                .await
            {
                rollback(tx, &target.name).await;
                return Err(system("update data keys", &target.name, err));
            }
        }
        tx.commit()
            .await
            .map_err(|err| system("commit the data key update", &target.name, err))
    }

    async fn move_to_different_database(
        &self,
        old_database_info_name: Option<&str>,
        old_data_key: &str,
        updated: &Tenant,
    ) -> Result<MoveOutcome> {
        let deadline = Instant::now() + self.move_timeout;
        let filter = DataKeyFilter::for_key(old_data_key, updated.is_hierarchical);
        let (old_target, old_db) = self.open(old_database_info_name).await?;
        let (new_target, new_db) = self.open(updated.database_info_name.as_deref()).await?;

        let mut read = step(
            deadline,
            "begin a read",
            &old_target.name,
            old_db.begin(IsolationLevel::Serializable),
        )
        .await?;
        let rows = match step(
            deadline,
            "read tenant data",
            &old_target.name,
            read.read_rows(&filter),
        )
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                rollback(read, &old_target.name).await;
                return Err(err);
            }
        };
        rollback(read, &old_target.name).await;

        let count = rows.len();
        let rows: Vec<TenantRow> = rows
            .into_iter()
            .map(|mut row| {
                row.reset_keys();
                row
            })
            .collect();

        let mut write = step(
            deadline,
            "begin a write",
            &new_target.name,
            new_db.begin(IsolationLevel::Serializable),
        )
        .await?;
        if let Err(err) = step(
            deadline,
            "copy tenant data",
            &new_target.name,
            write.insert_rows(rows),
        )
        .await
        {
            rollback(write, &new_target.name).await;
            return Err(err);
        }
        step(deadline, "commit the copy", &new_target.name, write.commit()).await?;
        info!(
            tenant = %updated.id,
            from = %old_target.name,
            to = %new_target.name,
            count,
            "tenant data copied"
        );

        let removed: Result<()> = async {
            let mut delete = step(
                deadline,
                "begin a delete",
                &old_target.name,
                old_db.begin(IsolationLevel::Serializable),
            )
            .await?;
            if let Err(err) = step(
                deadline,
                "delete the old data",
                &old_target.name,
                delete.delete_rows(&filter),
            )
            .await
            {
                rollback(delete, &old_target.name).await;
                return Err(err);
            }
            step(deadline, "commit the delete", &old_target.name, delete.commit()).await
        }
        .await;

        let leftover = removed.err().map(|err| {
            error!(
                tenant = %updated.id,
                database = %old_target.name,
                data_key = old_data_key,
                error = %err,
                "tenant data copied but the old rows could not be deleted"
            );
            format!(
                "the data of tenant '{}' now lives in '{}'; the stale copy left in '{}' \
                 (data key '{}') could not be deleted and must be removed manually",
                updated.full_name, new_target.name, old_target.name, old_data_key
            )
        });
        Ok(MoveOutcome {
            rows_copied: count,
            leftover,
        })
    }
}

/// Runs one move step against the shared deadline.
async fn step<T>(
    deadline: Instant,
    action: &str,
    database: &str,
    fut: impl Future<Output = std::result::Result<T, StoreError>>,
) -> Result<T> {
    match timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(system(action, database, err)),
        Err(_) => {
            error!(action, database, "tenant data move timed out");
            Err(Error::Timeout(format!(
                "moving tenant data timed out while trying to {action} in '{database}'"
            )))
        }
    }
}

async fn rollback<T: DataTransaction>(tx: T, database: &str) {
    if let Err(err) = tx.rollback().await {
        error!(database, error = %err, "rollback failed");
    }
}

fn system(action: &str, database: &str, err: StoreError) -> Error {
    error!(action, database, error = %err, "tenant data operation failed");
    Error::System(format!("failed to {action} in '{database}': {err}"))
}
