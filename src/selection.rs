//! Choosing the database of a new tenant.

use std::collections::BTreeMap;

use crate::cache::DistributedCache;
use crate::config::TenantOptions;
use crate::error::{Error, Result};
use crate::lock::NamedLock;
use crate::registry::ShardingRegistry;
use crate::sharding::ShardingEntry;
use crate::store::{DatabaseUsage, Store, TenantStore};

/// Picks the sharding entry for a new tenant.
///
/// A tenant with its own database gets an entry no tenant references yet:
/// reserved entries first, then preferred ones, then by name. The hybrid
/// default entry is never handed out as a dedicated database. A shared
/// tenant gets the least loaded shared-capable entry below the soft cap,
/// preferring entries not marked as preferred for own-db tenants, then by
/// name. `region` keeps only entries whose connection maps to that region.
pub fn pick_database(
    entries: &[ShardingEntry],
    usage: &[DatabaseUsage],
    has_own_db: bool,
    region: Option<&str>,
    options: &TenantOptions,
) -> Result<String> {
    let usage: BTreeMap<&str, &DatabaseUsage> = usage
        .iter()
        .map(|u| (u.database_info_name.as_str(), u))
        .collect();
    let in_region = |entry: &&ShardingEntry| match region {
        None => true,
        Some(region) => options
            .regions
            .get(&entry.connection_name)
            .is_some_and(|r| r == region),
    };
    let tenant_count = |entry: &ShardingEntry| {
        usage
            .get(entry.name.as_str())
            .map_or(0, |u| u.tenant_count)
    };

    let chosen = if has_own_db {
        entries
            .iter()
            .filter(in_region)
            .filter(|entry| !options.is_default_entry(&entry.name))
            .filter(|entry| tenant_count(*entry) == 0)
            .min_by_key(|entry| {
                (
                    !options.own_db_only.contains(&entry.name),
                    !options.own_db_preferred.contains(&entry.name),
                    entry.name.as_str(),
                )
            })
    } else {
        entries
            .iter()
            .filter(in_region)
            .filter(|entry| !options.own_db_only.contains(&entry.name))
            .filter(|entry| {
                !usage
                    .get(entry.name.as_str())
                    .is_some_and(|u| u.has_own_db_tenant)
            })
            .filter(|entry| tenant_count(*entry) < options.max_shared_tenants)
            .min_by_key(|entry| {
                (
                    tenant_count(*entry),
                    options.own_db_preferred.contains(&entry.name),
                    entry.name.as_str(),
                )
            })
    };

    chosen.map(|entry| entry.name.clone()).ok_or_else(|| {
        let kind = if has_own_db { "an empty" } else { "a shared" };
        let region = region.map(|r| format!(" in region '{r}'")).unwrap_or_default();
        Error::NoCapacity(format!(
            "there is no {kind} database available{region}; add a new sharding entry"
        ))
    })
}

impl<S, C, L> ShardingRegistry<S, C, L>
where
    S: Store,
    C: DistributedCache,
    L: NamedLock,
{
    /// Selects the database for a new tenant from the current registry and tenant counts.
    ///
    /// Does not take the registry lock; callers that create the tenant
    /// afterwards should hold it across both steps.
    pub async fn select_database(&self, has_own_db: bool, region: Option<&str>) -> Result<String> {
        let entries = self.list().await?;
        let usage = self.store().database_usage().await?;
        pick_database(&entries, &usage, has_own_db, region, self.options())
    }
}
