//! Tenant and sharding configuration.

use crate::lock::SHARDING_LOCK_NAME;
use crate::sharding::ShardingEntry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Soft cap on tenants sharing one database.
pub const DEFAULT_MAX_SHARED_TENANTS: usize = 50;

/// How the application uses tenants.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TenantType {
    /// Users are not grouped into tenants.
    NotUsingTenants,
    /// Flat tenants, filtered by exact data key.
    #[default]
    SingleLevel,
    /// Tenant trees, filtered by data key prefix.
    Hierarchical,
}

impl TenantType {
    /// Returns true for the multi-tenant modes.
    pub fn is_multi_tenant(self) -> bool {
        !matches!(self, Self::NotUsingTenants)
    }

    /// Returns true for tenant trees.
    pub fn is_hierarchical(self) -> bool {
        matches!(self, Self::Hierarchical)
    }
}

/// Options shared by the registry, the tenant admin and the permission refresher.
///
/// Deserializes with defaults for every missing field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantOptions {
    /// Tenant mode.
    pub tenant_type: TenantType,
    /// Whether tenants are spread over several databases.
    pub sharding: bool,
    /// Hybrid mode: the default shared database, served from configuration
    /// rather than the cache.
    pub default_entry: Option<ShardingEntry>,
    /// Name of the lock serializing registry mutations.
    pub lock_name: String,
    /// Soft cap on tenants in one shared database.
    pub max_shared_tenants: usize,
    /// Entries reserved for tenants with their own database.
    pub own_db_only: BTreeSet<String>,
    /// Shared entries offered to own-db tenants first and to shared tenants last.
    pub own_db_preferred: BTreeSet<String>,
    /// Region of each connection name, used by database selection.
    pub regions: BTreeMap<String, String>,
    /// Deadline for moving a tenant's data to another database.
    pub move_timeout_secs: u64,
    /// Drop a dedicated database when its tenant is deleted.
    pub drop_own_database_on_delete: bool,
    /// Remove the sharding entry of a deleted tenant that owned its database.
    pub remove_entry_on_delete: bool,
    /// Mark tenants down for maintenance while their data moves or is deleted.
    pub mark_down_during_changes: bool,
}

impl Default for TenantOptions {
    fn default() -> Self {
        Self {
            tenant_type: TenantType::default(),
            sharding: false,
            default_entry: None,
            lock_name: SHARDING_LOCK_NAME.to_string(),
            max_shared_tenants: DEFAULT_MAX_SHARED_TENANTS,
            own_db_only: BTreeSet::new(),
            own_db_preferred: BTreeSet::new(),
            regions: BTreeMap::new(),
            move_timeout_secs: 300,
            drop_own_database_on_delete: false,
            remove_entry_on_delete: false,
            mark_down_during_changes: true,
        }
    }
}

impl TenantOptions {
    /// Single-level tenants without sharding.
    pub fn single_level() -> Self {
        Self::default()
    }

    /// Hierarchical tenants without sharding.
    pub fn hierarchical() -> Self {
        Self {
            tenant_type: TenantType::Hierarchical,
            ..Self::default()
        }
    }

    /// Enables sharding.
    pub fn with_sharding(mut self) -> Self {
        self.sharding = true;
        self
    }

    /// Sets the hybrid default entry.
    pub fn with_default_entry(mut self, entry: ShardingEntry) -> Self {
        self.default_entry = Some(entry);
        self
    }

    /// Sets the soft cap on shared tenants per database.
    pub fn max_shared_tenants(mut self, cap: usize) -> Self {
        self.max_shared_tenants = cap;
        self
    }

    /// Reserves an entry for tenants with their own database.
    pub fn reserve_for_own_db(mut self, name: impl Into<String>) -> Self {
        self.own_db_only.insert(name.into());
        self
    }

    /// Marks a shared entry as preferred for tenants with their own database.
    pub fn prefer_for_own_db(mut self, name: impl Into<String>) -> Self {
        self.own_db_preferred.insert(name.into());
        self
    }

    /// Maps a connection name to a region.
    pub fn region(mut self, connection_name: impl Into<String>, region: impl Into<String>) -> Self {
        self.regions.insert(connection_name.into(), region.into());
        self
    }

    /// Sets the data move deadline.
    pub fn move_timeout(mut self, timeout: Duration) -> Self {
        self.move_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Returns the data move deadline.
    pub fn move_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.move_timeout_secs)
    }

    /// Returns true when `name` is the hybrid default entry.
    pub fn is_default_entry(&self, name: &str) -> bool {
        self.default_entry
            .as_ref()
            .is_some_and(|entry| entry.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_should_take_defaults() {
        let options: TenantOptions =
            serde_json::from_str(r#"{ "tenant_type": "Hierarchical", "sharding": true }"#)
                .unwrap();
        assert!(options.tenant_type.is_hierarchical());
        assert_eq!(options.max_shared_tenants, DEFAULT_MAX_SHARED_TENANTS);
        assert_eq!(options.lock_name, SHARDING_LOCK_NAME);
        assert!(options.mark_down_during_changes);
    }

    #[test]
    fn not_using_tenants_should_not_be_multi_tenant() {
        assert!(!TenantType::NotUsingTenants.is_multi_tenant());
        assert!(TenantType::SingleLevel.is_multi_tenant());
    }
}
