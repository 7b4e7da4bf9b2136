//! Down-for-maintenance markers for tenants whose data is being changed.

use std::future::Future;

use tracing::{info, warn};

use crate::cache::{DistributedCache, TENANT_DOWN_PREFIX, tenant_down_key};
use crate::error::{Error, Result};

/// Marks tenants as unavailable while their data moves or is deleted.
///
/// A marker covers the tenant and, through the data key prefix, every
/// descendant of a hierarchical tenant.
#[derive(Debug, Clone)]
pub struct Maintenance<C> {
    cache: C,
}

impl<C: DistributedCache> Maintenance<C> {
    /// Creates a maintenance view over `cache`.
    pub fn new(cache: C) -> Self {
        Self { cache }
    }

    /// Marks the tenant with `data_key` as down.
    pub async fn mark_down(&self, data_key: &str) -> Result<()> {
        self.cache
            .set(&tenant_down_key(data_key), data_key.to_string())
            .await?;
        info!(data_key, "tenant marked down for maintenance");
        Ok(())
    }

    /// Removes the down marker of `data_key`.
    pub async fn remove_down(&self, data_key: &str) -> Result<()> {
        self.cache.remove(&tenant_down_key(data_key)).await?;
        info!(data_key, "tenant back from maintenance");
        Ok(())
    }

    /// Returns the data keys currently marked down.
    pub async fn down_tenants(&self) -> Result<Vec<String>> {
        let keys = self.cache.keys_with_prefix(TENANT_DOWN_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(TENANT_DOWN_PREFIX).map(str::to_string))
            .collect())
    }

    /// Returns true when `data_key` or one of its ancestors is marked down.
    pub async fn is_down(&self, data_key: &str) -> Result<bool> {
        Ok(self
            .down_tenants()
            .await?
            .iter()
            .any(|down| data_key.starts_with(down.as_str())))
    }

    /// Runs `action` with `data_key` marked down, removing the marker afterwards.
    pub async fn with_tenant_down<F, Fut, T>(&self, data_key: &str, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.mark_down(data_key).await?;
        let result = action().await;
        if let Err(err) = self.remove_down(data_key).await {
            warn!(data_key, error = %err, "failed to remove the down marker");
            if result.is_ok() {
                return Err(Error::System(format!(
                    "the tenant with data key '{data_key}' is still marked down"
                )));
            }
        }
        result
    }
}

#[cfg(all(test, feature = "memory-cache"))]
mod tests {
    use super::*;
    use crate::memory_cache::MemoryCache;
    use futures::executor::block_on;

    #[test]
    fn descendants_of_a_down_tenant_should_be_down() {
        let maintenance = Maintenance::new(MemoryCache::new());
        block_on(maintenance.mark_down("1.2.")).unwrap();

        assert!(block_on(maintenance.is_down("1.2.")).unwrap());
        assert!(block_on(maintenance.is_down("1.2.7.")).unwrap());
        assert!(!block_on(maintenance.is_down("1.3.")).unwrap());
        assert_eq!(block_on(maintenance.down_tenants()).unwrap(), vec!["1.2."]);
    }

    #[test]
    fn marker_should_be_removed_even_when_action_fails() {
        let cache = MemoryCache::new();
        let maintenance = Maintenance::new(cache.clone());

        let result: Result<()> = block_on(maintenance.with_tenant_down("4.", || async {
            assert!(!cache.is_empty());
            Err(Error::System("boom".to_string()))
        }));

        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
