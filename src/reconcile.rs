//! Startup comparison of the sharding cache with its durable backup.

use std::collections::BTreeSet;

use tracing::{error, info};

use crate::cache::{DistributedCache, DistributedCacheExt, sharding_entry_key};
use crate::error::{Error, Result};
use crate::lock::{NamedLock, with_lock};
use crate::registry::ShardingRegistry;
use crate::sharding::ShardingEntry;
use crate::store::{IsolationLevel, ShardingBackupStore, Store, StoreTransaction, Transactional};

/// Which recovery path a reconciliation took.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReconcileOutcome {
    /// Neither the cache nor the backup had entries.
    BothEmpty,
    /// The backup was empty and was filled from the cache.
    BackupSeeded(usize),
    /// The cache was empty and was restored from the backup.
    CacheRestored(usize),
    /// Both held the same entry names.
    InSync(usize),
}

impl<S, C, L> ShardingRegistry<S, C, L>
where
    S: Store,
    C: DistributedCache,
    L: NamedLock,
{
    /// Compares cached entries with the backup table and repairs an empty side.
    ///
    /// Runs under the registry lock. When both sides hold entries but their
    /// names differ, returns [`Error::Consistency`] listing the names each side
    /// is missing and changes nothing.
    pub async fn reconcile_backup(&self) -> Result<ReconcileOutcome> {
        with_lock(self.lock(), &self.options().lock_name, || self.reconcile_locked()).await
    }

    async fn reconcile_locked(&self) -> Result<ReconcileOutcome> {
        let cached = self.cached_entries().await?;
        let backups = self.store().backups().await?;

        match (cached.is_empty(), backups.is_empty()) {
            (true, true) => {
                info!("no sharding entries in the cache or the backup");
                Ok(ReconcileOutcome::BothEmpty)
            }
            (false, true) => {
                let mut tx = self.store().begin(IsolationLevel::ReadCommitted).await?;
                for entry in &cached {
                    tx.upsert_backup(entry).await?;
                }
                tx.commit().await?;
                info!(count = cached.len(), "sharding backup seeded from the cache");
                Ok(ReconcileOutcome::BackupSeeded(cached.len()))
            }
            (true, false) => {
                let pairs: Vec<(String, ShardingEntry)> = backups
                    .iter()
                    .map(|entry| (sharding_entry_key(&entry.name), entry.clone()))
                    .collect();
                self.cache().set_many_classes(&pairs).await?;
                error!(
                    count = backups.len(),
                    "sharding cache was empty and has been restored from the backup"
                );
                Ok(ReconcileOutcome::CacheRestored(backups.len()))
            }
            (false, false) => {
                compare_names(&cached, &backups)?;
                info!(count = cached.len(), "sharding cache and backup are in sync");
                Ok(ReconcileOutcome::InSync(cached.len()))
            }
        }
    }
}

fn compare_names(cached: &[ShardingEntry], backups: &[ShardingEntry]) -> Result<()> {
    let in_cache: BTreeSet<&str> = cached.iter().map(|entry| entry.name.as_str()).collect();
    let in_backup: BTreeSet<&str> = backups.iter().map(|entry| entry.name.as_str()).collect();

    let mut problems = Vec::new();
    let missing_in_backup: Vec<&str> = in_cache.difference(&in_backup).copied().collect();
    if !missing_in_backup.is_empty() {
        problems.push(format!(
            "the backup is missing: {}",
            missing_in_backup.join(", ")
        ));
    }
    let missing_in_cache: Vec<&str> = in_backup.difference(&in_cache).copied().collect();
    if !missing_in_cache.is_empty() {
        problems.push(format!(
            "the cache is missing: {}",
            missing_in_cache.join(", ")
        ));
    }
    if problems.is_empty() {
        return Ok(());
    }
    let message = problems.join("; ");
    error!(%message, "sharding cache and backup disagree");
    Err(Error::Consistency(message))
}
