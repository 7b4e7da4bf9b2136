//! Transactions with post-commit hooks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::error::{Error, Result};
use crate::store::{ChangeSet, IsolationLevel, StoreTransaction, Transactional};

/// Callback run after a transaction commits.
#[async_trait]
pub trait CommitHook: Send + Sync {
    /// Reacts to what the committed transaction changed.
    async fn after_commit(&self, changes: &ChangeSet) -> Result<()>;
}

/// A store transaction plus the hooks to run once it commits.
///
/// Hooks see only committed changes: a rollback, a failed commit or simply
/// dropping the unit of work discards them without running.
pub struct UnitOfWork<T> {
    tx: T,
    hooks: Vec<Arc<dyn CommitHook>>,
}

impl<T: StoreTransaction> UnitOfWork<T> {
    /// Begins a transaction on `store`.
    pub async fn begin<S>(store: &S, isolation: IsolationLevel) -> Result<Self>
    where
        S: Transactional<Tx = T> + Sync,
    {
        Ok(Self::new(store.begin(isolation).await?))
    }

    /// Wraps an open transaction.
    pub fn new(tx: T) -> Self {
        Self {
            tx,
            hooks: Vec::new(),
        }
    }

    /// Registers a hook.
    pub fn with_hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Returns the transaction.
    pub fn tx(&mut self) -> &mut T {
        &mut self.tx
    }

    /// Commits, then runs every hook in registration order.
    ///
    /// A hook failure does not undo the commit. It is logged and returned as
    /// a system error after the remaining hooks have run.
    pub async fn commit(self) -> Result<ChangeSet> {
        let changes = self.tx.commit().await?;
        let mut failure = None;
        for hook in &self.hooks {
            if let Err(err) = hook.after_commit(&changes).await {
                error!(error = %err, "commit hook failed after a successful commit");
                failure.get_or_insert(err);
            }
        }
        match failure {
            None => Ok(changes),
            Some(err) => Err(Error::System(format!(
                "the change was saved but a follow-up update failed: {err}"
            ))),
        }
    }

    /// Rolls back and drops the hooks.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(Error::from)
    }
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::permission::{PackedPermissions, Permission};
    use crate::role::Role;
    use crate::store::RoleStore;
    use crate::types::RoleName;
    use futures::executor::block_on;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ChangeSet>>);

    #[async_trait]
    impl CommitHook for Recorder {
        async fn after_commit(&self, changes: &ChangeSet) -> Result<()> {
            self.0.lock().expect("poisoned lock").push(changes.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl CommitHook for Failing {
        async fn after_commit(&self, _changes: &ChangeSet) -> Result<()> {
            Err(Error::System("cache down".to_string()))
        }
    }

    fn role() -> Role {
        Role::new(
            RoleName::new("Editor").unwrap(),
            PackedPermissions::pack([Permission::new(3).unwrap()]),
        )
    }

    #[test]
    fn hooks_should_run_after_commit() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let mut uow = block_on(UnitOfWork::begin(&store, IsolationLevel::ReadCommitted))
            .unwrap()
            .with_hook(recorder.clone());
        block_on(uow.tx().upsert_role(&role())).unwrap();

        block_on(uow.commit()).unwrap();

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].roles.contains(&RoleName::new("Editor").unwrap()));
    }

    #[test]
    fn rollback_should_discard_hooks() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let mut uow = block_on(UnitOfWork::begin(&store, IsolationLevel::ReadCommitted))
            .unwrap()
            .with_hook(recorder.clone());
        block_on(uow.tx().upsert_role(&role())).unwrap();

        block_on(uow.rollback()).unwrap();

        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_commit_should_not_run_hooks() {
        let store = MemoryStore::new();
        store.fail_next_commit();
        let recorder = Arc::new(Recorder::default());
        let mut uow = block_on(UnitOfWork::begin(&store, IsolationLevel::ReadCommitted))
            .unwrap()
            .with_hook(recorder.clone());
        block_on(uow.tx().upsert_role(&role())).unwrap();

        assert!(block_on(uow.commit()).is_err());
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn hook_failure_should_keep_commit_and_report_system_error() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let mut uow = block_on(UnitOfWork::begin(&store, IsolationLevel::ReadCommitted))
            .unwrap()
            .with_hook(Arc::new(Failing))
            .with_hook(recorder.clone());
        block_on(uow.tx().upsert_role(&role())).unwrap();

        let err = block_on(uow.commit()).unwrap_err();

        assert!(matches!(err, Error::System(_)));
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        assert!(
            block_on(store.role(&RoleName::new("Editor").unwrap()))
                .unwrap()
                .is_some()
        );
    }
}
