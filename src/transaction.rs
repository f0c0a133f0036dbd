//! Per-invocation transaction state machine
//!
//! `Idle -> Active -> {Committed, RolledBack}`. A coordinator drives exactly
//! one transaction; a second `begin` is rejected.

use crate::error::{GuardError, Result};
use crate::store::{TransactionId, TransactionalStore};
use std::sync::Arc;

/// Lifecycle state of a coordinated transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Drives a single transaction against a `TransactionalStore`
///
/// A failed `commit` leaves the coordinator `Active` so the caller can still
/// roll back. `rollback` after a rollback is a no-op.
pub struct TransactionCoordinator {
    store: Arc<dyn TransactionalStore>,
    state: TransactionState,
    transaction: Option<TransactionId>,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            store,
            state: TransactionState::Idle,
            transaction: None,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Id of the open (or last) transaction
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction.as_ref()
    }

    /// Idle -> Active
    pub async fn begin(&mut self) -> Result<&TransactionId> {
        if self.state != TransactionState::Idle {
            return Err(GuardError::Transaction(format!(
                "Cannot begin transaction in state {:?}",
                self.state
            )));
        }

        let tx = self.store.begin().await.map_err(|e| match e {
            GuardError::Transaction(_) => e,
            other => GuardError::Transaction(format!("Begin failed: {}", other)),
        })?;
        self.state = TransactionState::Active;
        Ok(&*self.transaction.insert(tx))
    }

    /// Active -> Committed
    pub async fn commit(&mut self) -> Result<()> {
        let tx = self.active_transaction("commit")?;
        self.store.commit(&tx).await.map_err(|e| match e {
            GuardError::Transaction(_) => e,
            other => GuardError::Transaction(format!("Commit of {} failed: {}", tx, other)),
        })?;
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Active -> RolledBack
    pub async fn rollback(&mut self) -> Result<()> {
        if self.state == TransactionState::RolledBack {
            return Ok(());
        }

        let tx = self.active_transaction("roll back")?;
        self.store.rollback(&tx).await.map_err(|e| match e {
            GuardError::Transaction(_) => e,
            other => GuardError::Transaction(format!("Rollback of {} failed: {}", tx, other)),
        })?;
        self.state = TransactionState::RolledBack;
        Ok(())
    }

    fn active_transaction(&self, action: &str) -> Result<TransactionId> {
        match (&self.state, &self.transaction) {
            (TransactionState::Active, Some(tx)) => Ok(tx.clone()),
            (state, _) => Err(GuardError::Transaction(format!(
                "Cannot {} transaction in state {:?}",
                action, state
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepository;
    use async_trait::async_trait;

    /// Store whose commits always fail
    struct FailingCommitStore(MemoryRepository);

    #[async_trait]
    impl TransactionalStore for FailingCommitStore {
        async fn begin(&self) -> Result<TransactionId> {
            self.0.begin().await
        }

        async fn commit(&self, _tx: &TransactionId) -> Result<()> {
            Err(GuardError::Storage("replica unavailable".to_string()))
        }

        async fn rollback(&self, tx: &TransactionId) -> Result<()> {
            self.0.rollback(tx).await
        }
    }

    /// Store that cannot open transactions
    struct NoConnectionStore;

    #[async_trait]
    impl TransactionalStore for NoConnectionStore {
        async fn begin(&self) -> Result<TransactionId> {
            Err(GuardError::Storage("connection pool exhausted".to_string()))
        }

        async fn commit(&self, _tx: &TransactionId) -> Result<()> {
            Ok(())
        }

        async fn rollback(&self, _tx: &TransactionId) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_begin_commit() {
        let repo = MemoryRepository::new();
        let mut coordinator = TransactionCoordinator::new(Arc::new(repo.clone()));
        assert_eq!(coordinator.state(), TransactionState::Idle);

        coordinator.begin().await.unwrap();
        assert_eq!(coordinator.state(), TransactionState::Active);

        coordinator.commit().await.unwrap();
        assert_eq!(coordinator.state(), TransactionState::Committed);
        assert!(coordinator.state().is_terminal());
        assert_eq!(repo.commit_count().await, 1);
    }

    #[tokio::test]
    async fn test_reentrant_begin_denied() {
        let mut coordinator = TransactionCoordinator::new(Arc::new(MemoryRepository::new()));
        coordinator.begin().await.unwrap();

        let err = coordinator.begin().await.unwrap_err();
        assert!(matches!(err, GuardError::Transaction(_)));
        assert_eq!(coordinator.state(), TransactionState::Active);
    }

    #[tokio::test]
    async fn test_commit_requires_active() {
        let mut coordinator = TransactionCoordinator::new(Arc::new(MemoryRepository::new()));
        assert!(coordinator.commit().await.is_err());
        assert!(coordinator.rollback().await.is_err());

        coordinator.begin().await.unwrap();
        coordinator.commit().await.unwrap();
        assert!(coordinator.commit().await.is_err());
        assert!(coordinator.rollback().await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let repo = MemoryRepository::new();
        let mut coordinator = TransactionCoordinator::new(Arc::new(repo.clone()));
        coordinator.begin().await.unwrap();

        coordinator.rollback().await.unwrap();
        coordinator.rollback().await.unwrap();
        assert_eq!(coordinator.state(), TransactionState::RolledBack);
        assert_eq!(repo.rollback_count().await, 1);
    }

    #[tokio::test]
    async fn test_rollback_after_failed_commit() {
        let repo = MemoryRepository::new();
        let mut coordinator =
            TransactionCoordinator::new(Arc::new(FailingCommitStore(repo.clone())));
        coordinator.begin().await.unwrap();

        let err = coordinator.commit().await.unwrap_err();
        assert!(matches!(err, GuardError::Transaction(_)));
        assert!(err.to_string().contains("replica unavailable"));
        assert_eq!(coordinator.state(), TransactionState::Active);

        coordinator.rollback().await.unwrap();
        assert_eq!(coordinator.state(), TransactionState::RolledBack);
        assert_eq!(repo.rollback_count().await, 1);
        assert_eq!(repo.active_transactions().await, 0);
    }

    #[tokio::test]
    async fn test_begin_failure_is_transaction_error() {
        let mut coordinator = TransactionCoordinator::new(Arc::new(NoConnectionStore));

        let err = coordinator.begin().await.unwrap_err();
        assert!(matches!(err, GuardError::Transaction(_)));
        assert_eq!(err.kind(), "transaction");
        assert!(err.to_string().contains("connection pool exhausted"));
        assert_eq!(coordinator.state(), TransactionState::Idle);
        assert!(coordinator.transaction_id().is_none());
    }
}
