//! Transactional store and repository ports
//!
//! `TransactionalStore` provides atomic begin/commit/rollback; `Repository`
//! performs entity writes inside a transaction. `MemoryRepository` implements
//! both, staging writes per transaction so they are invisible to readers
//! until commit.

use crate::error::{GuardError, Result};
use crate::types::now_millis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Handle for an open transaction (tx-<uuid>)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new() -> Self {
        Self(format!("tx-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Atomic commit/rollback provider
///
/// Writes made under an open transaction must stay invisible to other
/// readers until `commit` succeeds.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Open a new transaction
    async fn begin(&self) -> Result<TransactionId>;

    /// Make all writes of the transaction visible
    async fn commit(&self, tx: &TransactionId) -> Result<()>;

    /// Discard all writes of the transaction
    async fn rollback(&self, tx: &TransactionId) -> Result<()>;
}

/// A persisted content entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique identifier (ent-<uuid>)
    pub id: String,

    /// Entity kind (e.g., "article", "media")
    pub kind: String,

    pub data: serde_json::Value,

    /// Incremented on every update
    pub version: u64,

    pub published: bool,

    /// Unix timestamp in milliseconds
    pub created_at: u64,

    /// Unix timestamp in milliseconds
    pub updated_at: u64,
}

/// Entity persistence, invoked by operation handlers inside a transaction
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create(
        &self,
        tx: &TransactionId,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<Entity>;

    async fn update(
        &self,
        tx: &TransactionId,
        id: &str,
        data: serde_json::Value,
    ) -> Result<Entity>;

    async fn delete(&self, tx: &TransactionId, id: &str) -> Result<()>;

    async fn publish(&self, tx: &TransactionId, id: &str) -> Result<Entity>;

    /// Read the committed state of an entity
    async fn get(&self, id: &str) -> Result<Option<Entity>>;

    /// List committed entities, optionally filtered by kind
    async fn list(&self, kind: Option<&str>, limit: usize) -> Result<Vec<Entity>>;
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Put(Entity),
    Delete(String),
}

#[derive(Default)]
struct RepositoryState {
    committed: HashMap<String, Entity>,
    pending: HashMap<TransactionId, Vec<StagedWrite>>,
    commits: u64,
    rollbacks: u64,
}

impl RepositoryState {
    fn staged(&mut self, tx: &TransactionId) -> Result<&mut Vec<StagedWrite>> {
        self.pending
            .get_mut(tx)
            .ok_or_else(|| GuardError::Transaction(format!("Transaction not active: {}", tx)))
    }

    /// Entity as seen from inside the transaction
    fn view(&self, tx: &TransactionId, id: &str) -> Option<Entity> {
        if let Some(writes) = self.pending.get(tx) {
            for write in writes.iter().rev() {
                match write {
                    StagedWrite::Put(e) if e.id == id => return Some(e.clone()),
                    StagedWrite::Delete(d) if d == id => return None,
                    _ => {}
                }
            }
        }
        self.committed.get(id).cloned()
    }
}

/// In-memory repository for development and testing
///
/// Clones share the same underlying state.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<RwLock<RepositoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful commits
    pub async fn commit_count(&self) -> u64 {
        self.state.read().await.commits
    }

    /// Number of rollbacks
    pub async fn rollback_count(&self) -> u64 {
        self.state.read().await.rollbacks
    }

    /// Number of transactions currently open
    pub async fn active_transactions(&self) -> usize {
        self.state.read().await.pending.len()
    }

    async fn modify(
        &self,
        tx: &TransactionId,
        id: &str,
        apply: impl FnOnce(&mut Entity) + Send,
    ) -> Result<Entity> {
        let mut state = self.state.write().await;
        let mut entity = state
            .view(tx, id)
            .ok_or_else(|| GuardError::NotFound(format!("Entity not found: {}", id)))?;
        apply(&mut entity);
        entity.updated_at = now_millis();
        state.staged(tx)?.push(StagedWrite::Put(entity.clone()));
        Ok(entity)
    }
}

#[async_trait]
impl TransactionalStore for MemoryRepository {
    async fn begin(&self) -> Result<TransactionId> {
        let tx = TransactionId::new();
        let mut state = self.state.write().await;
        state.pending.insert(tx.clone(), Vec::new());
        tracing::debug!(transaction = %tx, "Transaction opened");
        Ok(tx)
    }

    async fn commit(&self, tx: &TransactionId) -> Result<()> {
        let mut state = self.state.write().await;
        let writes = state
            .pending
            .remove(tx)
            .ok_or_else(|| GuardError::Transaction(format!("Transaction not active: {}", tx)))?;

        let count = writes.len();
        for write in writes {
            match write {
                StagedWrite::Put(entity) => {
                    state.committed.insert(entity.id.clone(), entity);
                }
                StagedWrite::Delete(id) => {
                    state.committed.remove(&id);
                }
            }
        }
        state.commits += 1;

        tracing::debug!(transaction = %tx, writes = count, "Transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx: &TransactionId) -> Result<()> {
        let mut state = self.state.write().await;
        let writes = state
            .pending
            .remove(tx)
            .ok_or_else(|| GuardError::Transaction(format!("Transaction not active: {}", tx)))?;
        state.rollbacks += 1;

        tracing::debug!(transaction = %tx, discarded = writes.len(), "Transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create(
        &self,
        tx: &TransactionId,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<Entity> {
        let now = now_millis();
        let entity = Entity {
            id: format!("ent-{}", uuid::Uuid::new_v4()),
            kind: kind.to_string(),
            data,
            version: 1,
            published: false,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.write().await;
        state.staged(tx)?.push(StagedWrite::Put(entity.clone()));
        Ok(entity)
    }

    async fn update(
        &self,
        tx: &TransactionId,
        id: &str,
        data: serde_json::Value,
    ) -> Result<Entity> {
        self.modify(tx, id, |entity| {
            entity.data = data;
            entity.version += 1;
        })
        .await
    }

    async fn delete(&self, tx: &TransactionId, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.view(tx, id).is_none() {
            return Err(GuardError::NotFound(format!("Entity not found: {}", id)));
        }
        state.staged(tx)?.push(StagedWrite::Delete(id.to_string()));
        Ok(())
    }

    async fn publish(&self, tx: &TransactionId, id: &str) -> Result<Entity> {
        self.modify(tx, id, |entity| {
            entity.published = true;
            entity.version += 1;
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Entity>> {
        let state = self.state.read().await;
        Ok(state.committed.get(id).cloned())
    }

    async fn list(&self, kind: Option<&str>, limit: usize) -> Result<Vec<Entity>> {
        let state = self.state.read().await;
        let mut entities: Vec<Entity> = state
            .committed
            .values()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        entities.truncate(limit);
        Ok(entities)
    }
}
