use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use dispensary_core::TenantId;
use dispensary_inventory::{InventoryItem, InventoryItemId, StockKey, StockMovement};

/// Ledger store operation error.
///
/// These are **infrastructure errors** (locking, storage, isolation) as opposed to
/// the domain errors raised by the stock rules.
///
/// - **LockTimeout / Conflict / Unavailable**: transient; retry the whole operation.
/// - **DuplicateKey**: a row for this stock key already exists.
/// - **Invariant**: the write boundary refused a row or movement that breaks the rules.
/// - **TenantIsolation**: a write targeted a row outside the transaction's locks.
/// - **Backend**: anything else the backend reported.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate stock key: {0}")]
    DuplicateKey(String),

    #[error("write rejected: {0}")]
    Invariant(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the whole operation from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout(_) | StoreError::Conflict(_) | StoreError::Unavailable(_)
        )
    }
}

/// Durable storage of stock rows and the append-only movement log.
///
/// Row identity is `(tenant_id, StockKey)`; every read is tenant-scoped.
///
/// ## Locking contract
///
/// Mutations happen only inside a [`LedgerTransaction`]:
/// - `find_for_update` takes an exclusive lock on the row, held until commit or rollback
/// - a second `find_for_update` of the same row in the same transaction does not block
///   and observes the transaction's own staged writes
/// - operations on the same row from different transactions are fully serialized
/// - rows not referenced by a transaction are never locked by it
///
/// Locks live in the store (not the process), so several service instances may share
/// one backend. Waiting for a lock is bounded by the store's lock timeout and surfaces
/// as [`StoreError::LockTimeout`].
#[async_trait]
pub trait StockLedgerStore: Send + Sync {
    type Tx: LedgerTransaction;

    /// Open a request-scoped transaction.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Non-locking read of the last committed row. Never feed this into a mutation.
    async fn find(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<Option<InventoryItem>, StoreError>;

    /// Create the row for a new stock key.
    async fn insert_item(&self, item: &InventoryItem) -> Result<(), StoreError>;

    /// Movements of one item in replay order (`created_at`, then insertion order).
    async fn movements(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<StockMovement>, StoreError>;
}

/// One open transaction against a [`StockLedgerStore`].
///
/// Dropping a transaction without committing discards every staged write and
/// releases its locks.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Lock the row and return its current state.
    async fn find_for_update(
        &mut self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<Option<InventoryItem>, StoreError>;

    /// Stage the new state of a row locked by this transaction.
    async fn save(&mut self, item: &InventoryItem) -> Result<(), StoreError>;

    /// Stage a movement for a row locked by this transaction.
    async fn append_movement(&mut self, movement: &StockMovement) -> Result<(), StoreError>;

    /// Movements of one item in replay order, read inside this transaction.
    ///
    /// Includes movements staged by this transaction. Reads through the transaction's
    /// own connection, so it never waits on a second one while row locks are held.
    async fn movements(
        &mut self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<StockMovement>, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> StockLedgerStore for Arc<S>
where
    S: StockLedgerStore,
{
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }

    async fn find(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<Option<InventoryItem>, StoreError> {
        (**self).find(tenant_id, key).await
    }

    async fn insert_item(&self, item: &InventoryItem) -> Result<(), StoreError> {
        (**self).insert_item(item).await
    }

    async fn movements(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<StockMovement>, StoreError> {
        (**self).movements(tenant_id, item_id).await
    }
}

/// Write-boundary checks shared by store implementations.
pub(crate) fn check_item(item: &InventoryItem) -> Result<(), StoreError> {
    item.check_invariants()
        .map_err(|e| StoreError::Invariant(e.to_string()))
}

pub(crate) fn check_movement(movement: &StockMovement) -> Result<(), StoreError> {
    if !movement.is_consistent() {
        return Err(StoreError::Invariant(format!(
            "movement {} does not satisfy new = previous + quantity",
            movement.id.0
        )));
    }
    if movement.new_quantity < 0 {
        return Err(StoreError::Invariant(
            "movement would leave negative on-hand".to_string(),
        ));
    }
    Ok(())
}
