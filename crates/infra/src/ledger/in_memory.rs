use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use dispensary_core::{Entity, TenantId};
use dispensary_inventory::{InventoryItem, InventoryItemId, StockKey, StockMovement};

use super::store::{LedgerTransaction, StockLedgerStore, StoreError, check_item, check_movement};
use crate::config::LedgerConfig;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    tenant_id: TenantId,
    key: StockKey,
}

impl RowKey {
    fn of(item: &InventoryItem) -> Self {
        Self {
            tenant_id: item.tenant_id,
            key: item.key,
        }
    }
}

/// Committed row plus the lock that serializes writers of it.
#[derive(Debug)]
struct RowSlot {
    lock: Arc<Mutex<()>>,
    item: InventoryItem,
}

#[derive(Debug)]
struct Inner {
    rows: RwLock<HashMap<RowKey, RowSlot>>,
    movements: RwLock<Vec<StockMovement>>,
    lock_timeout: Duration,
}

/// In-memory ledger store with per-row async locks.
///
/// Intended for tests/dev. Rows hold only committed state; a transaction stages its
/// writes and publishes them on commit while still holding the row locks, so a waiter
/// that acquires the lock next always reads the latest committed row.
#[derive(Debug, Clone)]
pub struct InMemoryLedgerStore {
    inner: Arc<Inner>,
}

impl InMemoryLedgerStore {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::with_lock_timeout(Self::DEFAULT_LOCK_TIMEOUT)
    }

    /// Store whose lock waits are bounded by `config.lock_timeout`.
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::with_lock_timeout(config.lock_timeout)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                rows: RwLock::new(HashMap::new()),
                movements: RwLock::new(Vec::new()),
                lock_timeout,
            }),
        }
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

#[async_trait]
impl StockLedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTransaction {
            inner: self.inner.clone(),
            locked: HashMap::new(),
            staged: HashMap::new(),
            movements: Vec::new(),
        })
    }

    async fn find(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<Option<InventoryItem>, StoreError> {
        let rows = self.inner.rows.read().map_err(|_| poisoned())?;
        Ok(rows
            .get(&RowKey { tenant_id, key: *key })
            .map(|slot| slot.item.clone()))
    }

    async fn insert_item(&self, item: &InventoryItem) -> Result<(), StoreError> {
        check_item(item)?;
        let mut rows = self.inner.rows.write().map_err(|_| poisoned())?;
        let row_key = RowKey::of(item);
        if rows.contains_key(&row_key) {
            return Err(StoreError::DuplicateKey(item.key.describe()));
        }
        rows.insert(
            row_key,
            RowSlot {
                lock: Arc::new(Mutex::new(())),
                item: item.clone(),
            },
        );
        Ok(())
    }

    async fn movements(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<StockMovement>, StoreError> {
        let log = self.inner.movements.read().map_err(|_| poisoned())?;
        Ok(item_movements(log.iter(), tenant_id, item_id))
    }
}

fn item_movements<'a>(
    log: impl Iterator<Item = &'a StockMovement>,
    tenant_id: TenantId,
    item_id: InventoryItemId,
) -> Vec<StockMovement> {
    let mut movements: Vec<StockMovement> = log
        .filter(|m| m.belongs_to(tenant_id) && m.inventory_item_id == item_id)
        .cloned()
        .collect();
    // Stable sort keeps insertion order for equal timestamps.
    movements.sort_by_key(|m| m.created_at);
    movements
}

/// Transaction over an [`InMemoryLedgerStore`].
///
/// Holds the row guards it acquired; dropping it releases them and discards staged writes.
#[derive(Debug)]
pub struct InMemoryTransaction {
    inner: Arc<Inner>,
    locked: HashMap<RowKey, OwnedMutexGuard<()>>,
    staged: HashMap<RowKey, InventoryItem>,
    movements: Vec<StockMovement>,
}

impl InMemoryTransaction {
    fn committed(&self, row_key: &RowKey) -> Result<Option<InventoryItem>, StoreError> {
        let rows = self.inner.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(row_key).map(|slot| slot.item.clone()))
    }

    fn holds_item(&self, tenant_id: TenantId, item_id: InventoryItemId) -> Result<bool, StoreError> {
        let rows = self.inner.rows.read().map_err(|_| poisoned())?;
        Ok(self.locked.keys().any(|k| {
            k.tenant_id == tenant_id && rows.get(k).is_some_and(|slot| slot.item.id == item_id)
        }))
    }
}

#[async_trait]
impl LedgerTransaction for InMemoryTransaction {
    async fn find_for_update(
        &mut self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<Option<InventoryItem>, StoreError> {
        let row_key = RowKey { tenant_id, key: *key };

        if let Some(item) = self.staged.get(&row_key) {
            return Ok(Some(item.clone()));
        }
        if self.locked.contains_key(&row_key) {
            return self.committed(&row_key);
        }

        let lock = {
            let rows = self.inner.rows.read().map_err(|_| poisoned())?;
            match rows.get(&row_key) {
                Some(slot) => slot.lock.clone(),
                None => return Ok(None),
            }
        };

        let guard = tokio::time::timeout(self.inner.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                StoreError::LockTimeout(format!(
                    "{} not released within {:?}",
                    key.describe(),
                    self.inner.lock_timeout
                ))
            })?;
        self.locked.insert(row_key, guard);

        self.committed(&row_key)
    }

    async fn save(&mut self, item: &InventoryItem) -> Result<(), StoreError> {
        check_item(item)?;
        let row_key = RowKey::of(item);
        if !self.locked.contains_key(&row_key) {
            return Err(StoreError::TenantIsolation(format!(
                "save of {} without holding its row lock",
                item.key.describe()
            )));
        }
        self.staged.insert(row_key, item.clone());
        Ok(())
    }

    async fn append_movement(&mut self, movement: &StockMovement) -> Result<(), StoreError> {
        check_movement(movement)?;
        if !self.holds_item(movement.tenant_id, movement.inventory_item_id)? {
            return Err(StoreError::TenantIsolation(
                "movement for an item not locked by this transaction".to_string(),
            ));
        }
        self.movements.push(movement.clone());
        Ok(())
    }

    async fn movements(
        &mut self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<StockMovement>, StoreError> {
        let log = self.inner.movements.read().map_err(|_| poisoned())?;
        Ok(item_movements(
            log.iter().chain(self.movements.iter()),
            tenant_id,
            item_id,
        ))
    }

    async fn commit(self) -> Result<(), StoreError> {
        let InMemoryTransaction {
            inner,
            locked,
            staged,
            movements,
        } = self;

        {
            let mut rows = inner.rows.write().map_err(|_| poisoned())?;
            let mut log = inner.movements.write().map_err(|_| poisoned())?;
            for (row_key, item) in staged {
                if let Some(slot) = rows.get_mut(&row_key) {
                    slot.item = item;
                }
            }
            log.extend(movements);
        }

        // Row locks are released only once the new state is visible.
        drop(locked);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        drop(self);
        Ok(())
    }
}
