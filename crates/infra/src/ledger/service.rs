//! Ledger operations (application-level orchestration).
//!
//! Every mutation follows the same pipeline:
//!
//! ```text
//! Request
//!   ↓
//! 1. Validate input (no transaction opened for bad input)
//!   ↓
//! 2. Begin a transaction and lock every referenced row (find_for_update)
//!   ↓
//! 3. Apply the pure stock rules to the locked rows
//!   ↓
//! 4. Save rows and append movements
//!   ↓
//! 5. Commit (any failure before this point rolls back everything)
//!   ↓
//! 6. Emit threshold notifications (best effort, never affects the result)
//! ```
//!
//! Mutation decisions are only ever made on rows read under lock inside the same
//! transaction. The non-locking `find` is used for plain queries.
//!
//! ## Error Semantics
//!
//! - **NotFound**: the stock key was never provisioned for this tenant; not retryable
//! - **InsufficientStock**: retry with a smaller quantity
//! - **Validation**: bad input; fix the request
//! - **Store** with a transient cause (lock timeout, serialization failure, pool exhausted):
//!   retry the whole operation, see [`LedgerError::is_retryable`]

use std::collections::HashMap;

use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;
use tracing::instrument;

use dispensary_core::{DomainError, TenantId};
use dispensary_events::EventEmitter;
use dispensary_inventory::{
    AdjustStock, AuditReport, DEFAULT_LOW_STOCK_THRESHOLD, FulfillReservation, InventoryItem,
    InventoryItemId, MovementType, ProvisionItem, ReservationLine, StockEvent, StockKey,
    StockMovement, replay_movements, threshold_events,
};

use super::store::{LedgerTransaction, StockLedgerStore, StoreError};
use crate::config::LedgerConfig;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("insufficient stock for {0}")]
    InsufficientStock(String),

    /// The stock key is already provisioned.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The movement log does not reproduce the row's on-hand count.
    #[error("audit mismatch: {0}")]
    AuditMismatch(String),

    #[error(transparent)]
    Store(StoreError),
}

impl LedgerError {
    /// Whether retrying the whole operation unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => LedgerError::Validation(msg),
            DomainError::InvariantViolation(msg) => LedgerError::Invariant(msg),
            DomainError::NotFound(what) => LedgerError::NotFound(what),
            DomainError::InsufficientStock(what) => LedgerError::InsufficientStock(what),
            DomainError::Conflict(msg) => LedgerError::Conflict(msg),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::DuplicateKey(msg) => LedgerError::Conflict(msg),
            other => LedgerError::Store(other),
        }
    }
}

/// Current time at the microsecond precision Postgres `TIMESTAMPTZ` keeps, so rows
/// returned by an operation equal what a later read yields.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn item_not_found() -> LedgerError {
    LedgerError::NotFound("inventory item".to_string())
}

/// The inventory ledger: stock counts, reservations and their audit trail.
///
/// - `S`: ledger store (in-memory for tests, Postgres in production)
/// - `E`: notification sink for `low_stock` / `restocked`
///
/// Holds no stock state of its own; any number of instances may share a store.
#[derive(Debug, Clone)]
pub struct InventoryLedger<S, E> {
    store: S,
    emitter: E,
    default_low_stock_threshold: i64,
}

impl<S, E> InventoryLedger<S, E> {
    pub fn new(store: S, emitter: E) -> Self {
        Self {
            store,
            emitter,
            default_low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
        }
    }

    /// Ledger with the configured default low-stock threshold.
    pub fn from_config(store: S, emitter: E, config: &LedgerConfig) -> Self {
        Self::new(store, emitter).with_default_low_stock_threshold(config.default_low_stock_threshold)
    }

    /// Threshold given to provisioned items that do not specify one.
    pub fn with_default_low_stock_threshold(mut self, threshold: i64) -> Self {
        self.default_low_stock_threshold = threshold;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn emitter(&self) -> &E {
        &self.emitter
    }
}

impl<S, E> InventoryLedger<S, E>
where
    S: StockLedgerStore,
    E: EventEmitter<StockEvent>,
{
    /// Create the stock row for a new key with zero counts.
    #[instrument(
        skip_all,
        fields(tenant_id = %request.tenant_id, product_id = %request.key.product_id),
        err
    )]
    pub async fn provision_item(&self, request: ProvisionItem) -> Result<InventoryItem, LedgerError> {
        let threshold = request
            .low_stock_threshold
            .unwrap_or(self.default_low_stock_threshold);
        let item = InventoryItem::provision(
            InventoryItemId::new(),
            request.tenant_id,
            request.key,
            threshold,
            now(),
        )?;

        self.store.insert_item(&item).await?;
        tracing::info!(item_id = %item.id, "inventory item provisioned");
        Ok(item)
    }

    /// Apply a signed delta to on-hand and record the movement.
    ///
    /// Returns the updated row. Fails with `InsufficientStock` when on-hand would go
    /// negative or below the reserved count; nothing is persisted in that case.
    ///
    /// The request is narrower than a bare signed delta: a `quantity` of zero or a blank
    /// `reason` is rejected with `Validation` before any transaction is opened, since
    /// neither would leave a meaningful movement.
    #[instrument(
        skip_all,
        fields(
            tenant_id = %request.tenant_id,
            product_id = %request.key.product_id,
            quantity = request.quantity,
            movement_type = %request.movement_type
        ),
        err
    )]
    pub async fn adjust_stock(&self, request: AdjustStock) -> Result<InventoryItem, LedgerError> {
        request.validate()?;

        let mut tx = self.store.begin().await?;
        let (item, events) = match adjust_locked(&mut tx, &request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                rollback(tx).await;
                return Err(err);
            }
        };
        tx.commit().await?;

        tracing::info!(
            item_id = %item.id,
            on_hand = item.quantity_on_hand,
            "stock adjusted"
        );
        self.publish(request.tenant_id, events);
        Ok(item)
    }

    /// Reserve every line or none.
    ///
    /// Rows are locked in the order the lines are given; callers that share rows should
    /// pass lines in a stable order (see [`dispensary_inventory::sort_lines`]). Lines naming
    /// the same key are checked against their combined quantity.
    #[instrument(skip_all, fields(%tenant_id, lines = lines.len()), err)]
    pub async fn reserve_stock(
        &self,
        tenant_id: TenantId,
        lines: &[ReservationLine],
    ) -> Result<(), LedgerError> {
        lines.iter().try_for_each(ReservationLine::validate)?;
        if lines.is_empty() {
            return Ok(());
        }

        self.mutate_lines(tenant_id, lines, |item, quantity, now| {
            item.reserve(quantity, now)
        })
        .await?;

        tracing::info!("stock reserved");
        Ok(())
    }

    /// Give reserved units back to the available pool. On-hand is untouched.
    #[instrument(skip_all, fields(%tenant_id, lines = lines.len()), err)]
    pub async fn release_reservation(
        &self,
        tenant_id: TenantId,
        lines: &[ReservationLine],
    ) -> Result<(), LedgerError> {
        lines.iter().try_for_each(ReservationLine::validate)?;
        if lines.is_empty() {
            return Ok(());
        }

        self.mutate_lines(tenant_id, lines, |item, quantity, now| {
            item.release(quantity, now)
        })
        .await?;

        tracing::info!("reservation released");
        Ok(())
    }

    /// Turn reserved units into sold units, one `sell` movement per line.
    ///
    /// Returns the updated rows in the order their keys first appear in the request.
    #[instrument(
        skip_all,
        fields(tenant_id = %request.tenant_id, lines = request.lines.len()),
        err
    )]
    pub async fn fulfill_reservation(
        &self,
        request: FulfillReservation,
    ) -> Result<Vec<InventoryItem>, LedgerError> {
        request.validate()?;
        if request.lines.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.store.begin().await?;
        let (items, events) = match fulfill_locked(&mut tx, &request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                rollback(tx).await;
                return Err(err);
            }
        };
        tx.commit().await?;

        tracing::info!(items = items.len(), "reservation fulfilled");
        self.publish(request.tenant_id, events);
        Ok(items)
    }

    #[instrument(skip_all, fields(%tenant_id, product_id = %key.product_id), err)]
    pub async fn set_low_stock_threshold(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
        threshold: i64,
    ) -> Result<InventoryItem, LedgerError> {
        let mut tx = self.store.begin().await?;
        let result = async {
            let mut item = lock_item(&mut tx, tenant_id, key).await?;
            item.set_low_stock_threshold(threshold, now())?;
            tx.save(&item).await?;
            Ok::<_, LedgerError>(item)
        }
        .await;

        match result {
            Ok(item) => {
                tx.commit().await?;
                Ok(item)
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    /// Last committed state of a row.
    pub async fn get_item(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<InventoryItem, LedgerError> {
        self.store
            .find(tenant_id, key)
            .await?
            .ok_or_else(item_not_found)
    }

    /// Movements of a row in replay order.
    pub async fn movement_history(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<Vec<StockMovement>, LedgerError> {
        let item = self.get_item(tenant_id, key).await?;
        Ok(self.store.movements(tenant_id, item.id).await?)
    }

    /// Replay the movement log and check it reproduces the row's on-hand count.
    ///
    /// The row is locked while the log is read, on the same transaction, so that no
    /// adjustment can slip in between the two reads; nothing is written.
    #[instrument(skip_all, fields(%tenant_id, product_id = %key.product_id), err)]
    pub async fn audit_item(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<AuditReport, LedgerError> {
        let mut tx = self.store.begin().await?;
        let item = match lock_item(&mut tx, tenant_id, key).await {
            Ok(item) => item,
            Err(err) => {
                rollback(tx).await;
                return Err(err);
            }
        };

        let movements = tx.movements(tenant_id, item.id).await;
        rollback(tx).await;

        let report = replay_movements(&item, &movements?)
            .map_err(|e| LedgerError::AuditMismatch(e.to_string()))?;
        tracing::debug!(movements = report.movement_count, "audit passed");
        Ok(report)
    }

    /// Lock the distinct rows of `lines`, apply `apply` per line, save and commit.
    async fn mutate_lines<F>(
        &self,
        tenant_id: TenantId,
        lines: &[ReservationLine],
        apply: F,
    ) -> Result<(), LedgerError>
    where
        F: Fn(&mut InventoryItem, i64, DateTime<Utc>) -> Result<(), DomainError> + Send + Sync,
    {
        let mut tx = self.store.begin().await?;
        let result = async {
            let (mut items, index) = lock_lines(&mut tx, tenant_id, lines).await?;
            let now = now();
            for line in lines {
                apply(&mut items[index[&line.key]], line.quantity, now)?;
            }
            for item in &items {
                tx.save(item).await?;
            }
            Ok::<_, LedgerError>(())
        }
        .await;

        match result {
            Ok(()) => Ok(tx.commit().await?),
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    fn publish(&self, tenant_id: TenantId, events: Vec<StockEvent>) {
        for event in events {
            tracing::debug!(?event, "emitting stock event");
            self.emitter.emit(tenant_id, event);
        }
    }
}

async fn lock_item<T: LedgerTransaction>(
    tx: &mut T,
    tenant_id: TenantId,
    key: &StockKey,
) -> Result<InventoryItem, LedgerError> {
    tx.find_for_update(tenant_id, key)
        .await?
        .ok_or_else(item_not_found)
}

/// Lock each distinct key once, in order of first appearance.
async fn lock_lines<T: LedgerTransaction>(
    tx: &mut T,
    tenant_id: TenantId,
    lines: &[ReservationLine],
) -> Result<(Vec<InventoryItem>, HashMap<StockKey, usize>), LedgerError> {
    let mut items = Vec::with_capacity(lines.len());
    let mut index = HashMap::with_capacity(lines.len());
    for line in lines {
        if index.contains_key(&line.key) {
            continue;
        }
        let item = lock_item(tx, tenant_id, &line.key).await?;
        index.insert(line.key, items.len());
        items.push(item);
    }
    Ok((items, index))
}

async fn adjust_locked<T: LedgerTransaction>(
    tx: &mut T,
    request: &AdjustStock,
) -> Result<(InventoryItem, Vec<StockEvent>), LedgerError> {
    let mut item = lock_item(tx, request.tenant_id, &request.key).await?;

    let now = now();
    let change = item.adjust_on_hand(request.quantity, now)?;
    tx.save(&item).await?;

    let movement = StockMovement::record(
        request.tenant_id,
        item.id,
        request.movement_type,
        change,
        request.reason.clone(),
        request.reference_id.clone(),
        request.actor_id,
        now,
    );
    tx.append_movement(&movement).await?;

    let events = threshold_events(&item, change, now);
    Ok((item, events))
}

async fn fulfill_locked<T: LedgerTransaction>(
    tx: &mut T,
    request: &FulfillReservation,
) -> Result<(Vec<InventoryItem>, Vec<StockEvent>), LedgerError> {
    let (mut items, index) = lock_lines(tx, request.tenant_id, &request.lines).await?;

    let now = now();
    let mut movements = Vec::with_capacity(request.lines.len());
    let mut events = Vec::new();
    for line in &request.lines {
        let item = &mut items[index[&line.key]];
        let change = item.fulfill(line.quantity, now)?;
        events.extend(threshold_events(item, change, now));
        movements.push(StockMovement::record(
            request.tenant_id,
            item.id,
            MovementType::Sell,
            change,
            request.reason.clone(),
            request.reference_id.clone(),
            request.actor_id,
            now,
        ));
    }

    for item in &items {
        tx.save(item).await?;
    }
    for movement in &movements {
        tx.append_movement(movement).await?;
    }
    Ok((items, events))
}

async fn rollback<T: LedgerTransaction>(tx: T) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(error = %err, "rollback failed; transaction is discarded on drop");
    }
}
