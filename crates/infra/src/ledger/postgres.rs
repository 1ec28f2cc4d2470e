//! Postgres-backed ledger store.
//!
//! Row locks are real `SELECT … FOR UPDATE` locks, so any number of service instances
//! may run against the same database. Each transaction sets `lock_timeout` locally;
//! a lock wait that exceeds it fails with SQLSTATE `55P03`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `55P03` | `LockTimeout` | Row lock not granted within `lock_timeout` |
//! | Database | `40001`, `40P01` | `Conflict` | Serialization failure / deadlock victim |
//! | Database | `23505` | `DuplicateKey` | Stock key provisioned twice |
//! | Database | `23514` | `Invariant` | A CHECK constraint refused the row |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolTimedOut / PoolClosed / Io | N/A | `Unavailable` | Could not get a connection |
//! | Other | N/A | `Backend` | Decode failures, protocol errors, etc. |

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use dispensary_core::{LocationId, ProductId, RecordId, TenantId, UserId, VariantId};
use dispensary_inventory::{
    InventoryItem, InventoryItemId, MovementType, StockKey, StockMovement, StockMovementId,
};

use super::store::{LedgerTransaction, StockLedgerStore, StoreError, check_item, check_movement};
use crate::config::LedgerConfig;

/// Schema applied by [`PostgresLedgerStore::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_inventory_ledger.sql");

const ITEM_COLUMNS: &str = "id, tenant_id, product_id, variant_id, location_id, \
     quantity_on_hand, quantity_reserved, low_stock_threshold, created_at, updated_at";

const MOVEMENT_COLUMNS: &str = "id, tenant_id, inventory_item_id, movement_type, quantity, \
     previous_quantity, new_quantity, reason, reference_id, actor_id, created_at";

/// Postgres-backed ledger store.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &LedgerConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("DATABASE_URL is not configured".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool, config.lock_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

fn item_query(key: &StockKey, for_update: bool) -> String {
    let variant_clause = if key.variant_id.is_some() {
        "variant_id = $4"
    } else {
        "variant_id IS NULL"
    };
    let lock_clause = if for_update { " FOR UPDATE" } else { "" };
    format!(
        "SELECT {ITEM_COLUMNS} FROM inventory_items \
         WHERE tenant_id = $1 AND product_id = $2 AND location_id = $3 AND {variant_clause}{lock_clause}"
    )
}

async fn fetch_item<'c, E>(
    executor: E,
    operation: &str,
    tenant_id: TenantId,
    key: &StockKey,
    for_update: bool,
) -> Result<Option<InventoryItem>, StoreError>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let sql = item_query(key, for_update);
    let mut query = sqlx::query(&sql)
        .bind(tenant_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .bind(key.location_id.as_uuid());
    if let Some(variant_id) = key.variant_id {
        query = query.bind(*variant_id.as_uuid());
    }

    let row = query
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

    row.map(|row| {
        InventoryItemRow::from_row(&row)
            .map_err(|e| StoreError::Backend(format!("failed to decode inventory row: {e}")))
            .map(InventoryItem::from)
    })
    .transpose()
}

#[async_trait]
impl StockLedgerStore for PostgresLedgerStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // SET does not take bind parameters; the value is an integer we format ourselves.
        let set_timeout = format!("SET LOCAL lock_timeout = {}", self.lock_timeout.as_millis());
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(PostgresTransaction {
            tx,
            locked: HashSet::new(),
        })
    }

    async fn find(
        &self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<Option<InventoryItem>, StoreError> {
        fetch_item(&self.pool, "find", tenant_id, key, false).await
    }

    async fn insert_item(&self, item: &InventoryItem) -> Result<(), StoreError> {
        check_item(item)?;
        sqlx::query(&format!(
            "INSERT INTO inventory_items ({ITEM_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(item.id.0.as_uuid())
        .bind(item.tenant_id.as_uuid())
        .bind(item.key.product_id.as_uuid())
        .bind(item.key.variant_id.map(uuid::Uuid::from))
        .bind(item.key.location_id.as_uuid())
        .bind(item.quantity_on_hand)
        .bind(item.quantity_reserved)
        .bind(item.low_stock_threshold)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_item", e))?;
        Ok(())
    }

    async fn movements(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<StockMovement>, StoreError> {
        fetch_movements(&self.pool, "movements", tenant_id, item_id).await
    }
}

async fn fetch_movements<'c, E>(
    executor: E,
    operation: &str,
    tenant_id: TenantId,
    item_id: InventoryItemId,
) -> Result<Vec<StockMovement>, StoreError>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let sql = format!(
        "SELECT {MOVEMENT_COLUMNS} FROM stock_movements \
         WHERE tenant_id = $1 AND inventory_item_id = $2 \
         ORDER BY created_at ASC, seq ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(tenant_id.as_uuid())
        .bind(item_id.0.as_uuid())
        .fetch_all(executor)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

    rows.iter()
        .map(|row| {
            let row = StockMovementRow::from_row(row)
                .map_err(|e| StoreError::Backend(format!("failed to decode movement row: {e}")))?;
            StockMovement::try_from(row)
        })
        .collect()
}

/// Transaction over a [`PostgresLedgerStore`].
///
/// Dropping it without commit rolls back (sqlx queues the rollback on the connection).
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    locked: HashSet<(TenantId, InventoryItemId)>,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LedgerTransaction for PostgresTransaction {
    async fn find_for_update(
        &mut self,
        tenant_id: TenantId,
        key: &StockKey,
    ) -> Result<Option<InventoryItem>, StoreError> {
        let item = fetch_item(&mut *self.tx, "find_for_update", tenant_id, key, true).await?;
        if let Some(item) = &item {
            self.locked.insert((tenant_id, item.id));
        }
        Ok(item)
    }

    async fn save(&mut self, item: &InventoryItem) -> Result<(), StoreError> {
        check_item(item)?;
        if !self.locked.contains(&(item.tenant_id, item.id)) {
            return Err(StoreError::TenantIsolation(format!(
                "save of {} without holding its row lock",
                item.key.describe()
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE inventory_items
            SET quantity_on_hand = $1,
                quantity_reserved = $2,
                low_stock_threshold = $3,
                updated_at = $4
            WHERE id = $5 AND tenant_id = $6
            "#,
        )
        .bind(item.quantity_on_hand)
        .bind(item.quantity_reserved)
        .bind(item.low_stock_threshold)
        .bind(item.updated_at)
        .bind(item.id.0.as_uuid())
        .bind(item.tenant_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        if result.rows_affected() != 1 {
            return Err(StoreError::Backend(format!(
                "save of {} updated {} rows",
                item.key.describe(),
                result.rows_affected()
            )));
        }
        Ok(())
    }

    async fn append_movement(&mut self, movement: &StockMovement) -> Result<(), StoreError> {
        check_movement(movement)?;
        if !self
            .locked
            .contains(&(movement.tenant_id, movement.inventory_item_id))
        {
            return Err(StoreError::TenantIsolation(
                "movement for an item not locked by this transaction".to_string(),
            ));
        }

        sqlx::query(&format!(
            "INSERT INTO stock_movements ({MOVEMENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(movement.id.0.as_uuid())
        .bind(movement.tenant_id.as_uuid())
        .bind(movement.inventory_item_id.0.as_uuid())
        .bind(movement.movement_type.as_str())
        .bind(movement.quantity)
        .bind(movement.previous_quantity)
        .bind(movement.new_quantity)
        .bind(&movement.reason)
        .bind(movement.reference_id.as_deref())
        .bind(movement.actor_id.as_uuid())
        .bind(movement.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_movement", e))?;
        Ok(())
    }

    async fn movements(
        &mut self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<StockMovement>, StoreError> {
        fetch_movements(&mut *self.tx, "tx_movements", tenant_id, item_id).await
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("55P03") => StoreError::LockTimeout(msg),
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                Some("23505") => StoreError::DuplicateKey(msg),
                Some("23514") => StoreError::Invariant(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct InventoryItemRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    product_id: uuid::Uuid,
    variant_id: Option<uuid::Uuid>,
    location_id: uuid::Uuid,
    quantity_on_hand: i64,
    quantity_reserved: i64,
    low_stock_threshold: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for InventoryItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(InventoryItemRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            product_id: row.try_get("product_id")?,
            variant_id: row.try_get("variant_id")?,
            location_id: row.try_get("location_id")?,
            quantity_on_hand: row.try_get("quantity_on_hand")?,
            quantity_reserved: row.try_get("quantity_reserved")?,
            low_stock_threshold: row.try_get("low_stock_threshold")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<InventoryItemRow> for InventoryItem {
    fn from(row: InventoryItemRow) -> Self {
        InventoryItem {
            id: InventoryItemId(RecordId::from_uuid(row.id)),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            key: StockKey::new(
                ProductId::from_uuid(row.product_id),
                row.variant_id.map(VariantId::from_uuid),
                LocationId::from_uuid(row.location_id),
            ),
            quantity_on_hand: row.quantity_on_hand,
            quantity_reserved: row.quantity_reserved,
            low_stock_threshold: row.low_stock_threshold,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug)]
struct StockMovementRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    inventory_item_id: uuid::Uuid,
    movement_type: String,
    quantity: i64,
    previous_quantity: i64,
    new_quantity: i64,
    reason: String,
    reference_id: Option<String>,
    actor_id: uuid::Uuid,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for StockMovementRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StockMovementRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            inventory_item_id: row.try_get("inventory_item_id")?,
            movement_type: row.try_get("movement_type")?,
            quantity: row.try_get("quantity")?,
            previous_quantity: row.try_get("previous_quantity")?,
            new_quantity: row.try_get("new_quantity")?,
            reason: row.try_get("reason")?,
            reference_id: row.try_get("reference_id")?,
            actor_id: row.try_get("actor_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<StockMovementRow> for StockMovement {
    type Error = StoreError;

    fn try_from(row: StockMovementRow) -> Result<Self, Self::Error> {
        let movement_type: MovementType = row
            .movement_type
            .parse()
            .map_err(|e| StoreError::Backend(format!("failed to decode movement type: {e}")))?;

        Ok(StockMovement {
            id: StockMovementId(RecordId::from_uuid(row.id)),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            inventory_item_id: InventoryItemId(RecordId::from_uuid(row.inventory_item_id)),
            movement_type,
            quantity: row.quantity,
            previous_quantity: row.previous_quantity,
            new_quantity: row.new_quantity,
            reason: row.reason,
            reference_id: row.reference_id,
            actor_id: UserId::from_uuid(row.actor_id),
            created_at: row.created_at,
        })
    }
}
