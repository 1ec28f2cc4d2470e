use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dispensary_core::{
    DomainError, DomainResult, Entity, LocationId, ProductId, RecordId, TenantId, ValueObject,
    VariantId,
};

/// Threshold used when an item is provisioned without an explicit one.
pub const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 10;

/// Inventory item identifier (row identity, independent of the stock key).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryItemId(pub RecordId);

impl InventoryItemId {
    pub fn new() -> Self {
        Self(RecordId::new())
    }
}

impl Default for InventoryItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for InventoryItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Identity key of a stock row within a tenant.
///
/// `variant_id = None` is the base product; it never matches a concrete variant.
/// The derived ordering is the one callers should use to sort multi-line reservations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockKey {
    pub product_id: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
}

impl StockKey {
    pub fn new(product_id: ProductId, variant_id: Option<VariantId>, location_id: LocationId) -> Self {
        Self {
            product_id,
            variant_id,
            location_id,
        }
    }

    /// Human-readable subject used in stock error messages.
    pub fn describe(&self) -> String {
        format!("product {}", self.product_id)
    }
}

impl ValueObject for StockKey {}

/// On-hand snapshot before and after a single change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OnHandChange {
    pub previous: i64,
    pub next: i64,
}

impl OnHandChange {
    pub fn delta(&self) -> i64 {
        self.next - self.previous
    }
}

/// Current stock of one (tenant, product, variant, location).
///
/// Invariants after every committed operation:
/// - `quantity_on_hand >= 0`
/// - `0 <= quantity_reserved <= quantity_on_hand`
/// - `low_stock_threshold >= 0`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: InventoryItemId,
    pub tenant_id: TenantId,
    #[serde(flatten)]
    pub key: StockKey,
    pub quantity_on_hand: i64,
    pub quantity_reserved: i64,
    pub low_stock_threshold: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for InventoryItem {
    type Id = InventoryItemId;

    fn id(&self) -> Self::Id {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl InventoryItem {
    /// A freshly provisioned row: nothing on hand, nothing reserved.
    pub fn provision(
        id: InventoryItemId,
        tenant_id: TenantId,
        key: StockKey,
        low_stock_threshold: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if low_stock_threshold < 0 {
            return Err(DomainError::validation("low stock threshold cannot be negative"));
        }
        Ok(Self {
            id,
            tenant_id,
            key,
            quantity_on_hand: 0,
            quantity_reserved: 0,
            low_stock_threshold,
            created_at: now,
            updated_at: now,
        })
    }

    /// Units eligible for new reservations.
    pub fn available(&self) -> i64 {
        self.quantity_on_hand - self.quantity_reserved
    }

    pub fn is_low_stock(&self) -> bool {
        self.quantity_on_hand <= self.low_stock_threshold
    }

    /// Verify the row invariants; stores call this before writing.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.quantity_on_hand < 0 {
            return Err(DomainError::invariant("quantity on hand cannot be negative"));
        }
        if self.quantity_reserved < 0 {
            return Err(DomainError::invariant("quantity reserved cannot be negative"));
        }
        if self.quantity_reserved > self.quantity_on_hand {
            return Err(DomainError::invariant("quantity reserved exceeds quantity on hand"));
        }
        if self.low_stock_threshold < 0 {
            return Err(DomainError::invariant("low stock threshold cannot be negative"));
        }
        Ok(())
    }

    /// Apply a signed delta to on-hand.
    ///
    /// Rejected when the result would be negative or would drop below what is
    /// already reserved. The reserved counter is untouched.
    pub fn adjust_on_hand(&mut self, delta: i64, now: DateTime<Utc>) -> DomainResult<OnHandChange> {
        let previous = self.quantity_on_hand;
        let next = previous
            .checked_add(delta)
            .ok_or_else(|| DomainError::validation("quantity overflows on-hand counter"))?;

        if next < 0 || next < self.quantity_reserved {
            return Err(DomainError::insufficient_stock(self.key.describe()));
        }

        self.quantity_on_hand = next;
        self.updated_at = now;
        Ok(OnHandChange { previous, next })
    }

    /// Hold `quantity` units against an in-flight order.
    pub fn reserve(&mut self, quantity: i64, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(quantity)?;
        if self.available() < quantity {
            return Err(DomainError::insufficient_stock(self.key.describe()));
        }
        self.quantity_reserved += quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Give back `quantity` previously reserved units (abandoned cart, failed payment).
    pub fn release(&mut self, quantity: i64, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive(quantity)?;
        if quantity > self.quantity_reserved {
            return Err(DomainError::insufficient_stock(format!(
                "reservation of {}",
                self.key.describe()
            )));
        }
        self.quantity_reserved -= quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Turn `quantity` reserved units into a sale: both counters drop together.
    pub fn fulfill(&mut self, quantity: i64, now: DateTime<Utc>) -> DomainResult<OnHandChange> {
        ensure_positive(quantity)?;
        if quantity > self.quantity_reserved {
            return Err(DomainError::insufficient_stock(format!(
                "reservation of {}",
                self.key.describe()
            )));
        }
        let previous = self.quantity_on_hand;
        self.quantity_reserved -= quantity;
        self.quantity_on_hand -= quantity;
        self.updated_at = now;
        Ok(OnHandChange {
            previous,
            next: self.quantity_on_hand,
        })
    }

    pub fn set_low_stock_threshold(&mut self, threshold: i64, now: DateTime<Utc>) -> DomainResult<()> {
        if threshold < 0 {
            return Err(DomainError::validation("low stock threshold cannot be negative"));
        }
        self.low_stock_threshold = threshold;
        self.updated_at = now;
        Ok(())
    }
}

fn ensure_positive(quantity: i64) -> DomainResult<()> {
    if quantity <= 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }
    Ok(())
}
