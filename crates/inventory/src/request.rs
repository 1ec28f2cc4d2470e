//! Inputs of the ledger operations.

use serde::{Deserialize, Serialize};

use dispensary_core::{DomainError, DomainResult, TenantId, UserId};

use crate::item::StockKey;
use crate::movement::MovementType;

/// Request: apply a signed delta to on-hand (receive, sell, adjust, return, damage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustStock {
    pub tenant_id: TenantId,
    #[serde(flatten)]
    pub key: StockKey,
    /// Signed delta: positive increases on-hand, negative decreases it.
    pub quantity: i64,
    pub reason: String,
    pub actor_id: UserId,
    #[serde(rename = "type")]
    pub movement_type: MovementType,
    #[serde(default)]
    pub reference_id: Option<String>,
}

impl AdjustStock {
    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity == 0 {
            return Err(DomainError::validation("quantity cannot be zero"));
        }
        ensure_reason(&self.reason)
    }
}

/// One line of a cart/order that must be reserved together with its siblings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationLine {
    #[serde(flatten)]
    pub key: StockKey,
    pub quantity: i64,
}

impl ReservationLine {
    pub fn new(key: StockKey, quantity: i64) -> Self {
        Self { key, quantity }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "quantity for {} must be positive",
                self.key.describe()
            )));
        }
        Ok(())
    }
}

/// Request: convert reserved units into sold units once an order is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillReservation {
    pub tenant_id: TenantId,
    pub lines: Vec<ReservationLine>,
    pub reason: String,
    pub actor_id: UserId,
    #[serde(default)]
    pub reference_id: Option<String>,
}

impl FulfillReservation {
    pub fn validate(&self) -> DomainResult<()> {
        ensure_reason(&self.reason)?;
        self.lines.iter().try_for_each(ReservationLine::validate)
    }
}

/// Request: create the stock row for a key the first time stock is provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionItem {
    pub tenant_id: TenantId,
    #[serde(flatten)]
    pub key: StockKey,
    /// Falls back to the ledger's configured default when absent.
    #[serde(default)]
    pub low_stock_threshold: Option<i64>,
}

/// Sort lines into the global lock order (by stock key).
///
/// Concurrent multi-line reservations that all lock in this order cannot deadlock
/// against each other.
pub fn sort_lines(lines: &mut [ReservationLine]) {
    lines.sort_by(|a, b| a.key.cmp(&b.key));
}

fn ensure_reason(reason: &str) -> DomainResult<()> {
    if reason.trim().is_empty() {
        return Err(DomainError::validation("reason cannot be empty"));
    }
    Ok(())
}
