use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dispensary_core::{DomainError, Entity, RecordId, TenantId, UserId};

use crate::item::{InventoryItemId, OnHandChange};

/// Stock movement identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockMovementId(pub RecordId);

impl StockMovementId {
    pub fn new() -> Self {
        Self(RecordId::new())
    }
}

impl Default for StockMovementId {
    fn default() -> Self {
        Self::new()
    }
}

/// Why on-hand changed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementType {
    Receive,
    Sell,
    Adjust,
    Return,
    Damage,
}

impl MovementType {
    pub const ALL: [MovementType; 5] = [
        MovementType::Receive,
        MovementType::Sell,
        MovementType::Adjust,
        MovementType::Return,
        MovementType::Damage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Receive => "receive",
            MovementType::Sell => "sell",
            MovementType::Adjust => "adjust",
            MovementType::Return => "return",
            MovementType::Damage => "damage",
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MovementType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown movement type: {s}")))
    }
}

/// Append-only audit record of one on-hand change. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMovement {
    pub id: StockMovementId,
    pub tenant_id: TenantId,
    pub inventory_item_id: InventoryItemId,
    #[serde(rename = "type")]
    pub movement_type: MovementType,
    /// Signed delta applied to on-hand.
    pub quantity: i64,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    pub reason: String,
    pub reference_id: Option<String>,
    pub actor_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Entity for StockMovement {
    type Id = StockMovementId;

    fn id(&self) -> Self::Id {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl StockMovement {
    /// Build the movement describing `change`; `quantity` is derived from the snapshot
    /// so `new_quantity = previous_quantity + quantity` holds by construction.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        tenant_id: TenantId,
        inventory_item_id: InventoryItemId,
        movement_type: MovementType,
        change: OnHandChange,
        reason: impl Into<String>,
        reference_id: Option<String>,
        actor_id: UserId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: StockMovementId::new(),
            tenant_id,
            inventory_item_id,
            movement_type,
            quantity: change.delta(),
            previous_quantity: change.previous,
            new_quantity: change.next,
            reason: reason.into(),
            reference_id,
            actor_id,
            created_at,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.previous_quantity.checked_add(self.quantity) == Some(self.new_quantity)
    }
}
