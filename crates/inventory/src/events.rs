//! Threshold-crossing notifications raised by on-hand changes.

use chrono::{DateTime, Utc};
use serde::Serialize;

use dispensary_core::{ProductId, VariantId};
use dispensary_events::Event;

use crate::item::{InventoryItem, OnHandChange};

/// On-hand dropped to or below the item's low-stock threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LowStock {
    pub product_id: ProductId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<VariantId>,
    pub current: i64,
    pub threshold: i64,
    #[serde(skip)]
    pub occurred_at: DateTime<Utc>,
}

/// On-hand went from nothing to something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Restocked {
    pub product_id: ProductId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<VariantId>,
    #[serde(skip)]
    pub occurred_at: DateTime<Utc>,
}

/// Notification payloads are exactly `{ productId, variantId?, current?, threshold? }`;
/// the event name travels in the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StockEvent {
    LowStock(LowStock),
    Restocked(Restocked),
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::LowStock(_) => "low_stock",
            StockEvent::Restocked(_) => "restocked",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::LowStock(e) => e.occurred_at,
            StockEvent::Restocked(e) => e.occurred_at,
        }
    }
}

/// Events implied by one committed on-hand change of `item`.
///
/// - `low_stock` when on-hand crosses the threshold downwards (`previous > t >= next`)
/// - `restocked` when on-hand leaves zero (`previous <= 0 < next`)
pub fn threshold_events(
    item: &InventoryItem,
    change: OnHandChange,
    occurred_at: DateTime<Utc>,
) -> Vec<StockEvent> {
    let threshold = item.low_stock_threshold;
    let mut events = Vec::new();

    if change.previous > threshold && change.next <= threshold {
        events.push(StockEvent::LowStock(LowStock {
            product_id: item.key.product_id,
            variant_id: item.key.variant_id,
            current: change.next,
            threshold,
            occurred_at,
        }));
    }

    if change.previous <= 0 && change.next > 0 {
        events.push(StockEvent::Restocked(Restocked {
            product_id: item.key.product_id,
            variant_id: item.key.variant_id,
            occurred_at,
        }));
    }

    events
}
