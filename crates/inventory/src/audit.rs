//! Audit replay of the movement log.

use serde::Serialize;

use dispensary_core::{DomainError, DomainResult};

use crate::item::{InventoryItem, InventoryItemId};
use crate::movement::StockMovement;

/// Outcome of a successful replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub item_id: InventoryItemId,
    pub movement_count: usize,
    pub replayed_on_hand: i64,
}

/// Replay `movements` in `created_at` order starting from zero and check they
/// reproduce `item.quantity_on_hand`.
///
/// Every movement must be internally consistent and chain onto the previous one
/// (its `previous_quantity` equals the prior `new_quantity`). Ties on `created_at`
/// keep the order the log returned them in.
pub fn replay_movements(item: &InventoryItem, movements: &[StockMovement]) -> DomainResult<AuditReport> {
    let mut ordered: Vec<&StockMovement> = movements.iter().collect();
    ordered.sort_by_key(|m| m.created_at);

    let mut on_hand = 0i64;
    for (idx, m) in ordered.iter().enumerate() {
        if m.inventory_item_id != item.id {
            return Err(DomainError::invariant(format!(
                "movement {idx} belongs to another item"
            )));
        }
        if !m.is_consistent() {
            return Err(DomainError::invariant(format!(
                "movement {idx}: {} + {} != {}",
                m.previous_quantity, m.quantity, m.new_quantity
            )));
        }
        if m.previous_quantity != on_hand {
            return Err(DomainError::invariant(format!(
                "movement {idx} starts at {} but replay is at {on_hand}",
                m.previous_quantity
            )));
        }
        on_hand = m.new_quantity;
    }

    if on_hand != item.quantity_on_hand {
        return Err(DomainError::invariant(format!(
            "replay ends at {on_hand} but item has {} on hand",
            item.quantity_on_hand
        )));
    }

    Ok(AuditReport {
        item_id: item.id,
        movement_count: ordered.len(),
        replayed_on_hand: on_hand,
    })
}
