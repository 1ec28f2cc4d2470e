//! Integration tests for the ledger pipeline.
//!
//! Tests: Request → InventoryLedger → StockLedgerStore → EventEmitter → EventBus
//!
//! Verifies:
//! - Concurrent operations on one row serialize and never lose an update
//! - Multi-line reservations are all-or-nothing
//! - Threshold notifications fire once per crossing, after commit
//! - The movement log replays to the stored on-hand count
//! - Lock waits are bounded and surface as retryable errors

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use dispensary_core::{LocationId, ProductId, TenantId, UserId, VariantId};
use dispensary_events::{BusEmitter, EventBus, EventEnvelope, InMemoryEventBus, NoopEmitter, Subscription};
use dispensary_inventory::{
    AdjustStock, FulfillReservation, InventoryItem, MovementType, ProvisionItem, ReservationLine,
    StockKey, sort_lines,
};

use crate::config::LedgerConfig;
use crate::ledger::{
    InMemoryLedgerStore, InventoryLedger, LedgerError, LedgerTransaction, StockLedgerStore,
    StoreError,
};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type Ledger = InventoryLedger<InMemoryLedgerStore, BusEmitter<Bus>>;

fn setup() -> (Ledger, Subscription<EventEnvelope<JsonValue>>) {
    dispensary_observability::init_for_tests();
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let subscription = bus.subscribe();
    let ledger = InventoryLedger::new(InMemoryLedgerStore::new(), BusEmitter::new(bus));
    (ledger, subscription)
}

fn key() -> StockKey {
    StockKey::new(ProductId::new(), None, LocationId::new())
}

fn adjust(tenant_id: TenantId, key: StockKey, quantity: i64, movement_type: MovementType) -> AdjustStock {
    AdjustStock {
        tenant_id,
        key,
        quantity,
        reason: format!("{movement_type} of {quantity}"),
        actor_id: UserId::new(),
        movement_type,
        reference_id: None,
    }
}

/// Provision `key` and receive `on_hand` units (when positive).
async fn stocked<S, E>(
    ledger: &InventoryLedger<S, E>,
    tenant_id: TenantId,
    key: StockKey,
    on_hand: i64,
) -> InventoryItem
where
    S: StockLedgerStore,
    E: dispensary_events::EventEmitter<dispensary_inventory::StockEvent>,
{
    let item = ledger
        .provision_item(ProvisionItem {
            tenant_id,
            key,
            low_stock_threshold: None,
        })
        .await
        .unwrap();
    if on_hand == 0 {
        return item;
    }
    ledger
        .adjust_stock(adjust(tenant_id, key, on_hand, MovementType::Receive))
        .await
        .unwrap()
}

fn event_types(envelopes: &[EventEnvelope<JsonValue>]) -> Vec<&str> {
    envelopes.iter().map(|e| e.event_type()).collect()
}

#[tokio::test]
async fn adjust_updates_on_hand_and_records_snapshot() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 10).await;

    let mut request = adjust(tenant_id, key, -3, MovementType::Sell);
    request.reference_id = Some("order-1042".to_string());
    let item = ledger.adjust_stock(request.clone()).await.unwrap();
    assert_eq!(item.quantity_on_hand, 7);
    assert_eq!(item.quantity_reserved, 0);

    let history = ledger.movement_history(tenant_id, &key).await.unwrap();
    assert_eq!(history.len(), 2);
    let last = &history[1];
    assert_eq!(last.movement_type, MovementType::Sell);
    assert_eq!((last.previous_quantity, last.quantity, last.new_quantity), (10, -3, 7));
    assert_eq!(last.reason, request.reason);
    assert_eq!(last.reference_id.as_deref(), Some("order-1042"));
    assert_eq!(last.actor_id, request.actor_id);
}

#[tokio::test]
async fn negative_on_hand_is_refused_without_a_movement() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 2).await;

    let err = ledger
        .adjust_stock(adjust(tenant_id, key, -5, MovementType::Damage))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientStock(_)));
    assert!(!err.is_retryable());

    assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_on_hand, 2);
    assert_eq!(ledger.movement_history(tenant_id, &key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn adjust_cannot_drop_on_hand_below_reserved() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 5).await;
    ledger
        .reserve_stock(tenant_id, &[ReservationLine::new(key, 4)])
        .await
        .unwrap();

    let err = ledger
        .adjust_stock(adjust(tenant_id, key, -2, MovementType::Damage))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientStock(_)));

    let item = ledger
        .adjust_stock(adjust(tenant_id, key, -1, MovementType::Damage))
        .await
        .unwrap();
    assert_eq!((item.quantity_on_hand, item.quantity_reserved), (4, 4));
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_touching_the_store() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 5).await;

    let err = ledger
        .adjust_stock(adjust(tenant_id, key, 0, MovementType::Adjust))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    let mut blank = adjust(tenant_id, key, 1, MovementType::Adjust);
    blank.reason = "  ".to_string();
    assert!(matches!(
        ledger.adjust_stock(blank).await,
        Err(LedgerError::Validation(_))
    ));

    assert!(matches!(
        ledger.reserve_stock(tenant_id, &[ReservationLine::new(key, 0)]).await,
        Err(LedgerError::Validation(_))
    ));
    assert_eq!(ledger.movement_history(tenant_id, &key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_keys_and_other_tenants_are_not_found() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 5).await;

    let err = ledger
        .adjust_stock(adjust(tenant_id, self::key(), 1, MovementType::Receive))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "inventory item not found");

    let intruder = TenantId::new();
    assert!(matches!(
        ledger.adjust_stock(adjust(intruder, key, -1, MovementType::Sell)).await,
        Err(LedgerError::NotFound(_))
    ));
    assert!(matches!(
        ledger.reserve_stock(intruder, &[ReservationLine::new(key, 1)]).await,
        Err(LedgerError::NotFound(_))
    ));
    assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_on_hand, 5);
}

#[tokio::test]
async fn variant_rows_are_distinct_from_the_base_product() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let base = key();
    let variant = StockKey::new(base.product_id, Some(VariantId::new()), base.location_id);

    stocked(&ledger, tenant_id, base, 3).await;
    stocked(&ledger, tenant_id, variant, 8).await;

    assert_eq!(ledger.get_item(tenant_id, &base).await.unwrap().quantity_on_hand, 3);
    assert_eq!(ledger.get_item(tenant_id, &variant).await.unwrap().quantity_on_hand, 8);
}

#[tokio::test]
async fn provisioning_twice_is_a_conflict() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 0).await;

    let err = ledger
        .provision_item(ProvisionItem {
            tenant_id,
            key,
            low_stock_threshold: Some(3),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));

    // Same key under another tenant is a different row.
    stocked(&ledger, TenantId::new(), key, 0).await;
}

#[tokio::test]
async fn provisioning_uses_the_configured_default_threshold() {
    let config = LedgerConfig::from_lookup(|name| {
        (name == "LEDGER_DEFAULT_LOW_STOCK_THRESHOLD").then(|| "25".to_string())
    })
    .unwrap();
    let ledger = InventoryLedger::from_config(
        InMemoryLedgerStore::from_config(&config),
        NoopEmitter,
        &config,
    );
    let tenant_id = TenantId::new();

    let item = stocked(&ledger, tenant_id, key(), 0).await;
    assert_eq!(item.low_stock_threshold, 25);

    let explicit = ledger
        .provision_item(ProvisionItem {
            tenant_id,
            key: key(),
            low_stock_threshold: Some(2),
        })
        .await
        .unwrap();
    assert_eq!(explicit.low_stock_threshold, 2);

    assert!(matches!(
        ledger
            .provision_item(ProvisionItem {
                tenant_id,
                key: key(),
                low_stock_threshold: Some(-1),
            })
            .await,
        Err(LedgerError::Validation(_))
    ));
}

#[tokio::test]
async fn threshold_changes_apply_to_later_crossings() {
    let (ledger, sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 30).await;
    sub.drain();

    let item = ledger.set_low_stock_threshold(tenant_id, &key, 25).await.unwrap();
    assert_eq!(item.low_stock_threshold, 25);
    assert!(sub.drain().is_empty());

    ledger
        .adjust_stock(adjust(tenant_id, key, -6, MovementType::Sell))
        .await
        .unwrap();
    let events = sub.drain_for(tenant_id);
    assert_eq!(event_types(&events), ["low_stock"]);
    assert_eq!(events[0].payload()["threshold"], json!(25));

    assert!(matches!(
        ledger.set_low_stock_threshold(tenant_id, &key, -1).await,
        Err(LedgerError::Validation(_))
    ));
}

#[tokio::test]
async fn low_stock_fires_once_on_the_downward_crossing() {
    let (ledger, sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 12).await;
    assert_eq!(event_types(&sub.drain()), ["restocked"]);

    ledger
        .adjust_stock(adjust(tenant_id, key, -4, MovementType::Sell))
        .await
        .unwrap();
    let events = sub.drain_for(tenant_id);
    assert_eq!(event_types(&events), ["low_stock"]);
    assert_eq!(events[0].tenant_id(), tenant_id);
    assert_eq!(
        events[0].payload(),
        &json!({ "productId": key.product_id, "current": 8, "threshold": 10 })
    );

    // Still below the threshold: no repeat.
    ledger
        .adjust_stock(adjust(tenant_id, key, -1, MovementType::Sell))
        .await
        .unwrap();
    assert!(sub.drain().is_empty());

    // Back above: nothing either.
    ledger
        .adjust_stock(adjust(tenant_id, key, 5, MovementType::Receive))
        .await
        .unwrap();
    assert!(sub.drain().is_empty());
}

#[tokio::test]
async fn restocked_fires_when_leaving_zero() {
    let (ledger, sub) = setup();
    let tenant_id = TenantId::new();
    let key = StockKey::new(ProductId::new(), Some(VariantId::new()), LocationId::new());
    stocked(&ledger, tenant_id, key, 0).await;

    ledger
        .adjust_stock(adjust(tenant_id, key, 5, MovementType::Receive))
        .await
        .unwrap();
    let events = sub.drain();
    assert_eq!(event_types(&events), ["restocked"]);
    assert_eq!(
        events[0].payload(),
        &json!({ "productId": key.product_id, "variantId": key.variant_id })
    );
}

#[tokio::test]
async fn failed_operations_emit_nothing() {
    let (ledger, sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 12).await;
    sub.drain();

    assert!(
        ledger
            .adjust_stock(adjust(tenant_id, key, -13, MovementType::Sell))
            .await
            .is_err()
    );
    assert!(sub.drain().is_empty());
}

#[tokio::test]
async fn multi_line_reservation_is_all_or_nothing() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let plenty = key();
    let scarce = key();
    stocked(&ledger, tenant_id, plenty, 10).await;
    stocked(&ledger, tenant_id, scarce, 1).await;

    let err = ledger
        .reserve_stock(
            tenant_id,
            &[ReservationLine::new(plenty, 4), ReservationLine::new(scarce, 2)],
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("insufficient stock for product {}", scarce.product_id)
    );

    assert_eq!(ledger.get_item(tenant_id, &plenty).await.unwrap().quantity_reserved, 0);
    assert_eq!(ledger.get_item(tenant_id, &scarce).await.unwrap().quantity_reserved, 0);

    ledger
        .reserve_stock(
            tenant_id,
            &[ReservationLine::new(plenty, 4), ReservationLine::new(scarce, 1)],
        )
        .await
        .unwrap();
    let item = ledger.get_item(tenant_id, &plenty).await.unwrap();
    assert_eq!((item.quantity_on_hand, item.quantity_reserved, item.available()), (10, 4, 6));
}

#[tokio::test]
async fn duplicate_lines_are_checked_against_their_sum() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 5).await;

    let err = ledger
        .reserve_stock(
            tenant_id,
            &[ReservationLine::new(key, 3), ReservationLine::new(key, 3)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientStock(_)));
    assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_reserved, 0);

    ledger
        .reserve_stock(
            tenant_id,
            &[ReservationLine::new(key, 2), ReservationLine::new(key, 3)],
        )
        .await
        .unwrap();
    assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_reserved, 5);
}

#[tokio::test]
async fn empty_reservation_is_a_no_op() {
    let (ledger, _sub) = setup();
    ledger.reserve_stock(TenantId::new(), &[]).await.unwrap();
    ledger.release_reservation(TenantId::new(), &[]).await.unwrap();
}

#[tokio::test]
async fn reservations_do_not_touch_on_hand_or_the_log() {
    let (ledger, sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 11).await;
    sub.drain();

    ledger
        .reserve_stock(tenant_id, &[ReservationLine::new(key, 9)])
        .await
        .unwrap();
    let item = ledger.get_item(tenant_id, &key).await.unwrap();
    assert_eq!((item.quantity_on_hand, item.quantity_reserved), (11, 9));
    assert_eq!(ledger.movement_history(tenant_id, &key).await.unwrap().len(), 1);
    assert!(sub.drain().is_empty());
}

#[tokio::test]
async fn release_returns_units_to_available() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 6).await;
    ledger
        .reserve_stock(tenant_id, &[ReservationLine::new(key, 3)])
        .await
        .unwrap();

    ledger
        .release_reservation(tenant_id, &[ReservationLine::new(key, 2)])
        .await
        .unwrap();
    let item = ledger.get_item(tenant_id, &key).await.unwrap();
    assert_eq!((item.quantity_on_hand, item.quantity_reserved), (6, 1));

    let err = ledger
        .release_reservation(tenant_id, &[ReservationLine::new(key, 2)])
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientStock(_)));
    assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_reserved, 1);
    assert_eq!(ledger.movement_history(tenant_id, &key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn fulfilment_consumes_the_reservation_and_logs_a_sale() {
    let (ledger, sub) = setup();
    let tenant_id = TenantId::new();
    let flower = key();
    let edible = key();
    stocked(&ledger, tenant_id, flower, 12).await;
    stocked(&ledger, tenant_id, edible, 30).await;
    let mut lines = vec![ReservationLine::new(flower, 4), ReservationLine::new(edible, 2)];
    sort_lines(&mut lines);
    ledger.reserve_stock(tenant_id, &lines).await.unwrap();
    sub.drain();

    let actor_id = UserId::new();
    let items = ledger
        .fulfill_reservation(FulfillReservation {
            tenant_id,
            lines: lines.clone(),
            reason: "checkout".to_string(),
            actor_id,
            reference_id: Some("order-77".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(items.len(), 2);

    let flower_item = ledger.get_item(tenant_id, &flower).await.unwrap();
    assert_eq!((flower_item.quantity_on_hand, flower_item.quantity_reserved), (8, 0));
    let edible_item = ledger.get_item(tenant_id, &edible).await.unwrap();
    assert_eq!((edible_item.quantity_on_hand, edible_item.quantity_reserved), (28, 0));

    let sale = ledger.movement_history(tenant_id, &flower).await.unwrap().pop().unwrap();
    assert_eq!(sale.movement_type, MovementType::Sell);
    assert_eq!((sale.previous_quantity, sale.quantity, sale.new_quantity), (12, -4, 8));
    assert_eq!(sale.actor_id, actor_id);
    assert_eq!(sale.reference_id.as_deref(), Some("order-77"));

    let events = sub.drain_for(tenant_id);
    assert_eq!(event_types(&events), ["low_stock"]);
    assert_eq!(events[0].payload()["productId"], json!(flower.product_id));

    ledger.audit_item(tenant_id, &flower).await.unwrap();
    ledger.audit_item(tenant_id, &edible).await.unwrap();
}

#[tokio::test]
async fn fulfilment_beyond_the_reservation_changes_nothing() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let a = key();
    let b = key();
    stocked(&ledger, tenant_id, a, 10).await;
    stocked(&ledger, tenant_id, b, 10).await;
    ledger
        .reserve_stock(tenant_id, &[ReservationLine::new(a, 2), ReservationLine::new(b, 1)])
        .await
        .unwrap();

    let err = ledger
        .fulfill_reservation(FulfillReservation {
            tenant_id,
            lines: vec![ReservationLine::new(a, 2), ReservationLine::new(b, 3)],
            reason: "checkout".to_string(),
            actor_id: UserId::new(),
            reference_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientStock(_)));

    let item = ledger.get_item(tenant_id, &a).await.unwrap();
    assert_eq!((item.quantity_on_hand, item.quantity_reserved), (10, 2));
    assert_eq!(ledger.movement_history(tenant_id, &a).await.unwrap().len(), 1);
}

#[tokio::test]
async fn audit_replays_the_log_to_on_hand() {
    let (ledger, _sub) = setup();
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&ledger, tenant_id, key, 10).await;
    for (quantity, movement_type) in [
        (-3, MovementType::Sell),
        (2, MovementType::Return),
        (-1, MovementType::Damage),
        (20, MovementType::Receive),
        (-4, MovementType::Adjust),
    ] {
        ledger
            .adjust_stock(adjust(tenant_id, key, quantity, movement_type))
            .await
            .unwrap();
    }

    let report = ledger.audit_item(tenant_id, &key).await.unwrap();
    assert_eq!(report.movement_count, 6);
    assert_eq!(report.replayed_on_hand, 24);
    assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_on_hand, 24);
}

#[tokio::test]
async fn audit_reports_rows_the_log_cannot_explain() {
    let store = InMemoryLedgerStore::new();
    let ledger = InventoryLedger::new(store.clone(), NoopEmitter);
    let tenant_id = TenantId::new();

    // A row imported with stock but no movements behind it.
    let mut item = InventoryItem::provision(
        dispensary_inventory::InventoryItemId::new(),
        tenant_id,
        key(),
        10,
        chrono::Utc::now(),
    )
    .unwrap();
    item.quantity_on_hand = 4;
    store.insert_item(&item).await.unwrap();

    let err = ledger.audit_item(tenant_id, &item.key).await.unwrap_err();
    assert!(matches!(err, LedgerError::AuditMismatch(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adjustments_serialize() {
    let (ledger, _sub) = setup();
    let ledger = Arc::new(ledger);
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&*ledger, tenant_id, key, 10).await;

    let plus = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .adjust_stock(adjust(tenant_id, key, 5, MovementType::Receive))
                .await
        })
    };
    let minus = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .adjust_stock(adjust(tenant_id, key, -3, MovementType::Sell))
                .await
        })
    };
    plus.await.unwrap().unwrap();
    minus.await.unwrap().unwrap();

    assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_on_hand, 12);

    let history = ledger.movement_history(tenant_id, &key).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].previous_quantity, 10);
    assert_eq!(history[2].previous_quantity, history[1].new_quantity);
    assert_eq!(history[2].new_quantity, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_adjustments_lose_no_update() {
    let (ledger, _sub) = setup();
    let ledger = Arc::new(ledger);
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&*ledger, tenant_id, key, 100).await;

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let ledger = ledger.clone();
            let delta = if i % 2 == 0 { 3 } else { -2 };
            tokio::spawn(async move {
                ledger
                    .adjust_stock(adjust(tenant_id, key, delta, MovementType::Adjust))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // 25 × 3 − 25 × 2
    assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_on_hand, 125);
    let report = ledger.audit_item(tenant_id, &key).await.unwrap();
    assert_eq!(report.movement_count, 51);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_cannot_oversell() {
    let (ledger, _sub) = setup();
    let ledger = Arc::new(ledger);
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&*ledger, tenant_id, key, 5).await;

    let attempts: Vec<_> = (0..2)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .reserve_stock(tenant_id, &[ReservationLine::new(key, 3)])
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut short = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(()) => succeeded += 1,
            Err(LedgerError::InsufficientStock(_)) => short += 1,
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!((succeeded, short), (1, 1));

    let item = ledger.get_item(tenant_id, &key).await.unwrap();
    assert_eq!((item.quantity_on_hand, item.quantity_reserved), (5, 3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_carts_in_key_order_do_not_deadlock() {
    let (ledger, _sub) = setup();
    let ledger = Arc::new(ledger);
    let tenant_id = TenantId::new();
    let a = key();
    let b = key();
    stocked(&*ledger, tenant_id, a, 1_000).await;
    stocked(&*ledger, tenant_id, b, 1_000).await;

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let ledger = ledger.clone();
            // Half the carts list the keys in reverse; sorting restores one lock order.
            let mut lines = if i % 2 == 0 {
                vec![ReservationLine::new(a, 1), ReservationLine::new(b, 1)]
            } else {
                vec![ReservationLine::new(b, 1), ReservationLine::new(a, 1)]
            };
            sort_lines(&mut lines);
            tokio::spawn(async move { ledger.reserve_stock(tenant_id, &lines).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(ledger.get_item(tenant_id, &a).await.unwrap().quantity_reserved, 40);
    assert_eq!(ledger.get_item(tenant_id, &b).await.unwrap().quantity_reserved, 40);
}

#[tokio::test]
async fn lock_wait_timeout_is_retryable() {
    let config = LedgerConfig::from_lookup(|name| {
        (name == "LEDGER_LOCK_TIMEOUT_MS").then(|| "25".to_string())
    })
    .unwrap();
    let store = InMemoryLedgerStore::from_config(&config);
    let ledger = InventoryLedger::from_config(store.clone(), NoopEmitter, &config);
    let tenant_id = TenantId::new();
    let busy = key();
    let idle = key();
    stocked(&ledger, tenant_id, busy, 5).await;
    stocked(&ledger, tenant_id, idle, 5).await;

    let mut holder = store.begin().await.unwrap();
    holder.find_for_update(tenant_id, &busy).await.unwrap();

    let err = ledger
        .adjust_stock(adjust(tenant_id, busy, 1, MovementType::Receive))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Store(StoreError::LockTimeout(_))));
    assert!(err.is_retryable());

    // Rows the holder never touched stay available.
    ledger
        .adjust_stock(adjust(tenant_id, idle, 1, MovementType::Receive))
        .await
        .unwrap();

    holder.rollback().await.unwrap();
    let item = ledger
        .adjust_stock(adjust(tenant_id, busy, 1, MovementType::Receive))
        .await
        .unwrap();
    assert_eq!(item.quantity_on_hand, 6);
}

#[tokio::test]
async fn reservation_waits_for_in_flight_adjustment() {
    let store = InMemoryLedgerStore::new();
    let ledger = Arc::new(InventoryLedger::new(store.clone(), NoopEmitter));
    let tenant_id = TenantId::new();
    let key = key();
    stocked(&*ledger, tenant_id, key, 2).await;

    // Hold the row, stage a receive, and commit only after the reservation is queued.
    let mut holder = store.begin().await.unwrap();
    let mut row = holder.find_for_update(tenant_id, &key).await.unwrap().unwrap();
    let change = row.adjust_on_hand(3, chrono::Utc::now()).unwrap();
    holder.save(&row).await.unwrap();
    holder
        .append_movement(&dispensary_inventory::StockMovement::record(
            tenant_id,
            row.id,
            MovementType::Receive,
            change,
            "late delivery",
            None,
            UserId::new(),
            row.updated_at,
        ))
        .await
        .unwrap();

    let waiter = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .reserve_stock(tenant_id, &[ReservationLine::new(key, 4)])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    holder.commit().await.unwrap();
    waiter.await.unwrap().unwrap();

    let item = ledger.get_item(tenant_id, &key).await.unwrap();
    assert_eq!((item.quantity_on_hand, item.quantity_reserved), (5, 4));
}

mod postgres {
    //! Same guarantees against a real database. Run with
    //! `DATABASE_URL=postgres://… cargo test -p dispensary-infra -- --ignored`.

    use super::*;
    use crate::ledger::PostgresLedgerStore;

    async fn ledger_with(config: &LedgerConfig) -> InventoryLedger<PostgresLedgerStore, NoopEmitter> {
        dispensary_observability::init_for_tests();
        let store = PostgresLedgerStore::connect(config).await.unwrap();
        store.migrate().await.unwrap();
        InventoryLedger::from_config(store, NoopEmitter, config)
    }

    async fn ledger() -> InventoryLedger<PostgresLedgerStore, NoopEmitter> {
        ledger_with(&LedgerConfig::from_env().unwrap()).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn postgres_adjustments_serialize_and_replay() {
        let ledger = Arc::new(ledger().await);
        let tenant_id = TenantId::new();
        let key = StockKey::new(ProductId::new(), Some(VariantId::new()), LocationId::new());
        stocked(&*ledger, tenant_id, key, 10).await;

        let tasks: Vec<_> = [5, -3]
            .into_iter()
            .map(|delta| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .adjust_stock(adjust(tenant_id, key, delta, MovementType::Adjust))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_on_hand, 12);
        let report = ledger.audit_item(tenant_id, &key).await.unwrap();
        assert_eq!((report.movement_count, report.replayed_on_hand), (3, 12));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn postgres_reservations_cannot_oversell() {
        let ledger = Arc::new(ledger().await);
        let tenant_id = TenantId::new();
        let key = key();
        stocked(&*ledger, tenant_id, key, 5).await;

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .reserve_stock(tenant_id, &[ReservationLine::new(key, 3)])
                        .await
                })
            })
            .collect();
        let mut succeeded = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap().quantity_reserved, 3);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn postgres_duplicate_provisioning_is_a_conflict() {
        let ledger = ledger().await;
        let tenant_id = TenantId::new();
        let key = key();
        stocked(&ledger, tenant_id, key, 0).await;

        let err = ledger
            .provision_item(ProvisionItem {
                tenant_id,
                key,
                low_stock_threshold: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn postgres_audit_runs_on_a_single_connection() {
        let mut config = LedgerConfig::from_env().unwrap();
        config.max_connections = 1;
        let ledger = ledger_with(&config).await;
        let tenant_id = TenantId::new();
        let key = key();
        stocked(&ledger, tenant_id, key, 10).await;
        ledger
            .adjust_stock(adjust(tenant_id, key, -4, MovementType::Sell))
            .await
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), ledger.audit_item(tenant_id, &key))
            .await
            .expect("audit must not wait for a second connection")
            .unwrap();
        assert_eq!((report.movement_count, report.replayed_on_hand), (2, 6));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn postgres_returned_rows_match_read_back() {
        let ledger = ledger().await;
        let tenant_id = TenantId::new();
        let key = key();
        let provisioned = stocked(&ledger, tenant_id, key, 0).await;
        assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap(), provisioned);

        let adjusted = ledger
            .adjust_stock(adjust(tenant_id, key, 7, MovementType::Receive))
            .await
            .unwrap();
        assert_eq!(ledger.get_item(tenant_id, &key).await.unwrap(), adjusted);

        let history = ledger.movement_history(tenant_id, &key).await.unwrap();
        assert_eq!(history[0].created_at, adjusted.updated_at);
    }
}
