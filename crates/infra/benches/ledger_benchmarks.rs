use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use dispensary_core::{LocationId, ProductId, TenantId, UserId};
use dispensary_events::NoopEmitter;
use dispensary_infra::{InMemoryLedgerStore, InventoryLedger};
use dispensary_inventory::{
    AdjustStock, InventoryItem, MovementType, ProvisionItem, ReservationLine, StockKey, sort_lines,
};

type Ledger = InventoryLedger<InMemoryLedgerStore, NoopEmitter>;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime")
}

async fn stocked(ledger: &Ledger, tenant_id: TenantId, on_hand: i64) -> InventoryItem {
    let key = StockKey::new(ProductId::new(), None, LocationId::new());
    ledger
        .provision_item(ProvisionItem {
            tenant_id,
            key,
            low_stock_threshold: None,
        })
        .await
        .expect("provision");
    ledger
        .adjust_stock(receive(tenant_id, key, on_hand))
        .await
        .expect("receive")
}

fn receive(tenant_id: TenantId, key: StockKey, quantity: i64) -> AdjustStock {
    AdjustStock {
        tenant_id,
        key,
        quantity,
        reason: "bench receiving".to_string(),
        actor_id: UserId::new(),
        movement_type: MovementType::Receive,
        reference_id: None,
    }
}

fn bench_adjust_stock(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("adjust_stock");
    group.throughput(Throughput::Elements(1));

    group.bench_function("receive_one_unit", |b| {
        let ledger = InventoryLedger::new(InMemoryLedgerStore::new(), NoopEmitter);
        let tenant_id = TenantId::new();
        let item = rt.block_on(stocked(&ledger, tenant_id, 1));

        b.iter(|| {
            rt.block_on(ledger.adjust_stock(receive(tenant_id, item.key, black_box(1))))
                .expect("adjust");
        });
    });

    group.finish();
}

fn bench_reserve_release(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("reserve_then_release");

    for line_count in [1usize, 5, 20] {
        group.throughput(Throughput::Elements(line_count as u64));
        group.bench_with_input(
            BenchmarkId::new("lines", line_count),
            &line_count,
            |b, &line_count| {
                let ledger = InventoryLedger::new(InMemoryLedgerStore::new(), NoopEmitter);
                let tenant_id = TenantId::new();
                let mut lines: Vec<ReservationLine> = (0..line_count)
                    .map(|_| {
                        let item = rt.block_on(stocked(&ledger, tenant_id, 1_000));
                        ReservationLine::new(item.key, 1)
                    })
                    .collect();
                sort_lines(&mut lines);

                b.iter(|| {
                    rt.block_on(async {
                        ledger.reserve_stock(tenant_id, black_box(&lines)).await?;
                        ledger.release_reservation(tenant_id, &lines).await
                    })
                    .expect("reserve/release");
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_adjust_stock, bench_reserve_release);
criterion_main!(benches);
