use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use serde_json::{json, Value};
use stockview_cache::{CacheConfig, CacheManager};
use stockview_core::ReportParams;

fn report_params(i: usize) -> ReportParams {
    match json!({
        "start_date": "2024-01-01",
        "end_date": "2024-12-31",
        "supplier_name": format!("supplier-{i}"),
        "filters": {"warehouse": "main", "include_zero_stock": false},
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn report_rows(rows: usize) -> Value {
    Value::Array(
        (0..rows)
            .map(|i| json!({"sku": format!("SKU-{i:05}"), "qty": i, "amount": i as f64 * 1.5}))
            .collect(),
    )
}

fn bench_key_generation(c: &mut Criterion) {
    let cache: CacheManager = CacheManager::without_sweeper(CacheConfig::default());
    let params = report_params(7);

    c.bench_function("cache_key", |b| {
        b.iter(|| cache.key(black_box("purchase_report"), black_box(&params)));
    });
}

fn bench_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get_hit");

    for rows in [10usize, 100, 1000] {
        let cache: CacheManager = CacheManager::without_sweeper(CacheConfig::default());
        let params = report_params(0);
        let key = cache.key("inventory_report", &params);
        cache.set(&key, "inventory_report", &params, report_rows(rows), None);

        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("rows", rows), &key, |b, key| {
            b.iter(|| cache.get(black_box(key)));
        });
    }

    group.finish();
}

fn bench_set_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_set_at_capacity");

    for max_size in [100usize, 1000] {
        let cache: CacheManager =
            CacheManager::without_sweeper(CacheConfig::default().with_max_size(max_size));
        let keys: Vec<(String, ReportParams)> = (0..max_size * 2)
            .map(|i| {
                let params = report_params(i);
                (cache.key("sales_report", &params), params)
            })
            .collect();
        let rows = report_rows(10);

        group.bench_with_input(BenchmarkId::new("max_size", max_size), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                let (key, params) = &keys[i % keys.len()];
                cache.set(key, "sales_report", params, rows.clone(), None);
                i += 1;
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_get_hit,
    bench_set_with_eviction
);
criterion_main!(benches);
