// benches/marshal_large_payloads.rs
//! Marshaling cost for large arguments and return values
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use polycall::{Bridge, BridgeConfig, Value};
use std::time::Instant;

fn generate_sequence(len: usize) -> Value {
    Value::Sequence(
        (0..len)
            .map(|i| {
                if i % 2 == 0 {
                    Value::Int(i as i64)
                } else {
                    Value::Float(i as f64 + 0.5)
                }
            })
            .collect(),
    )
}

fn generate_record(field_count: usize) -> Value {
    Value::mapping((0..field_count).map(|i| {
        let value = match i % 3 {
            0 => Value::Int(i as i64),
            1 => Value::Float(i as f64 * 1.25),
            _ => Value::String(format!("field value {}", i)),
        };
        (format!("f{}", i), value)
    }))
}

fn generate_nested(depth: usize, width: usize) -> Value {
    if depth == 0 {
        return generate_record(width);
    }
    Value::Sequence((0..width).map(|_| generate_nested(depth - 1, width)).collect())
}

fn bench_large_payloads(c: &mut Criterion) {
    let bridge = Bridge::initialize(BridgeConfig::default()).expect("Failed to initialize");
    bridge
        .load_from_memory("script", "function script_id(x) { return x; }")
        .expect("Failed to load script");
    bridge
        .load_from_memory("mock", "mock_id(x) = $0")
        .expect("Failed to load mock");

    let warm = generate_nested(3, 8);
    let start = Instant::now();
    for _ in 0..5 {
        let _ = bridge.call("script_id", vec![warm.clone()]);
    }
    println!("Warm-up of 5 nested round trips took {:?}", start.elapsed());

    let mut group = c.benchmark_group("sequence_round_trip");
    for len in [100usize, 1_000, 10_000] {
        let payload = generate_sequence(len);
        group.bench_with_input(BenchmarkId::new("script", len), &payload, |b, payload| {
            b.iter(|| bridge.call("script_id", black_box(vec![payload.clone()])))
        });
        group.bench_with_input(BenchmarkId::new("mock", len), &payload, |b, payload| {
            b.iter(|| bridge.call("mock_id", black_box(vec![payload.clone()])))
        });
    }
    group.finish();

    let mut group = c.benchmark_group("record_round_trip");
    for fields in [50usize, 500] {
        let payload = generate_record(fields);
        group.bench_with_input(BenchmarkId::new("script", fields), &payload, |b, payload| {
            b.iter(|| bridge.call("script_id", black_box(vec![payload.clone()])))
        });
        group.bench_with_input(BenchmarkId::new("mock", fields), &payload, |b, payload| {
            b.iter(|| bridge.call("mock_id", black_box(vec![payload.clone()])))
        });
    }
    group.finish();

    c.bench_function("nested_3x8_script", |b| {
        b.iter(|| bridge.call("script_id", black_box(vec![warm.clone()])))
    });

    bridge.destroy();
}

criterion_group!(benches, bench_large_payloads);
criterion_main!(benches);
