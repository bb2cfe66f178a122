// benches/call_dispatch.rs
//! Call latency through the bridge
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use polycall::{Bridge, BridgeConfig, Continuations, Value};

const SCRIPT: &str = r#"
    function add(a, b) { return a + b; }

    function sum_to(n) {
        let total = 0;
        let i = 0;
        while (i < n) {
            total = total + i;
            i = i + 1;
        }
        return total;
    }

    async function later(x) {
        await sleep(0);
        return x;
    }
"#;

const MOCK: &str = r#"
three_str(a, b, c) = "Hello World"
echo(x) = $0
"#;

fn setup() -> Bridge {
    let bridge = Bridge::initialize(BridgeConfig::default()).expect("Failed to initialize");
    bridge.load_from_memory("script", SCRIPT).expect("Failed to load script");
    bridge.load_from_memory("mock", MOCK).expect("Failed to load mock");
    bridge
}

fn benchmark_sync_calls(c: &mut Criterion) {
    let bridge = setup();

    c.bench_function("script_add", |b| {
        b.iter(|| bridge.call("add", black_box(vec![Value::Int(2), Value::Int(3)])))
    });

    c.bench_function("mock_three_str", |b| {
        b.iter(|| {
            bridge.call(
                "three_str",
                black_box(vec![Value::from("e"), Value::from("f"), Value::from("g")]),
            )
        })
    });

    c.bench_function("mock_echo", |b| {
        b.iter(|| bridge.call("echo", black_box(vec![Value::Float(1.5)])))
    });

    bridge.destroy();
}

fn benchmark_script_work(c: &mut Criterion) {
    let bridge = setup();
    let mut group = c.benchmark_group("script_sum_to");

    for n in [10i64, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| bridge.call("sum_to", black_box(vec![Value::Int(n)])))
        });
    }

    group.finish();
    bridge.destroy();
}

fn benchmark_await_round_trip(c: &mut Criterion) {
    let bridge = setup();

    c.bench_function("await_immediate", |b| {
        b.iter(|| {
            let handle = bridge
                .await_call("add", vec![Value::Int(1), Value::Int(2)], Continuations::noop(), None)
                .unwrap();
            black_box(handle.wait())
        })
    });

    c.bench_function("await_deferred", |b| {
        b.iter(|| {
            let handle = bridge
                .await_call("later", vec![Value::Int(7)], Continuations::noop(), None)
                .unwrap();
            black_box(handle.wait())
        })
    });

    bridge.destroy();
}

criterion_group!(
    benches,
    benchmark_sync_calls,
    benchmark_script_work,
    benchmark_await_round_trip
);
criterion_main!(benches);
