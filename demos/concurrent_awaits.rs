// demos/concurrent_awaits.rs
//! Many awaited calls in flight at once, each with its own continuations

use polycall::{Bridge, BridgeConfig, CallState, Continuations, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SCRIPT: &str = r#"
    async function work(id, ms) {
        await sleep(ms);
        if (id % 10 == 9) {
            throw { message: "job " + str(id) + " failed", id: id };
        }
        return id * 2;
    }
"#;

#[derive(Default)]
struct Tally {
    resolved: AtomicUsize,
    rejected: AtomicUsize,
}

fn main() {
    println!("=== polycall - Concurrent Awaits ===\n");

    let bridge = Bridge::initialize(BridgeConfig::default()).expect("Failed to initialize bridge");
    bridge.load_from_memory("script", SCRIPT).expect("Failed to load script");
    bridge
        .load_from_memory("mock", "slow_ping() ~ 40 = \"pong\"")
        .expect("Failed to load mock");

    let tally = Arc::new(Tally::default());
    let start = Instant::now();

    let mut handles: Vec<_> = (0..50i64)
        .map(|i| {
            bridge
                .await_call(
                    "work",
                    vec![Value::Int(i), Value::Int(10 + (i % 5) * 10)],
                    Continuations::new(
                        tally.clone(),
                        |value, tally: Arc<Tally>| {
                            tally.resolved.fetch_add(1, Ordering::SeqCst);
                            value
                        },
                        |value, tally: Arc<Tally>| {
                            tally.rejected.fetch_add(1, Ordering::SeqCst);
                            value
                        },
                    ),
                    Some(Duration::from_secs(2)),
                )
                .expect("Failed to start call")
        })
        .collect();

    // one call that cannot finish in time
    handles.push(
        bridge
            .await_call("slow_ping", vec![], Continuations::noop(), Some(Duration::from_millis(5)))
            .expect("Failed to start call"),
    );

    for handle in &handles {
        let _ = handle.wait();
    }

    println!("Settled {} calls in {:?}", handles.len(), start.elapsed());
    println!(
        "resolved = {}, rejected = {}",
        tally.resolved.load(Ordering::SeqCst),
        tally.rejected.load(Ordering::SeqCst)
    );

    let timed_out = handles
        .iter()
        .filter(|h| h.state() == CallState::TimedOut)
        .count();
    println!("timed out = {}", timed_out);

    if let Some(Err(e)) = handles[9].outcome() {
        println!("call 9: {}", e);
    }

    bridge.destroy();
    println!("\nBridge destroyed");
}
