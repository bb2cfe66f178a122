// demos/async_integration.rs
//! Driving bridge calls from async code: a script module builds reports from
//! records that a slow remote service (mocked) hands back

use polycall::{Bridge, BridgeConfig, Value};
use std::sync::Arc;
use std::time::Duration;

const SCRIPT: &str = r#"
    async function load_record(key) {
        await sleep(20);
        return { key: key, title: "Record " + key, tags: ["bridge", "demo"] };
    }

    function render(record, extra) {
        return record.title + " [" + str(len(record.tags)) + " tags] " + extra;
    }
"#;

const REMOTE: &str = r#"
# Remote service, answers after a delay
lookup_owner(key) ~ 15 = "team-runtime"
"#;

// Simulated async sink the reports are written to
struct Sink;

impl Sink {
    async fn write(&self, key: &str, report: &Value) {
        tokio::time::sleep(Duration::from_micros(50)).await;
        println!("  [sink] {} -> {}", key, report);
    }
}

async fn build_report(bridge: &Bridge, sink: &Sink, key: &str) -> Result<(), String> {
    let record = bridge
        .call_async("load_record", vec![Value::from(key)])
        .await
        .map_err(|e| e.to_string())?;

    let owner = bridge
        .call_async("lookup_owner", vec![Value::from(key)])
        .await
        .map_err(|e| e.to_string())?;

    // render returns immediately; keep the blocking call off the async workers
    let rendering = bridge.clone();
    let report = tokio::task::spawn_blocking(move || {
        let extra = Value::String(format!("owned by {}", owner));
        rendering.call("render", vec![record, extra])
    })
    .await
    .map_err(|e| e.to_string())?
    .map_err(|e| e.to_string())?;

    sink.write(key, &report).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    println!("=== polycall - Async Integration ===\n");

    let bridge = Bridge::initialize(BridgeConfig::default()).expect("Failed to initialize bridge");
    bridge.load_from_memory("script", SCRIPT).expect("Failed to load script");
    bridge.load_from_memory("mock", REMOTE).expect("Failed to load mock");
    let sink = Arc::new(Sink);

    let tasks: Vec<_> = ["alpha", "beta", "gamma"]
        .into_iter()
        .map(|key| {
            let bridge = bridge.clone();
            let sink = sink.clone();
            tokio::spawn(async move { (key, build_report(&bridge, &sink, key).await) })
        })
        .collect();

    for task in tasks {
        match task.await {
            Ok((key, Err(e))) => println!("  {} failed: {}", key, e),
            Ok(_) => {}
            Err(e) => println!("  task panicked: {}", e),
        }
    }

    let destroying = bridge.clone();
    tokio::task::spawn_blocking(move || destroying.destroy())
        .await
        .expect("destroy panicked");
    println!("\nBridge destroyed");
}
