// demos/basic_usage.rs
//! Basic usage of the bridge: load modules, call them, handle errors

use polycall::{Bridge, BridgeConfig, DispatchError, Value};

fn main() {
    println!("=== polycall - Basic Usage ===\n");

    let bridge = Bridge::initialize(BridgeConfig::default()).expect("Failed to initialize bridge");

    let script = r#"
        // Greeting built from its arguments
        function greet(name, times) {
            let out = [];
            let i = 0;
            while (i < times) {
                push(out, "Hello " + name);
                i = i + 1;
            }
            return out;
        }

        function summarize(order) {
            return {
                id: order.id,
                total: order.qty * order.price,
                items: order.qty,
            };
        }

        function check(amount) {
            if (amount > 1000) {
                throw { message: "amount over limit", limit: 1000 };
            }
            return true;
        }
    "#;

    println!("Loading script module...");
    let module = bridge.load_from_memory("script", script).expect("Failed to load script");
    println!("✓ Loaded module {}", module.id());
    for export in module.exports() {
        println!("    {}", export);
    }
    println!();

    bridge
        .load_from_memory("mock", "three_str(a, b, c) = \"Hello World\"\nratio() = 0.25")
        .expect("Failed to load mock");

    // Example 1: plain call
    println!("Example 1: Plain call");
    let greeting = bridge
        .call("greet", vec![Value::from("world"), Value::Int(2)])
        .expect("greet failed");
    println!("greet -> {}\n", greeting);

    // Example 2: structured arguments and results
    println!("Example 2: Structured values");
    let order = Value::mapping([
        ("id", Value::from("A-17")),
        ("qty", Value::Int(3)),
        ("price", Value::Float(19.5)),
    ]);
    let summary = bridge.call("summarize", vec![order]).expect("summarize failed");
    println!("summarize -> {}", summary);
    println!("total = {:?}\n", summary.get("total"));

    // Example 3: a different runtime behind the same call surface
    println!("Example 3: Mock runtime");
    let three = bridge
        .call("three_str", vec![Value::from("e"), Value::from("f"), Value::from("g")])
        .expect("three_str failed");
    println!("three_str -> {}", three);
    println!("ratio -> {}\n", bridge.call("ratio", vec![]).expect("ratio failed"));

    // Example 4: native exceptions keep their payload
    println!("Example 4: Native exception");
    match bridge.call("check", vec![Value::Int(5000)]) {
        Err(DispatchError::NativeException { message, stack, payload }) => {
            println!("message: {}", message);
            println!("limit:   {:?}", payload.get("limit"));
            if let Some(stack) = stack {
                println!("stack:\n{}", stack);
            }
        }
        other => println!("unexpected: {:?}", other),
    }
    println!();

    // Example 5: resolution errors
    println!("Example 5: Unknown function");
    if let Err(e) = bridge.call("does_not_exist", vec![]) {
        println!("{} ({})\n", e, e.kind());
    }

    bridge.destroy();
    println!("Bridge destroyed");
}
