// tests/integration_tests.rs
//! Integration tests for the bridge: loading, resolution, marshaling and
//! synchronous calls

use polycall::marshal::MAX_SAFE_INTEGER;
use polycall::script::ScriptProgram;
use polycall::{
    Bridge, BridgeConfig, DispatchError, LoadError, MarshalError, MarshalSite, ResolveError, Value,
};

fn bridge() -> Bridge {
    Bridge::initialize(BridgeConfig::default()).expect("Failed to initialize")
}

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

#[test]
fn test_three_str_from_mock_file() {
    let bridge = bridge();
    bridge
        .load_from_file("mock", &[fixture("test.mock")])
        .expect("Failed to load");

    let result = bridge
        .call("three_str", vec!["e".into(), "f".into(), "g".into()])
        .unwrap();
    assert_eq!(result, Value::String("Hello World".to_string()));
}

#[test]
fn test_sequence_result_keeps_order() {
    let bridge = bridge();
    bridge
        .load_from_file("script", &[fixture("lib.script")])
        .unwrap();

    let result = bridge.call("g", vec![]).unwrap();
    assert_eq!(
        result,
        Value::Sequence(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
    );
}

#[test]
fn test_files_are_concatenated_in_order() {
    let bridge = bridge();
    let module = bridge
        .load_from_file("script", &[fixture("lib.script"), fixture("async.script")])
        .unwrap();

    assert!(module.exports_name("g"));
    assert!(module.exports_name("delayed"));
}

#[test]
fn test_relative_paths_use_execution_paths() {
    let bridge = bridge();
    let fixtures = format!("{}/tests/fixtures", env!("CARGO_MANIFEST_DIR"));

    assert!(matches!(
        bridge.load_from_file("mock", &["test.mock"]),
        Err(LoadError::Io { .. })
    ));

    bridge.add_execution_path("mock", &fixtures).unwrap();
    bridge.add_execution_path("script", &fixtures).unwrap();
    bridge.load_from_file("mock", &["test.mock"]).unwrap();
    bridge
        .load_from_file("script", &["lib.script", "async.script"])
        .unwrap();

    assert_eq!(
        bridge.call("three_str", vec!["e".into(), "f".into(), "g".into()]).unwrap(),
        Value::from("Hello World")
    );
    assert_eq!(bridge.call("add_one", vec![Value::Int(1)]).unwrap(), Value::Int(2));

    assert_eq!(
        bridge.add_execution_path("lua", &fixtures),
        Err(LoadError::UnknownTag("lua".into()))
    );
}

#[test]
fn test_export_signatures_from_files() {
    let bridge = bridge();
    bridge.load_from_file("mock", &[fixture("test.mock")]).unwrap();
    bridge.load_from_file("script", &[fixture("async.script")]).unwrap();

    let three = bridge.signature("three_str", None).unwrap();
    assert_eq!(three.to_string(), "three_str(a, b, c)");
    assert!(!three.is_async);

    assert!(bridge.signature("slow_echo", Some("mock")).unwrap().is_async);

    let delayed = bridge.signature("delayed", Some("script")).unwrap();
    assert_eq!(delayed.to_string(), "async delayed(x, ms)");
    assert_eq!(delayed.arity(), 2);

    assert_eq!(
        bridge.signature("nope", None),
        Err(ResolveError::SymbolNotFound("nope".into()))
    );
}

#[test]
fn test_duplicate_tag_isolation() {
    let bridge = bridge();
    let first = bridge
        .load_from_memory("script", "function first() { return 1; } function shared() { return \"a\"; }")
        .unwrap();
    let second = bridge
        .load_from_memory("script", "function second() { return 2; } function shared() { return \"b\"; }")
        .unwrap();
    assert_ne!(first.id(), second.id());

    assert_eq!(bridge.call("first", vec![]).unwrap(), Value::Int(1));
    assert_eq!(bridge.call("second", vec![]).unwrap(), Value::Int(2));

    // first match in load order wins
    assert_eq!(bridge.call("shared", vec![]).unwrap(), Value::from("a"));
    assert_eq!(bridge.modules().len(), 2);

    assert!(bridge.unload(first.id()));
    assert_eq!(bridge.call("shared", vec![]).unwrap(), Value::from("b"));
    assert!(!bridge.unload(first.id()));
}

#[test]
fn test_strict_resolution_reports_ambiguity() {
    let config = BridgeConfig {
        strict_resolution: true,
        ..BridgeConfig::default()
    };
    let bridge = Bridge::initialize(config).unwrap();
    let a = bridge.load_from_memory("mock", "f() = 1").unwrap();
    let b = bridge.load_from_memory("mock", "f() = 2").unwrap();

    assert_eq!(
        bridge.call("f", vec![]),
        Err(DispatchError::ResolveFailed(ResolveError::Ambiguous {
            name: "f".into(),
            modules: vec![a.id(), b.id()],
        }))
    );
}

#[test]
fn test_resolution_failures() {
    let bridge = bridge();
    bridge.load_from_memory("mock", "f() = 1").unwrap();

    assert_eq!(
        bridge.call("missing", vec![]),
        Err(DispatchError::ResolveFailed(ResolveError::SymbolNotFound(
            "missing".into()
        )))
    );
    assert_eq!(
        bridge.call_in("nope", "f", vec![]),
        Err(DispatchError::ResolveFailed(ResolveError::TagNotFound(
            "nope".into()
        )))
    );
    assert_eq!(
        bridge.call_in("script", "f", vec![]),
        Err(DispatchError::ResolveFailed(ResolveError::SymbolNotFound(
            "f".into()
        )))
    );
    assert_eq!(bridge.call_in("mock", "f", vec![]).unwrap(), Value::Int(1));
}

#[test]
fn test_load_failures() {
    let bridge = bridge();

    assert_eq!(
        bridge.load_from_memory("cobol", "").unwrap_err(),
        LoadError::UnknownTag("cobol".into())
    );
    assert!(matches!(
        bridge.load_from_memory("script", "function (").unwrap_err(),
        LoadError::Syntax(_)
    ));
    assert!(matches!(
        bridge.load_from_memory("mock", "f() = {not json}").unwrap_err(),
        LoadError::Syntax(_)
    ));
    assert!(matches!(
        bridge.load_from_file("mock", &[fixture("missing.mock")]).unwrap_err(),
        LoadError::Io { .. }
    ));
    assert!(matches!(
        bridge.load_from_package("mock", b"pcs1").unwrap_err(),
        LoadError::Unsupported(_)
    ));

    // nothing half-loaded is left behind
    assert!(bridge.modules().is_empty());
}

#[test]
fn test_precompiled_package() {
    let program = ScriptProgram::compile("function triple(x) { return x * 3; }").unwrap();
    let package = program.to_bytes().unwrap();

    let bridge = bridge();
    let module = bridge.load_from_package("script", &package).unwrap();
    assert_eq!(module.export_names(), vec!["triple"]);
    assert_eq!(module.signature("triple").unwrap().params, vec!["x".to_string()]);
    assert_eq!(bridge.call("triple", vec![Value::Int(4)]).unwrap(), Value::Int(12));
}

#[test]
fn test_structured_values_round_trip() {
    let bridge = bridge();
    bridge
        .load_from_memory("script", "function id(x) { return x; }")
        .unwrap();

    let value = Value::mapping([
        ("int", Value::Int(i64::MAX)),
        ("float", Value::Float(0.1)),
        ("null", Value::Null),
        (
            "nested",
            Value::Sequence(vec![Value::Bool(true), Value::from(vec!["x", "y"])]),
        ),
    ]);
    assert_eq!(bridge.call("id", vec![value.clone()]).unwrap(), value);
}

#[test]
fn test_float_only_runtime_precision() {
    let bridge = bridge();
    bridge
        .load_from_file("mock", &[fixture("test.mock")])
        .unwrap();

    assert_eq!(
        bridge.call("echo", vec![Value::Int(MAX_SAFE_INTEGER)]).unwrap(),
        Value::Int(MAX_SAFE_INTEGER)
    );
    assert_eq!(
        bridge.call("echo", vec![Value::Int(MAX_SAFE_INTEGER + 2)]),
        Err(DispatchError::MarshalFailed {
            site: MarshalSite::Argument(0),
            source: MarshalError::Precision {
                value: MAX_SAFE_INTEGER + 2,
                tag: "mock".into()
            },
        })
    );
    assert_eq!(
        bridge.call("numbers", vec![]).unwrap(),
        Value::Sequence(vec![Value::Int(0), Value::Int(1), Value::Float(2.5)])
    );
}

#[test]
fn test_cyclic_result_fails_to_marshal() {
    let bridge = bridge();
    bridge
        .load_from_memory("script", "function cyc() { let a = [1]; push(a, a); return a; }")
        .unwrap();

    let err = bridge.call("cyc", vec![]).unwrap_err();
    assert_eq!(
        err,
        DispatchError::MarshalFailed {
            site: MarshalSite::ReturnValue,
            source: MarshalError::Cyclic { depth: 64 },
        }
    );
}

#[test]
fn test_unsupported_argument() {
    let bridge = bridge();
    bridge.load_from_memory("mock", "f(x) = $0").unwrap();

    let err = bridge
        .call("f", vec![Value::Mapping(vec![(Value::Int(1), Value::Null)])])
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::MarshalFailed {
            site: MarshalSite::Argument(0),
            source: MarshalError::Unsupported { kind: "int", .. },
        }
    ));
}

#[test]
fn test_native_exceptions() {
    let bridge = bridge();
    bridge
        .load_from_file("mock", &[fixture("test.mock")])
        .unwrap();
    bridge
        .load_from_memory(
            "script",
            "function check(x) { if (x < 0) { throw { message: \"negative\", value: x }; } return x; }",
        )
        .unwrap();

    let err = bridge.call("fail", vec!["bad input".into()]).unwrap_err();
    assert_eq!(err, DispatchError::native(Value::from("bad input"), None));
    assert_eq!(err.to_string(), "Native exception: bad input");

    let DispatchError::NativeException {
        message,
        stack,
        payload,
    } = bridge.call("check", vec![Value::Int(-2)]).unwrap_err()
    else {
        panic!("expected a native exception");
    };
    assert_eq!(message, "negative");
    assert_eq!(stack.as_deref(), Some("    at check"));
    assert_eq!(payload.get("value"), Some(&Value::Int(-2)));

    // arity is checked by the mock runtime
    assert!(matches!(
        bridge.call("echo", vec![]),
        Err(DispatchError::NativeException { .. })
    ));

    // a failed call is distinguishable from a null result
    assert_eq!(bridge.call("check", vec![Value::Null]), Ok(Value::Null));
}

#[test]
fn test_function_values() {
    let bridge = bridge();
    bridge
        .load_from_memory(
            "script",
            r#"
            function add_one(x) { return x + 1; }
            function adder() { return add_one; }
            function apply(f, x) { return f(x); }
            "#,
        )
        .unwrap();

    let func = bridge.call("adder", vec![]).unwrap();
    let func_ref = func.as_function().expect("expected a function value").clone();
    assert_eq!(func_ref.name(), Some("add_one"));
    assert_eq!(func_ref.tag(), "script");

    assert_eq!(
        bridge.call_function(&func_ref, vec![Value::Int(41)]).unwrap(),
        Value::Int(42)
    );
    assert_eq!(
        bridge.call("apply", vec![func, Value::Int(1)]).unwrap(),
        Value::Int(2)
    );
}

#[test]
fn test_function_from_another_module_is_unsupported() {
    let bridge = bridge();
    bridge
        .load_from_memory("script", "function inc(x) { return x + 1; } function get() { return inc; }")
        .unwrap();
    bridge.load_from_memory("mock", "take(f) = 1").unwrap();

    let func = bridge.call("get", vec![]).unwrap();
    assert!(matches!(
        bridge.call("take", vec![func]),
        Err(DispatchError::MarshalFailed {
            site: MarshalSite::Argument(0),
            source: MarshalError::Unsupported { kind: "function", .. },
        })
    ));
}

#[test]
fn test_references_go_stale_after_unload() {
    let bridge = bridge();
    let module = bridge
        .load_from_memory("script", "function inc(x) { return x + 1; } function get() { return inc; }")
        .unwrap();

    let func = bridge.call("get", vec![]).unwrap();
    let func_ref = func.as_function().unwrap().clone();
    assert!(func_ref.is_live());

    assert!(bridge.unload(module.id()));
    assert!(!func_ref.is_live());
    assert_eq!(
        bridge.call_function(&func_ref, vec![Value::Int(1)]),
        Err(DispatchError::MarshalFailed {
            site: MarshalSite::Callee,
            source: MarshalError::StaleReference {
                module: module.id()
            },
        })
    );
}

#[test]
fn test_sync_call_waits_for_async_function() {
    let bridge = bridge();
    bridge
        .load_from_file("script", &[fixture("async.script")])
        .unwrap();

    assert_eq!(
        bridge
            .call("delayed", vec![Value::from("late"), Value::Int(10)])
            .unwrap(),
        Value::from("late")
    );
    assert_eq!(
        bridge.call("both", vec![Value::Int(1), Value::Int(2)]).unwrap(),
        Value::from(vec![1, 2])
    );

    let err = bridge.call("delayed_throw", vec![Value::Int(5)]).unwrap_err();
    assert_eq!(err.kind(), "exception");
    assert!(err.to_string().contains("async failure"));
}

#[test]
fn test_calls_from_many_threads() {
    let bridge = bridge();
    bridge
        .load_from_memory("script", "function square(x) { return x * x; }")
        .unwrap();
    bridge.load_from_memory("mock", "echo(x) = $0").unwrap();

    let workers: Vec<_> = (0..8)
        .map(|t| {
            let bridge = bridge.clone();
            std::thread::spawn(move || {
                for i in 0..50i64 {
                    let n = t * 100 + i;
                    assert_eq!(bridge.call("square", vec![Value::Int(n)]).unwrap(), Value::Int(n * n));
                    assert_eq!(bridge.call("echo", vec![Value::Int(n)]).unwrap(), Value::Int(n));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_calls_after_destroy_fail() {
    let bridge = bridge();
    bridge.load_from_memory("mock", "f() = 1").unwrap();
    bridge.destroy();

    assert_eq!(bridge.call("f", vec![]), Err(DispatchError::Closed));
    assert_eq!(
        bridge.load_from_memory("mock", "g() = 1").unwrap_err(),
        LoadError::Closed
    );
}
