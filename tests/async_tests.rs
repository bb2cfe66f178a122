// tests/async_tests.rs
//! Asynchronous calls: continuation pairs, timeouts and concurrent awaits

use parking_lot::Mutex;
use polycall::{Bridge, BridgeConfig, CallState, Continuations, DispatchError, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ASYNC_SCRIPT: &str = r#"
    async function delayed(x, ms) {
        await sleep(ms);
        return x;
    }

    async function delayed_throw(ms) {
        await sleep(ms);
        throw { message: "async failure", code: 7 };
    }

    function immediate(x) { return x + 1; }

    function later_box(x) { return { value: delayed(x, 10) }; }

    async function unwrap(p) { return await p; }
"#;

fn bridge() -> Bridge {
    let bridge = Bridge::initialize(BridgeConfig::default()).expect("Failed to initialize");
    bridge
        .load_from_memory("script", ASYNC_SCRIPT)
        .expect("Failed to load");
    bridge
}

/// Fire counts and the last value seen by each continuation
#[derive(Default)]
struct Recorder {
    resolved: AtomicUsize,
    rejected: AtomicUsize,
    last: Mutex<Option<Value>>,
}

impl Recorder {
    fn continuations(self: &Arc<Self>) -> Continuations<Arc<Recorder>> {
        Continuations::new(
            self.clone(),
            |value, recorder: Arc<Recorder>| {
                recorder.resolved.fetch_add(1, Ordering::SeqCst);
                *recorder.last.lock() = Some(value.clone());
                value
            },
            |value, recorder: Arc<Recorder>| {
                recorder.rejected.fetch_add(1, Ordering::SeqCst);
                *recorder.last.lock() = Some(value.clone());
                value
            },
        )
    }

    fn counts(&self) -> (usize, usize) {
        (
            self.resolved.load(Ordering::SeqCst),
            self.rejected.load(Ordering::SeqCst),
        )
    }

    fn last(&self) -> Option<Value> {
        self.last.lock().clone()
    }
}

#[test]
fn test_settles_before_timeout_resolves_once() {
    let bridge = bridge();
    let recorder = Arc::new(Recorder::default());

    let handle = bridge
        .await_call(
            "delayed",
            vec![Value::from("ok"), Value::Int(20)],
            recorder.continuations(),
            Some(Duration::from_millis(300)),
        )
        .unwrap();
    assert_eq!(handle.target(), "delayed");
    assert_eq!(handle.arg_count(), 2);

    assert_eq!(handle.wait(), Ok(Value::from("ok")));
    assert_eq!(handle.state(), CallState::Resolved);

    // outlive the timeout; nothing else may fire
    thread::sleep(Duration::from_millis(350));
    assert_eq!(recorder.counts(), (1, 0));
    assert_eq!(recorder.last(), Some(Value::from("ok")));
    assert_eq!(handle.continuation_value(), Some(Value::from("ok")));
}

#[test]
fn test_throwing_async_function_rejects_once() {
    let bridge = bridge();
    let recorder = Arc::new(Recorder::default());

    let handle = bridge
        .await_call(
            "delayed_throw",
            vec![Value::Int(10)],
            recorder.continuations(),
            Some(Duration::from_millis(300)),
        )
        .unwrap();

    let err = handle.wait().unwrap_err();
    assert!(matches!(err, DispatchError::NativeException { ref message, .. } if message == "async failure"));
    assert_eq!(handle.state(), CallState::Rejected);

    thread::sleep(Duration::from_millis(350));
    assert_eq!(recorder.counts(), (0, 1));

    // reject receives the thrown value itself
    let payload = recorder.last().unwrap();
    assert_eq!(payload.get("code"), Some(&Value::Int(7)));
}

#[test]
fn test_timeout_rejects_and_late_settlement_is_dropped() {
    let bridge = bridge();
    let recorder = Arc::new(Recorder::default());

    let handle = bridge
        .await_call(
            "delayed",
            vec![Value::Int(1), Value::Int(150)],
            recorder.continuations(),
            Some(Duration::from_millis(20)),
        )
        .unwrap();

    assert_eq!(handle.wait(), Err(DispatchError::Timeout));
    assert_eq!(handle.state(), CallState::TimedOut);
    assert_eq!(
        recorder.last(),
        Some(Value::mapping([
            ("kind", Value::from("timeout")),
            ("message", Value::from("Call timed out")),
        ]))
    );

    // the native call completes later; no continuation may fire for it
    thread::sleep(Duration::from_millis(250));
    assert_eq!(recorder.counts(), (0, 1));
    assert_eq!(handle.state(), CallState::TimedOut);
}

#[test]
fn test_immediate_result_resolves() {
    let bridge = bridge();
    let recorder = Arc::new(Recorder::default());

    let handle = bridge
        .await_call("immediate", vec![Value::Int(1)], recorder.continuations(), None)
        .unwrap();
    assert_eq!(handle.wait(), Ok(Value::Int(2)));
    assert_eq!(recorder.counts(), (1, 0));
}

#[test]
fn test_resolution_failure_is_synchronous() {
    let bridge = bridge();
    let recorder = Arc::new(Recorder::default());

    let err = bridge
        .await_call("missing", vec![], recorder.continuations(), None)
        .unwrap_err();
    assert_eq!(err.kind(), "resolve");
    assert_eq!(recorder.counts(), (0, 0));
}

#[test]
fn test_marshal_failure_rejects() {
    let bridge = bridge();
    bridge.load_from_memory("mock", "echo(x) = $0").unwrap();
    let recorder = Arc::new(Recorder::default());

    let handle = bridge
        .await_call_in(
            "mock",
            "echo",
            vec![Value::Int(i64::MAX)],
            recorder.continuations(),
            None,
        )
        .unwrap();
    assert_eq!(handle.tag(), Some("mock"));
    assert_eq!(handle.wait().unwrap_err().kind(), "marshal");

    let rejection = recorder.last().unwrap();
    assert_eq!(rejection.get("kind"), Some(&Value::from("marshal")));
    assert_eq!(recorder.counts(), (0, 1));
}

fn concurrent_awaits(n: usize) {
    let bridge = bridge();
    let recorders: Vec<Arc<Recorder>> = (0..n).map(|_| Arc::new(Recorder::default())).collect();

    let handles: Vec<_> = recorders
        .iter()
        .enumerate()
        .map(|(i, recorder)| {
            bridge
                .await_call(
                    "delayed",
                    vec![Value::Int(i as i64), Value::Int(10 + (i % 7) as i64)],
                    recorder.continuations(),
                    Some(Duration::from_secs(5)),
                )
                .unwrap()
        })
        .collect();

    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(handle.wait(), Ok(Value::Int(i as i64)));
    }
    for (i, recorder) in recorders.iter().enumerate() {
        assert_eq!(recorder.counts(), (1, 0), "call {} fired the wrong continuations", i);
        assert_eq!(recorder.last(), Some(Value::Int(i as i64)));
    }
}

#[test]
fn test_one_await() {
    concurrent_awaits(1);
}

#[test]
fn test_five_concurrent_awaits() {
    concurrent_awaits(5);
}

#[test]
fn test_sixty_four_concurrent_awaits() {
    concurrent_awaits(64);
}

#[test]
fn test_awaits_across_runtimes() {
    let bridge = bridge();
    bridge
        .load_from_memory("mock", "slow_echo(x) ~ 20 = $0\nslow_fail() ~ 20 ! \"mock failure\"")
        .unwrap();

    let script = bridge
        .await_call("delayed", vec![Value::Int(1), Value::Int(20)], Continuations::noop(), None)
        .unwrap();
    let mock_ok = bridge
        .await_call("slow_echo", vec![Value::from("m")], Continuations::noop(), None)
        .unwrap();
    let mock_err = bridge
        .await_call("slow_fail", vec![], Continuations::noop(), None)
        .unwrap();

    assert_eq!(script.wait(), Ok(Value::Int(1)));
    assert_eq!(mock_ok.wait(), Ok(Value::from("m")));
    assert_eq!(
        mock_err.wait(),
        Err(DispatchError::native(Value::from("mock failure"), None))
    );
}

#[test]
fn test_pending_values() {
    let bridge = bridge();

    let boxed = bridge.call("later_box", vec![Value::Int(5)]).unwrap();
    let pending = boxed
        .get("value")
        .and_then(Value::as_pending)
        .expect("expected a pending value")
        .clone();
    assert_eq!(pending.tag(), "script");

    let handle = bridge
        .await_pending(&pending, Continuations::noop(), Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(handle.wait(), Ok(Value::Int(5)));

    // settled pending values can be awaited again and passed back in
    let again = bridge
        .await_pending(&pending, Continuations::noop(), None)
        .unwrap();
    assert_eq!(again.wait(), Ok(Value::Int(5)));
    assert_eq!(
        bridge.call("unwrap", vec![Value::Pending(pending)]).unwrap(),
        Value::Int(5)
    );
}

#[test]
fn test_sync_call_from_continuation_is_reentrant() {
    let bridge = bridge();
    let inner = bridge.clone();

    let handle = bridge
        .await_call(
            "immediate",
            vec![Value::Int(1)],
            Continuations::new(
                inner,
                |_, bridge: Bridge| match bridge.call("immediate", vec![Value::Int(2)]) {
                    Err(e) => Value::from(e.kind()),
                    Ok(v) => v,
                },
                |value, _| value,
            ),
            None,
        )
        .unwrap();

    assert_eq!(handle.wait(), Ok(Value::Int(2)));
    assert_eq!(handle.continuation_value(), Some(Value::from("reentrant")));
}

#[test]
fn test_default_timeout_from_config() {
    let config = BridgeConfig {
        default_timeout_ms: Some(20),
        ..BridgeConfig::default()
    };
    let bridge = Bridge::initialize(config).unwrap();
    bridge.load_from_memory("script", ASYNC_SCRIPT).unwrap();

    let handle = bridge
        .await_call("delayed", vec![Value::Int(1), Value::Int(500)], Continuations::noop(), None)
        .unwrap();
    assert_eq!(handle.wait(), Err(DispatchError::Timeout));
}

#[test]
fn test_destroy_drains_in_flight_calls() {
    let bridge = bridge();
    let recorder = Arc::new(Recorder::default());

    let handle = bridge
        .await_call(
            "delayed",
            vec![Value::Int(9), Value::Int(40)],
            recorder.continuations(),
            None,
        )
        .unwrap();

    bridge.destroy();

    assert!(handle.is_terminal());
    assert_eq!(handle.outcome(), Some(Ok(Value::Int(9))));
    assert_eq!(recorder.counts(), (1, 0));
    assert!(matches!(
        bridge.await_call("delayed", vec![], Continuations::noop(), None),
        Err(DispatchError::Closed)
    ));
}

#[test]
fn test_destroy_from_continuation_keeps_draining() {
    let bridge = bridge();

    let first = bridge
        .await_call(
            "delayed",
            vec![Value::Int(1), Value::Int(10)],
            Continuations::new(
                bridge.clone(),
                |value, bridge: Bridge| {
                    bridge.destroy();
                    value
                },
                |value, _| value,
            ),
            None,
        )
        .unwrap();
    let second = bridge
        .await_call("delayed", vec![Value::Int(2), Value::Int(50)], Continuations::noop(), None)
        .unwrap();

    assert_eq!(first.wait_timeout(Duration::from_secs(3)), Some(Ok(Value::Int(1))));
    assert_eq!(second.wait_timeout(Duration::from_secs(3)), Some(Ok(Value::Int(2))));
    assert_eq!(first.continuation_value(), Some(Value::Int(1)));

    assert!(bridge.is_closed());
    assert_eq!(
        bridge.call("immediate", vec![Value::Int(1)]),
        Err(DispatchError::Closed)
    );
}

#[test]
fn test_destroy_from_timeout_continuation() {
    let bridge = bridge();

    let handle = bridge
        .await_call(
            "delayed",
            vec![Value::Int(1), Value::Int(500)],
            Continuations::new(
                bridge.clone(),
                |value, _| value,
                |value, bridge: Bridge| {
                    bridge.destroy();
                    value
                },
            ),
            Some(Duration::from_millis(20)),
        )
        .unwrap();

    assert_eq!(
        handle.wait_timeout(Duration::from_secs(3)),
        Some(Err(DispatchError::Timeout))
    );
    assert!(bridge.is_closed());
}

#[test]
fn test_unrepresentable_timeout_waits_without_one() {
    let bridge = bridge();
    let recorder = Arc::new(Recorder::default());

    let handle = bridge
        .await_call(
            "delayed",
            vec![Value::from("late"), Value::Int(10)],
            recorder.continuations(),
            Some(Duration::MAX),
        )
        .unwrap();

    assert_eq!(handle.wait(), Ok(Value::from("late")));
    assert_eq!(recorder.counts(), (1, 0));
}

#[test]
fn test_timed_out_calls_do_not_pile_up() {
    let bridge = bridge();
    bridge.load_from_memory("mock", "stuck() ~ 60000 = 1").unwrap();

    for _ in 0..32 {
        let handle = bridge
            .await_call("stuck", vec![], Continuations::noop(), Some(Duration::from_millis(1)))
            .unwrap();
        assert_eq!(handle.wait(), Err(DispatchError::Timeout));
    }

    // executors still answer promptly and teardown does not wait on the stuck calls
    assert_eq!(bridge.call("immediate", vec![Value::Int(1)]).unwrap(), Value::Int(2));
    bridge.destroy();
}

#[cfg(feature = "tokio")]
#[tokio::test]
async fn test_call_async() {
    let bridge = bridge();
    let value = bridge
        .call_async("delayed", vec![Value::from("tokio"), Value::Int(10)])
        .await
        .unwrap();
    assert_eq!(value, Value::from("tokio"));
}
