use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use frontier_bridge::bridge::error::payload_code;
use frontier_bridge::{BridgeConfig, BridgeSession, ErrorCode, ScopeId, Value};
use serde_json::json;

fn session() -> BridgeSession {
    BridgeSession::new(&BridgeConfig::default()).expect("session")
}

fn results(session: &BridgeSession, scope: ScopeId) -> serde_json::Value {
    let text: String = session
        .renderer()
        .eval_with(scope, "JSON.stringify(globalThis.results)", "read-results.js")
        .expect("read results");
    serde_json::from_str(&text).expect("results json")
}

#[tokio::test]
async fn echo_call_completes_exactly_once() {
    let session = session();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    session
        .host()
        .register_native(
            "echo",
            ScopeId::GLOBAL,
            move |call| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(call.params.clone())
            },
            false,
        )
        .expect("register echo");

    let doc = session.open_document(true).expect("document");
    session
        .renderer()
        .eval(
            doc,
            r#"
            globalThis.results = [];
            frontier.bridge.call('echo', { text: 'ping', n: 3 }, (err, value) => {
                results.push({ err, value });
            });
            "#,
            "echo.js",
        )
        .expect("eval");

    session.settle().await.expect("settle");
    session.settle().await.expect("settle again");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        results(&session, doc),
        json!([{ "err": null, "value": { "text": "ping", "n": 3 } }])
    );
    assert_eq!(session.renderer().agent().pending_calls(), 0);
}

#[tokio::test]
async fn unknown_host_function_reports_not_found() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    session
        .renderer()
        .eval(
            doc,
            r#"
            globalThis.results = [];
            frontier.bridge.call('does.not.exist', (err, value) => {
                results.push({ code: err.code, value: value === undefined });
            });
            "#,
            "missing.js",
        )
        .expect("eval");

    session.settle().await.expect("settle");

    assert_eq!(
        results(&session, doc),
        json!([{ "code": "FunctionNotFound", "value": true }])
    );
}

#[tokio::test]
async fn failing_host_function_reports_invoked_function_failed() {
    let session = session();
    session
        .host()
        .register_native(
            "fails",
            ScopeId::GLOBAL,
            |_| Err(anyhow::anyhow!("disk on fire")),
            false,
        )
        .expect("register");
    session
        .host()
        .register_native("panics", ScopeId::GLOBAL, |_| panic!("boom"), false)
        .expect("register");

    let doc = session.open_document(true).expect("document");
    session
        .renderer()
        .eval(
            doc,
            r#"
            globalThis.results = [];
            frontier.bridge.call('fails', null, (err) => results.push(err));
            frontier.bridge.call('panics', null, (err) => results.push(err));
            "#,
            "failures.js",
        )
        .expect("eval");

    session.settle().await.expect("settle");

    let results = results(&session, doc);
    assert_eq!(results[0]["code"], "InvokedFunctionFailed");
    assert_eq!(results[0]["message"], "disk on fire");
    assert_eq!(results[1]["code"], "InvokedFunctionFailed");
    assert_eq!(results[1]["message"], "boom");
}

#[tokio::test]
async fn correlation_ids_increase_per_call() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    let ordered: bool = session
        .renderer()
        .eval_with(
            doc,
            r#"
            (() => {
                const noop = () => {};
                const ids = [1, 2, 3].map((n) => frontier.bridge.call('echo', n, noop));
                return ids[0] > 0 && ids[0] < ids[1] && ids[1] < ids[2];
            })()
            "#,
            "ids.js",
        )
        .expect("eval");
    assert!(ordered);
    assert_eq!(session.renderer().agent().pending_calls(), 3);

    session.settle().await.expect("settle");
    assert_eq!(session.renderer().agent().pending_calls(), 0);
}

#[tokio::test]
async fn navigating_away_drops_pending_callbacks() {
    let session = session();
    let marks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&marks);
    session
        .host()
        .register_native(
            "mark",
            ScopeId::GLOBAL,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            },
            false,
        )
        .expect("register mark");
    session
        .host()
        .register_native("echo", ScopeId::GLOBAL, |call| Ok(call.params.clone()), false)
        .expect("register echo");

    let doc = session.open_document(true).expect("document");
    session
        .renderer()
        .eval(
            doc,
            r#"
            frontier.bridge.call('echo', 'late', () => {
                frontier.bridge.call('mark', null, () => {});
            });
            "#,
            "teardown.js",
        )
        .expect("eval");
    assert_eq!(session.renderer().agent().pending_calls(), 1);

    let next = session.navigate(doc).expect("navigate");
    assert_ne!(next, doc);
    assert_eq!(session.renderer().agent().pending_calls(), 0);

    session.settle().await.expect("settle");

    assert_eq!(marks.load(Ordering::SeqCst), 0);
    assert_eq!(session.host().main_document(), Some(next));
    assert_eq!(session.host().live_documents(), vec![next]);
}

#[tokio::test]
async fn scoped_host_function_is_invisible_to_other_documents() {
    let session = session();
    let first = session.open_document(true).expect("first");
    let second = session.open_document(false).expect("second");
    session
        .host()
        .register_native("secret", first, |_| Ok(json!("for first")), false)
        .expect("register");

    let script = r#"
        globalThis.results = [];
        frontier.bridge.call('secret', null, (err, value) => {
            results.push(err ? err.code : value);
        });
    "#;
    session
        .renderer()
        .eval(first, script, "first.js")
        .expect("eval first");
    session
        .renderer()
        .eval(second, script, "second.js")
        .expect("eval second");
    session.settle().await.expect("settle");

    assert_eq!(results(&session, first), json!(["for first"]));
    assert_eq!(results(&session, second), json!(["FunctionNotFound"]));
}

#[tokio::test]
async fn send_message_reaches_raw_handler() {
    let session = session();
    let received: Arc<Mutex<Vec<(ScopeId, String, Vec<Value>)>>> = Arc::default();
    let sink = Arc::clone(&received);
    session
        .host()
        .set_raw_message_handler(move |scope, name, args| {
            sink.lock()
                .expect("lock")
                .push((scope, name.to_string(), args.to_vec()));
        });

    let doc = session.open_document(true).expect("document");
    session
        .renderer()
        .eval(
            doc,
            "frontier.bridge.sendMessage('ready', ['demo', 1, true]);",
            "raw.js",
        )
        .expect("eval");
    session.settle().await.expect("settle");

    let received = received.lock().expect("lock");
    assert_eq!(received.len(), 1);
    let (scope, name, args) = &received[0];
    assert_eq!(*scope, doc);
    assert_eq!(name, "ready");
    assert_eq!(
        args,
        &vec![Value::from("demo"), Value::Int(1), Value::Bool(true)]
    );
}

#[tokio::test]
async fn host_keeps_serving_after_a_panicking_completion() {
    let session = session();
    session
        .host()
        .register_native("echo", ScopeId::GLOBAL, |call| Ok(call.params.clone()), false)
        .expect("register echo");
    let doc = session.open_document(true).expect("document");
    session
        .renderer()
        .eval(doc, "frontier.bridge.register('ping', () => 'pong');", "ping.js")
        .expect("eval");

    session
        .host()
        .call_script("ping", "", doc, |_| panic!("completion bug"))
        .expect("call");
    session.settle().await.expect("settle");
    assert_eq!(session.host().pending_calls(), 0);

    session
        .renderer()
        .eval(
            doc,
            r#"
            globalThis.results = [];
            frontier.bridge.call('echo', 'still here', (err, value) => {
                results.push({ err, value });
            });
            "#,
            "after-panic.js",
        )
        .expect("host link still open");
    session.settle().await.expect("settle");

    assert_eq!(
        results(&session, doc),
        json!([{ "err": null, "value": "still here" }])
    );
}

#[test]
fn error_payloads_carry_codes() {
    let payload = json!({ "code": "Timeout", "message": "slow" }).to_string();
    assert_eq!(payload_code(&payload), Some(ErrorCode::Timeout));
    assert_eq!(payload_code("42"), None);
}
