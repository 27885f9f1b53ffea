use std::time::Duration;

use frontier_bridge::bridge::error::payload_code;
use futures_util::future::join_all;
use frontier_bridge::{BridgeConfig, BridgeError, BridgeSession, ErrorCode, ScopeId};

fn session() -> BridgeSession {
    BridgeSession::new(&BridgeConfig::default()).expect("session")
}

fn register(session: &BridgeSession, scope: ScopeId, source: &str) {
    session
        .renderer()
        .eval(scope, source, "register.js")
        .expect("register script function");
}

#[tokio::test]
async fn host_calls_registered_script_function() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    register(
        &session,
        doc,
        "frontier.bridge.register('double', (n) => n * 2);",
    );

    let (outcome, settled) = tokio::join!(
        session.host().call_script_async("double", "21", doc),
        session.settle()
    );
    settled.expect("settle");
    let outcome = outcome.expect("call");
    assert!(!outcome.has_error);
    assert_eq!(outcome.payload, "42");
    assert_eq!(session.host().pending_calls(), 0);
}

#[tokio::test]
async fn concurrent_calls_get_their_own_answers() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    register(&session, doc, "frontier.bridge.register('square', (n) => n * n);");

    let params: Vec<String> = (1..=5).map(|n| n.to_string()).collect();
    let calls = join_all(
        params
            .iter()
            .map(|param| session.host().call_script_async("square", param, doc)),
    );
    let (outcomes, settled) = tokio::join!(calls, session.settle());
    settled.expect("settle");

    let payloads: Vec<String> = outcomes
        .into_iter()
        .map(|outcome| outcome.expect("call").payload)
        .collect();
    assert_eq!(payloads, vec!["1", "4", "9", "16", "25"]);
}

#[tokio::test]
async fn undefined_result_is_null_payload() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    register(&session, doc, "frontier.bridge.register('nothing', () => {});");

    let (outcome, _) = tokio::join!(
        session.host().call_script_async("nothing", "", doc),
        session.settle()
    );
    assert_eq!(outcome.expect("call").into_result(), Ok("null".to_string()));
}

#[tokio::test]
async fn throwing_script_function_reports_failure() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    register(
        &session,
        doc,
        "frontier.bridge.register('explode', () => { throw new Error('kaput'); });",
    );

    let (outcome, _) = tokio::join!(
        session.host().call_script_async("explode", "null", doc),
        session.settle()
    );
    let outcome = outcome.expect("call");
    assert!(outcome.has_error);
    assert_eq!(
        payload_code(&outcome.payload),
        Some(ErrorCode::InvokedFunctionFailed)
    );
    assert!(outcome.payload.contains("kaput"));
}

#[tokio::test]
async fn unknown_script_function_reports_not_found() {
    let session = session();
    let doc = session.open_document(true).expect("document");

    let (outcome, _) = tokio::join!(
        session.host().call_script_async("absent", "", doc),
        session.settle()
    );
    let outcome = outcome.expect("call");
    assert!(outcome.has_error);
    assert_eq!(
        payload_code(&outcome.payload),
        Some(ErrorCode::FunctionNotFound)
    );
}

#[tokio::test]
async fn duplicate_registration_throws_unless_replacing() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    let report: String = session
        .renderer()
        .eval_with(
            doc,
            r#"
            (() => {
                frontier.bridge.register('name', () => 'first');
                let duplicate = 'no error';
                try {
                    frontier.bridge.register('name', () => 'second');
                } catch (err) {
                    duplicate = err.message;
                }
                frontier.bridge.register('name', () => 'third', true);
                return duplicate;
            })()
            "#,
            "duplicate.js",
        )
        .expect("eval");
    assert!(report.contains("already registered"), "got {report}");

    let (outcome, _) = tokio::join!(
        session.host().call_script_async("name", "", doc),
        session.settle()
    );
    assert_eq!(outcome.expect("call").payload, "\"third\"");
}

#[tokio::test]
async fn unregistered_function_is_no_longer_found() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    let removed: bool = session
        .renderer()
        .eval_with(
            doc,
            r#"
            frontier.bridge.register('temp', () => 1);
            frontier.bridge.unregister('temp')
            "#,
            "unregister.js",
        )
        .expect("eval");
    assert!(removed);

    let (outcome, _) = tokio::join!(
        session.host().call_script_async("temp", "", doc),
        session.settle()
    );
    assert_eq!(
        payload_code(&outcome.expect("call").payload),
        Some(ErrorCode::FunctionNotFound)
    );
}

#[tokio::test]
async fn script_functions_are_scoped_to_their_document() {
    let session = session();
    let first = session.open_document(true).expect("first");
    let second = session.open_document(false).expect("second");
    register(&session, first, "frontier.bridge.register('who', () => 'first');");

    let (from_first, from_second, _) = tokio::join!(
        session.host().call_script_async("who", "", first),
        session.host().call_script_async("who", "", second),
        session.settle()
    );
    assert_eq!(from_first.expect("first").payload, "\"first\"");
    assert_eq!(
        payload_code(&from_second.expect("second").payload),
        Some(ErrorCode::FunctionNotFound)
    );
}

#[tokio::test]
async fn stale_document_falls_back_to_main() {
    let session = session();
    let main = session.open_document(true).expect("main");
    let popup = session.open_document(false).expect("popup");
    register(&session, main, "frontier.bridge.register('who', () => 'main');");
    register(&session, popup, "frontier.bridge.register('who', () => 'popup');");
    session.close_document(popup).expect("close");

    let (outcome, _) = tokio::join!(
        session.host().call_script_async("who", "", popup),
        session.settle()
    );
    assert_eq!(outcome.expect("call").payload, "\"main\"");
}

#[tokio::test]
async fn calls_fail_without_any_live_document() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    session.close_document(doc).expect("close");

    let err = session
        .host()
        .call_script("who", "", doc, |_| panic!("completion must not run"))
        .expect_err("no document");
    assert!(matches!(err, BridgeError::NoLiveDocument));
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let config = BridgeConfig {
        call_timeout_ms: 50,
        ..BridgeConfig::default()
    };
    let session = BridgeSession::new(&config).expect("session");
    let doc = session.open_document(true).expect("document");
    register(&session, doc, "frontier.bridge.register('slow', () => 1);");

    // The renderer is never pumped, so the request stays unanswered.
    let outcome = session
        .host()
        .call_script_async("slow", "", doc)
        .await
        .expect("call");
    assert_eq!(payload_code(&outcome.payload), Some(ErrorCode::Timeout));
    assert_eq!(session.host().pending_calls(), 0);

    // The late answer finds nothing to complete.
    session.settle().await.expect("settle");
    assert_eq!(session.host().pending_calls(), 0);
}

#[tokio::test]
async fn explicit_timeout_overrides_default() {
    let session = session();
    let doc = session.open_document(true).expect("document");
    let (tx, rx) = tokio::sync::oneshot::channel();
    session
        .host()
        .call_script_with_timeout("never", "", doc, Duration::from_millis(20), move |outcome| {
            let _ = tx.send(outcome);
        })
        .expect("call");

    let outcome = rx.await.expect("completion");
    assert_eq!(payload_code(&outcome.payload), Some(ErrorCode::Timeout));
}
