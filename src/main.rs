use std::path::PathBuf;

use anyhow::{Context, Result};
use frontier_bridge::{BridgeConfig, BridgeSession, ScopeId};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const DEMO_SCRIPT: &str = r#"
frontier.bridge.register('greet', (params) => {
    const who = params && params.name ? params.name : 'host';
    return { greeting: `hello, ${who}` };
});

frontier.bridge.call('echo', { text: 'ping' }, (err, result) => {
    if (err) {
        console.error('echo failed', JSON.stringify(err));
        return;
    }
    console.log('echo returned', JSON.stringify(result));
});

frontier.bridge.call('add', [2, 40], (err, sum) => {
    console.log('add returned', err ? JSON.stringify(err) : sum);
});

frontier.bridge.call('missing', (err) => {
    console.log('missing function reported', err && err.code);
});

frontier.bridge.sendMessage('ready', ['demo', 1]);
"#;

fn main() -> Result<()> {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let script_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load(None).context("load bridge config")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(run(config, script_path))
}

async fn run(config: BridgeConfig, script_path: Option<PathBuf>) -> Result<()> {
    let session = BridgeSession::new(&config)?;
    let host = session.host();

    host.register_native("echo", ScopeId::GLOBAL, |call| Ok(call.params.clone()), false)?;
    host.register_native(
        "add",
        ScopeId::GLOBAL,
        |call| {
            let terms = call
                .params
                .as_array()
                .context("add expects an array of numbers")?;
            let sum: f64 = terms.iter().filter_map(|term| term.as_f64()).sum();
            Ok(json!(sum))
        },
        false,
    )?;
    host.set_raw_message_handler(|scope, name, args| {
        tracing::info!(target: "bridge", scope = %scope, name, args = ?args, "script message");
    });

    let document = session.open_document(true)?;
    let (source, filename) = match script_path {
        Some(path) => {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("read script {}", path.display()))?;
            (source, path.display().to_string())
        }
        None => (DEMO_SCRIPT.to_string(), "demo.js".to_string()),
    };
    session.renderer().eval(document, &source, &filename)?;
    let handled = session.settle().await?;
    tracing::info!(target: "bridge", handled, "script calls settled");

    let params = json!({ "name": "frontier" }).to_string();
    let (outcome, settled) = tokio::join!(
        host.call_script_async("greet", &params, document),
        session.settle()
    );
    settled?;
    match outcome?.into_result() {
        Ok(payload) => tracing::info!(target: "bridge", payload = %payload, "greet answered"),
        Err(payload) => tracing::warn!(target: "bridge", payload = %payload, "greet failed"),
    }

    Ok(())
}
