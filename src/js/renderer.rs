use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context as AnyhowContext, Result};
use rquickjs::Context;

use super::agent::{ContextLifecycleObserver, ContextResolver, ScriptAgent};
use super::bindings::install_bridge;
use super::runtime::QuickJsEngine;
use crate::bridge::channel::{Inbox, LinkEndpoint};
use crate::bridge::error::BridgeError;
use crate::bridge::scope::{ScopeAllocator, ScopeId};
use crate::config::BridgeConfig;

/// Owns the QuickJS runtime for a set of documents and drives the script side of the
/// bridge.
///
/// Every document gets its own context and scope. The renderer doubles as the lifecycle
/// monitor: observers hear about a context's teardown before the context is dropped.
pub struct ScriptRenderer {
    agent: Rc<ScriptAgent>,
    observers: RefCell<Vec<Rc<dyn ContextLifecycleObserver>>>,
    documents: RefCell<HashMap<ScopeId, Context>>,
    scopes: RefCell<ScopeAllocator>,
    inbox: RefCell<Inbox>,
    engine: QuickJsEngine,
}

impl ScriptRenderer {
    pub fn new(endpoint: LinkEndpoint, config: &BridgeConfig) -> Result<Self> {
        let LinkEndpoint { outbound, inbox } = endpoint;
        let engine = QuickJsEngine::new(config).context("create QuickJS engine for renderer")?;
        let agent = Rc::new(ScriptAgent::new(outbound));
        let agent_observer: Rc<dyn ContextLifecycleObserver> = agent.clone();
        Ok(Self {
            agent,
            observers: RefCell::new(vec![agent_observer]),
            documents: RefCell::new(HashMap::new()),
            scopes: RefCell::new(ScopeAllocator::new()),
            inbox: RefCell::new(inbox),
            engine,
        })
    }

    pub fn agent(&self) -> Rc<ScriptAgent> {
        Rc::clone(&self.agent)
    }

    pub fn add_lifecycle_observer(&self, observer: Rc<dyn ContextLifecycleObserver>) {
        self.observers.borrow_mut().push(observer);
    }

    /// Create a new document with a fresh context and `frontier.bridge` installed.
    pub fn create_document(&self) -> Result<ScopeId> {
        let scope = self.scopes.borrow_mut().allocate();
        if let Err(err) = self.attach_context(scope) {
            self.scopes.borrow_mut().release(scope);
            return Err(err);
        }
        tracing::debug!(target: "bridge", scope = %scope, "document created");
        Ok(scope)
    }

    /// Replace the document in `scope`'s frame, as a navigation or reload does.
    ///
    /// The old context is torn down (its pending calls abandoned) and the new document's
    /// scope is returned. If the new context cannot be created the frame slot is released,
    /// leaving no document behind.
    pub fn navigate(&self, scope: ScopeId) -> Result<ScopeId> {
        if !self.scopes.borrow().is_live(scope) {
            return Err(BridgeError::UnknownScope(scope).into());
        }
        self.teardown_context(scope);
        let renewed = self
            .scopes
            .borrow_mut()
            .renew(scope)
            .ok_or(BridgeError::UnknownScope(scope))?;
        if let Err(err) = self.attach_context(renewed) {
            self.scopes.borrow_mut().release(renewed);
            return Err(err);
        }
        tracing::debug!(target: "bridge", from = %scope, to = %renewed, "document navigated");
        Ok(renewed)
    }

    /// Destroy a document for good.
    pub fn release_document(&self, scope: ScopeId) -> Result<()> {
        if !self.scopes.borrow().is_live(scope) {
            return Err(BridgeError::UnknownScope(scope).into());
        }
        self.teardown_context(scope);
        self.scopes.borrow_mut().release(scope);
        Ok(())
    }

    pub fn documents(&self) -> Vec<ScopeId> {
        let mut scopes: Vec<ScopeId> = self.documents.borrow().keys().copied().collect();
        scopes.sort_by_key(|scope| (scope.index(), scope.generation()));
        scopes
    }

    /// Evaluate a script in the document `scope`.
    pub fn eval(&self, scope: ScopeId, source: &str, filename: &str) -> Result<()> {
        self.eval_with::<()>(scope, source, filename)
    }

    pub fn eval_with<V>(&self, scope: ScopeId, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let context = self
            .context_for(scope)
            .ok_or(BridgeError::UnknownScope(scope))?;
        self.engine.eval_in(&context, source, filename)
    }

    /// Deliver every message waiting in the inbox, then run pending promise jobs.
    ///
    /// This is the only place script callbacks run. Returns the number of messages handled.
    pub fn pump(&self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let next = self.inbox.borrow_mut().try_recv();
            let Some(envelope) = next else {
                break;
            };
            handled += 1;
            if !self
                .agent
                .handle_message(self, envelope.scope, &envelope.name, &envelope.args)
            {
                tracing::warn!(
                    target: "bridge",
                    name = %envelope.name,
                    "renderer dropped unknown message"
                );
            }
            self.engine.execute_pending_jobs()?;
        }
        Ok(handled)
    }

    /// Pump until two consecutive passes find nothing to do, yielding to other tasks in
    /// between so the host can answer.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut total = 0;
        let mut idle_passes = 0;
        while idle_passes < 2 {
            let handled = self.pump()?;
            total += handled;
            idle_passes = if handled == 0 { idle_passes + 1 } else { 0 };
            tokio::task::yield_now().await;
        }
        Ok(total)
    }

    fn attach_context(&self, scope: ScopeId) -> Result<()> {
        let context = self.engine.new_context()?;
        install_bridge(&context, Rc::clone(&self.agent), scope)
            .context("install frontier.bridge")?;
        self.documents.borrow_mut().insert(scope, context);
        Ok(())
    }

    fn teardown_context(&self, scope: ScopeId) {
        let observers: Vec<Rc<dyn ContextLifecycleObserver>> =
            self.observers.borrow().iter().cloned().collect();
        for observer in observers {
            observer.on_scope_will_release(scope);
        }
        let context = self.documents.borrow_mut().remove(&scope);
        drop(context);
    }
}

impl ContextResolver for ScriptRenderer {
    fn context_for(&self, scope: ScopeId) -> Option<Context> {
        self.documents.borrow().get(&scope).cloned()
    }
}

impl Drop for ScriptRenderer {
    fn drop(&mut self) {
        // Persistent callbacks must be released before the runtime goes away.
        for scope in self.documents() {
            self.teardown_context(scope);
        }
        self.agent.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{memory_link, MessageChannel};
    use crate::bridge::message::{CALL_NATIVE, NATIVE_RESULT};
    use crate::bridge::value::Value;

    fn renderer() -> (ScriptRenderer, LinkEndpoint) {
        let (host, script) = memory_link();
        let renderer = ScriptRenderer::new(script, &BridgeConfig::default()).expect("renderer");
        (renderer, host)
    }

    #[test]
    fn documents_get_their_own_contexts() {
        let (renderer, _host) = renderer();
        let first = renderer.create_document().expect("first");
        let second = renderer.create_document().expect("second");
        assert_ne!(first, second);

        renderer
            .eval(first, "globalThis.marker = 'first';", "first.js")
            .expect("eval");
        let seen: bool = renderer
            .eval_with(second, "typeof globalThis.marker === 'undefined'", "second.js")
            .expect("eval");
        assert!(seen);
        assert_eq!(renderer.documents(), vec![first, second]);
    }

    #[test]
    fn navigation_renews_the_scope() {
        let (renderer, _host) = renderer();
        let scope = renderer.create_document().expect("document");
        renderer
            .eval(scope, "frontier.bridge.register('f', () => 1);", "register.js")
            .expect("eval");

        let next = renderer.navigate(scope).expect("navigate");
        assert_eq!(next.index(), scope.index());
        assert_eq!(next.generation(), scope.generation() + 1);
        assert!(renderer.agent().registered_names(scope).is_empty());
        assert!(renderer.eval(scope, "1", "stale.js").is_err());

        let fresh: bool = renderer
            .eval_with(next, "typeof frontier.bridge.call === 'function'", "fresh.js")
            .expect("eval");
        assert!(fresh);
    }

    #[test]
    fn failed_navigation_frees_the_frame_slot() {
        let (renderer, _host) = renderer();
        let scope = renderer.create_document().expect("document");

        renderer.engine.set_memory_limit(1);
        assert!(renderer.navigate(scope).is_err());
        renderer.engine.set_memory_limit(usize::MAX);

        assert!(renderer.documents().is_empty());
        assert!(renderer.release_document(scope).is_err());
        let reused = renderer.create_document().expect("document");
        assert_eq!(reused.index(), scope.index());
        assert_eq!(renderer.documents(), vec![reused]);
    }

    #[test]
    fn released_documents_refuse_work() {
        let (renderer, _host) = renderer();
        let scope = renderer.create_document().expect("document");
        renderer.release_document(scope).expect("release");
        assert!(renderer.documents().is_empty());
        assert!(renderer.release_document(scope).is_err());
        assert!(renderer.navigate(scope).is_err());
    }

    #[tokio::test]
    async fn pump_delivers_host_messages() {
        let (renderer, mut host) = renderer();
        let scope = renderer.create_document().expect("document");
        renderer
            .eval(
                scope,
                "frontier.bridge.call('ping', null, (err, v) => { globalThis.got = v; });",
                "call.js",
            )
            .expect("eval");

        let request = host.inbox.try_recv().expect("call_native");
        assert_eq!(request.scope, scope);
        assert_eq!(request.name, CALL_NATIVE);
        let id = request.args[2].clone();
        host.outbound
            .send(
                scope,
                NATIVE_RESULT,
                vec![id, Value::Bool(false), Value::from("\"pong\"")],
            )
            .expect("send");

        assert_eq!(renderer.pump().expect("pump"), 1);
        let got: String = renderer.eval_with(scope, "globalThis.got", "read.js").expect("read");
        assert_eq!(got, "pong");
    }

    #[tokio::test]
    async fn repeated_native_result_runs_the_callback_once() {
        let (renderer, mut host) = renderer();
        let scope = renderer.create_document().expect("document");
        renderer
            .eval(
                scope,
                r#"
                globalThis.hits = 0;
                frontier.bridge.call('ping', null, () => { globalThis.hits += 1; });
                "#,
                "call.js",
            )
            .expect("eval");

        let request = host.inbox.try_recv().expect("call_native");
        let id = request.args[2].clone();
        for _ in 0..2 {
            host.outbound
                .send(
                    scope,
                    NATIVE_RESULT,
                    vec![id.clone(), Value::Bool(false), Value::from("1")],
                )
                .expect("send");
        }

        assert_eq!(renderer.pump().expect("pump"), 2);
        let hits: i32 = renderer.eval_with(scope, "globalThis.hits", "read.js").expect("read");
        assert_eq!(hits, 1);
        assert_eq!(renderer.agent().pending_calls(), 0);
    }
}
