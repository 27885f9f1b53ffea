use std::rc::Rc;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::bridge::channel::memory_link;
use crate::bridge::host::HostAgent;
use crate::bridge::scope::ScopeId;
use crate::config::BridgeConfig;
use crate::js::agent::ContextLifecycleObserver;
use crate::js::renderer::ScriptRenderer;

/// Keeps the host's view of live documents in step with the renderer.
struct HostDocumentSync {
    host: HostAgent,
}

impl ContextLifecycleObserver for HostDocumentSync {
    fn on_scope_will_release(&self, scope: ScopeId) {
        self.host.document_detached(scope);
    }
}

/// A host agent and a script renderer joined by an in-process link.
///
/// The host serves its inbox on a spawned task. The renderer is single threaded and only
/// makes progress when [`BridgeSession::settle`] (or [`ScriptRenderer::pump`]) is driven,
/// so a session must be created inside a tokio runtime and used from one task.
pub struct BridgeSession {
    host: HostAgent,
    renderer: ScriptRenderer,
    serve_task: JoinHandle<()>,
}

impl BridgeSession {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let (host_end, script_end) = memory_link();
        let host = HostAgent::new(host_end.outbound).with_default_timeout(config.call_timeout());
        let serve_task = tokio::spawn(host.clone().serve(host_end.inbox));

        let renderer = ScriptRenderer::new(script_end, config)?;
        renderer.add_lifecycle_observer(Rc::new(HostDocumentSync { host: host.clone() }));

        Ok(Self {
            host,
            renderer,
            serve_task,
        })
    }

    pub fn host(&self) -> &HostAgent {
        &self.host
    }

    pub fn renderer(&self) -> &ScriptRenderer {
        &self.renderer
    }

    /// Open a document and announce it to the host.
    pub fn open_document(&self, is_main: bool) -> Result<ScopeId> {
        let scope = self.renderer.create_document()?;
        self.host.document_attached(scope, is_main);
        Ok(scope)
    }

    /// Navigate the document in `scope`. The new document inherits the main-document role.
    pub fn navigate(&self, scope: ScopeId) -> Result<ScopeId> {
        let was_main = self.host.main_document() == Some(scope);
        let renewed = self.renderer.navigate(scope)?;
        self.host.document_attached(renewed, was_main);
        Ok(renewed)
    }

    pub fn close_document(&self, scope: ScopeId) -> Result<()> {
        self.renderer.release_document(scope)
    }

    /// Let both sides exchange messages until the renderer goes idle.
    pub async fn settle(&self) -> Result<usize> {
        self.renderer.run_until_idle().await
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.serve_task.abort();
        self.host.shutdown();
    }
}
