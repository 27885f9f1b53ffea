use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::agent::{demux, sealed, CorrelationAgent, Demux, Direction, Inbound};
use super::channel::{Inbox, MessageChannel};
use super::correlation::CorrelationId;
use super::error::{error_payload, panic_message, BridgeError, ErrorCode};
use super::message::{BridgeMessage, CallOutcome};
use super::scope::ScopeId;
use super::value::Value;

/// A script-originated call as seen by a host function.
#[derive(Debug, Clone)]
pub struct NativeCall {
    pub name: String,
    pub scope: ScopeId,
    pub params: JsonValue,
}

pub type HostFunction = Arc<dyn Fn(&NativeCall) -> anyhow::Result<JsonValue> + Send + Sync>;
pub type ScriptCompletion = Box<dyn FnOnce(CallOutcome) + Send>;
pub type RawMessageHandler = Arc<dyn Fn(ScopeId, &str, &[Value]) + Send + Sync>;

/// The host side of the bridge: originates `call_script`, services `call_native`.
pub enum HostSide {}

impl sealed::Sealed for HostSide {}

impl Direction for HostSide {
    /// The document the call was delivered to.
    type Owner = ScopeId;
    type Completion = ScriptCompletion;
    type Function = HostFunction;

    const ACCEPTS_RAW: bool = true;

    fn call_message(
        name: String,
        params_json: String,
        id: CorrelationId,
        scope: ScopeId,
    ) -> BridgeMessage {
        BridgeMessage::CallScript {
            name,
            params_json,
            id,
            scope,
        }
    }

    fn result_message(id: CorrelationId, outcome: CallOutcome) -> BridgeMessage {
        BridgeMessage::NativeResult { id, outcome }
    }

    fn classify(message: BridgeMessage, source: ScopeId) -> Option<Inbound> {
        match message {
            BridgeMessage::CallNative {
                name,
                params_json,
                id,
            } => Some(Inbound::Call {
                name,
                params_json,
                id,
                scope: source,
            }),
            BridgeMessage::ScriptResult { id, outcome } => Some(Inbound::Result { id, outcome }),
            BridgeMessage::RawSend { name, args } => Some(Inbound::Raw { name, args }),
            BridgeMessage::NativeResult { .. } | BridgeMessage::CallScript { .. } => None,
        }
    }
}

struct HostState {
    agent: CorrelationAgent<HostSide>,
    documents: Vec<ScopeId>,
    main_document: Option<ScopeId>,
    raw_handler: Option<RawMessageHandler>,
    timers: HashMap<CorrelationId, JoinHandle<()>>,
}

/// Host-side agent. Cheap to clone; every clone shares one table and registry.
///
/// All state sits behind a single mutex. Completions and host functions always run after
/// the lock is released, so they may call back into the agent.
#[derive(Clone)]
pub struct HostAgent {
    state: Arc<Mutex<HostState>>,
    channel: Arc<dyn MessageChannel>,
    default_timeout: Option<Duration>,
}

impl HostAgent {
    pub fn new(channel: impl MessageChannel + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                agent: CorrelationAgent::new(),
                documents: Vec::new(),
                main_document: None,
                raw_handler: None,
                timers: HashMap::new(),
            })),
            channel: Arc::new(channel),
            default_timeout: None,
        }
    }

    /// Timeout applied by [`HostAgent::call_script_async`].
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a host function callable from script.
    ///
    /// `scope_hint` limits the function to one document; pass [`ScopeId::GLOBAL`] to make it
    /// callable from every document.
    pub fn register_native<F>(
        &self,
        name: &str,
        scope_hint: ScopeId,
        function: F,
        replace: bool,
    ) -> Result<(), BridgeError>
    where
        F: Fn(&NativeCall) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        self.state()
            .agent
            .register(name, scope_hint, Arc::new(function), replace)?;
        debug!(target: "bridge", name, scope = %scope_hint, "registered host function");
        Ok(())
    }

    pub fn unregister_native(&self, name: &str, scope_hint: ScopeId) -> bool {
        let removed = self.state().agent.unregister(name, scope_hint);
        removed.is_some()
    }

    pub fn set_raw_message_handler<F>(&self, handler: F)
    where
        F: Fn(ScopeId, &str, &[Value]) + Send + Sync + 'static,
    {
        self.state().raw_handler = Some(Arc::new(handler));
    }

    /// Record that a document is live and can receive calls.
    pub fn document_attached(&self, scope: ScopeId, is_main: bool) {
        let mut state = self.state();
        if !state.documents.contains(&scope) {
            state.documents.push(scope);
        }
        if is_main || state.main_document.is_none() {
            state.main_document = Some(scope);
        }
        debug!(target: "bridge", scope = %scope, is_main, "document attached");
    }

    /// Forget a document and the host functions registered only for it.
    pub fn document_detached(&self, scope: ScopeId) {
        let dropped = {
            let mut state = self.state();
            state.documents.retain(|live| *live != scope);
            if state.main_document == Some(scope) {
                state.main_document = state.documents.first().copied();
            }
            // Host calls have no context affinity; only registrations are scoped.
            state.agent.release_scope(scope, |_| false).functions
        };
        debug!(
            target: "bridge",
            scope = %scope,
            functions = dropped.len(),
            "document detached"
        );
    }

    pub fn live_documents(&self) -> Vec<ScopeId> {
        self.state().documents.clone()
    }

    pub fn main_document(&self) -> Option<ScopeId> {
        self.state().main_document
    }

    pub fn pending_calls(&self) -> usize {
        self.state().agent.pending_calls()
    }

    /// Pick the document a call will actually go to.
    ///
    /// A stale handle is redirected to the main document rather than failing the call.
    fn target_document(state: &HostState, requested: ScopeId) -> Result<ScopeId, BridgeError> {
        if state.documents.contains(&requested) {
            return Ok(requested);
        }
        let fallback = state
            .main_document
            .or_else(|| state.documents.first().copied())
            .ok_or(BridgeError::NoLiveDocument)?;
        warn!(
            target: "bridge",
            requested = %requested,
            fallback = %fallback,
            "target document is gone; delivering to main document"
        );
        Ok(fallback)
    }

    /// Invoke a script-registered function in `document`.
    ///
    /// Returns once the request is queued; `completion` runs later, at most once, when the
    /// script side answers.
    pub fn call_script<F>(
        &self,
        name: &str,
        params_json: &str,
        document: ScopeId,
        completion: F,
    ) -> Result<CorrelationId, BridgeError>
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        let (id, target) = {
            let mut state = self.state();
            let target = Self::target_document(&state, document)?;
            let id = state.agent.begin_call(target, Box::new(completion))?;
            (id, target)
        };

        let message =
            HostSide::call_message(name.to_string(), params_json.to_string(), id, target);
        if let Err(err) = self.channel.send(target, message.name(), message.encode()) {
            let _ = self.state().agent.finish_call(id);
            return Err(err.into());
        }
        debug!(target: "bridge", id = %id, name, scope = %target, "call_script sent");
        Ok(id)
    }

    /// Like [`HostAgent::call_script`], but the completion receives a `Timeout` error if
    /// no result arrives within `timeout`. A result arriving afterwards is discarded.
    ///
    /// Fails with [`BridgeError::NoRuntime`], before anything is sent, when called outside
    /// a tokio runtime.
    pub fn call_script_with_timeout<F>(
        &self,
        name: &str,
        params_json: &str,
        document: ScopeId,
        timeout: Duration,
        completion: F,
    ) -> Result<CorrelationId, BridgeError>
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let id = self.call_script(name, params_json, document, completion)?;
        let agent = self.clone();
        let name = name.to_string();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            agent.expire(id, &name, timeout);
        });

        let mut state = self.state();
        if state.agent.is_pending(id) {
            state.timers.insert(id, timer);
        } else {
            // Answered before the timer was recorded.
            timer.abort();
        }
        Ok(id)
    }

    fn expire(&self, id: CorrelationId, name: &str, timeout: Duration) {
        let call = {
            let mut state = self.state();
            state.timers.remove(&id);
            state.agent.finish_call(id)
        };
        let Some(call) = call else {
            return;
        };
        warn!(
            target: "bridge",
            id = %id,
            name,
            timeout_ms = timeout.as_millis() as u64,
            "script call timed out"
        );
        let message = format!("{name} did not answer within {}ms", timeout.as_millis());
        run_completion(
            id,
            call.completion,
            CallOutcome::failure(error_payload(ErrorCode::Timeout, &message)),
        );
    }

    /// Await the outcome of a script call, applying the configured default timeout.
    pub async fn call_script_async(
        &self,
        name: &str,
        params_json: &str,
        document: ScopeId,
    ) -> Result<CallOutcome, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let completion = move |outcome: CallOutcome| {
            let _ = tx.send(outcome);
        };
        match self.default_timeout {
            Some(timeout) => {
                self.call_script_with_timeout(name, params_json, document, timeout, completion)?
            }
            None => self.call_script(name, params_json, document, completion)?,
        };
        // The sender only disappears without a value when the host shuts down.
        Ok(rx.await.unwrap_or_else(|_| {
            CallOutcome::failure(error_payload(
                ErrorCode::Abandoned,
                "host agent shut down before the call completed",
            ))
        }))
    }

    /// Deliver a `SCRIPT_RESULT`. Unknown or already-finished ids are dropped.
    pub fn on_script_result(&self, id: CorrelationId, outcome: CallOutcome) {
        let call = {
            let mut state = self.state();
            if let Some(timer) = state.timers.remove(&id) {
                timer.abort();
            }
            state.agent.finish_call(id)
        };
        match call {
            Some(call) => run_completion(id, call.completion, outcome),
            None => debug!(target: "bridge", id = %id, "discarding result for unknown call"),
        }
    }

    /// Service a `CALL_NATIVE` from `scope`. Every request gets an answer, including
    /// misses and failures.
    pub fn on_call_native(
        &self,
        name: &str,
        params_json: &str,
        scope: ScopeId,
        script_callback_id: CorrelationId,
    ) {
        let function = self.state().agent.resolve(name, scope);
        let outcome = match function {
            Some(function) => invoke_host_function(&function, name, params_json, scope),
            None => {
                let err = BridgeError::FunctionNotFound {
                    name: name.to_string(),
                    scope,
                };
                info!(target: "bridge", name, scope = %scope, "host function not found");
                CallOutcome::failure(err.to_payload())
            }
        };

        let reply = HostSide::result_message(script_callback_id, outcome);
        if let Err(err) = self.channel.send(scope, reply.name(), reply.encode()) {
            warn!(
                target: "bridge",
                id = %script_callback_id,
                error = %err,
                "failed to send native result"
            );
        }
    }

    /// Handle one inbound channel message. Returns `false` if it was not a bridge message.
    pub fn handle_message(&self, scope: ScopeId, name: &str, args: &[Value]) -> bool {
        match demux::<HostSide>(scope, name, args) {
            Demux::Foreign => false,
            Demux::Malformed(err) => {
                error!(target: "bridge", scope = %scope, error = %err, "dropping malformed message");
                true
            }
            Demux::Misdirected(reserved) => {
                warn!(target: "bridge", kind = reserved, "host received a script-bound message");
                true
            }
            Demux::Inbound(Inbound::Result { id, outcome }) => {
                self.on_script_result(id, outcome);
                true
            }
            Demux::Inbound(Inbound::Call {
                name,
                params_json,
                id,
                scope,
            }) => {
                self.on_call_native(&name, &params_json, scope, id);
                true
            }
            Demux::Inbound(Inbound::Raw { name, args }) => {
                let handler = self.state().raw_handler.clone();
                match handler {
                    Some(handler) => {
                        if let Err(panic) =
                            catch_unwind(AssertUnwindSafe(|| handler(scope, &name, &args)))
                        {
                            let message = panic_message(panic.as_ref());
                            error!(
                                target: "bridge",
                                name = %name,
                                message = %message,
                                "raw message handler panicked"
                            );
                        }
                    }
                    None => {
                        debug!(target: "bridge", name = %name, "no raw message handler installed")
                    }
                }
                true
            }
        }
    }

    /// Deliver every message arriving on `inbox` until the link closes.
    pub async fn serve(self, mut inbox: Inbox) {
        while let Some(envelope) = inbox.recv().await {
            if !self.handle_message(envelope.scope, &envelope.name, &envelope.args) {
                warn!(
                    target: "bridge",
                    name = %envelope.name,
                    "host dropped unknown message"
                );
            }
        }
        debug!(target: "bridge", "host inbox closed");
    }

    /// Drop every pending call and registration. Completions are not invoked.
    pub fn shutdown(&self) {
        let abandoned = {
            let mut state = self.state();
            state.documents.clear();
            state.main_document = None;
            state.raw_handler = None;
            for (_, timer) in state.timers.drain() {
                timer.abort();
            }
            state.agent.shutdown()
        };
        if !abandoned.is_empty() {
            info!(
                target: "bridge",
                abandoned = abandoned.len(),
                "host shut down with calls in flight"
            );
        }
    }
}

/// Run a call completion. A panicking completion is logged and must not take the
/// caller (usually the serve loop) down with it.
fn run_completion(id: CorrelationId, completion: ScriptCompletion, outcome: CallOutcome) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| completion(outcome))) {
        let message = panic_message(panic.as_ref());
        error!(target: "bridge", id = %id, message = %message, "call completion panicked");
    }
}

fn invoke_host_function(
    function: &HostFunction,
    name: &str,
    params_json: &str,
    scope: ScopeId,
) -> CallOutcome {
    let params = if params_json.trim().is_empty() {
        JsonValue::Null
    } else {
        match serde_json::from_str(params_json) {
            Ok(params) => params,
            Err(err) => {
                let message = format!("invalid parameters for {name}: {err}");
                return CallOutcome::failure(error_payload(
                    ErrorCode::InvokedFunctionFailed,
                    &message,
                ));
            }
        }
    };

    let call = NativeCall {
        name: name.to_string(),
        scope,
        params,
    };
    match catch_unwind(AssertUnwindSafe(|| function(&call))) {
        Ok(Ok(result)) => CallOutcome::success(result.to_string()),
        Ok(Err(err)) => {
            debug!(target: "bridge", name, error = %err, "host function failed");
            CallOutcome::failure(error_payload(
                ErrorCode::InvokedFunctionFailed,
                &format!("{err:#}"),
            ))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(target: "bridge", name, message = %message, "host function panicked");
            CallOutcome::failure(error_payload(ErrorCode::InvokedFunctionFailed, &message))
        }
    }
}
