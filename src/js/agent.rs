use std::cell::RefCell;

use rquickjs::{Context, Error as JsError, Function, Persistent, Value as JsValue};
use tracing::{debug, error, warn};

use super::runtime::capture_exception_message;
use crate::bridge::agent::{demux, sealed, CorrelationAgent, Demux, Direction, Inbound};
use crate::bridge::channel::MessageChannel;
use crate::bridge::correlation::CorrelationId;
use crate::bridge::error::{error_payload, BridgeError, ErrorCode};
use crate::bridge::message::{BridgeMessage, CallOutcome};
use crate::bridge::scope::{ContextRef, ScopeId};
use crate::bridge::value::Value;

/// A script function kept alive across turns of its context.
pub type ScriptCallback = Persistent<Function<'static>>;

/// The script side of the bridge: originates `call_native`, services `call_script`.
pub enum ScriptSide {}

impl sealed::Sealed for ScriptSide {}

impl Direction for ScriptSide {
    type Owner = ContextRef;
    type Completion = ScriptCallback;
    type Function = ScriptCallback;

    const ACCEPTS_RAW: bool = false;

    fn call_message(
        name: String,
        params_json: String,
        id: CorrelationId,
        _scope: ScopeId,
    ) -> BridgeMessage {
        // The channel stamps the source scope; the host replies to it.
        BridgeMessage::CallNative {
            name,
            params_json,
            id,
        }
    }

    fn result_message(id: CorrelationId, outcome: CallOutcome) -> BridgeMessage {
        BridgeMessage::ScriptResult { id, outcome }
    }

    fn classify(message: BridgeMessage, _source: ScopeId) -> Option<Inbound> {
        match message {
            BridgeMessage::NativeResult { id, outcome } => Some(Inbound::Result { id, outcome }),
            BridgeMessage::CallScript {
                name,
                params_json,
                id,
                scope,
            } => Some(Inbound::Call {
                name,
                params_json,
                id,
                scope,
            }),
            BridgeMessage::CallNative { .. }
            | BridgeMessage::ScriptResult { .. }
            | BridgeMessage::RawSend { .. } => None,
        }
    }
}

/// Notified synchronously right before a script context is destroyed.
pub trait ContextLifecycleObserver {
    fn on_scope_will_release(&self, scope: ScopeId);
}

/// Maps a scope to its live QuickJS context.
pub trait ContextResolver {
    fn context_for(&self, scope: ScopeId) -> Option<Context>;
}

/// Script-side agent, shared by every document of one renderer.
///
/// Single threaded. Script callbacks are only ever run from the renderer's own pump, inside
/// the context that owns them, and never while the agent's tables are borrowed.
pub struct ScriptAgent {
    inner: RefCell<CorrelationAgent<ScriptSide>>,
    channel: Box<dyn MessageChannel>,
}

impl ScriptAgent {
    pub fn new(channel: impl MessageChannel + 'static) -> Self {
        Self {
            inner: RefCell::new(CorrelationAgent::new()),
            channel: Box::new(channel),
        }
    }

    /// Call a host function on behalf of `owner`.
    ///
    /// `callback` is invoked later with `(hasError, payload)`, unless `owner` is torn down
    /// first, in which case it is dropped without being called.
    pub fn call(
        &self,
        owner: ContextRef,
        name: &str,
        params_json: &str,
        callback: ScriptCallback,
    ) -> Result<CorrelationId, BridgeError> {
        let id = self.inner.borrow_mut().begin_call(owner, callback)?;
        let message =
            ScriptSide::call_message(name.to_string(), params_json.to_string(), id, owner.scope());
        if let Err(err) = self
            .channel
            .send(owner.scope(), message.name(), message.encode())
        {
            let unsent = self.inner.borrow_mut().finish_call(id);
            drop(unsent);
            return Err(err.into());
        }
        debug!(target: "bridge", id = %id, name, scope = %owner.scope(), "call_native sent");
        Ok(id)
    }

    pub fn register(
        &self,
        scope: ScopeId,
        name: &str,
        function: ScriptCallback,
        replace: bool,
    ) -> Result<(), BridgeError> {
        self.inner
            .borrow_mut()
            .register(name, scope, function, replace)
    }

    pub fn unregister(&self, scope: ScopeId, name: &str) -> bool {
        let removed = self.inner.borrow_mut().unregister(name, scope);
        removed.is_some()
    }

    /// Fire-and-forget notification to the host. No id, no result.
    pub fn send_message(
        &self,
        scope: ScopeId,
        name: &str,
        args: Vec<Value>,
    ) -> Result<(), BridgeError> {
        let message = BridgeMessage::RawSend {
            name: name.to_string(),
            args,
        };
        self.channel
            .send(scope, message.name(), message.encode())
            .map_err(BridgeError::from)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.borrow().pending_calls()
    }

    pub fn registered_names(&self, scope: ScopeId) -> Vec<String> {
        self.inner.borrow().registered_names(scope)
    }

    /// Deliver a `NATIVE_RESULT`. The only path that runs a call completion.
    pub fn on_native_result(
        &self,
        contexts: &dyn ContextResolver,
        id: CorrelationId,
        outcome: CallOutcome,
    ) {
        let call = self.inner.borrow_mut().finish_call(id);
        let Some(call) = call else {
            debug!(target: "bridge", id = %id, "discarding result for unknown or abandoned call");
            return;
        };

        let scope = call.owner.scope();
        let Some(context) = contexts.context_for(scope) else {
            warn!(target: "bridge", id = %id, scope = %scope, "owner context missing; dropping result");
            return;
        };

        let completion = call.completion;
        let result = context.with(|ctx| -> rquickjs::Result<()> {
            let callback = completion.restore(&ctx)?;
            match callback.call::<_, JsValue>((outcome.has_error, outcome.payload)) {
                Ok(_) => Ok(()),
                Err(JsError::Exception) => {
                    let message = capture_exception_message(&ctx);
                    warn!(target: "quickjs", id = %id, message = %message, "call callback threw");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        });
        if let Err(err) = result {
            error!(target: "bridge", id = %id, error = %err, "failed to run call completion");
        }
    }

    /// Service a `CALL_SCRIPT`. Always answers with a `SCRIPT_RESULT`.
    pub fn on_call_script(
        &self,
        contexts: &dyn ContextResolver,
        name: &str,
        params_json: &str,
        scope: ScopeId,
        host_callback_id: CorrelationId,
    ) {
        let function = self.inner.borrow().resolve(name, scope);
        let outcome = match (function, contexts.context_for(scope)) {
            (_, None) => CallOutcome::failure(BridgeError::UnknownScope(scope).to_payload()),
            (None, Some(_)) => CallOutcome::failure(
                BridgeError::FunctionNotFound {
                    name: name.to_string(),
                    scope,
                }
                .to_payload(),
            ),
            (Some(function), Some(context)) => {
                invoke_script_function(&context, function, name, params_json)
            }
        };

        let reply = ScriptSide::result_message(host_callback_id, outcome);
        if let Err(err) = self.channel.send(scope, reply.name(), reply.encode()) {
            warn!(
                target: "bridge",
                id = %host_callback_id,
                error = %err,
                "failed to send script result"
            );
        }
    }

    /// Handle one inbound channel message. Returns `false` if it was not a bridge message.
    pub fn handle_message(
        &self,
        contexts: &dyn ContextResolver,
        scope: ScopeId,
        name: &str,
        args: &[Value],
    ) -> bool {
        match demux::<ScriptSide>(scope, name, args) {
            Demux::Foreign => false,
            Demux::Malformed(err) => {
                error!(target: "bridge", scope = %scope, error = %err, "dropping malformed message");
                true
            }
            Demux::Misdirected(reserved) => {
                warn!(target: "bridge", kind = reserved, "script side received a host-bound message");
                true
            }
            Demux::Inbound(Inbound::Result { id, outcome }) => {
                self.on_native_result(contexts, id, outcome);
                true
            }
            Demux::Inbound(Inbound::Call {
                name,
                params_json,
                id,
                scope,
            }) => {
                self.on_call_script(contexts, &name, &params_json, scope, id);
                true
            }
            Demux::Inbound(Inbound::Raw { .. }) => true,
        }
    }

    /// Drop every registration and pending call. Callbacks are not invoked.
    pub fn shutdown(&self) {
        let abandoned = self.inner.borrow_mut().shutdown();
        if !abandoned.is_empty() {
            debug!(
                target: "bridge",
                abandoned = abandoned.len(),
                "script agent shut down with calls in flight"
            );
        }
    }
}

impl ContextLifecycleObserver for ScriptAgent {
    fn on_scope_will_release(&self, scope: ScopeId) {
        let released = self
            .inner
            .borrow_mut()
            .release_scope(scope, |owner| owner.belongs_to(scope));
        debug!(
            target: "bridge",
            scope = %scope,
            functions = released.functions.len(),
            abandoned = released.abandoned.len(),
            code = ErrorCode::Abandoned.as_str(),
            "script context released"
        );
    }
}

fn invoke_script_function(
    context: &Context,
    function: ScriptCallback,
    name: &str,
    params_json: &str,
) -> CallOutcome {
    context.with(|ctx| {
        let function = match function.restore(&ctx) {
            Ok(function) => function,
            Err(err) => {
                return CallOutcome::failure(error_payload(
                    ErrorCode::InvokedFunctionFailed,
                    &err.to_string(),
                ))
            }
        };
        match function.call::<_, Option<String>>((params_json.to_string(),)) {
            Ok(result) => CallOutcome::success(result.unwrap_or_else(|| "null".to_string())),
            Err(JsError::Exception) => {
                let message = capture_exception_message(&ctx);
                debug!(target: "quickjs", name, message = %message, "script function threw");
                CallOutcome::failure(error_payload(ErrorCode::InvokedFunctionFailed, &message))
            }
            Err(err) => CallOutcome::failure(error_payload(
                ErrorCode::InvokedFunctionFailed,
                &err.to_string(),
            )),
        }
    })
}
