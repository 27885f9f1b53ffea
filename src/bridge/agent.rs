//! The correlation protocol, written once and instantiated for each side of the bridge.
//!
//! A [`CorrelationAgent`] owns the outbound correlation table and the function registry of
//! one side. It never talks to the channel and never invokes user callbacks itself; the
//! side-specific wrappers take entries out of it and run them outside of any borrow or
//! lock, so a callback is free to re-enter the agent.

use std::marker::PhantomData;

use super::correlation::{CorrelationId, CorrelationTable, PendingCall};
use super::error::BridgeError;
use super::message::{BridgeMessage, CallOutcome};
use super::registry::FunctionRegistry;
use super::scope::ScopeId;
use super::value::Value;

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Which message pair a side originates and which it services.
///
/// Implemented by exactly two marker types: the host side and the script side.
pub trait Direction: sealed::Sealed {
    /// What a pending call remembers about its originator.
    type Owner;
    /// Invoked once with the outcome of an outbound call.
    type Completion;
    /// What the registry stores for inbound calls.
    type Function: Clone;

    /// Whether fire-and-forget messages are addressed to this side.
    const ACCEPTS_RAW: bool;

    fn call_message(
        name: String,
        params_json: String,
        id: CorrelationId,
        scope: ScopeId,
    ) -> BridgeMessage;

    fn result_message(id: CorrelationId, outcome: CallOutcome) -> BridgeMessage;

    /// Sort a decoded message into this side's view of it, or `None` if it was meant for
    /// the other side.
    fn classify(message: BridgeMessage, source: ScopeId) -> Option<Inbound>;
}

/// An inbound message after demultiplexing.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The peer finished one of our outbound calls.
    Result {
        id: CorrelationId,
        outcome: CallOutcome,
    },
    /// The peer wants one of our registered functions run.
    Call {
        name: String,
        params_json: String,
        id: CorrelationId,
        scope: ScopeId,
    },
    /// Fire-and-forget notification outside the correlation system.
    Raw { name: String, args: Vec<Value> },
}

/// Result of routing a raw channel message.
#[derive(Debug, PartialEq)]
pub enum Demux {
    /// Not a bridge message; someone else on the channel may want it.
    Foreign,
    /// A bridge message that failed to decode.
    Malformed(super::message::MessageError),
    /// A bridge message meant for the other side.
    Misdirected(&'static str),
    Inbound(Inbound),
}

/// Route one channel message for side `D`.
pub fn demux<D: Direction>(source: ScopeId, name: &str, args: &[Value]) -> Demux {
    match BridgeMessage::decode(name, args) {
        None => Demux::Foreign,
        Some(Err(err)) => Demux::Malformed(err),
        Some(Ok(message)) => {
            let reserved = message.name();
            match D::classify(message, source) {
                Some(Inbound::Raw { .. }) if !D::ACCEPTS_RAW => Demux::Misdirected(reserved),
                Some(inbound) => Demux::Inbound(inbound),
                None => Demux::Misdirected(reserved),
            }
        }
    }
}

/// Entries removed when a scope goes away.
pub struct ScopeRelease<D: Direction> {
    pub functions: Vec<D::Function>,
    pub abandoned: Vec<PendingCall<D::Owner, D::Completion>>,
}

pub struct CorrelationAgent<D: Direction> {
    outbound: CorrelationTable<D::Owner, D::Completion>,
    registry: FunctionRegistry<D::Function>,
    _direction: PhantomData<D>,
}

impl<D: Direction> Default for CorrelationAgent<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Direction> CorrelationAgent<D> {
    pub fn new() -> Self {
        Self {
            outbound: CorrelationTable::new(),
            registry: FunctionRegistry::new(),
            _direction: PhantomData,
        }
    }

    /// Record an outbound call and return the id the peer must echo back.
    pub fn begin_call(
        &mut self,
        owner: D::Owner,
        completion: D::Completion,
    ) -> Result<CorrelationId, BridgeError> {
        self.outbound
            .insert(owner, completion)
            .map_err(|(id, _completion)| BridgeError::DuplicateCorrelation(id))
    }

    /// Remove the pending call `id`, if it is still pending.
    pub fn finish_call(
        &mut self,
        id: CorrelationId,
    ) -> Option<PendingCall<D::Owner, D::Completion>> {
        self.outbound.take(id)
    }

    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.outbound.contains(id)
    }

    pub fn pending_calls(&self) -> usize {
        self.outbound.len()
    }

    pub fn register(
        &mut self,
        name: &str,
        scope: ScopeId,
        function: D::Function,
        replace: bool,
    ) -> Result<(), BridgeError> {
        match self.registry.insert(name, scope, function, replace) {
            Ok(_) => Ok(()),
            Err(_rejected) => Err(BridgeError::AlreadyRegistered {
                name: name.to_string(),
                scope,
            }),
        }
    }

    pub fn unregister(&mut self, name: &str, scope: ScopeId) -> Option<D::Function> {
        self.registry.remove(name, scope)
    }

    /// Find the function to run for a call arriving from `scope`: the scope's own entry
    /// first, then the global one.
    pub fn resolve(&self, name: &str, scope: ScopeId) -> Option<D::Function> {
        self.registry.resolve(name, scope).cloned()
    }

    pub fn registered_names(&self, scope: ScopeId) -> Vec<String> {
        self.registry.names_in(scope)
    }

    pub fn registered_functions(&self) -> usize {
        self.registry.len()
    }

    /// Drop the registrations of `scope` and every pending call whose owner satisfies
    /// `owned`. Completions are handed back unused; callers must not invoke them.
    pub fn release_scope(
        &mut self,
        scope: ScopeId,
        owned: impl FnMut(&D::Owner) -> bool,
    ) -> ScopeRelease<D> {
        ScopeRelease {
            functions: self.registry.release_scope(scope),
            abandoned: self.outbound.sweep(owned),
        }
    }

    /// Tear everything down. Pending completions are handed back unused.
    pub fn shutdown(&mut self) -> Vec<PendingCall<D::Owner, D::Completion>> {
        self.registry.drain();
        self.outbound.drain()
    }
}
