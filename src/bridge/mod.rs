//! Request/response layer between the host and the scripts running in its documents.

pub mod agent;
pub mod channel;
pub mod correlation;
pub mod error;
pub mod host;
pub mod message;
pub mod registry;
pub mod scope;
pub mod value;

pub use channel::{
    memory_link, ChannelError, Envelope, Inbox, LinkEndpoint, MemoryChannel, MessageChannel,
};
pub use correlation::CorrelationId;
pub use error::{BridgeError, ErrorCode};
pub use host::{HostAgent, HostFunction, NativeCall};
pub use message::{BridgeMessage, CallOutcome};
pub use scope::{ContextRef, ScopeId};
pub use value::Value;
