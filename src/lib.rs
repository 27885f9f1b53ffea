// Library exports for the demo binary and tests

pub mod bridge;
pub mod config;
pub mod js;
pub mod session;

// Re-export commonly used types for tests
pub use bridge::{BridgeError, CallOutcome, ErrorCode, HostAgent, NativeCall, ScopeId, Value};
pub use config::BridgeConfig;
pub use js::ScriptRenderer;
pub use session::BridgeSession;
