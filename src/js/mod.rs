pub mod agent;
pub mod bindings;
pub mod renderer;
pub mod runtime;

pub use agent::{ContextLifecycleObserver, ContextResolver, ScriptAgent};
pub use renderer::ScriptRenderer;
pub use runtime::QuickJsEngine;
