use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use super::correlation::CorrelationId;
use super::scope::ScopeId;

/// Machine readable code carried in error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    DuplicateCorrelation,
    AlreadyRegistered,
    FunctionNotFound,
    Abandoned,
    InvokedFunctionFailed,
    Timeout,
    NoLiveDocument,
    ChannelClosed,
    NoRuntime,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DuplicateCorrelation => "DuplicateCorrelation",
            ErrorCode::AlreadyRegistered => "AlreadyRegistered",
            ErrorCode::FunctionNotFound => "FunctionNotFound",
            ErrorCode::Abandoned => "Abandoned",
            ErrorCode::InvokedFunctionFailed => "InvokedFunctionFailed",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::NoLiveDocument => "NoLiveDocument",
            ErrorCode::ChannelClosed => "ChannelClosed",
            ErrorCode::NoRuntime => "NoRuntime",
        }
    }
}

/// Errors raised synchronously by bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelation(CorrelationId),
    #[error("function {name:?} is already registered in scope {scope}")]
    AlreadyRegistered { name: String, scope: ScopeId },
    #[error("function {name:?} is not registered for scope {scope}")]
    FunctionNotFound { name: String, scope: ScopeId },
    #[error("no live document to deliver the call to")]
    NoLiveDocument,
    #[error("scope {0} has no live script context")]
    UnknownScope(ScopeId),
    #[error("timed calls must be started from within a tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Channel(#[from] super::channel::ChannelError),
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::DuplicateCorrelation(_) => ErrorCode::DuplicateCorrelation,
            BridgeError::AlreadyRegistered { .. } => ErrorCode::AlreadyRegistered,
            BridgeError::FunctionNotFound { .. } => ErrorCode::FunctionNotFound,
            BridgeError::NoLiveDocument | BridgeError::UnknownScope(_) => {
                ErrorCode::NoLiveDocument
            }
            BridgeError::NoRuntime => ErrorCode::NoRuntime,
            BridgeError::Channel(_) => ErrorCode::ChannelClosed,
        }
    }

    pub fn to_payload(&self) -> String {
        error_payload(self.code(), &self.to_string())
    }
}

/// Render the JSON body that travels through a result path with `hasError = true`.
pub fn error_payload(code: ErrorCode, message: &str) -> String {
    json!({ "code": code.as_str(), "message": message }).to_string()
}

/// Extract the code from an error payload, if it is one of ours.
pub fn payload_code(payload: &str) -> Option<ErrorCode> {
    let parsed: serde_json::Value = serde_json::from_str(payload).ok()?;
    serde_json::from_value(parsed.get("code")?.clone()).ok()
}

/// Best-effort text for a panic payload caught at a dispatch boundary.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "function panicked".to_string()
    }
}
