use thiserror::Error;

use super::correlation::CorrelationId;
use super::scope::ScopeId;
use super::value::Value;

pub const CALL_NATIVE: &str = "frontier.bridge.call_native";
pub const NATIVE_RESULT: &str = "frontier.bridge.native_result";
pub const CALL_SCRIPT: &str = "frontier.bridge.call_script";
pub const SCRIPT_RESULT: &str = "frontier.bridge.script_result";
pub const RAW_SEND: &str = "frontier.bridge.raw_send";

/// What a completion handler receives: an error flag plus a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub has_error: bool,
    pub payload: String,
}

impl CallOutcome {
    pub fn success(payload: impl Into<String>) -> Self {
        Self {
            has_error: false,
            payload: payload.into(),
        }
    }

    pub fn failure(payload: impl Into<String>) -> Self {
        Self {
            has_error: true,
            payload: payload.into(),
        }
    }

    pub fn into_result(self) -> Result<String, String> {
        if self.has_error {
            Err(self.payload)
        } else {
            Ok(self.payload)
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MessageError {
    #[error("{message} expects {expected} arguments, got {found}")]
    Arity {
        message: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{message} argument {index} should be {expected}, got {found}")]
    Type {
        message: &'static str,
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{message} carries invalid correlation id {raw}")]
    InvalidId { message: &'static str, raw: i64 },
    #[error("{message} carries a malformed scope")]
    InvalidScope { message: &'static str },
}

/// The five messages the bridge puts on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    CallNative {
        name: String,
        params_json: String,
        id: CorrelationId,
    },
    NativeResult {
        id: CorrelationId,
        outcome: CallOutcome,
    },
    CallScript {
        name: String,
        params_json: String,
        id: CorrelationId,
        scope: ScopeId,
    },
    ScriptResult {
        id: CorrelationId,
        outcome: CallOutcome,
    },
    RawSend {
        name: String,
        args: Vec<Value>,
    },
}

impl BridgeMessage {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeMessage::CallNative { .. } => CALL_NATIVE,
            BridgeMessage::NativeResult { .. } => NATIVE_RESULT,
            BridgeMessage::CallScript { .. } => CALL_SCRIPT,
            BridgeMessage::ScriptResult { .. } => SCRIPT_RESULT,
            BridgeMessage::RawSend { .. } => RAW_SEND,
        }
    }

    pub fn is_reserved(name: &str) -> bool {
        matches!(
            name,
            CALL_NATIVE | NATIVE_RESULT | CALL_SCRIPT | SCRIPT_RESULT | RAW_SEND
        )
    }

    pub fn encode(&self) -> Vec<Value> {
        match self {
            BridgeMessage::CallNative {
                name,
                params_json,
                id,
            } => vec![
                Value::from(name.as_str()),
                Value::from(params_json.as_str()),
                Value::Int(id.to_wire()),
            ],
            BridgeMessage::NativeResult { id, outcome }
            | BridgeMessage::ScriptResult { id, outcome } => vec![
                Value::Int(id.to_wire()),
                Value::Bool(outcome.has_error),
                Value::from(outcome.payload.as_str()),
            ],
            BridgeMessage::CallScript {
                name,
                params_json,
                id,
                scope,
            } => vec![
                Value::from(name.as_str()),
                Value::from(params_json.as_str()),
                Value::Int(id.to_wire()),
                scope.to_value(),
            ],
            BridgeMessage::RawSend { name, args } => {
                vec![Value::from(name.as_str()), Value::List(args.clone())]
            }
        }
    }

    /// Decode a received message.
    ///
    /// Returns `None` when `name` is not one of the bridge's reserved names, so the caller
    /// can pass it on to whoever else shares the channel.
    pub fn decode(name: &str, args: &[Value]) -> Option<Result<Self, MessageError>> {
        let decoded = match name {
            CALL_NATIVE => Args::new(CALL_NATIVE, args, 3).and_then(|args| {
                Ok(BridgeMessage::CallNative {
                    name: args.string(0)?,
                    params_json: args.string(1)?,
                    id: args.id(2)?,
                })
            }),
            NATIVE_RESULT => Args::new(NATIVE_RESULT, args, 3).and_then(|args| {
                Ok(BridgeMessage::NativeResult {
                    id: args.id(0)?,
                    outcome: args.outcome(1)?,
                })
            }),
            CALL_SCRIPT => Args::new(CALL_SCRIPT, args, 4).and_then(|args| {
                Ok(BridgeMessage::CallScript {
                    name: args.string(0)?,
                    params_json: args.string(1)?,
                    id: args.id(2)?,
                    scope: args.scope(3)?,
                })
            }),
            SCRIPT_RESULT => Args::new(SCRIPT_RESULT, args, 3).and_then(|args| {
                Ok(BridgeMessage::ScriptResult {
                    id: args.id(0)?,
                    outcome: args.outcome(1)?,
                })
            }),
            RAW_SEND => Args::new(RAW_SEND, args, 2).and_then(|args| {
                Ok(BridgeMessage::RawSend {
                    name: args.string(0)?,
                    args: args.list(1)?,
                })
            }),
            _ => return None,
        };
        Some(decoded)
    }
}

struct Args<'a> {
    message: &'static str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    fn new(message: &'static str, values: &'a [Value], expected: usize) -> Result<Self, MessageError> {
        if values.len() != expected {
            return Err(MessageError::Arity {
                message,
                expected,
                found: values.len(),
            });
        }
        Ok(Self { message, values })
    }

    fn mismatch(&self, index: usize, expected: &'static str) -> MessageError {
        MessageError::Type {
            message: self.message,
            index,
            expected,
            found: self.values[index].kind(),
        }
    }

    fn string(&self, index: usize) -> Result<String, MessageError> {
        self.values[index]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.mismatch(index, "string"))
    }

    fn id(&self, index: usize) -> Result<CorrelationId, MessageError> {
        let raw = self.values[index]
            .as_int()
            .ok_or_else(|| self.mismatch(index, "int"))?;
        CorrelationId::from_wire(raw).ok_or(MessageError::InvalidId {
            message: self.message,
            raw,
        })
    }

    fn outcome(&self, index: usize) -> Result<CallOutcome, MessageError> {
        let has_error = self.values[index]
            .as_bool()
            .ok_or_else(|| self.mismatch(index, "bool"))?;
        let payload = self.string(index + 1)?;
        Ok(CallOutcome { has_error, payload })
    }

    fn scope(&self, index: usize) -> Result<ScopeId, MessageError> {
        ScopeId::from_value(&self.values[index]).ok_or(MessageError::InvalidScope {
            message: self.message,
        })
    }

    fn list(&self, index: usize) -> Result<Vec<Value>, MessageError> {
        self.values[index]
            .as_list()
            .map(<[Value]>::to_vec)
            .ok_or_else(|| self.mismatch(index, "list"))
    }
}
