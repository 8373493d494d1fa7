//! Wire frames.
//!
//! OCPP-J frames are JSON arrays whose first element selects the kind:
//!
//! - CALL:       `[2, "<messageId>", "<action>", <payload>]`
//! - CALLRESULT: `[3, "<messageId>", <payload>]`
//! - CALLERROR:  `[4, "<messageId>", "<errorCode>", "<description>", <details>]`

use crate::error::{ErrorCode, RpcError};
use serde_json::Value;

/// Numeric frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    /// Number of array elements a frame of this type must have.
    pub fn arity(&self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

impl TryFrom<u64> for MessageType {
    type Error = FrameError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            other => Err(FrameError::UnsupportedMessageType(other)),
        }
    }
}

/// A request.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

/// A success reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

/// An error reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error: RpcError,
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    pub fn call(
        message_id: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Frame::Call(Call {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        })
    }

    pub fn result(message_id: impl Into<String>, payload: Value) -> Self {
        Frame::CallResult(CallResult {
            message_id: message_id.into(),
            payload,
        })
    }

    pub fn error(message_id: impl Into<String>, error: RpcError) -> Self {
        Frame::CallError(CallError {
            message_id: message_id.into(),
            error,
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Frame::Call(c) => &c.message_id,
            Frame::CallResult(r) => &r.message_id,
            Frame::CallError(e) => &e.message_id,
        }
    }

    /// Render the frame as its JSON array.
    pub fn to_value(&self) -> Value {
        let kind = Value::from(self.message_type() as u64);
        match self {
            Frame::Call(c) => Value::Array(vec![
                kind,
                Value::from(c.message_id.as_str()),
                Value::from(c.action.as_str()),
                c.payload.clone(),
            ]),
            Frame::CallResult(r) => Value::Array(vec![
                kind,
                Value::from(r.message_id.as_str()),
                r.payload.clone(),
            ]),
            Frame::CallError(e) => Value::Array(vec![
                kind,
                Value::from(e.message_id.as_str()),
                Value::from(e.error.code.as_str()),
                Value::from(e.error.description.as_str()),
                e.error.details.clone(),
            ]),
        }
    }

    /// Encode to the text sent over the transport.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    /// Decode a text message.
    ///
    /// Checks run in order: JSON array, numeric known type, non-empty string
    /// message id, then the arity and field types of the specific kind.
    pub fn decode(text: &str) -> Result<Frame, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        let Value::Array(mut fields) = value else {
            return Err(FrameError::NotAnArray);
        };

        let kind = fields
            .first()
            .and_then(Value::as_u64)
            .ok_or(FrameError::InvalidMessageType)?;
        let kind = MessageType::try_from(kind)?;

        let message_id = match fields.get(1) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => return Err(FrameError::InvalidMessageId),
        };

        if fields.len() != kind.arity() {
            return Err(FrameError::Arity {
                kind,
                expected: kind.arity(),
                found: fields.len(),
            });
        }

        // Arity is checked, so the pops below cannot come up empty.
        let mut take_last = || fields.pop().unwrap_or(Value::Null);
        match kind {
            MessageType::Call => {
                let payload = take_last();
                let action = expect_string(take_last(), "action")?;
                Ok(Frame::Call(Call {
                    message_id,
                    action,
                    payload,
                }))
            }
            MessageType::CallResult => Ok(Frame::CallResult(CallResult {
                message_id,
                payload: take_last(),
            })),
            MessageType::CallError => {
                let details = take_last();
                let description = expect_string(take_last(), "errorDescription")?;
                let code = expect_string(take_last(), "errorCode")?;
                Ok(Frame::CallError(CallError {
                    message_id,
                    error: RpcError {
                        code: ErrorCode::from_wire(&code),
                        description,
                        details,
                    },
                }))
            }
        }
    }
}

fn expect_string(value: Value, field: &'static str) -> Result<String, FrameError> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(FrameError::InvalidField {
            field,
            expected: "string",
        }),
    }
}

/// Why an incoming text message is not a valid frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("message must be a JSON structure: {0}")]
    InvalidJson(String),
    #[error("message must be an array")]
    NotAnArray,
    #[error("message type must be a number")]
    InvalidMessageType,
    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(u64),
    #[error("message id must be a non-empty string")]
    InvalidMessageId,
    #[error("{kind:?} frame must have {expected} elements, got {found}")]
    Arity {
        kind: MessageType,
        expected: usize,
        found: usize,
    },
    #[error("{field} must be a {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

impl FrameError {
    /// Nearest taxonomy entry for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            FrameError::UnsupportedMessageType(_) => ErrorCode::MessageTypeNotSupported,
            FrameError::Arity { .. } | FrameError::InvalidField { .. } => {
                ErrorCode::FormationViolation
            }
            _ => ErrorCode::RpcFrameworkError,
        }
    }
}
