//! RPC error taxonomy.
//!
//! Every CALLERROR frame carries one of these codes. Unknown codes received
//! from a peer collapse to [`ErrorCode::GenericError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Wire `errorCode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ErrorCode {
    GenericError,
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    FormatViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    MessageTypeNotSupported,
    RpcFrameworkError,
}

impl ErrorCode {
    /// All codes, in wire declaration order.
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::GenericError,
        ErrorCode::NotImplemented,
        ErrorCode::NotSupported,
        ErrorCode::InternalError,
        ErrorCode::ProtocolError,
        ErrorCode::SecurityError,
        ErrorCode::FormationViolation,
        ErrorCode::FormatViolation,
        ErrorCode::PropertyConstraintViolation,
        ErrorCode::OccurrenceConstraintViolation,
        ErrorCode::TypeConstraintViolation,
        ErrorCode::MessageTypeNotSupported,
        ErrorCode::RpcFrameworkError,
    ];

    /// The string sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::GenericError => "GenericError",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
        }
    }

    /// Parse a wire code. Never fails: unrecognized codes become `GenericError`.
    ///
    /// OCPP 1.6 spells one code `OccurenceConstraintViolation`; both
    /// spellings are accepted.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "OccurenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            other => ErrorCode::ALL
                .into_iter()
                .find(|c| c.as_str() == other)
                .unwrap_or(ErrorCode::GenericError),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        ErrorCode::from_wire(&code)
    }
}

/// A structured RPC failure, as carried by a CALLERROR frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl RpcError {
    /// Create an error with empty details.
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Fallback for failures that fit no other code.
    pub fn generic(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericError, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("Unable to handle '{action}' calls"),
        )
    }

    pub fn not_supported(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, description)
    }
}
