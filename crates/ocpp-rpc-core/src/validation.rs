//! Schema validation adapter.
//!
//! Payload validation is a pluggable capability: anything implementing
//! [`Validator`] can be registered in a [`SchemaSet`] under
//! `<action>.req` (request) or `<action>.conf` (response). A `SchemaSet` is
//! tied to one protocol version and chosen when an endpoint is built.

use crate::error::{ErrorCode, RpcError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Which side of a call a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn suffix(&self) -> &'static str {
        match self {
            Direction::Request => "req",
            Direction::Response => "conf",
        }
    }
}

/// Schema lookup key for an action and direction, e.g. `Heartbeat.conf`.
pub fn schema_key(action: &str, direction: Direction) -> String {
    format!("{action}.{}", direction.suffix())
}

/// Category of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// No schema registered for the key.
    SchemaNotFound,
    /// A value is outside its allowed length or range.
    Format,
    /// A property is not allowed, or does not match a pattern or enum.
    Property,
    /// A required property is missing, or there are too many or too few items.
    Occurrence,
    /// A value has the wrong JSON type.
    Type,
    /// The payload is structurally malformed.
    Formation,
}

/// A payload that failed validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{schema}: {message}")]
pub struct Violation {
    pub kind: ViolationKind,
    /// Schema key the payload was checked against.
    pub schema: String,
    /// JSON pointer to the offending value, empty for the root.
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            schema: String::new(),
            path: path.into(),
            message: message.into(),
        }
    }

    fn for_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    /// Wire code reported to a peer for this violation.
    pub fn code(&self) -> ErrorCode {
        match self.kind {
            ViolationKind::SchemaNotFound => ErrorCode::ProtocolError,
            ViolationKind::Format => ErrorCode::FormatViolation,
            ViolationKind::Property => ErrorCode::PropertyConstraintViolation,
            ViolationKind::Occurrence => ErrorCode::OccurrenceConstraintViolation,
            ViolationKind::Type => ErrorCode::TypeConstraintViolation,
            ViolationKind::Formation => ErrorCode::FormationViolation,
        }
    }
}

impl From<Violation> for RpcError {
    fn from(v: Violation) -> Self {
        RpcError::new(v.code(), v.message.clone()).with_details(json!({
            "schema": v.schema,
            "path": v.path,
        }))
    }
}

/// A payload check for one schema key.
pub trait Validator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), Violation>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> Result<(), Violation> + Send + Sync,
{
    fn validate(&self, payload: &Value) -> Result<(), Violation> {
        self(payload)
    }
}

/// Validators for one protocol version, keyed by `<action>.req|conf`.
#[derive(Clone)]
pub struct SchemaSet {
    protocol: String,
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl SchemaSet {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            validators: HashMap::new(),
        }
    }

    /// Protocol version these schemas describe (e.g. `ocpp2.0.1`).
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Register a validator, replacing any previous one for the same key.
    pub fn insert(
        &mut self,
        action: &str,
        direction: Direction,
        validator: impl Validator + 'static,
    ) -> &mut Self {
        self.validators
            .insert(schema_key(action, direction), Arc::new(validator));
        self
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(
        mut self,
        action: &str,
        direction: Direction,
        validator: impl Validator + 'static,
    ) -> Self {
        self.insert(action, direction, validator);
        self
    }

    pub fn contains(&self, action: &str, direction: Direction) -> bool {
        self.validators.contains_key(&schema_key(action, direction))
    }

    /// Validate a payload. A missing schema is a violation, never a pass.
    pub fn validate(
        &self,
        action: &str,
        direction: Direction,
        payload: &Value,
    ) -> Result<(), Violation> {
        let key = schema_key(action, direction);
        let Some(validator) = self.validators.get(&key) else {
            return Err(Violation::new(
                ViolationKind::SchemaNotFound,
                "",
                format!("schema '{key}' is missing from {}", self.protocol),
            )
            .for_schema(&key));
        };
        validator.validate(payload).map_err(|v| v.for_schema(&key))
    }

    pub fn validate_request(&self, action: &str, payload: &Value) -> Result<(), Violation> {
        self.validate(action, Direction::Request, payload)
    }

    pub fn validate_response(&self, action: &str, payload: &Value) -> Result<(), Violation> {
        self.validate(action, Direction::Response, payload)
    }
}

impl fmt::Debug for SchemaSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.validators.keys().collect();
        keys.sort();
        f.debug_struct("SchemaSet")
            .field("protocol", &self.protocol)
            .field("schemas", &keys)
            .finish()
    }
}

/// JSON value types, as named by JSON Schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl JsonType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Number => value.is_number(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
        }
    }
}

/// Minimal structural validator: an object with typed properties.
///
/// Covers the common required/optional/type checks. Anything richer should
/// come from a full JSON Schema engine behind [`Validator`].
#[derive(Debug, Clone, Default)]
pub struct Shape {
    properties: Vec<(String, JsonType, bool)>,
    closed: bool,
}

impl Shape {
    pub fn object() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, ty: JsonType) -> Self {
        self.properties.push((name.to_string(), ty, true));
        self
    }

    pub fn optional(mut self, name: &str, ty: JsonType) -> Self {
        self.properties.push((name.to_string(), ty, false));
        self
    }

    /// Reject properties that are not declared.
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }
}

impl Validator for Shape {
    fn validate(&self, payload: &Value) -> Result<(), Violation> {
        let Some(object) = payload.as_object() else {
            return Err(Violation::new(
                ViolationKind::Type,
                "",
                "payload must be an object",
            ));
        };

        for (name, ty, required) in &self.properties {
            match object.get(name) {
                None if *required => {
                    return Err(Violation::new(
                        ViolationKind::Occurrence,
                        format!("/{name}"),
                        format!("missing required property '{name}'"),
                    ));
                }
                Some(value) if !ty.matches(value) => {
                    return Err(Violation::new(
                        ViolationKind::Type,
                        format!("/{name}"),
                        format!("property '{name}' must be of type {ty:?}"),
                    ));
                }
                _ => {}
            }
        }

        if self.closed
            && let Some(extra) = object
                .keys()
                .find(|k| !self.properties.iter().any(|(name, _, _)| name == *k))
        {
            return Err(Violation::new(
                ViolationKind::Property,
                format!("/{extra}"),
                format!("property '{extra}' is not allowed"),
            ));
        }

        Ok(())
    }
}
