//! Peer identity.
//!
//! A charge point identifies itself during the WebSocket upgrade, either
//! through the `Authorization` header or the last segment of the request
//! path:
//! - `Authorization: <base64(identity)>`
//! - `Authorization: Basic <base64(identity:password)>`
//! - `ws://host/ocpp/<identity>`

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::str::FromStr;

/// Identity of one peer, with the password it presented (if any).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    id: String,
    password: Option<String>,
}

impl PeerIdentity {
    /// Create an identity without a password.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            password: None,
        }
    }

    /// Attach a password (OCPP security profile 1).
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Parse an `Authorization` header value.
    pub fn from_authorization(header: &str) -> Result<Self, IdentityError> {
        let header = header.trim();
        // Auth schemes are case-insensitive.
        let encoded = match header.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("basic") => rest.trim(),
            _ => header,
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| IdentityError::InvalidBase64)?;
        let decoded = String::from_utf8(bytes).map_err(|_| IdentityError::InvalidUtf8)?;

        let identity = match decoded.split_once(':') {
            Some((id, password)) => Self::new(id).with_password(password),
            None => Self::new(decoded),
        };
        if identity.id.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(identity)
    }

    /// Take the last non-empty path segment, ignoring any query string.
    pub fn from_path(path: &str) -> Result<Self, IdentityError> {
        let path = path.split('?').next().unwrap_or_default();
        path.rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(Self::new)
            .ok_or(IdentityError::Missing)
    }

    /// Resolve from upgrade request parts, preferring the header.
    pub fn resolve(path: &str, authorization: Option<&str>) -> Result<Self, IdentityError> {
        match authorization {
            Some(header) => Self::from_authorization(header),
            None => Self::from_path(path),
        }
    }

    /// `Basic` header value for this identity, when it carries a password.
    pub fn authorization_header(&self) -> Option<String> {
        self.password.as_ref().map(|password| {
            format!("Basic {}", STANDARD.encode(format!("{}:{password}", self.id)))
        })
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self::new(s))
    }
}

/// Error resolving a peer identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("no identity in request path or headers")]
    Missing,
    #[error("identity cannot be empty")]
    Empty,
    #[error("authorization header is not valid base64")]
    InvalidBase64,
    #[error("authorization header is not valid UTF-8")]
    InvalidUtf8,
}
