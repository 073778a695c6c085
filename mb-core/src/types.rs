//! Wire-level types: actions, semantic version, message header, and the
//! error taxonomy carried in RESPONSE payloads.
//!
//! These are distinct from the internal [`crate::error::Error`] used for
//! `Result` plumbing inside the broker — nothing here is a Rust error type,
//! it's data that gets serialized onto the wire.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three message actions recognized by the wire grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Publish,
    Request,
    Response,
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "publish" => Ok(Action::Publish),
            "request" => Ok(Action::Request),
            "response" => Ok(Action::Response),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Publish => "publish",
            Action::Request => "request",
            Action::Response => "response",
        };
        write!(f, "{s}")
    }
}

/// A `MAJOR.MINOR.PATCH` version as carried in a message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for Version {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let mut parts = s.split('.');
        let major = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let minor = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let patch = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        if parts.next().is_some() {
            return Err(());
        }
        Ok(Version { major, minor, patch })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A parsed message header: the first line of a framed message, before the
/// JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub action: Action,
    pub topic: String,
    pub version: Version,
    pub request_id: Option<Uuid>,
    pub parent_request_id: Option<Uuid>,
    pub timeout: Option<u32>,
}

impl Header {
    /// Build a RESPONSE header that echoes this header's topic and request
    /// id, as used for every reply the router or registry sends back.
    pub fn response_to(&self, topic: impl Into<String>) -> Header {
        Header {
            action: Action::Response,
            topic: topic.into(),
            version: self.version,
            request_id: self.request_id,
            parent_request_id: self.parent_request_id,
            timeout: None,
        }
    }
}

/// The wire-level error taxonomy (§7): what gets serialized into a
/// RESPONSE payload's `error.code` field. Distinct from [`crate::error::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedMessage,
    InvalidRequest,
    InvalidRequestId,
    VersionNotSupported,
    Unauthorized,
    Forbidden,
    TopicNotSupported,
    NoRouteFound,
    ServiceUnavailable,
    Timeout,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::MalformedMessage => "MALFORMED_MESSAGE",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidRequestId => "INVALID_REQUEST_ID",
            ErrorCode::VersionNotSupported => "VERSION_NOT_SUPPORTED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::TopicNotSupported => "TOPIC_NOT_SUPPORTED",
            ErrorCode::NoRouteFound => "NO_ROUTE_FOUND",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{s}")
    }
}

/// The `error` object embedded in a RESPONSE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageError {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl MessageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            timestamp: Utc::now(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            timestamp: Utc::now(),
            details: Some(details),
        }
    }
}

/// The top-level shape of a payload carrying only an error, as emitted by
/// the router/registry for synthesized failure responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: MessageError,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: MessageError::new(code, message),
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            error: MessageError::with_details(code, message, details),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("ErrorPayload always serializes")
    }
}

/// Whether a string is shaped like a UUID version 4 (the `xxxxxxxx-xxxx-4xxx-{8,9,a,b}xxx-xxxxxxxxxxxx` pattern).
pub fn is_uuid4(s: &str) -> bool {
    match Uuid::parse_str(s) {
        Ok(u) => u.get_version_num() == 4,
        Err(_) => false,
    }
}
