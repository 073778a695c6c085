//! Wire format: the line-header + JSON-payload message grammar of §6.
//!
//! ```text
//! message   = header LF payload
//! header    = action ":" topic ":" version [":" rid [":" prid [":" timeout]]]
//! rid       = uuid4 | ""      ; empty only when prid is present
//! prid      = uuid4 | ""
//! timeout   = 1*DIGIT         ; milliseconds, request-only
//! payload   = JSON object, UTF-8
//! ```

use std::str::FromStr;

use chrono::DateTime;
use uuid::Uuid;

use crate::topic::canonicalize_topic;
use crate::types::{Action, Header, Version};

/// Maximum header-line length: action + topic + version + 2 UUIDs +
/// timeout + 5 colons + margin.
pub const MAX_HEADER_LENGTH: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderParseError {
    #[error("header line exceeds {MAX_HEADER_LENGTH} bytes")]
    TooLong,
    #[error("header has too many ':'-separated fields")]
    TooManyFields,
    #[error("unknown action {0:?}")]
    InvalidAction(String),
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] crate::topic::TopicError),
    #[error("invalid version {0:?}")]
    InvalidVersion(String),
    #[error("{0:?} is not a UUID-4 request id")]
    InvalidRequestId(String),
    #[error("{0:?} is not a UUID-4 parent request id")]
    InvalidParentRequestId(String),
    #[error("timeout is only permitted on a request action")]
    TimeoutOnNonRequest,
    #[error("invalid timeout value {0:?}")]
    InvalidTimeout(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadParseError {
    #[error("payload exceeds maximum length of {limit} bytes (was {actual})")]
    TooLarge { limit: usize, actual: usize },
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid 'error' object: {0}")]
    InvalidErrorShape(String),
}

fn is_uuid4_or_empty(s: &str) -> Option<Option<Uuid>> {
    if s.is_empty() {
        return Some(None);
    }
    match Uuid::parse_str(s) {
        Ok(u) if u.get_version_num() == 4 => Some(Some(u)),
        _ => None,
    }
}

/// Parse a header line (without the trailing LF).
pub fn decode_header(line: &str) -> Result<Header, HeaderParseError> {
    if line.len() > MAX_HEADER_LENGTH {
        return Err(HeaderParseError::TooLong);
    }

    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 3 || fields.len() > 6 {
        return Err(HeaderParseError::TooManyFields);
    }

    let action = Action::from_str(fields[0])
        .map_err(|_| HeaderParseError::InvalidAction(fields[0].to_string()))?;
    let topic = canonicalize_topic(fields[1])?;
    let version = Version::from_str(fields[2])
        .map_err(|_| HeaderParseError::InvalidVersion(fields[2].to_string()))?;

    let request_id = match fields.get(3) {
        Some(s) => is_uuid4_or_empty(s)
            .ok_or_else(|| HeaderParseError::InvalidRequestId(s.to_string()))?,
        None => None,
    };
    let mut parent_request_id = match fields.get(4) {
        Some(s) => is_uuid4_or_empty(s)
            .ok_or_else(|| HeaderParseError::InvalidParentRequestId(s.to_string()))?,
        None => None,
    };

    // parentRequestId equal to requestid is treated as unset.
    if parent_request_id == request_id {
        parent_request_id = None;
    }

    let timeout = match fields.get(5) {
        Some(s) => {
            if action != Action::Request {
                return Err(HeaderParseError::TimeoutOnNonRequest);
            }
            let t: u32 = s
                .parse()
                .map_err(|_| HeaderParseError::InvalidTimeout(s.to_string()))?;
            if t == 0 {
                return Err(HeaderParseError::InvalidTimeout(s.to_string()));
            }
            Some(t)
        }
        None => None,
    };

    Ok(Header {
        action,
        topic,
        version,
        request_id,
        parent_request_id,
        timeout,
    })
}

/// Serialize a header back to its wire line (without the trailing LF).
/// Positional order is preserved; empty optional middle fields are emitted
/// as empty segments when a later field is present.
pub fn encode_header(header: &Header) -> String {
    let mut parts = vec![
        header.action.to_string(),
        header.topic.clone(),
        header.version.to_string(),
    ];

    let rid = header.request_id.map(|u| u.to_string()).unwrap_or_default();
    let prid = header
        .parent_request_id
        .map(|u| u.to_string())
        .unwrap_or_default();
    let timeout = header.timeout.map(|t| t.to_string());

    if header.request_id.is_some() || header.parent_request_id.is_some() || timeout.is_some() {
        parts.push(rid);
    }
    if header.parent_request_id.is_some() || timeout.is_some() {
        parts.push(prid);
    }
    if let Some(t) = timeout {
        parts.push(t);
    }

    parts.join(":")
}

/// Parse and validate a JSON payload against the configured maximum length.
///
/// When `action` is [`Action::Response`] and the payload carries an
/// `error` key, its shape is validated too (§4.3): it must be an object
/// with a string `code`, a string `message`, and an ISO-8601 `timestamp`.
pub fn decode_payload(bytes: &[u8], max_length: usize, action: Action) -> Result<serde_json::Value, PayloadParseError> {
    if bytes.len() > max_length {
        return Err(PayloadParseError::TooLarge {
            limit: max_length,
            actual: bytes.len(),
        });
    }
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| PayloadParseError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(PayloadParseError::NotAnObject);
    }
    if action == Action::Response {
        if let Some(error) = value.get("error") {
            validate_error_shape(error)?;
        }
    }
    Ok(value)
}

fn validate_error_shape(error: &serde_json::Value) -> Result<(), PayloadParseError> {
    let obj = error
        .as_object()
        .ok_or_else(|| PayloadParseError::InvalidErrorShape("'error' must be an object".to_string()))?;

    let has_code = obj.get("code").is_some_and(|v| v.is_string());
    let has_message = obj.get("message").is_some_and(|v| v.is_string());
    let timestamp_ok = obj
        .get("timestamp")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok());

    if !has_code || !has_message || !timestamp_ok {
        return Err(PayloadParseError::InvalidErrorShape(
            "'error' must have a string 'code', a string 'message', and an ISO-8601 'timestamp'".to_string(),
        ));
    }
    Ok(())
}

/// Serialize a complete `header LF payload` message to bytes, ready to be
/// wrapped in a transport frame.
pub fn encode_message(header: &Header, payload: &serde_json::Value) -> Vec<u8> {
    let mut buf = encode_header(header).into_bytes();
    buf.push(b'\n');
    buf.extend_from_slice(&serde_json::to_vec(payload).expect("payload always serializes"));
    buf
}

/// Split a raw message buffer into its header line and payload bytes.
pub fn split_message(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = raw.iter().position(|&b| b == b'\n')?;
    Some((&raw[..pos], &raw[pos + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn uuid() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn decodes_minimal_publish() {
        let h = decode_header("publish:orders.new:1.0.0").unwrap();
        assert_eq!(h.action, Action::Publish);
        assert_eq!(h.topic, "orders.new");
        assert_eq!(h.version, Version::new(1, 0, 0));
        assert_eq!(h.request_id, None);
    }

    #[test]
    fn decodes_full_request_header() {
        let rid = uuid();
        let prid = uuid();
        let line = format!("request:orders.new:1.0.0:{rid}:{prid}:500");
        let h = decode_header(&line).unwrap();
        assert_eq!(h.action, Action::Request);
        assert_eq!(h.request_id, Some(rid));
        assert_eq!(h.parent_request_id, Some(prid));
        assert_eq!(h.timeout, Some(500));
    }

    #[test]
    fn round_trips_header() {
        let rid = uuid();
        let header = Header {
            action: Action::Request,
            topic: "orders.new".to_string(),
            version: Version::new(1, 0, 0),
            request_id: Some(rid),
            parent_request_id: None,
            timeout: Some(500),
        };
        let line = encode_header(&header);
        let decoded = decode_header(&line).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_unknown_action() {
        assert!(matches!(
            decode_header("deleteAll:orders.new:1.0.0"),
            Err(HeaderParseError::InvalidAction(_))
        ));
    }

    #[test]
    fn rejects_timeout_on_non_request() {
        let rid = uuid();
        let line = format!("publish:orders.new:1.0.0:{rid}::500");
        assert_eq!(
            decode_header(&line),
            Err(HeaderParseError::TimeoutOnNonRequest)
        );
    }

    #[test]
    fn rejects_malformed_version() {
        assert!(matches!(
            decode_header("publish:orders.new:1.0"),
            Err(HeaderParseError::InvalidVersion(_))
        ));
    }

    #[test]
    fn rejects_non_uuid4_request_id() {
        assert!(matches!(
            decode_header("request:orders.new:1.0.0:not-a-uuid"),
            Err(HeaderParseError::InvalidRequestId(_))
        ));
    }

    #[test]
    fn parent_request_id_equal_to_request_id_is_normalized_away() {
        let rid = uuid();
        let line = format!("request:orders.new:1.0.0:{rid}:{rid}");
        let h = decode_header(&line).unwrap();
        assert_eq!(h.request_id, Some(rid));
        assert_eq!(h.parent_request_id, None);
    }

    #[test]
    fn rejects_header_over_max_length() {
        let huge_topic = "a".repeat(600);
        let line = format!("publish:{huge_topic}:1.0.0");
        assert_eq!(decode_header(&line), Err(HeaderParseError::TooLong));
    }

    #[test]
    fn payload_accepts_exact_max_length_rejects_one_more() {
        let body = json!({"x": 1}).to_string();
        let bytes = body.as_bytes();
        assert!(decode_payload(bytes, bytes.len(), Action::Publish).is_ok());
        assert!(matches!(
            decode_payload(bytes, bytes.len() - 1, Action::Publish),
            Err(PayloadParseError::TooLarge { .. })
        ));
    }

    #[test]
    fn payload_must_be_object() {
        assert!(matches!(
            decode_payload(b"[1,2,3]", 100, Action::Publish),
            Err(PayloadParseError::NotAnObject)
        ));
        assert!(matches!(
            decode_payload(b"42", 100, Action::Publish),
            Err(PayloadParseError::NotAnObject)
        ));
    }

    #[test]
    fn response_with_well_formed_error_is_accepted() {
        let body = json!({
            "error": {
                "code": "MALFORMED_MESSAGE",
                "message": "bad request",
                "timestamp": "2026-07-26T00:00:00Z",
            }
        })
        .to_string();
        assert!(decode_payload(body.as_bytes(), body.len(), Action::Response).is_ok());
    }

    #[test]
    fn response_with_incomplete_error_is_rejected() {
        let body = json!({"error": {"code": "MALFORMED_MESSAGE"}}).to_string();
        assert!(matches!(
            decode_payload(body.as_bytes(), body.len(), Action::Response),
            Err(PayloadParseError::InvalidErrorShape(_))
        ));
    }

    #[test]
    fn response_with_non_object_error_is_rejected() {
        let body = json!({"error": "oops"}).to_string();
        assert!(matches!(
            decode_payload(body.as_bytes(), body.len(), Action::Response),
            Err(PayloadParseError::InvalidErrorShape(_))
        ));
    }

    #[test]
    fn publish_with_malformed_error_key_is_not_validated() {
        // Shape validation is response-specific; other actions can carry
        // whatever they like under an "error" key.
        let body = json!({"error": "oops"}).to_string();
        assert!(decode_payload(body.as_bytes(), body.len(), Action::Publish).is_ok());
    }

    #[test]
    fn split_message_separates_header_and_payload() {
        let raw = b"publish:a.b:1.0.0\n{\"x\":1}";
        let (header, payload) = split_message(raw).unwrap();
        assert_eq!(header, b"publish:a.b:1.0.0");
        assert_eq!(payload, b"{\"x\":1}");
    }

    #[test]
    fn encode_message_round_trips_through_split_and_decode() {
        let header = Header {
            action: Action::Publish,
            topic: "a.b".to_string(),
            version: Version::new(1, 0, 0),
            request_id: None,
            parent_request_id: None,
            timeout: None,
        };
        let payload = json!({"x": 1});
        let raw = encode_message(&header, &payload);
        let (h_bytes, p_bytes) = split_message(&raw).unwrap();
        let decoded_header = decode_header(std::str::from_utf8(h_bytes).unwrap()).unwrap();
        let decoded_payload = decode_payload(p_bytes, 1024, decoded_header.action).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_payload, payload);
    }
}
