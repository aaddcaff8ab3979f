//! Wire protocol types for host-worker communication.
//!
//! One self-contained JSON message per line, UTF-8, newline-terminated.
//! Requests flow host to worker, responses worker to host; the first
//! line(s) out of a fresh worker may instead be a handshake.
//!
//! Everything in this module is pure: validators are total functions over
//! raw [`serde_json::Value`]s and return typed errors, never panic. The
//! only mutable state is the process-wide correlation counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope marker carried by every request and response.
pub const WIRE_VERSION: &str = "2.0";

/// Worker protocol version this codec speaks, `major.minor.patch`.
pub const PROTOCOL_VERSION: &str = "1.2.0";

/// Bare token emitted by legacy workers in place of a JSON handshake.
pub const LEGACY_READY_SENTINEL: &str = "READY";

/// Longest prefix of an offending line echoed back in errors.
const ERROR_LINE_PREVIEW: usize = 120;

/// Protocol-level failures: malformed frames, envelope validation,
/// version incompatibility. Always line-scoped and typed; these are
/// returned to the caller and never terminate the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty wire frame")]
    EmptyFrame,

    #[error("malformed wire frame {line:?}: {source}")]
    MalformedFrame {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid response line {line:?}: {source}")]
    InvalidResponse {
        line: String,
        #[source]
        source: Box<ProtocolError>,
    },

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("unsupported protocol marker {found:?}, expected \"2.0\"")]
    UnsupportedProtocol { found: String },

    #[error("invalid message id: {reason}")]
    InvalidId { reason: String },

    #[error("method must be a non-empty string")]
    InvalidMethod,

    #[error("invalid error object: {reason}")]
    InvalidErrorObject { reason: String },

    #[error("response carries {found} of result and error, exactly one required")]
    PayloadCardinality { found: &'static str },

    #[error("unparseable protocol version {version:?}")]
    MalformedVersion { version: String },

    #[error("incompatible protocol version: worker speaks {remote}, host speaks {local}")]
    IncompatibleVersion { remote: String, local: String },

    #[error("failed to encode request: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

/// A request envelope, immutable once constructed.
///
/// `sent_at` is stamped at construction and stays off the wire; callers
/// use it for latency accounting when the matching response arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub protocol: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip, default = "Instant::now")]
    pub sent_at: Instant,
}

impl RequestEnvelope {
    /// Build a validated request. Fails on a zero id or empty method.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Result<Self, ProtocolError> {
        if id < 1 {
            return Err(ProtocolError::InvalidId {
                reason: "must be >= 1".to_string(),
            });
        }
        let method = method.into();
        if method.is_empty() {
            return Err(ProtocolError::InvalidMethod);
        }
        Ok(Self {
            protocol: WIRE_VERSION.to_string(),
            id,
            method,
            params,
            sent_at: Instant::now(),
        })
    }

    /// Time since this request was constructed.
    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }
}

/// Error payload embedded in a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker error {}: {}", self.code, self.message)
    }
}

/// Exactly one of result or error, by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(ErrorObject),
}

/// A validated response envelope.
///
/// Only produced by [`validate_response`]; the payload enum makes a
/// both-or-neither envelope unrepresentable past the wire boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub payload: ResponsePayload,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        matches!(self.payload, ResponsePayload::Result(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(v) => Some(v),
            ResponsePayload::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match &self.payload {
            ResponsePayload::Result(_) => None,
            ResponsePayload::Error(e) => Some(e),
        }
    }
}

/// Worker handshake, first protocol exchange after spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Handshake {
    /// Check the announced version against this codec's compiled version.
    pub fn is_compatible(&self) -> bool {
        validate_protocol_version(&self.protocol_version, PROTOCOL_VERSION).is_ok()
    }
}

#[derive(Deserialize)]
struct WireHandshake {
    #[serde(rename = "type")]
    kind: String,
    protocol_version: String,
    #[serde(default)]
    worker_id: Option<String>,
}

/// Detect a handshake on a raw output line.
///
/// Accepts the legacy bare `READY` sentinel (mapped to a handshake
/// announcing [`PROTOCOL_VERSION`]) or the JSON form with `type: "READY"`.
/// Anything else, including a well-formed response envelope, returns
/// `None`. Detection runs speculatively on a worker's first lines, so
/// "not a handshake" is an ordinary outcome, never an error.
pub fn parse_handshake(line: &str) -> Option<Handshake> {
    let trimmed = line.trim();
    if trimmed == LEGACY_READY_SENTINEL {
        return Some(Handshake {
            protocol_version: PROTOCOL_VERSION.to_string(),
            worker_id: None,
        });
    }
    let wire: WireHandshake = serde_json::from_str(trimmed).ok()?;
    (wire.kind == LEGACY_READY_SENTINEL).then_some(Handshake {
        protocol_version: wire.protocol_version,
        worker_id: wire.worker_id,
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate a message id: an integer `>= 1`.
pub fn validate_id(value: &Value) -> Result<u64, ProtocolError> {
    match value {
        Value::Number(n) => match n.as_u64() {
            Some(id) if id >= 1 => Ok(id),
            Some(_) => Err(ProtocolError::InvalidId {
                reason: "must be >= 1".to_string(),
            }),
            None => Err(ProtocolError::InvalidId {
                reason: format!("{n} is not a positive integer"),
            }),
        },
        other => Err(ProtocolError::InvalidId {
            reason: format!("expected integer, got {}", json_type_name(other)),
        }),
    }
}

fn validate_marker(obj: &serde_json::Map<String, Value>) -> Result<(), ProtocolError> {
    match obj.get("protocol").and_then(Value::as_str) {
        Some(v) if v == WIRE_VERSION => Ok(()),
        Some(v) => Err(ProtocolError::UnsupportedProtocol {
            found: v.to_string(),
        }),
        None => Err(ProtocolError::UnsupportedProtocol {
            found: "<absent>".to_string(),
        }),
    }
}

/// Validate a raw value as a request envelope.
pub fn validate_request(value: &Value) -> Result<(), ProtocolError> {
    let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    validate_marker(obj)?;
    validate_id(obj.get("id").unwrap_or(&Value::Null))?;
    match obj.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => Ok(()),
        _ => Err(ProtocolError::InvalidMethod),
    }
}

/// Validate a raw value as an error object.
pub fn validate_error_obj(value: &Value) -> Result<ErrorObject, ProtocolError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::InvalidErrorObject {
            reason: format!("expected object, got {}", json_type_name(value)),
        })?;
    let code = obj
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| ProtocolError::InvalidErrorObject {
            reason: "code must be an integer".to_string(),
        })?;
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidErrorObject {
            reason: "message must be a string".to_string(),
        })?;
    Ok(ErrorObject {
        code,
        message: message.to_string(),
    })
}

/// Validate a raw value as a response envelope.
///
/// Requires the `2.0` marker, a valid id, and exactly one of
/// `result`/`error`. Validity is judged per line, independent of any
/// request the caller may have in flight.
pub fn validate_response(value: &Value) -> Result<ResponseEnvelope, ProtocolError> {
    let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    validate_marker(obj)?;
    let id = validate_id(obj.get("id").unwrap_or(&Value::Null))?;
    let payload = match (obj.get("result"), obj.get("error")) {
        (Some(_), Some(_)) => return Err(ProtocolError::PayloadCardinality { found: "both" }),
        (None, None) => return Err(ProtocolError::PayloadCardinality { found: "neither" }),
        (Some(result), None) => ResponsePayload::Result(result.clone()),
        (None, Some(error)) => ResponsePayload::Error(validate_error_obj(error)?),
    };
    Ok(ResponseEnvelope { id, payload })
}

pub(crate) fn preview_line(line: &str) -> String {
    line.chars().take(ERROR_LINE_PREVIEW).collect()
}

fn parse_semver(version: &str) -> Option<(u32, u32, u32)> {
    let version = version.trim().strip_prefix('v').unwrap_or(version.trim());
    let mut parts = version.split('.');
    let mut component = || {
        let digits: String = parts
            .next()?
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse::<u32>().ok()
    };
    Some((component()?, component()?, component()?))
}

/// Compare a worker's announced protocol version against the host's.
///
/// Same major is compatible regardless of minor and patch; a minor skew
/// is logged. A major mismatch is a hard refusal.
pub fn validate_protocol_version(remote: &str, local: &str) -> Result<(), ProtocolError> {
    let r = parse_semver(remote).ok_or_else(|| ProtocolError::MalformedVersion {
        version: remote.to_string(),
    })?;
    let l = parse_semver(local).ok_or_else(|| ProtocolError::MalformedVersion {
        version: local.to_string(),
    })?;
    if r.0 != l.0 {
        return Err(ProtocolError::IncompatibleVersion {
            remote: remote.to_string(),
            local: local.to_string(),
        });
    }
    if r.1 != l.1 {
        tracing::debug!(%remote, %local, "protocol minor version skew");
    }
    Ok(())
}

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh correlation id, unique for the process lifetime.
///
/// Combines a wall-clock millisecond component with an atomic counter, so
/// ids stay distinct even within a single millisecond.
pub fn generate_correlation_id() -> String {
    let seq = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("req-{millis:011x}-{seq:04x}")
}

/// Test isolation only. Never called on a production path.
#[doc(hidden)]
pub fn reset_correlation_counter() {
    CORRELATION_COUNTER.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_accepts_positive_integers() {
        assert_eq!(validate_id(&json!(1)).unwrap(), 1);
        assert_eq!(validate_id(&json!(42)).unwrap(), 42);
        assert_eq!(validate_id(&json!(u64::MAX)).unwrap(), u64::MAX);
    }

    #[test]
    fn id_rejects_zero_and_negatives() {
        assert!(validate_id(&json!(0)).is_err());
        assert!(validate_id(&json!(-1)).is_err());
        assert!(validate_id(&json!(-42)).is_err());
    }

    #[test]
    fn id_rejects_non_integers() {
        assert!(validate_id(&json!(1.5)).is_err());
        assert!(validate_id(&json!("1")).is_err());
        assert!(validate_id(&json!(null)).is_err());
        assert!(validate_id(&json!(true)).is_err());
        assert!(validate_id(&json!([1])).is_err());
    }

    #[test]
    fn request_envelope_round_trips() {
        let req = RequestEnvelope::new(7, "prose.draft", Some(json!({"scene": 3}))).unwrap();
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: RequestEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.protocol, req.protocol);
        assert_eq!(decoded.id, req.id);
        assert_eq!(decoded.method, req.method);
        assert_eq!(decoded.params, req.params);
    }

    #[test]
    fn request_envelope_rejects_bad_input() {
        assert!(matches!(
            RequestEnvelope::new(0, "prose.draft", None),
            Err(ProtocolError::InvalidId { .. })
        ));
        assert!(matches!(
            RequestEnvelope::new(1, "", None),
            Err(ProtocolError::InvalidMethod)
        ));
    }

    #[test]
    fn request_wire_shape() {
        let req = RequestEnvelope::new(7, "prose.draft", None).unwrap();
        insta::assert_json_snapshot!(req, @r###"
        {
          "protocol": "2.0",
          "id": 7,
          "method": "prose.draft"
        }
        "###);
    }

    #[test]
    fn request_wire_shape_with_params() {
        let req = RequestEnvelope::new(7, "prose.draft", Some(json!({"scene": 3}))).unwrap();
        insta::assert_json_snapshot!(req, @r###"
        {
          "protocol": "2.0",
          "id": 7,
          "method": "prose.draft",
          "params": {
            "scene": 3
          }
        }
        "###);
    }

    #[test]
    fn validate_request_checks_every_field() {
        let ok = json!({"protocol": "2.0", "id": 1, "method": "style.score"});
        assert!(validate_request(&ok).is_ok());

        let with_params =
            json!({"protocol": "2.0", "id": 1, "method": "style.score", "params": [1, 2]});
        assert!(validate_request(&with_params).is_ok());

        assert!(matches!(
            validate_request(&json!({"protocol": "1.0", "id": 1, "method": "m"})),
            Err(ProtocolError::UnsupportedProtocol { .. })
        ));
        assert!(matches!(
            validate_request(&json!({"id": 1, "method": "m"})),
            Err(ProtocolError::UnsupportedProtocol { .. })
        ));
        assert!(matches!(
            validate_request(&json!({"protocol": "2.0", "id": "1", "method": "m"})),
            Err(ProtocolError::InvalidId { .. })
        ));
        assert!(matches!(
            validate_request(&json!({"protocol": "2.0", "id": 1, "method": ""})),
            Err(ProtocolError::InvalidMethod)
        ));
        assert!(matches!(
            validate_request(&json!({"protocol": "2.0", "id": 1})),
            Err(ProtocolError::InvalidMethod)
        ));
        assert!(matches!(
            validate_request(&json!("not an object")),
            Err(ProtocolError::NotAnObject)
        ));
    }

    #[test]
    fn validate_error_obj_shapes() {
        let err = validate_error_obj(&json!({"code": -32000, "message": "boom"})).unwrap();
        assert_eq!(err, ErrorObject::new(-32000, "boom"));

        assert!(validate_error_obj(&json!({"code": "x", "message": "boom"})).is_err());
        assert!(validate_error_obj(&json!({"code": 1})).is_err());
        assert!(validate_error_obj(&json!(null)).is_err());
    }

    #[test]
    fn response_success() {
        let resp =
            validate_response(&json!({"protocol": "2.0", "id": 3, "result": "done"})).unwrap();
        assert!(resp.is_success());
        assert!(!resp.is_error());
        assert_eq!(resp.id, 3);
        assert_eq!(resp.result(), Some(&json!("done")));
        assert!(resp.error().is_none());
    }

    #[test]
    fn response_error() {
        let resp = validate_response(
            &json!({"protocol": "2.0", "id": 3, "error": {"code": 5, "message": "no"}}),
        )
        .unwrap();
        assert!(resp.is_error());
        assert_eq!(resp.error(), Some(&ErrorObject::new(5, "no")));
    }

    #[test]
    fn response_result_and_error_exclusive() {
        let both = json!({
            "protocol": "2.0",
            "id": 1,
            "result": "ok",
            "error": {"code": 1, "message": "x"}
        });
        assert!(matches!(
            validate_response(&both),
            Err(ProtocolError::PayloadCardinality { found: "both" })
        ));

        let neither = json!({"protocol": "2.0", "id": 1});
        assert!(matches!(
            validate_response(&neither),
            Err(ProtocolError::PayloadCardinality { found: "neither" })
        ));
    }

    #[test]
    fn response_null_result_is_present() {
        let resp =
            validate_response(&json!({"protocol": "2.0", "id": 1, "result": null})).unwrap();
        assert!(resp.is_success());
    }

    #[test]
    fn response_invalid_error_obj_rejected() {
        let bad = json!({"protocol": "2.0", "id": 1, "error": {"code": "x", "message": "m"}});
        assert!(matches!(
            validate_response(&bad),
            Err(ProtocolError::InvalidErrorObject { .. })
        ));
    }

    #[test]
    fn handshake_legacy_sentinel() {
        let hs = parse_handshake("READY").unwrap();
        assert_eq!(hs.protocol_version, PROTOCOL_VERSION);
        assert!(hs.worker_id.is_none());

        // surrounding whitespace tolerated
        assert!(parse_handshake("  READY\n").is_some());
    }

    #[test]
    fn handshake_json_form() {
        let hs = parse_handshake(
            r#"{"type":"READY","protocol_version":"1.0.0","worker_id":"scrib-w1"}"#,
        )
        .unwrap();
        assert_eq!(hs.protocol_version, "1.0.0");
        assert_eq!(hs.worker_id.as_deref(), Some("scrib-w1"));

        let no_id = parse_handshake(r#"{"type":"READY","protocol_version":"1.0.0"}"#).unwrap();
        assert!(no_id.worker_id.is_none());
    }

    #[test]
    fn handshake_rejects_other_content() {
        assert!(parse_handshake(r#"{"protocol":"2.0","id":1,"result":"ok"}"#).is_none());
        assert!(parse_handshake(r#"{"type":"HELLO","protocol_version":"1.0.0"}"#).is_none());
        assert!(parse_handshake(r#"{"type":"READY"}"#).is_none());
        assert!(parse_handshake("not json").is_none());
        assert!(parse_handshake("").is_none());
        assert!(parse_handshake("ready").is_none());
    }

    #[test]
    fn handshake_compatibility() {
        let hs = Handshake {
            protocol_version: PROTOCOL_VERSION.to_string(),
            worker_id: None,
        };
        assert!(hs.is_compatible());

        let future = Handshake {
            protocol_version: "99.0.0".to_string(),
            worker_id: None,
        };
        assert!(!future.is_compatible());
    }

    #[test]
    fn version_same_major_compatible() {
        assert!(validate_protocol_version("1.0.0", "1.0.0").is_ok());
        assert!(validate_protocol_version("1.1.0", "1.0.0").is_ok());
        assert!(validate_protocol_version("1.0.9", "1.4.2").is_ok());
    }

    #[test]
    fn version_major_mismatch_refused() {
        assert!(matches!(
            validate_protocol_version("2.0.0", "1.0.0"),
            Err(ProtocolError::IncompatibleVersion { .. })
        ));
        assert!(matches!(
            validate_protocol_version("1.0.0", "2.3.1"),
            Err(ProtocolError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn version_garbage_refused() {
        assert!(matches!(
            validate_protocol_version("latest", "1.0.0"),
            Err(ProtocolError::MalformedVersion { .. })
        ));
        assert!(validate_protocol_version("1.0", "1.0.0").is_err());
        assert!(validate_protocol_version("", "1.0.0").is_err());
    }

    #[test]
    fn version_tolerates_prefixes_and_suffixes() {
        assert!(validate_protocol_version("v1.2.3", "1.0.0").is_ok());
        assert!(validate_protocol_version("1.2.3-beta", "1.0.0").is_ok());
    }

    #[test]
    fn compiled_protocol_version_parses() {
        assert!(validate_protocol_version(PROTOCOL_VERSION, PROTOCOL_VERSION).is_ok());
    }

    // Single test so the reset cannot race the uniqueness assertions on
    // the process-wide counter.
    #[test]
    fn correlation_ids_unique_and_opaque() {
        let a = generate_correlation_id();
        let b = generate_correlation_id();
        assert_ne!(a, b);
        assert!(a.len() > 10, "{a}");
        assert!(b.len() > 10, "{b}");

        reset_correlation_counter();
        let c = generate_correlation_id();
        let d = generate_correlation_id();
        assert_ne!(c, d);
    }
}
