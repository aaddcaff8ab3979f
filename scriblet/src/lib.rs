//! scriblet: worker runtime bridge for the Scrib narrative engine.
//!
//! The host pipeline plans, drafts, and certifies long-form text in an
//! external worker process. This crate supplies the transport underneath:
//! a process supervisor with a strict lifecycle state machine, and a pure
//! codec for the line-delimited wire protocol the two sides speak.

pub mod bridge;
mod lifecycle;
mod supervisor;

pub use lifecycle::WorkerState;

pub use supervisor::{
    BridgeConfig, BridgeError, BridgeEvent, DEFAULT_STOP_TIMEOUT, LineHandler, WorkerBridge,
};

pub use bridge::codec::{LineCodec, MAX_LINE_BYTES, decode_response_line, encode_request};
pub use bridge::protocol::{
    ErrorObject, Handshake, LEGACY_READY_SENTINEL, PROTOCOL_VERSION, ProtocolError,
    RequestEnvelope, ResponseEnvelope, ResponsePayload, WIRE_VERSION, generate_correlation_id,
    parse_handshake, validate_error_obj, validate_id, validate_protocol_version,
    validate_request, validate_response,
};
