//! Wire layer for host-worker communication.
//!
//! This module provides the protocol types and the framing codec used
//! between the supervisor's caller (host side) and the worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types, validators, handshake, versioning
//! - **codec**: Newline framing for AsyncRead/AsyncWrite plus the pure
//!   encode/decode functions

pub mod codec;
pub mod protocol;
