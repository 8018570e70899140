//! Codec for encoding and decoding Burrow envelopes.
//!
//! The body of every message is a JSON object:
//!
//! ```json
//! { "event": "invoice.paid", "payload": "{\"id\":42}" }
//! ```
//!
//! The payload travels as a JSON string, so it must be valid UTF-8.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::Envelope;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Payload cannot be represented as a JSON string.
    #[error("Payload is not valid UTF-8 (error at byte {0})")]
    NonUtf8Payload(usize),

    /// Routing key without an exchange/event separator.
    #[error("Invalid routing key: {0:?}")]
    InvalidRoutingKey(String),
}

#[derive(Serialize)]
struct WireRef<'a> {
    event: &'a str,
    payload: &'a str,
}

#[derive(Deserialize)]
struct Wire {
    event: String,
    payload: String,
}

/// Encode an envelope to a message body.
///
/// # Errors
///
/// Returns an error if the payload is not UTF-8 or serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let payload = std::str::from_utf8(&envelope.payload)
        .map_err(|e| ProtocolError::NonUtf8Payload(e.valid_up_to()))?;

    let body = serde_json::to_vec(&WireRef {
        event: &envelope.event,
        payload,
    })
    .map_err(ProtocolError::Encode)?;

    Ok(Bytes::from(body))
}

/// Decode an envelope from a message body.
///
/// # Errors
///
/// Returns an error if the body is not a well-formed envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let wire: Wire = serde_json::from_slice(data).map_err(ProtocolError::Decode)?;
    Ok(Envelope::new(wire.event, wire.payload.into_bytes()))
}
