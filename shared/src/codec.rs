//! JSON codec for fleet payloads
//!
//! All messages are UTF-8 JSON without extra framing; MQTT preserves message
//! boundaries. Shadow updates travel as:
//! ```text
//! { "state": { "desired": { ... }, "reported": { ... } } }
//! ```
//! and orders as bare `Order` objects.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Order, ShadowDocument};
use crate::shadow::ReportedUpdate;

/// Maximum payload size (128 KB), the usual broker limit for shadow documents
pub const MAX_PAYLOAD_SIZE: usize = 128 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max: {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),

    #[error("Shadow document has no reported state")]
    MissingReported,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Accepted shadow documents carry extra fields (metadata, version, timestamp)
/// that are ignored here.
#[derive(Debug, Deserialize)]
struct AcceptedDocument {
    state: Option<AcceptedState>,
}

#[derive(Debug, Deserialize)]
struct AcceptedState {
    reported: Option<ReportedUpdate>,
}

/// Encode any payload as JSON bytes
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let buf = serde_json::to_vec(value)?;

    if buf.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(buf.len()));
    }

    Ok(Bytes::from(buf))
}

/// Decode a JSON payload
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    Ok(serde_json::from_slice(payload)?)
}

/// Encode a shadow update request
pub fn encode_shadow(document: &ShadowDocument) -> Result<Bytes, CodecError> {
    encode(document)
}

/// Encode a work order
pub fn encode_order(order: &Order) -> Result<Bytes, CodecError> {
    encode(order)
}

/// Decode a work order received by a robot
pub fn decode_order(payload: &[u8]) -> Result<Order, CodecError> {
    decode(payload)
}

/// Extract the reported projection from an accepted shadow document
///
/// Fields inside the projection stay optional; the shadow store decides which
/// ones are required.
pub fn decode_reported(payload: &[u8]) -> Result<ReportedUpdate, CodecError> {
    let document: AcceptedDocument = decode(payload)?;

    document
        .state
        .and_then(|state| state.reported)
        .ok_or(CodecError::MissingReported)
}
