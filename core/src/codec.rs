//! Pluggable payload codecs.
//!
//! The bus wire contract treats the message body as opaque bytes; how a typed event maps
//! to those bytes is decided per event type at registration time. Two codecs ship with
//! the crate:
//!
//! - [`JsonCodec`] - human-readable, the usual choice for cross-team integration events
//! - [`BincodeCodec`] - compact binary, for all-Rust consumers

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Errors produced while encoding or decoding a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to serialize a typed event to bytes.
    #[error("Failed to serialize payload: {0}")]
    Serialization(String),

    /// The bytes do not match the expected schema.
    #[error("Failed to deserialize payload: {0}")]
    Deserialization(String),
}

/// Converts a typed event to and from its wire representation.
///
/// Implementations must be stateless with respect to individual messages; the registry
/// shares one codec instance across concurrent deliveries.
pub trait Codec<E>: Send + Sync + 'static {
    /// Short name used in logs (e.g. `"json"`).
    fn name(&self) -> &'static str;

    /// Encode an event into body bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the event cannot be encoded.
    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError>;

    /// Decode body bytes into an event.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Deserialization`] on schema mismatch or corrupt input.
    fn decode(&self, bytes: &[u8]) -> Result<E, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<E> Codec<E> for JsonCodec
where
    E: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(event).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<E, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

/// Binary codec backed by `bincode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<E> Codec<E> for BincodeCodec
where
    E: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(event).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<E, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}
