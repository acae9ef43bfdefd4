//! Integration event trait.
//!
//! An integration event is the externally visible notification a bounded context emits
//! for others to consume. Inside the outbox its payload is stored with `bincode` (compact,
//! all-Rust); the wire encoding is chosen per event type by the outbound registry.
//!
//! # Example
//!
//! ```
//! use reliable_events_core::event::IntegrationEvent;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct BookingCreated {
//!     booking_id: String,
//!     facility_id: String,
//! }
//!
//! impl IntegrationEvent for BookingCreated {
//!     fn event_type(&self) -> &'static str {
//!         "BookingCreated"
//!     }
//! }
//! ```

use crate::codec::CodecError;
use serde::{Serialize, de::DeserializeOwned};

/// An event that crosses a bounded-context boundary.
///
/// # Event Naming Convention
///
/// `event_type()` must be stable for the lifetime of the bus namespace: it is the routing
/// key for both registries. Add a version suffix when the schema changes incompatibly
/// (`"BookingCreated"` → `"BookingCreated.v2"`).
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` so they can move between the dispatcher and
/// receiver tasks.
pub trait IntegrationEvent: Send + Sync + 'static {
    /// Returns the logical type name of this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event with the internal outbox encoding (`bincode`).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Deserialize an event stored with the internal outbox encoding.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Deserialization`] if the bytes are corrupt or belong to a
    /// different schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}
