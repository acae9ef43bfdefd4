//! Mapper registries.
//!
//! Dispatch by type name is a closed set of bindings fixed at startup. Each side of the
//! bridge has its own registry type:
//!
//! - [`OutboundRegistry`] - `event_type → (wire codec, logical topic)`, used by the publisher
//! - [`InboundRegistry`] - `event_type → (wire codec, handler)`, used by the receiver
//!
//! Both are assembled with a builder during startup and are immutable afterwards, so a
//! built registry can be shared through an `Arc` without locking.
//!
//! # Example
//!
//! ```
//! use reliable_events_core::codec::JsonCodec;
//! use reliable_events_core::event::IntegrationEvent;
//! use reliable_events_core::registry::OutboundRegistry;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct BookingCreated { booking_id: String }
//!
//! impl IntegrationEvent for BookingCreated {
//!     fn event_type(&self) -> &'static str { "BookingCreated" }
//! }
//!
//! # fn main() -> Result<(), reliable_events_core::registry::RegistryError> {
//! let registry = OutboundRegistry::builder()
//!     .register::<BookingCreated, _>("BookingCreated", "booking", JsonCodec)?
//!     .build();
//!
//! assert_eq!(registry.resolve("BookingCreated")?.topic(), "booking");
//! assert!(registry.resolve("BookingMoved").is_err());
//! # Ok(())
//! # }
//! ```

use crate::bus::Delivery;
use crate::codec::{Codec, CodecError};
use crate::event::IntegrationEvent;
use crate::message::{MessageHeaders, MessageId};
use crate::persistence::PersistenceError;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use thiserror::Error;

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The event type is already bound on this side. Startup configuration error.
    #[error("Event type '{0}' is already registered")]
    DuplicateRegistration(String),

    /// No binding exists for the event type.
    #[error("Unknown event type '{0}'")]
    UnknownEventType(String),
}

// ============================================================================
// Outbound
// ============================================================================

type Transcoder = dyn Fn(&[u8]) -> Result<Vec<u8>, CodecError> + Send + Sync;

/// Publisher-side binding of one event type.
pub struct OutboundBinding {
    event_type: String,
    topic: String,
    codec_name: &'static str,
    transcode: Box<Transcoder>,
}

impl OutboundBinding {
    /// The bound event type.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Logical topic the event is routed to (before prefixing).
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Name of the wire codec.
    #[must_use]
    pub const fn codec_name(&self) -> &'static str {
        self.codec_name
    }

    /// Turn an outbox payload (internal `bincode` encoding) into the wire body.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the payload does not decode as the registered type or
    /// the wire codec cannot encode it.
    pub fn encode_body(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        (self.transcode)(payload)
    }
}

impl fmt::Debug for OutboundBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundBinding")
            .field("event_type", &self.event_type)
            .field("topic", &self.topic)
            .field("codec", &self.codec_name)
            .finish_non_exhaustive()
    }
}

/// Frozen publisher-side registry.
#[derive(Debug)]
pub struct OutboundRegistry {
    bindings: HashMap<String, OutboundBinding>,
}

impl OutboundRegistry {
    /// Start a registration window.
    #[must_use]
    pub fn builder() -> OutboundRegistryBuilder {
        OutboundRegistryBuilder {
            bindings: HashMap::new(),
        }
    }

    /// Look up the binding for `event_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownEventType`] if nothing is bound.
    pub fn resolve(&self, event_type: &str) -> Result<&OutboundBinding, RegistryError> {
        self.bindings
            .get(event_type)
            .ok_or_else(|| RegistryError::UnknownEventType(event_type.to_string()))
    }

    /// All bound event types, sorted.
    #[must_use]
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// All distinct logical topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<&str> {
        self.bindings
            .values()
            .map(|b| b.topic.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Builder for [`OutboundRegistry`].
pub struct OutboundRegistryBuilder {
    bindings: HashMap<String, OutboundBinding>,
}

impl OutboundRegistryBuilder {
    /// Bind `event_type` to a wire codec and a logical topic.
    ///
    /// `E` is the type stored in the outbox under that name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateRegistration`] if `event_type` is already bound.
    pub fn register<E, C>(
        mut self,
        event_type: impl Into<String>,
        topic: impl Into<String>,
        codec: C,
    ) -> Result<Self, RegistryError>
    where
        E: IntegrationEvent + Serialize + DeserializeOwned,
        C: Codec<E>,
    {
        let event_type = event_type.into();
        if self.bindings.contains_key(&event_type) {
            return Err(RegistryError::DuplicateRegistration(event_type));
        }

        let codec_name = codec.name();
        let transcode = Box::new(move |payload: &[u8]| {
            let event = E::from_bytes(payload)?;
            codec.encode(&event)
        });

        self.bindings.insert(
            event_type.clone(),
            OutboundBinding {
                event_type,
                topic: topic.into(),
                codec_name,
                transcode,
            },
        );
        Ok(self)
    }

    /// Close the registration window.
    #[must_use]
    pub fn build(self) -> OutboundRegistry {
        OutboundRegistry {
            bindings: self.bindings,
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Failure reported by an integration handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth retrying (lock timeout, downstream hiccup). The message is redelivered.
    #[error("Recoverable handler failure: {0}")]
    Recoverable(String),

    /// Will never succeed (business rule violation). The message is dead-lettered.
    #[error("Terminal handler failure: {0}")]
    Terminal(String),
}

impl HandlerError {
    /// Whether redelivery may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

impl From<PersistenceError> for HandlerError {
    fn from(error: PersistenceError) -> Self {
        if error.is_transient() {
            Self::Recoverable(error.to_string())
        } else {
            Self::Terminal(error.to_string())
        }
    }
}

/// Everything a handler may need to know about the message besides its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageContext {
    /// Identity of the message
    pub message_id: MessageId,
    /// Its logical type
    pub event_type: String,
    /// Correlation and partitioning headers
    pub headers: MessageHeaders,
    /// Topic it arrived on
    pub topic: String,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
}

impl MessageContext {
    /// Build the context of a delivery.
    #[must_use]
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let message = delivery.message();
        Self {
            message_id: message.message_id,
            event_type: message.event_type.clone(),
            headers: message.headers.clone(),
            topic: delivery.topic().to_string(),
            attempt: delivery.attempt(),
        }
    }
}

/// Local reaction to an inbound integration event.
///
/// The handler runs inside the transaction that also records the message in the inbox;
/// all its writes must go through `tx` so they commit or roll back together with it.
pub trait IntegrationHandler<E, Tx>: Send + Sync + 'static {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Recoverable`] to request redelivery or
    /// [`HandlerError::Terminal`] to dead-letter the message.
    fn handle<'a>(
        &'a self,
        tx: &'a mut Tx,
        event: E,
        ctx: &'a MessageContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Failure while dispatching an inbound message to its handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InboundError {
    /// The body does not match the registered schema.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

trait ErasedHandler<Tx>: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        tx: &'a mut Tx,
        body: &'a [u8],
        ctx: &'a MessageContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), InboundError>> + Send + 'a>>;
}

struct TypedHandler<E, C, H> {
    codec: C,
    handler: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, C, H, Tx> ErasedHandler<Tx> for TypedHandler<E, C, H>
where
    E: Send + 'static,
    C: Codec<E>,
    H: IntegrationHandler<E, Tx>,
    Tx: Send,
{
    fn dispatch<'a>(
        &'a self,
        tx: &'a mut Tx,
        body: &'a [u8],
        ctx: &'a MessageContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), InboundError>> + Send + 'a>> {
        let decoded = self.codec.decode(body);
        Box::pin(async move {
            let event = decoded?;
            self.handler.handle(tx, event, ctx).await?;
            Ok(())
        })
    }
}

/// Receiver-side binding of one event type.
pub struct InboundBinding<Tx> {
    event_type: String,
    codec_name: &'static str,
    handler: Box<dyn ErasedHandler<Tx>>,
}

impl<Tx: Send> InboundBinding<Tx> {
    /// The bound event type.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Name of the wire codec.
    #[must_use]
    pub const fn codec_name(&self) -> &'static str {
        self.codec_name
    }

    /// Decode `body` and run the handler inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`InboundError::Codec`] on schema mismatch and [`InboundError::Handler`]
    /// if the handler fails.
    pub fn dispatch<'a>(
        &'a self,
        tx: &'a mut Tx,
        body: &'a [u8],
        ctx: &'a MessageContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), InboundError>> + Send + 'a>> {
        self.handler.dispatch(tx, body, ctx)
    }
}

impl<Tx> fmt::Debug for InboundBinding<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundBinding")
            .field("event_type", &self.event_type)
            .field("codec", &self.codec_name)
            .finish_non_exhaustive()
    }
}

/// Frozen receiver-side registry.
pub struct InboundRegistry<Tx> {
    bindings: HashMap<String, InboundBinding<Tx>>,
}

impl<Tx: Send + 'static> InboundRegistry<Tx> {
    /// Start a registration window.
    #[must_use]
    pub fn builder() -> InboundRegistryBuilder<Tx> {
        InboundRegistryBuilder {
            bindings: HashMap::new(),
        }
    }

    /// Look up the binding for `event_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownEventType`] if nothing is bound.
    pub fn resolve(&self, event_type: &str) -> Result<&InboundBinding<Tx>, RegistryError> {
        self.bindings
            .get(event_type)
            .ok_or_else(|| RegistryError::UnknownEventType(event_type.to_string()))
    }

    /// All bound event types, sorted.
    #[must_use]
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl<Tx> fmt::Debug for InboundRegistry<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundRegistry")
            .field("bindings", &self.bindings)
            .finish()
    }
}

/// Builder for [`InboundRegistry`].
pub struct InboundRegistryBuilder<Tx> {
    bindings: HashMap<String, InboundBinding<Tx>>,
}

impl<Tx: Send + 'static> InboundRegistryBuilder<Tx> {
    /// Bind `event_type` to a wire codec and a handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateRegistration`] if `event_type` is already bound.
    pub fn register<E, C, H>(
        mut self,
        event_type: impl Into<String>,
        codec: C,
        handler: H,
    ) -> Result<Self, RegistryError>
    where
        E: Send + 'static,
        C: Codec<E>,
        H: IntegrationHandler<E, Tx>,
    {
        let event_type = event_type.into();
        if self.bindings.contains_key(&event_type) {
            return Err(RegistryError::DuplicateRegistration(event_type));
        }

        let codec_name = codec.name();
        self.bindings.insert(
            event_type.clone(),
            InboundBinding {
                event_type,
                codec_name,
                handler: Box::new(TypedHandler {
                    codec,
                    handler,
                    _event: PhantomData,
                }),
            },
        );
        Ok(self)
    }

    /// Close the registration window.
    #[must_use]
    pub fn build(self) -> InboundRegistry<Tx> {
        InboundRegistry {
            bindings: self.bindings,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::codec::{BincodeCodec, JsonCodec};
    use chrono::Utc;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct BookingCreated {
        booking_id: String,
        nights: u32,
    }

    impl IntegrationEvent for BookingCreated {
        fn event_type(&self) -> &'static str {
            "BookingCreated"
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct FacilityClosed {
        facility_id: String,
    }

    impl IntegrationEvent for FacilityClosed {
        fn event_type(&self) -> &'static str {
            "FacilityClosed"
        }
    }

    fn context(event_type: &str) -> MessageContext {
        MessageContext {
            message_id: MessageId::random(),
            event_type: event_type.to_string(),
            headers: MessageHeaders::new("F-1", Utc::now()),
            topic: "facility.facility".to_string(),
            attempt: 1,
        }
    }

    /// Appends every handled facility id to the transaction.
    struct CollectClosures {
        calls: Arc<AtomicUsize>,
    }

    impl IntegrationHandler<FacilityClosed, Vec<String>> for CollectClosures {
        fn handle<'a>(
            &'a self,
            tx: &'a mut Vec<String>,
            event: FacilityClosed,
            _ctx: &'a MessageContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if event.facility_id.is_empty() {
                    return Err(HandlerError::Terminal("empty facility id".to_string()));
                }
                tx.push(event.facility_id);
                Ok(())
            })
        }
    }

    #[test]
    fn outbound_transcodes_stored_payload_to_wire_codec() {
        let registry = OutboundRegistry::builder()
            .register::<BookingCreated, _>("BookingCreated", "booking", JsonCodec)
            .unwrap()
            .build();

        let event = BookingCreated {
            booking_id: "B1".to_string(),
            nights: 2,
        };
        let binding = registry.resolve("BookingCreated").unwrap();
        let body = binding.encode_body(&event.to_bytes().unwrap()).unwrap();

        assert_eq!(binding.codec_name(), "json");
        let decoded: BookingCreated = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn outbound_rejects_payload_of_another_schema() {
        let registry = OutboundRegistry::builder()
            .register::<BookingCreated, _>("BookingCreated", "booking", JsonCodec)
            .unwrap()
            .build();

        let result = registry.resolve("BookingCreated").unwrap().encode_body(&[0xff]);
        assert!(matches!(result, Err(CodecError::Deserialization(_))));
    }

    #[test]
    fn duplicate_outbound_registration_fails() {
        let result = OutboundRegistry::builder()
            .register::<BookingCreated, _>("BookingCreated", "booking", JsonCodec)
            .unwrap()
            .register::<BookingCreated, _>("BookingCreated", "other", BincodeCodec);

        assert!(matches!(
            result,
            Err(RegistryError::DuplicateRegistration(ref t)) if t == "BookingCreated"
        ));
    }

    #[test]
    fn outbound_enumerates_closed_set() {
        let registry = OutboundRegistry::builder()
            .register::<FacilityClosed, _>("FacilityClosed", "facility", JsonCodec)
            .unwrap()
            .register::<BookingCreated, _>("BookingCreated", "booking", JsonCodec)
            .unwrap()
            .register::<BookingCreated, _>("BookingCreated.v2", "booking", BincodeCodec)
            .unwrap()
            .build();

        assert_eq!(
            registry.event_types(),
            vec!["BookingCreated", "BookingCreated.v2", "FacilityClosed"]
        );
        assert_eq!(registry.topics(), vec!["booking", "facility"]);
        assert_eq!(
            registry.resolve("BookingMoved").unwrap_err(),
            RegistryError::UnknownEventType("BookingMoved".to_string())
        );
    }

    #[tokio::test]
    async fn inbound_decodes_and_runs_handler_in_transaction() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = InboundRegistry::<Vec<String>>::builder()
            .register::<FacilityClosed, _, _>(
                "FacilityClosed",
                JsonCodec,
                CollectClosures {
                    calls: Arc::clone(&calls),
                },
            )
            .unwrap()
            .build();

        let mut tx = Vec::new();
        let ctx = context("FacilityClosed");
        let binding = registry.resolve("FacilityClosed").unwrap();
        binding
            .dispatch(&mut tx, br#"{"facility_id":"F-1"}"#, &ctx)
            .await
            .unwrap();

        assert_eq!(tx, vec!["F-1".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inbound_schema_mismatch_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = InboundRegistry::<Vec<String>>::builder()
            .register::<FacilityClosed, _, _>(
                "FacilityClosed",
                JsonCodec,
                CollectClosures {
                    calls: Arc::clone(&calls),
                },
            )
            .unwrap()
            .build();

        let mut tx = Vec::new();
        let ctx = context("FacilityClosed");
        let result = registry
            .resolve("FacilityClosed")
            .unwrap()
            .dispatch(&mut tx, br#"{"id":7}"#, &ctx)
            .await;

        assert!(matches!(result, Err(InboundError::Codec(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inbound_handler_errors_are_passed_through() {
        let registry = InboundRegistry::<Vec<String>>::builder()
            .register::<FacilityClosed, _, _>(
                "FacilityClosed",
                JsonCodec,
                CollectClosures {
                    calls: Arc::new(AtomicUsize::new(0)),
                },
            )
            .unwrap()
            .build();

        let mut tx = Vec::new();
        let ctx = context("FacilityClosed");
        let result = registry
            .resolve("FacilityClosed")
            .unwrap()
            .dispatch(&mut tx, br#"{"facility_id":""}"#, &ctx)
            .await;

        assert!(matches!(
            result,
            Err(InboundError::Handler(HandlerError::Terminal(_)))
        ));
    }

    #[test]
    fn duplicate_inbound_registration_fails() {
        let handler = || CollectClosures {
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let result = InboundRegistry::<Vec<String>>::builder()
            .register::<FacilityClosed, _, _>("FacilityClosed", JsonCodec, handler())
            .unwrap()
            .register::<FacilityClosed, _, _>("FacilityClosed", BincodeCodec, handler());

        assert!(matches!(result, Err(RegistryError::DuplicateRegistration(_))));
    }

    #[test]
    fn persistence_errors_map_to_handler_classes() {
        assert!(HandlerError::from(PersistenceError::Conflict("row".into())).is_recoverable());
        assert!(!HandlerError::from(PersistenceError::CorruptRecord("row".into())).is_recoverable());
    }
}
