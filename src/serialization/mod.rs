//! Subject-keyed message serialization.
//!
//! The [`SerializationRegister`] maps a wire subject string to a codec for
//! one concrete message type, bidirectionally: decode picks the codec by
//! the subject carried in the transport envelope, encode picks it by the
//! message's runtime type. Payloads are JSON via serde.
//!
//! Lookup is exact and case-sensitive. An unregistered subject or type is
//! always an error, never silently ignored: dropping a message here would
//! break at-least-once delivery.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors that can occur during message encode/decode routing.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("no decoder registered for subject '{subject}'")]
    UnknownSubject { subject: String },

    #[error("no encoder registered for message type {type_name}")]
    UnknownType { type_name: String },

    #[error("transport envelope carried no subject")]
    MissingSubject,

    #[error("failed to decode '{subject}' payload: {source}")]
    Payload {
        subject: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {type_name}: {source}")]
    Encode {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Trait for bus messages, providing methods for type erasure.
///
/// Blanket-implemented for every `Any + Send + Sync + Debug` type; the
/// serialization bounds (`Serialize + DeserializeOwned`) are only required
/// at registration time.
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// Returns a reference to the message as `Any`.
    fn as_any(&self) -> &dyn Any;

    /// Converts the shared message into an `Any` for downcasting.
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// The concrete Rust type name, for diagnostics.
    fn type_name(&self) -> &'static str;
}

impl<T> Message for T
where
    T: Any + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

type DecodeFn = Arc<dyn Fn(&str) -> Result<Arc<dyn Message>, SerializationError> + Send + Sync>;
type EncodeFn = Arc<dyn Fn(&dyn Message) -> Result<String, SerializationError> + Send + Sync>;

/// Bidirectional subject <-> codec registry.
///
/// Built once during bus assembly and shared as `Arc<SerializationRegister>`
/// afterwards; reads are lock-free. Registering a subject twice replaces the
/// previous codec (last registration wins).
#[derive(Default)]
pub struct SerializationRegister {
    decoders: HashMap<String, DecodeFn>,
    encoders: HashMap<TypeId, (String, EncodeFn)>,
}

impl SerializationRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the JSON codec for `M` under `subject`.
    pub fn register<M>(&mut self, subject: impl Into<String>)
    where
        M: Message + Serialize + DeserializeOwned,
    {
        let subject = subject.into();

        let decode_subject = subject.clone();
        let decoder: DecodeFn = Arc::new(move |payload| {
            let message: M =
                serde_json::from_str(payload).map_err(|e| SerializationError::Payload {
                    subject: decode_subject.clone(),
                    source: e,
                })?;
            Ok(Arc::new(message) as Arc<dyn Message>)
        });

        let encoder: EncodeFn = Arc::new(|message| {
            let typed = message
                .as_any()
                .downcast_ref::<M>()
                .ok_or_else(|| SerializationError::UnknownType {
                    type_name: message.type_name().to_string(),
                })?;
            serde_json::to_string(typed).map_err(|e| SerializationError::Encode {
                type_name: std::any::type_name::<M>().to_string(),
                source: e,
            })
        });

        self.decoders.insert(subject.clone(), decoder);
        self.encoders.insert(TypeId::of::<M>(), (subject, encoder));
    }

    /// Decode a payload using the codec registered for `subject`.
    pub fn decode(
        &self,
        subject: &str,
        payload: &str,
    ) -> Result<Arc<dyn Message>, SerializationError> {
        let decoder =
            self.decoders
                .get(subject)
                .ok_or_else(|| SerializationError::UnknownSubject {
                    subject: subject.to_string(),
                })?;
        decoder(payload)
    }

    /// Encode a message, returning `(subject, payload)`.
    pub fn encode(&self, message: &dyn Message) -> Result<(String, String), SerializationError> {
        let (subject, encoder) = self
            .encoders
            .get(&message.as_any().type_id())
            .ok_or_else(|| SerializationError::UnknownType {
                type_name: message.type_name().to_string(),
            })?;
        let payload = encoder(message)?;
        Ok((subject.clone(), payload))
    }

    /// The subject a message's runtime type was registered under.
    pub fn subject_of(&self, message: &dyn Message) -> Option<&str> {
        self.encoders
            .get(&message.as_any().type_id())
            .map(|(subject, _)| subject.as_str())
    }

    pub fn is_registered(&self, subject: &str) -> bool {
        self.decoders.contains_key(subject)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl fmt::Debug for SerializationRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializationRegister")
            .field("subjects", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderAccepted {
        order_id: String,
        total_cents: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderRejected {
        order_id: String,
    }

    fn register() -> SerializationRegister {
        let mut register = SerializationRegister::new();
        register.register::<OrderAccepted>("OrderAccepted");
        register.register::<OrderRejected>("OrderRejected");
        register
    }

    #[test]
    fn test_decode_round_trips_equivalent_message() {
        let register = register();
        let original = OrderAccepted {
            order_id: "o-1".to_string(),
            total_cents: 1299,
        };

        let (subject, payload) = register.encode(&original).unwrap();
        assert_eq!(subject, "OrderAccepted");

        let decoded = register.decode(&subject, &payload).unwrap();
        let decoded = decoded.as_any().downcast_ref::<OrderAccepted>().unwrap();
        assert_eq!(decoded, &original);
    }

    #[test]
    fn test_decode_unknown_subject() {
        let register = register();
        let result = register.decode("NeverRegistered", "{}");
        assert!(matches!(
            result,
            Err(SerializationError::UnknownSubject { subject }) if subject == "NeverRegistered"
        ));
    }

    #[test]
    fn test_subject_lookup_is_case_sensitive() {
        let register = register();
        assert!(register.is_registered("OrderAccepted"));
        assert!(!register.is_registered("orderaccepted"));
    }

    #[test]
    fn test_encode_unregistered_type() {
        let register = register();

        #[derive(Debug, Serialize)]
        struct Unregistered;

        let result = register.encode(&Unregistered);
        assert!(matches!(result, Err(SerializationError::UnknownType { .. })));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let register = register();
        let result = register.decode("OrderAccepted", "not json");
        assert!(matches!(result, Err(SerializationError::Payload { .. })));
    }

    #[test]
    fn test_reregistering_subject_replaces_codec() {
        let mut register = register();
        register.register::<OrderRejected>("OrderAccepted");

        let decoded = register
            .decode("OrderAccepted", r#"{"order_id":"o-2"}"#)
            .unwrap();
        assert!(decoded.as_any().downcast_ref::<OrderRejected>().is_some());
    }

    #[test]
    fn test_subject_of() {
        let register = register();
        let message = OrderRejected {
            order_id: "o-3".to_string(),
        };
        assert_eq!(register.subject_of(&message), Some("OrderRejected"));
    }
}
