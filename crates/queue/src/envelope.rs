//! Wire envelope for queued messages.
//!
//! JSON layout (field order irrelevant):
//!
//! ```text
//! { "id": "<uuid>", "type": "email.send", "data": "<base64>",
//!   "metadata": { ... }, "timestamp": "<rfc3339>", "retry_count": 0 }
//! ```

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use courier_core::DomainError;

/// Unique envelope identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for EnvelopeId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("EnvelopeId: {}", e)))?;
        Ok(Self(uuid))
    }
}

/// Envelope codec error.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode payload: {0}")]
    EncodePayload(#[source] serde_json::Error),

    #[error("failed to decode payload: {0}")]
    DecodePayload(#[source] serde_json::Error),
}

/// The unit of transport between producers and consumers.
///
/// Notes:
/// - `id`, `kind`, `payload` and `timestamp` are fixed at creation.
/// - `retry_count` only grows, once per failed-and-retried attempt.
/// - `kind` is informational (logging, handler-side dispatch); routing is by queue name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,

    #[serde(rename = "type")]
    kind: String,

    #[serde(rename = "data", with = "payload_bytes")]
    payload: Vec<u8>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, JsonValue>,

    timestamp: DateTime<Utc>,

    #[serde(default)]
    retry_count: u32,
}

impl Envelope {
    /// Create an envelope around raw payload bytes.
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: EnvelopeId::new(),
            kind: kind.into(),
            payload: payload.into(),
            metadata: Map::new(),
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }

    /// Create an envelope whose payload is the JSON encoding of `value`.
    pub fn from_value<T: Serialize + ?Sized>(
        kind: impl Into<String>,
        value: &T,
    ) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_vec(value).map_err(EnvelopeError::EncodePayload)?;
        Ok(Self::new(kind, payload))
    }

    /// Attach an out-of-band metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &Map<String, JsonValue> {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Decode the JSON payload into a typed value.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_slice(&self.payload).map_err(EnvelopeError::DecodePayload)
    }

    /// Count one more failed attempt. Returns the new retry count.
    pub(crate) fn record_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Parse the wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }
}

/// `data` is written as standard base64. Reads accept base64, an array of
/// byte values, or `null` (empty payload).
mod payload_bytes {
    use std::fmt;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        d.deserialize_any(PayloadVisitor)
    }

    struct PayloadVisitor;

    impl<'de> Visitor<'de> for PayloadVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a base64 string or an array of bytes")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<u8>, E> {
            STANDARD
                .decode(v)
                .map_err(|e| E::custom(format!("invalid base64 payload: {e}")))
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Vec<u8>, E> {
            Ok(Vec::new())
        }

        fn visit_none<E: de::Error>(self) -> Result<Vec<u8>, E> {
            Ok(Vec::new())
        }
    }
}
