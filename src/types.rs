//! Core message types for the relay
//!
//! The persisted and wire form of a message is the JSON object
//! `{id, topic, payload, timestamp, retries}`. A payload that was not a JSON
//! object travels as `{"raw_payload": "<text>"}` (or `raw_payload_b64` for
//! non-UTF-8 bytes) and the message carries `"raw": true`, so an inbound
//! object that happens to use those field names is never mistaken for one.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::breaker::BreakerState;

/// Field used to carry inbound bytes that were not a JSON object
pub const RAW_PAYLOAD_FIELD: &str = "raw_payload";

/// Field used when the raw bytes are not valid UTF-8
pub const RAW_PAYLOAD_B64_FIELD: &str = "raw_payload_b64";

/// Message field marking a raw payload
pub const RAW_FLAG_FIELD: &str = "raw";

/// A buffered event awaiting delivery
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "MessageRecord")]
pub struct Message {
    /// Buffer-assigned identifier (`<unix-nanos>-<topic>`)
    pub id: String,

    /// Bus topic the event arrived on
    pub topic: String,

    /// Event body
    pub payload: Payload,

    /// When the buffer accepted the event (`timestamp`)
    pub received_at: DateTime<Utc>,

    /// Failed delivery attempts so far (`retries`)
    pub retry_count: u32,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = self.payload.is_raw();
        let mut state = serializer.serialize_struct("Message", if raw { 6 } else { 5 })?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("topic", &self.topic)?;
        state.serialize_field("payload", &self.payload)?;
        state.serialize_field("timestamp", &self.received_at)?;
        state.serialize_field("retries", &self.retry_count)?;
        if raw {
            state.serialize_field(RAW_FLAG_FIELD, &true)?;
        }
        state.end()
    }
}

/// Persisted layout of a [`Message`]
#[derive(Deserialize)]
struct MessageRecord {
    id: String,
    topic: String,
    payload: Payload,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    retries: u32,
    #[serde(default)]
    raw: bool,
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        let payload = if record.raw {
            record.payload.into_raw()
        } else {
            record.payload
        };
        Message {
            id: record.id,
            topic: record.topic,
            payload,
            received_at: record.timestamp,
            retry_count: record.retries,
        }
    }
}

/// Event body: either a parsed JSON object or the bytes as received
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Inbound bytes parsed as a JSON object
    Object(Map<String, Value>),

    /// Inbound bytes that were not a JSON object
    Raw(Vec<u8>),
}

impl Payload {
    /// Parse inbound bytes, falling back to `Raw` when they are not a JSON object
    pub fn parse(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Map<String, Value>>(bytes) {
            Ok(map) => Payload::Object(map),
            Err(_) => Payload::Raw(bytes.to_vec()),
        }
    }

    /// Look up a top-level field of an object payload
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Payload::Object(map) => map.get(key),
            Payload::Raw(_) => None,
        }
    }

    /// Whether the payload fell back to raw bytes
    pub fn is_raw(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }

    /// Recover the bytes of a payload persisted with the raw flag
    ///
    /// An object without a decodable raw field stays an object.
    fn into_raw(self) -> Self {
        let map = match self {
            Payload::Object(map) => map,
            raw => return raw,
        };
        if let Some(Value::String(text)) = map.get(RAW_PAYLOAD_FIELD) {
            return Payload::Raw(text.as_bytes().to_vec());
        }
        if let Some(Value::String(encoded)) = map.get(RAW_PAYLOAD_B64_FIELD) {
            if let Ok(bytes) = BASE64.decode(encoded) {
                return Payload::Raw(bytes);
            }
        }
        Payload::Object(map)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Payload::Object(map)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Object(map) => map.serialize(serializer),
            Payload::Raw(bytes) => {
                let mut map = serializer.serialize_map(Some(1))?;
                match std::str::from_utf8(bytes) {
                    Ok(text) => map.serialize_entry(RAW_PAYLOAD_FIELD, text)?,
                    Err(_) => map.serialize_entry(RAW_PAYLOAD_B64_FIELD, &BASE64.encode(bytes))?,
                }
                map.end()
            }
        }
    }
}

/// A bare payload always reads back as an object; `null` reads as the raw
/// bytes `null`, the same as [`Payload::parse`] gives for that input.
impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<Map<String, Value>>::deserialize(deserializer)? {
            Some(map) => Payload::Object(map),
            None => Payload::Raw(b"null".to_vec()),
        })
    }
}

/// Point-in-time buffer statistics
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    /// Messages currently buffered
    pub total_messages: usize,

    /// Messages not inside a backoff window right now
    pub eligible_messages: usize,

    /// Live backoff entries
    pub backoff_entries: usize,

    /// Circuit breaker state
    pub breaker_state: BreakerState,

    /// Consecutive failures recorded on the breaker
    pub breaker_failures: u32,

    /// Last time a delivered or rejected batch was removed
    pub last_flush: Option<DateTime<Utc>>,

    /// Messages evicted by capacity rotation since startup
    pub dropped_total: u64,
}
