//! Data model for the ingestion path.
//!
//! A `RawDatagram` comes in from the transport, a `DecodedMessage` comes out
//! of the decoder, and a `MessageEvent` is what occupies a buffer slot.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Serialize, Serializer};

/// A datagram exactly as the transport handed it over.
#[derive(Debug, Clone)]
pub struct RawDatagram {
    pub payload: Bytes,
    /// Monotonic arrival time. Used for chunk-set ageing.
    pub received_at: Instant,
    /// Wall-clock arrival time. Carried through to the decoded message.
    pub timestamp: SystemTime,
    pub remote_addr: Option<SocketAddr>,
}

impl RawDatagram {
    /// Stamp a payload with the current time.
    pub fn new(payload: impl Into<Bytes>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            payload: payload.into(),
            received_at: Instant::now(),
            timestamp: SystemTime::now(),
            remote_addr,
        }
    }

    /// Override the monotonic arrival time.
    pub fn at(mut self, received_at: Instant) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Fully reassembled and decompressed message text plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedMessage {
    pub text: String,
    /// Identity of the input that produced this message.
    pub input_id: String,
    pub remote_addr: Option<SocketAddr>,
    #[serde(serialize_with = "unix_millis")]
    pub received_at: SystemTime,
    /// Time spent between arrival of the completing datagram and decode.
    #[serde(serialize_with = "micros")]
    pub decode_time: Duration,
}

fn unix_millis<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    let millis = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    s.serialize_u64(millis)
}

fn micros<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

/// Content of one buffer slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    Single(DecodedMessage),
    /// Several messages decoded from one payload. Processed as a unit.
    Batch(Vec<DecodedMessage>),
}

impl MessageEvent {
    pub fn messages(&self) -> &[DecodedMessage] {
        match self {
            MessageEvent::Single(message) => std::slice::from_ref(message),
            MessageEvent::Batch(messages) => messages,
        }
    }

    pub fn into_messages(self) -> Vec<DecodedMessage> {
        match self {
            MessageEvent::Single(message) => vec![message],
            MessageEvent::Batch(messages) => messages,
        }
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }
}

impl From<DecodedMessage> for MessageEvent {
    fn from(message: DecodedMessage) -> Self {
        MessageEvent::Single(message)
    }
}

impl From<Vec<DecodedMessage>> for MessageEvent {
    fn from(messages: Vec<DecodedMessage>) -> Self {
        MessageEvent::Batch(messages)
    }
}
