//! loghaul-core: wire format, payload decoding, data model, and configuration.
//! Everything here is pure; threads and shared state live in loghaul-services.

pub mod config;
pub mod decode;
pub mod message;
pub mod wire;

pub use config::{InsertPolicy, LoghaulConfig};
pub use decode::{DecodeError, PayloadDecoder};
pub use message::{DecodedMessage, MessageEvent, RawDatagram};
pub use wire::{Chunk, CorrelationId, MessageType, WireError};
