//! Hot Rod binary protocol implementation.
//!
//! This module provides the wire types for talking to Hot Rod servers:
//! variable-length integers, the request and response model, a version-aware
//! frame codec, and the `tokio_util` codec built on top of it.

mod codec;
pub mod constants;
mod reader;
mod request;
mod response;
mod version;
pub mod vint;
mod wire;

pub use codec::{HotRodCodec, PendingShapes, RequestFrame};
pub use reader::{DecodeError, DecodeResult, WireReader};
pub use request::{Expiration, FactoryRef, Lifetime, MediaType, Request, RequestBody};
pub use response::{
    ClientEvent, EntryMetadata, EventKind, EventPayload, Inbound, IterationEntry, MetadataValue,
    Response, ResponseBody, ResponseHeader, ResponseShape, Status, VersionedValue,
};
pub use version::{ClientIntelligence, ProtocolVersion};
pub use wire::{write_response_header, write_topology, WireCodec};
