//! Core types and protocol codec for Hot Rod remote caches.

#![warn(missing_docs)]

pub mod error;
pub mod hash;
pub mod protocol;
pub mod topology;

pub use error::{HotRodError, Result};
pub use hash::{segment_of, KeyHasher, Murmur3Hasher};
pub use protocol::{ClientIntelligence, ProtocolVersion};
pub use topology::{SegmentOwners, ServerAddress, Topology};
