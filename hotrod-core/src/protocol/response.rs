//! Response model: header, status, typed bodies, and server-pushed events.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes};

use super::constants::*;
use super::reader::{DecodeResult, WireReader};
use super::vint::{put_array, put_vint};
use crate::topology::Topology;

/// A response status byte with its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u8);

impl Status {
    /// Wraps a raw status byte.
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the raw status byte.
    pub fn raw(self) -> u8 {
        self.0
    }

    /// The operation ran and succeeded, including the object-storage variants.
    pub fn is_success(self) -> bool {
        matches!(
            self.0,
            NO_ERROR_STATUS
                | SUCCESS_WITH_PREVIOUS_STATUS
                | NO_ERROR_STATUS_OBJ_STORAGE
                | SUCCESS_WITH_PREVIOUS_OBJ_STORAGE
        )
    }

    /// A conditional operation did not run because the entry changed.
    pub fn is_not_executed(self) -> bool {
        matches!(
            self.0,
            NOT_PUT_REMOVED_REPLACED_STATUS
                | NOT_EXECUTED_WITH_PREVIOUS_STATUS
                | NOT_EXECUTED_WITH_PREVIOUS_OBJ_STORAGE
        )
    }

    /// The key does not exist.
    pub fn is_key_missing(self) -> bool {
        self.0 == KEY_DOES_NOT_EXIST_STATUS
    }

    /// A previous value follows the header.
    pub fn has_previous_value(self) -> bool {
        matches!(
            self.0,
            SUCCESS_WITH_PREVIOUS_STATUS
                | NOT_EXECUTED_WITH_PREVIOUS_STATUS
                | SUCCESS_WITH_PREVIOUS_OBJ_STORAGE
                | NOT_EXECUTED_WITH_PREVIOUS_OBJ_STORAGE
        )
    }

    /// The server hints that the cache stores objects rather than bytes.
    pub fn is_object_storage(self) -> bool {
        matches!(
            self.0,
            NO_ERROR_STATUS_OBJ_STORAGE
                | SUCCESS_WITH_PREVIOUS_OBJ_STORAGE
                | NOT_EXECUTED_WITH_PREVIOUS_OBJ_STORAGE
        )
    }

    /// The iteration id is unknown to the server.
    pub fn is_invalid_iteration(self) -> bool {
        self.0 == INVALID_ITERATION_STATUS
    }

    /// The server reported an error; an error message follows the header.
    pub fn is_error(self) -> bool {
        self.0 >= INVALID_MAGIC_OR_MESSAGE_ID_STATUS
    }

    /// An error caused by a rebalance or a suspected node, worth retrying elsewhere.
    pub fn is_topology_stale(self) -> bool {
        matches!(
            self.0,
            NODE_SUSPECTED_STATUS | ILLEGAL_LIFECYCLE_STATE_STATUS
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// The body layout a response is decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseShape {
    /// Status only.
    Empty,
    /// A value when the status is success.
    Value,
    /// A previous value when the status says one follows.
    PreviousValue,
    /// Version and value.
    Versioned,
    /// Expiration metadata, version, and value.
    Metadata,
    /// Entry count.
    Size,
    /// Name/value statistics pairs.
    Stats,
    /// Iteration id.
    IterationStart,
    /// Finished segments and a batch of entries.
    IterationNext {
        /// Entries carry metadata.
        metadata: bool,
    },
}

impl ResponseShape {
    /// Default shape for a response opcode.
    pub fn for_opcode(response_opcode: u8) -> Self {
        match response_opcode.wrapping_sub(1) {
            GET_REQUEST => ResponseShape::Value,
            PUT_REQUEST
            | PUT_IF_ABSENT_REQUEST
            | REPLACE_REQUEST
            | REPLACE_IF_UNMODIFIED_REQUEST
            | REMOVE_REQUEST
            | REMOVE_IF_UNMODIFIED_REQUEST => ResponseShape::PreviousValue,
            GET_WITH_VERSION_REQUEST => ResponseShape::Versioned,
            GET_WITH_METADATA_REQUEST => ResponseShape::Metadata,
            SIZE_REQUEST => ResponseShape::Size,
            STATS_REQUEST => ResponseShape::Stats,
            ITERATION_START_REQUEST => ResponseShape::IterationStart,
            ITERATION_NEXT_REQUEST => ResponseShape::IterationNext { metadata: false },
            _ => ResponseShape::Empty,
        }
    }
}

/// A value with its server-assigned data version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Value bytes.
    pub value: Bytes,
    /// Opaque data version; echo it back unchanged for conditional writes.
    pub version: i64,
}

impl VersionedValue {
    /// Writes the GET_WITH_VERSION payload: version then value.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_i64(self.version);
        put_array(dst, &self.value);
    }

    /// Reads the GET_WITH_VERSION payload.
    pub fn decode(reader: &mut WireReader<'_>) -> DecodeResult<Self> {
        let version = reader.read_i64()?;
        let value = reader.read_array()?;
        Ok(Self { value, version })
    }
}

/// Expiration metadata attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryMetadata {
    /// Creation time in milliseconds since the epoch, when lifespan is finite.
    pub created: Option<i64>,
    /// Lifespan, when finite.
    pub lifespan: Option<Duration>,
    /// Last access time in milliseconds since the epoch, when max-idle is finite.
    pub last_used: Option<i64>,
    /// Max-idle, when finite.
    pub max_idle: Option<Duration>,
    /// Data version.
    pub version: i64,
}

impl EntryMetadata {
    /// Writes the flags byte, optional timestamps, and the version.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut flags = 0u8;
        if self.lifespan.is_none() {
            flags |= INFINITE_LIFESPAN_FLAG;
        }
        if self.max_idle.is_none() {
            flags |= INFINITE_MAXIDLE_FLAG;
        }
        dst.put_u8(flags);
        if let Some(lifespan) = self.lifespan {
            dst.put_i64(self.created.unwrap_or(-1));
            put_vint(dst, lifespan.as_secs() as u32);
        }
        if let Some(max_idle) = self.max_idle {
            dst.put_i64(self.last_used.unwrap_or(-1));
            put_vint(dst, max_idle.as_secs() as u32);
        }
        dst.put_i64(self.version);
    }

    /// Reads the flags byte, optional timestamps, and the version.
    pub fn decode(reader: &mut WireReader<'_>) -> DecodeResult<Self> {
        let flags = reader.read_u8()?;
        let mut metadata = EntryMetadata::default();
        if flags & INFINITE_LIFESPAN_FLAG == 0 {
            metadata.created = Some(reader.read_i64()?);
            metadata.lifespan = Some(Duration::from_secs(u64::from(reader.read_vint()?)));
        }
        if flags & INFINITE_MAXIDLE_FLAG == 0 {
            metadata.last_used = Some(reader.read_i64()?);
            metadata.max_idle = Some(Duration::from_secs(u64::from(reader.read_vint()?)));
        }
        metadata.version = reader.read_i64()?;
        Ok(metadata)
    }
}

/// A value together with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataValue {
    /// Expiration metadata and version.
    pub metadata: EntryMetadata,
    /// Value bytes.
    pub value: Bytes,
}

/// One entry of an iteration batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationEntry {
    /// Key bytes.
    pub key: Bytes,
    /// Value bytes.
    pub value: Bytes,
    /// Metadata, when the iteration asked for it.
    pub metadata: Option<EntryMetadata>,
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// No payload.
    Empty,
    /// Value or previous value; `None` when absent.
    Value(Option<Bytes>),
    /// Versioned value; `None` when the key does not exist.
    Versioned(Option<VersionedValue>),
    /// Value with metadata; `None` when the key does not exist.
    Metadata(Option<MetadataValue>),
    /// Entry count.
    Size(u64),
    /// Statistics pairs in server order.
    Stats(Vec<(String, String)>),
    /// Server-assigned iteration id.
    IterationStarted(String),
    /// Iteration batch.
    IterationBatch {
        /// Bit set of segments completed by this batch.
        finished_segments: Bytes,
        /// Entries in this batch.
        entries: Vec<IterationEntry>,
    },
    /// Error message accompanying an error status.
    Error(String),
}

/// Fixed fields at the start of every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Id of the request this answers.
    pub message_id: u64,
    /// Response opcode.
    pub opcode: u8,
    /// Status byte.
    pub status: Status,
    /// New topology, present when the server flagged a topology change.
    pub topology: Option<Topology>,
}

/// A fully decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Header fields.
    pub header: ResponseHeader,
    /// Typed body.
    pub body: ResponseBody,
}

impl Response {
    /// Returns the status.
    pub fn status(&self) -> Status {
        self.header.status
    }

    /// Returns the error message if the status is an error.
    pub fn error_message(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Kind of cache event pushed to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An entry was created.
    Created,
    /// An entry was modified.
    Modified,
    /// An entry was removed.
    Removed,
    /// An entry expired.
    Expired,
}

impl EventKind {
    /// Maps an event opcode to its kind.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            CACHE_ENTRY_CREATED_EVENT => Some(EventKind::Created),
            CACHE_ENTRY_MODIFIED_EVENT => Some(EventKind::Modified),
            CACHE_ENTRY_REMOVED_EVENT => Some(EventKind::Removed),
            CACHE_ENTRY_EXPIRED_EVENT => Some(EventKind::Expired),
            _ => None,
        }
    }

    /// Returns the event opcode.
    pub fn opcode(self) -> u8 {
        match self {
            EventKind::Created => CACHE_ENTRY_CREATED_EVENT,
            EventKind::Modified => CACHE_ENTRY_MODIFIED_EVENT,
            EventKind::Removed => CACHE_ENTRY_REMOVED_EVENT,
            EventKind::Expired => CACHE_ENTRY_EXPIRED_EVENT,
        }
    }

    /// Created and modified events carry the new data version.
    pub fn carries_version(self) -> bool {
        matches!(self, EventKind::Created | EventKind::Modified)
    }
}

/// Payload of a server-pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// The key, plus the version for created/modified events.
    Key {
        /// Key bytes.
        key: Bytes,
        /// New data version, if the event kind carries one.
        version: Option<i64>,
    },
    /// Output of a server-side converter.
    Custom(Bytes),
}

/// A cache event delivered on a listener connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    /// Listener the event is addressed to.
    pub listener_id: Bytes,
    /// Event kind.
    pub kind: EventKind,
    /// The server re-sent this event after a failover.
    pub retried: bool,
    /// Event payload.
    pub payload: EventPayload,
}

impl ClientEvent {
    /// Returns the key for non-custom events.
    pub fn key(&self) -> Option<&Bytes> {
        match &self.payload {
            EventPayload::Key { key, .. } => Some(key),
            EventPayload::Custom(_) => None,
        }
    }
}

/// Anything the server sends on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Answer to a request.
    Response(Response),
    /// Event pushed to a registered listener.
    Event(ClientEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_status_success_family() {
        for raw in [0x00, 0x03, 0x06, 0x07] {
            assert!(Status::new(raw).is_success(), "{:#04x}", raw);
            assert!(!Status::new(raw).is_error());
        }
        assert!(Status::new(0x08).is_not_executed());
        assert!(Status::new(0x08).has_previous_value());
        assert!(Status::new(0x08).is_object_storage());
    }

    #[test]
    fn test_status_conditional_family() {
        assert!(Status::new(0x01).is_not_executed());
        assert!(Status::new(0x02).is_key_missing());
        assert!(!Status::new(0x02).is_success());
        assert!(!Status::new(0x02).is_error());
    }

    #[test]
    fn test_status_error_family() {
        assert!(Status::new(0x85).is_error());
        assert!(!Status::new(0x85).is_topology_stale());
        assert!(Status::new(0x87).is_topology_stale());
        assert!(Status::new(0x88).is_topology_stale());
        assert_eq!(Status::new(0x85).to_string(), "0x85");
    }

    #[test]
    fn test_shape_for_opcode() {
        assert_eq!(ResponseShape::for_opcode(0x04), ResponseShape::Value);
        assert_eq!(ResponseShape::for_opcode(0x0E), ResponseShape::PreviousValue);
        assert_eq!(ResponseShape::for_opcode(0x12), ResponseShape::Versioned);
        assert_eq!(ResponseShape::for_opcode(0x2A), ResponseShape::Size);
        assert_eq!(ResponseShape::for_opcode(0x18), ResponseShape::Empty);
        assert_eq!(ResponseShape::for_opcode(0x00), ResponseShape::Empty);
    }

    #[test]
    fn test_versioned_value_round_trip() {
        let original = VersionedValue {
            value: Bytes::from_static(b"v1"),
            version: -4_611_686_018_427_387_904,
        };
        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        let mut reader = WireReader::new(&buf);
        assert_eq!(VersionedValue::decode(&mut reader).unwrap(), original);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_metadata_round_trip_partial() {
        let original = EntryMetadata {
            created: Some(1_700_000_000_000),
            lifespan: Some(Duration::from_secs(60)),
            last_used: None,
            max_idle: None,
            version: 9,
        };
        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        assert_eq!(buf[0], INFINITE_MAXIDLE_FLAG);
        let mut reader = WireReader::new(&buf);
        assert_eq!(EntryMetadata::decode(&mut reader).unwrap(), original);
    }

    #[test]
    fn test_event_kind_opcodes() {
        for kind in [
            EventKind::Created,
            EventKind::Modified,
            EventKind::Removed,
            EventKind::Expired,
        ] {
            assert_eq!(EventKind::from_opcode(kind.opcode()), Some(kind));
        }
        assert!(EventKind::Modified.carries_version());
        assert!(!EventKind::Removed.carries_version());
        assert_eq!(EventKind::from_opcode(0x64), None);
    }
}
