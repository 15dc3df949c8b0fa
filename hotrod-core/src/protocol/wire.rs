//! Version-aware frame encoding and decoding.
//!
//! One [`WireCodec`] value covers every supported protocol version. Behavior
//! that differs between versions is picked once, at construction, into a small
//! table of functions; everything else checks the capability predicates on
//! [`ProtocolVersion`].

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::constants::*;
use super::reader::{DecodeError, DecodeResult, WireReader};
use super::request::{Expiration, FactoryRef, Lifetime, MediaType, Request, RequestBody};
use super::response::*;
use super::version::{ClientIntelligence, ProtocolVersion};
use super::vint::*;
use crate::error::{HotRodError, Result};
use crate::topology::{SegmentOwners, ServerAddress, Topology};

type ExpirationFlagsFn = fn(&Expiration) -> u32;
type WriteExpirationFn = fn(&mut BytesMut, &Expiration);
type WriteListenerOptionsFn = fn(&mut BytesMut, bool);
type ReadEventMarkersFn = fn(&mut WireReader<'_>) -> DecodeResult<(u8, bool)>;

#[derive(Clone, Copy)]
struct Behaviors {
    expiration_flags: ExpirationFlagsFn,
    write_expiration: WriteExpirationFn,
    write_listener_options: WriteListenerOptionsFn,
    read_event_markers: ReadEventMarkersFn,
}

impl Behaviors {
    fn for_version(version: ProtocolVersion) -> Self {
        let mut behaviors = Behaviors {
            expiration_flags: seconds_expiration_flags,
            write_expiration: write_seconds_expiration,
            write_listener_options: write_no_listener_options,
            read_event_markers: read_no_event_markers,
        };
        if version.supports_listener_include_state() {
            behaviors.write_listener_options = write_listener_options;
            behaviors.read_event_markers = read_event_markers;
        }
        if version.supports_time_units() {
            behaviors.expiration_flags = no_expiration_flags;
            behaviors.write_expiration = write_unit_expiration;
        }
        behaviors
    }
}

fn seconds_expiration_flags(expiration: &Expiration) -> u32 {
    let mut flags = 0;
    if expiration.lifespan == Lifetime::Default {
        flags |= DEFAULT_LIFESPAN;
    }
    if expiration.max_idle == Lifetime::Default {
        flags |= DEFAULT_MAXIDLE;
    }
    flags
}

fn no_expiration_flags(_: &Expiration) -> u32 {
    0
}

fn write_seconds_expiration(dst: &mut BytesMut, expiration: &Expiration) {
    put_vint(dst, expiration.lifespan.whole_seconds());
    put_vint(dst, expiration.max_idle.whole_seconds());
}

fn write_unit_expiration(dst: &mut BytesMut, expiration: &Expiration) {
    let (lifespan_unit, lifespan) = expiration.lifespan.to_wire();
    let (max_idle_unit, max_idle) = expiration.max_idle.to_wire();
    dst.put_u8((lifespan_unit << 4) | max_idle_unit);
    if let Some(value) = lifespan {
        put_vlong(dst, value);
    }
    if let Some(value) = max_idle {
        put_vlong(dst, value);
    }
}

fn write_no_listener_options(_: &mut BytesMut, _: bool) {}

fn write_listener_options(dst: &mut BytesMut, include_state: bool) {
    dst.put_u8(u8::from(include_state));
}

fn read_no_event_markers(_: &mut WireReader<'_>) -> DecodeResult<(u8, bool)> {
    Ok((0, false))
}

fn read_event_markers(reader: &mut WireReader<'_>) -> DecodeResult<(u8, bool)> {
    let custom = reader.read_u8()?;
    let retried = reader.read_u8()? != 0;
    Ok((custom, retried))
}

fn write_media_type(dst: &mut BytesMut, media_type: &MediaType) {
    match media_type {
        MediaType::Unspecified => dst.put_u8(MEDIA_TYPE_NONE),
        MediaType::Custom(mime) => {
            dst.put_u8(MEDIA_TYPE_CUSTOM);
            put_string(dst, mime);
            put_vint(dst, 0);
        }
    }
}

fn write_factory(dst: &mut BytesMut, factory: Option<&FactoryRef>) -> Result<()> {
    match factory {
        Some(factory) if !factory.name.is_empty() => {
            let count = u8::try_from(factory.params.len()).map_err(|_| {
                HotRodError::Protocol(format!(
                    "factory {} has {} parameters, at most 255 fit in a frame",
                    factory.name,
                    factory.params.len()
                ))
            })?;
            put_string(dst, &factory.name);
            dst.put_u8(count);
            for param in &factory.params {
                put_array(dst, param);
            }
        }
        _ => put_string(dst, ""),
    }
    Ok(())
}

/// Topology ids travel as a 32-bit VInt.
fn wire_topology_id(topology_id: u64) -> Result<u32> {
    u32::try_from(topology_id).map_err(|_| {
        HotRodError::Protocol(format!(
            "topology id {} does not fit in 32 bits",
            topology_id
        ))
    })
}

/// Frames requests and parses responses for one protocol version.
#[derive(Clone)]
pub struct WireCodec {
    version: ProtocolVersion,
    intelligence: ClientIntelligence,
    key_media_type: MediaType,
    value_media_type: MediaType,
    behaviors: Behaviors,
}

impl fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireCodec")
            .field("version", &self.version)
            .field("intelligence", &self.intelligence)
            .field("key_media_type", &self.key_media_type)
            .field("value_media_type", &self.value_media_type)
            .finish()
    }
}

impl WireCodec {
    /// Creates a codec for `version`, announcing `intelligence` in every request.
    pub fn new(version: ProtocolVersion, intelligence: ClientIntelligence) -> Self {
        Self {
            version,
            intelligence,
            key_media_type: MediaType::Unspecified,
            value_media_type: MediaType::Unspecified,
            behaviors: Behaviors::for_version(version),
        }
    }

    /// Sets the media types sent with requests when the version carries them.
    pub fn with_media_types(mut self, key: MediaType, value: MediaType) -> Self {
        self.key_media_type = key;
        self.value_media_type = value;
        self
    }

    /// Returns the protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Returns the intelligence level announced to servers.
    pub fn intelligence(&self) -> ClientIntelligence {
        self.intelligence
    }

    /// Whether the server may report object-storage success statuses.
    pub fn supports_object_storage_hint(&self) -> bool {
        self.version.supports_object_storage_hint()
    }

    /// Whether near-cache listeners may be gated by a bloom filter.
    pub fn supports_bloom_filter(&self) -> bool {
        self.version.supports_bloom_filter()
    }

    /// Whether iteration can target a segment subset.
    pub fn supports_iteration_segments(&self) -> bool {
        self.version.supports_iteration_segments()
    }

    /// Whether iteration can return entry metadata.
    pub fn supports_iteration_metadata(&self) -> bool {
        self.version.supports_iteration_metadata()
    }

    /// Appends a complete request frame to `dst`.
    ///
    /// The header is magic, message id, version, opcode, cache name, flags,
    /// intelligence and topology id. On error `dst` may hold a partial frame.
    pub fn encode_request(
        &self,
        message_id: u64,
        topology_id: u64,
        request: &Request,
        dst: &mut BytesMut,
    ) -> Result<()> {
        let topology_id = wire_topology_id(topology_id)?;
        let mut flags = request.flags;
        if let Some(expiration) = request.body.expiration() {
            flags |= (self.behaviors.expiration_flags)(expiration);
        }

        dst.put_u8(REQUEST_MAGIC);
        put_vlong(dst, message_id);
        dst.put_u8(self.version.as_byte());
        dst.put_u8(request.body.opcode());
        put_string(dst, &request.cache_name);
        put_vint(dst, flags);
        dst.put_u8(self.intelligence.as_byte());
        put_vint(dst, topology_id);
        if self.version.supports_media_types() {
            write_media_type(dst, &self.key_media_type);
            write_media_type(dst, &self.value_media_type);
        }

        self.encode_body(&request.body, dst)
    }

    fn encode_body(&self, body: &RequestBody, dst: &mut BytesMut) -> Result<()> {
        match body {
            RequestBody::Get { key }
            | RequestBody::GetWithVersion { key }
            | RequestBody::GetWithMetadata { key }
            | RequestBody::ContainsKey { key }
            | RequestBody::Remove { key } => put_array(dst, key),
            RequestBody::Put {
                key,
                value,
                expiration,
            }
            | RequestBody::PutIfAbsent {
                key,
                value,
                expiration,
            }
            | RequestBody::Replace {
                key,
                value,
                expiration,
            } => {
                put_array(dst, key);
                (self.behaviors.write_expiration)(dst, expiration);
                put_array(dst, value);
            }
            RequestBody::ReplaceIfUnmodified {
                key,
                value,
                expiration,
                version,
            } => {
                put_array(dst, key);
                (self.behaviors.write_expiration)(dst, expiration);
                dst.put_i64(*version);
                put_array(dst, value);
            }
            RequestBody::RemoveIfUnmodified { key, version } => {
                put_array(dst, key);
                dst.put_i64(*version);
            }
            RequestBody::Clear | RequestBody::Size | RequestBody::Stats | RequestBody::Ping => {}
            RequestBody::AddClientListener {
                listener_id,
                include_current_state,
                filter,
                converter,
                use_raw_data,
            } => {
                put_array(dst, listener_id);
                (self.behaviors.write_listener_options)(dst, *include_current_state);
                write_factory(dst, filter.as_ref())?;
                write_factory(dst, converter.as_ref())?;
                if self.version.supports_listener_include_state() {
                    dst.put_u8(u8::from(*use_raw_data));
                }
                if self.version.supports_listener_interests() {
                    // Created, modified, removed, expired.
                    put_vint(dst, 0x0F);
                }
            }
            RequestBody::AddBloomNearCacheListener {
                listener_id,
                bloom_bits,
            } => {
                put_array(dst, listener_id);
                put_vint(dst, *bloom_bits);
            }
            RequestBody::UpdateBloomFilter { listener_id, bits } => {
                put_array(dst, listener_id);
                put_array(dst, bits);
            }
            RequestBody::RemoveClientListener { listener_id } => put_array(dst, listener_id),
            RequestBody::IterationStart {
                segments,
                filter,
                batch_size,
                metadata,
            } => {
                if self.version.supports_iteration_segments() {
                    put_optional_array(dst, segments.as_deref());
                }
                write_factory(dst, filter.as_ref())?;
                put_vint(dst, *batch_size);
                if self.version.supports_iteration_metadata() {
                    dst.put_u8(u8::from(*metadata));
                }
            }
            RequestBody::IterationNext { iteration_id, .. }
            | RequestBody::IterationEnd { iteration_id } => put_string(dst, iteration_id),
        }
        Ok(())
    }

    /// Parses one frame from the start of `buf`.
    ///
    /// `shape_of` maps a message id and response opcode to the body layout the
    /// caller expects. Returns the decoded frame and the number of bytes it
    /// occupied; `DecodeError::Incomplete` means more bytes are needed.
    pub fn decode(
        &self,
        buf: &[u8],
        shape_of: impl FnOnce(u64, u8) -> ResponseShape,
    ) -> DecodeResult<(Inbound, usize)> {
        let mut reader = WireReader::new(buf);
        let magic = reader.read_u8()?;
        if magic != RESPONSE_MAGIC {
            return Err(DecodeError::Desync(format!(
                "invalid response magic {:#04x}",
                magic
            )));
        }
        let message_id = reader.read_vlong()?;
        let opcode = reader.read_u8()?;
        let status = Status::new(reader.read_u8()?);
        let topology = if reader.read_u8()? != 0 {
            Some(self.read_topology(&mut reader)?)
        } else {
            None
        };

        if let Some(kind) = EventKind::from_opcode(opcode) {
            let event = self.read_event(&mut reader, kind)?;
            return Ok((Inbound::Event(event), reader.position()));
        }

        let body = if status.is_error() || opcode == ERROR_RESPONSE {
            ResponseBody::Error(reader.read_string()?)
        } else {
            self.read_body(&mut reader, shape_of(message_id, opcode), status)?
        };

        let response = Response {
            header: ResponseHeader {
                message_id,
                opcode,
                status,
                topology,
            },
            body,
        };
        Ok((Inbound::Response(response), reader.position()))
    }

    fn read_topology(&self, reader: &mut WireReader<'_>) -> DecodeResult<Topology> {
        let id = u64::from(reader.read_vint()?);
        let server_count = reader.read_vint()? as usize;
        let mut servers = Vec::with_capacity(server_count.min(1024));
        for _ in 0..server_count {
            let host = reader.read_string()?;
            let port = reader.read_u16()?;
            servers.push(ServerAddress::new(host, port));
        }
        if self.intelligence != ClientIntelligence::HashDistributionAware {
            return Ok(Topology::servers_only(id, servers));
        }

        let hash_version = reader.read_u8()?;
        let segment_count = reader.read_vint()?;
        let mut segments = Vec::with_capacity((segment_count as usize).min(4096));
        for segment in 0..segment_count {
            let owner_count = reader.read_u8()?;
            let mut owners = Vec::with_capacity(usize::from(owner_count));
            for _ in 0..owner_count {
                let index = reader.read_vint()? as usize;
                let owner = servers.get(index).cloned().ok_or_else(|| {
                    DecodeError::Malformed(format!(
                        "segment {} names server index {} of {}",
                        segment, index, server_count
                    ))
                })?;
                owners.push(owner);
            }
            segments.push(SegmentOwners::new(segment, owners));
        }
        Ok(Topology::new(id, servers, segments, hash_version))
    }

    fn read_event(&self, reader: &mut WireReader<'_>, kind: EventKind) -> DecodeResult<ClientEvent> {
        let listener_id = reader.read_array()?;
        let (custom, retried) = (self.behaviors.read_event_markers)(reader)?;
        let payload = if custom != 0 {
            EventPayload::Custom(reader.read_array()?)
        } else {
            let key = reader.read_array()?;
            let version = if kind.carries_version() {
                Some(reader.read_i64()?)
            } else {
                None
            };
            EventPayload::Key { key, version }
        };
        Ok(ClientEvent {
            listener_id,
            kind,
            retried,
            payload,
        })
    }

    fn read_body(
        &self,
        reader: &mut WireReader<'_>,
        shape: ResponseShape,
        status: Status,
    ) -> DecodeResult<ResponseBody> {
        let body = match shape {
            ResponseShape::Empty => ResponseBody::Empty,
            ResponseShape::Value => {
                if status.is_success() {
                    ResponseBody::Value(Some(reader.read_array()?))
                } else {
                    ResponseBody::Value(None)
                }
            }
            ResponseShape::PreviousValue => {
                if status.has_previous_value() {
                    let previous = reader.read_array()?;
                    ResponseBody::Value((!previous.is_empty()).then_some(previous))
                } else {
                    ResponseBody::Value(None)
                }
            }
            ResponseShape::Versioned => {
                if status.is_success() {
                    ResponseBody::Versioned(Some(VersionedValue::decode(reader)?))
                } else {
                    ResponseBody::Versioned(None)
                }
            }
            ResponseShape::Metadata => {
                if status.is_success() {
                    let metadata = EntryMetadata::decode(reader)?;
                    let value = reader.read_array()?;
                    ResponseBody::Metadata(Some(MetadataValue { metadata, value }))
                } else {
                    ResponseBody::Metadata(None)
                }
            }
            ResponseShape::Size => ResponseBody::Size(reader.read_vlong()?),
            ResponseShape::Stats => {
                let count = reader.read_vint()? as usize;
                let mut stats = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    let name = reader.read_string()?;
                    let value = reader.read_string()?;
                    stats.push((name, value));
                }
                ResponseBody::Stats(stats)
            }
            ResponseShape::IterationStart => ResponseBody::IterationStarted(reader.read_string()?),
            ResponseShape::IterationNext { metadata } => {
                if !status.is_success() {
                    return Ok(ResponseBody::Empty);
                }
                let finished_segments = if self.version.supports_iteration_segments() {
                    reader.read_array()?
                } else {
                    Bytes::new()
                };
                let count = reader.read_vint()? as usize;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let metadata = if metadata
                        && self.version.supports_iteration_metadata()
                        && reader.read_u8()? != 0
                    {
                        Some(EntryMetadata::decode(reader)?)
                    } else {
                        None
                    };
                    let key = reader.read_array()?;
                    let value = reader.read_array()?;
                    entries.push(IterationEntry {
                        key,
                        value,
                        metadata,
                    });
                }
                ResponseBody::IterationBatch {
                    finished_segments,
                    entries,
                }
            }
        };
        Ok(body)
    }
}

/// Writes a response header; servers and test doubles use it to build frames.
pub fn write_response_header(
    dst: &mut BytesMut,
    message_id: u64,
    opcode: u8,
    status: u8,
    topology: Option<(&Topology, ClientIntelligence)>,
) -> Result<()> {
    dst.put_u8(RESPONSE_MAGIC);
    put_vlong(dst, message_id);
    dst.put_u8(opcode);
    dst.put_u8(status);
    match topology {
        Some((topology, intelligence)) => {
            dst.put_u8(1);
            write_topology(dst, topology, intelligence)
        }
        None => {
            dst.put_u8(0);
            Ok(())
        }
    }
}

/// Writes a topology block in the layout matching `intelligence`.
///
/// Fails when the id exceeds 32 bits or a segment names an owner missing
/// from the server list.
pub fn write_topology(
    dst: &mut BytesMut,
    topology: &Topology,
    intelligence: ClientIntelligence,
) -> Result<()> {
    put_vint(dst, wire_topology_id(topology.id())?);
    put_vint(dst, topology.servers().len() as u32);
    for server in topology.servers() {
        put_string(dst, server.host());
        dst.put_u16(server.port());
    }
    if intelligence != ClientIntelligence::HashDistributionAware {
        return Ok(());
    }
    dst.put_u8(topology.hash_version());
    put_vint(dst, topology.segment_count());
    for segment in topology.segments() {
        dst.put_u8(segment.owners().len() as u8);
        for owner in segment.owners() {
            let index = topology
                .servers()
                .iter()
                .position(|s| s == owner)
                .ok_or_else(|| {
                    HotRodError::Protocol(format!(
                        "segment {} owner {} is not a topology member",
                        segment.segment(),
                        owner
                    ))
                })?;
            put_vint(dst, index as u32);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> ServerAddress {
        ServerAddress::new("127.0.0.1", port)
    }

    fn get(key: &'static [u8]) -> Request {
        Request::new(
            "users",
            RequestBody::Get {
                key: Bytes::from_static(key),
            },
        )
    }

    #[test]
    fn test_request_header_layout() {
        let codec = WireCodec::new(ProtocolVersion::V2_0, ClientIntelligence::HashDistributionAware);
        let mut buf = BytesMut::new();
        codec.encode_request(300, 5, &get(b"k"), &mut buf).unwrap();

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.read_u8(), Ok(REQUEST_MAGIC));
        assert_eq!(reader.read_vlong(), Ok(300));
        assert_eq!(reader.read_u8(), Ok(20));
        assert_eq!(reader.read_u8(), Ok(GET_REQUEST));
        assert_eq!(reader.read_string().unwrap(), "users");
        assert_eq!(reader.read_vint(), Ok(0));
        assert_eq!(reader.read_u8(), Ok(0x03));
        assert_eq!(reader.read_vint(), Ok(5));
        assert_eq!(&reader.read_array().unwrap()[..], b"k");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_media_types_only_from_2_8() {
        let request = get(b"k");
        let mut old = BytesMut::new();
        WireCodec::new(ProtocolVersion::V2_7, ClientIntelligence::Basic)
            .with_media_types(MediaType::octet_stream(), MediaType::octet_stream())
            .encode_request(1, 0, &request, &mut old).unwrap();
        let mut new = BytesMut::new();
        WireCodec::new(ProtocolVersion::V2_8, ClientIntelligence::Basic)
            .encode_request(1, 0, &request, &mut new).unwrap();
        // Two MEDIA_TYPE_NONE bytes.
        assert_eq!(new.len(), old.len() + 2);
    }

    #[test]
    fn test_pre_2_2_expiration_uses_default_flags() {
        let codec = WireCodec::new(ProtocolVersion::V2_1, ClientIntelligence::Basic);
        let request = Request::new(
            "",
            RequestBody::Put {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                expiration: Expiration::server_default(),
            },
        );
        let mut buf = BytesMut::new();
        codec.encode_request(1, 0, &request, &mut buf).unwrap();
        let mut reader = WireReader::new(&buf);
        reader.skip(4).unwrap();
        reader.read_string().unwrap();
        assert_eq!(reader.read_vint(), Ok(DEFAULT_LIFESPAN | DEFAULT_MAXIDLE));
        reader.skip(2).unwrap();
        reader.read_array().unwrap();
        assert_eq!(reader.read_vint(), Ok(0));
        assert_eq!(reader.read_vint(), Ok(0));
        assert_eq!(&reader.read_array().unwrap()[..], b"v");
    }

    #[test]
    fn test_time_unit_expiration() {
        let codec = WireCodec::new(ProtocolVersion::V2_4, ClientIntelligence::Basic);
        let request = Request::new(
            "",
            RequestBody::Put {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                expiration: Expiration::lifespan(Duration::from_secs(120))
                    .with_max_idle(Lifetime::Infinite),
            },
        );
        let mut buf = BytesMut::new();
        codec.encode_request(1, 0, &request, &mut buf).unwrap();
        let mut reader = WireReader::new(&buf);
        reader.skip(4).unwrap();
        reader.read_string().unwrap();
        assert_eq!(reader.read_vint(), Ok(0));
        reader.skip(2).unwrap();
        reader.read_array().unwrap();
        assert_eq!(
            reader.read_u8(),
            Ok((TIME_UNIT_MINUTES << 4) | TIME_UNIT_INFINITE)
        );
        assert_eq!(reader.read_vlong(), Ok(2));
        assert_eq!(&reader.read_array().unwrap()[..], b"v");
    }

    #[test]
    fn test_decode_value_response() {
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::Basic);
        let mut buf = BytesMut::new();
        write_response_header(&mut buf, 9, GET_REQUEST + 1, NO_ERROR_STATUS, None).unwrap();
        put_array(&mut buf, b"value");

        let (inbound, consumed) = codec.decode(&buf, |_, op| ResponseShape::for_opcode(op)).unwrap();
        assert_eq!(consumed, buf.len());
        match inbound {
            Inbound::Response(r) => {
                assert_eq!(r.header.message_id, 9);
                assert_eq!(r.body, ResponseBody::Value(Some(Bytes::from_static(b"value"))));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_incomplete_then_complete() {
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::Basic);
        let mut buf = BytesMut::new();
        write_response_header(&mut buf, 1, GET_REQUEST + 1, NO_ERROR_STATUS, None).unwrap();
        put_array(&mut buf, b"value");
        for cut in 0..buf.len() {
            assert_eq!(
                codec.decode(&buf[..cut], |_, op| ResponseShape::for_opcode(op)).err(),
                Some(DecodeError::Incomplete)
            );
        }
    }

    #[test]
    fn test_decode_bad_magic_is_desync() {
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::Basic);
        let result = codec.decode(&[0xA0, 0x01], |_, op| ResponseShape::for_opcode(op));
        assert!(matches!(result, Err(DecodeError::Desync(_))));
    }

    #[test]
    fn test_decode_topology_block() {
        let topology = Topology::from_owner_table(
            4,
            vec![vec![addr(1)], vec![addr(1), addr(2)], vec![addr(2)], vec![addr(2)]],
        );
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::HashDistributionAware);
        let mut buf = BytesMut::new();
        write_response_header(
            &mut buf,
            2,
            PING_REQUEST + 1,
            NO_ERROR_STATUS,
            Some((&topology, ClientIntelligence::HashDistributionAware)),
        )
        .unwrap();
        let (inbound, _) = codec.decode(&buf, |_, op| ResponseShape::for_opcode(op)).unwrap();
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        assert_eq!(response.header.topology, Some(topology));
    }

    #[test]
    fn test_decode_servers_only_topology() {
        let topology = Topology::servers_only(3, vec![addr(1), addr(2)]);
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::TopologyAware);
        let mut buf = BytesMut::new();
        write_response_header(
            &mut buf,
            2,
            PING_REQUEST + 1,
            NO_ERROR_STATUS,
            Some((&topology, ClientIntelligence::TopologyAware)),
        )
        .unwrap();
        let (inbound, _) = codec.decode(&buf, |_, op| ResponseShape::for_opcode(op)).unwrap();
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        assert_eq!(response.header.topology, Some(topology));
    }

    #[test]
    fn test_decode_error_status_reads_message() {
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::Basic);
        let mut buf = BytesMut::new();
        write_response_header(&mut buf, 3, ERROR_RESPONSE, SERVER_ERROR_STATUS, None).unwrap();
        put_string(&mut buf, "boom");
        let (inbound, _) = codec.decode(&buf, |_, op| ResponseShape::for_opcode(op)).unwrap();
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        assert!(response.status().is_error());
        assert_eq!(response.error_message(), Some("boom"));
    }

    #[test]
    fn test_decode_modified_event() {
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::Basic);
        let mut buf = BytesMut::new();
        write_response_header(&mut buf, 0, CACHE_ENTRY_MODIFIED_EVENT, NO_ERROR_STATUS, None).unwrap();
        put_array(&mut buf, b"listener");
        buf.put_u8(0);
        buf.put_u8(1);
        put_array(&mut buf, b"k1");
        buf.put_i64(77);
        let (inbound, consumed) = codec.decode(&buf, |_, _| ResponseShape::Empty).unwrap();
        assert_eq!(consumed, buf.len());
        let Inbound::Event(event) = inbound else {
            panic!("expected event");
        };
        assert_eq!(event.kind, EventKind::Modified);
        assert!(event.retried);
        assert_eq!(
            event.payload,
            EventPayload::Key {
                key: Bytes::from_static(b"k1"),
                version: Some(77)
            }
        );
    }

    #[test]
    fn test_decode_removed_event_2_0_has_no_markers() {
        let codec = WireCodec::new(ProtocolVersion::V2_0, ClientIntelligence::Basic);
        let mut buf = BytesMut::new();
        write_response_header(&mut buf, 0, CACHE_ENTRY_REMOVED_EVENT, NO_ERROR_STATUS, None).unwrap();
        put_array(&mut buf, b"listener");
        put_array(&mut buf, b"k1");
        let (inbound, consumed) = codec.decode(&buf, |_, _| ResponseShape::Empty).unwrap();
        assert_eq!(consumed, buf.len());
        let Inbound::Event(event) = inbound else {
            panic!("expected event");
        };
        assert_eq!(event.key().map(|k| &k[..]), Some(&b"k1"[..]));
    }

    #[test]
    fn test_previous_value_empty_array_is_none() {
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::Basic);
        let mut buf = BytesMut::new();
        write_response_header(&mut buf, 1, PUT_REQUEST + 1, SUCCESS_WITH_PREVIOUS_STATUS, None).unwrap();
        put_array(&mut buf, b"");
        let (inbound, _) = codec.decode(&buf, |_, op| ResponseShape::for_opcode(op)).unwrap();
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        assert_eq!(response.body, ResponseBody::Value(None));
    }

    #[test]
    fn test_iteration_batch_with_segments() {
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::Basic);
        let mut buf = BytesMut::new();
        write_response_header(&mut buf, 1, ITERATION_NEXT_REQUEST + 1, NO_ERROR_STATUS, None).unwrap();
        put_array(&mut buf, &[0b0000_0101]);
        put_vint(&mut buf, 1);
        put_array(&mut buf, b"k");
        put_array(&mut buf, b"v");
        let (inbound, _) = codec
            .decode(&buf, |_, _| ResponseShape::IterationNext { metadata: false })
            .unwrap();
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        match response.body {
            ResponseBody::IterationBatch {
                finished_segments,
                entries,
            } => {
                assert_eq!(&finished_segments[..], &[0b0000_0101]);
                assert_eq!(entries.len(), 1);
                assert_eq!(&entries[0].key[..], b"k");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_topology_id_beyond_32_bits_is_rejected() {
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::HashDistributionAware);
        let mut buf = BytesMut::new();
        let err = codec
            .encode_request(1, u64::from(u32::MAX) + 1, &get(b"k"), &mut buf)
            .unwrap_err();
        assert!(matches!(err, HotRodError::Protocol(_)));

        let topology = Topology::servers_only(u64::MAX, vec![addr(1)]);
        let mut buf = BytesMut::new();
        assert!(write_topology(&mut buf, &topology, ClientIntelligence::TopologyAware).is_err());
    }

    #[test]
    fn test_too_many_factory_params_is_rejected() {
        let mut filter = FactoryRef::new("by-prefix");
        for i in 0..256u32 {
            filter = filter.param(Bytes::from(i.to_be_bytes().to_vec()));
        }
        let request = Request::new(
            "users",
            RequestBody::IterationStart {
                segments: None,
                filter: Some(filter),
                batch_size: 10,
                metadata: false,
            },
        );
        let codec = WireCodec::new(ProtocolVersion::LATEST, ClientIntelligence::Basic);
        let mut buf = BytesMut::new();
        let err = codec.encode_request(1, 0, &request, &mut buf).unwrap_err();
        assert!(matches!(err, HotRodError::Protocol(_)));
    }

    #[test]
    fn test_owner_outside_server_list_is_rejected() {
        let topology = Topology::new(
            2,
            vec![addr(1)],
            vec![SegmentOwners::new(0, vec![addr(2)])],
            0,
        );
        let mut buf = BytesMut::new();
        let err = write_topology(&mut buf, &topology, ClientIntelligence::HashDistributionAware)
            .unwrap_err();
        assert!(matches!(err, HotRodError::Protocol(_)));
    }
}
