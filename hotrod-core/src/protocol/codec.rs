//! Codec implementation for framing Hot Rod requests and responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::reader::DecodeError;
use super::request::Request;
use super::response::{Inbound, ResponseShape};
use super::wire::WireCodec;
use crate::error::{HotRodError, Result};

/// A request plus the per-attempt header values.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    /// Correlation id, fresh for every attempt.
    pub message_id: u64,
    /// Topology id the client currently holds for the cache.
    pub topology_id: u64,
    /// The request itself.
    pub request: Request,
}

/// Response shapes expected for in-flight message ids.
///
/// Response bodies are not self-describing, so the decoder needs to know what
/// each outstanding request expects. Unknown ids fall back to the default
/// shape of the response opcode.
#[derive(Debug, Clone, Default)]
pub struct PendingShapes {
    inner: Arc<Mutex<HashMap<u64, ResponseShape>>>,
}

impl PendingShapes {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn shapes(&self) -> MutexGuard<'_, HashMap<u64, ResponseShape>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Records the shape expected for `message_id`.
    pub fn register(&self, message_id: u64, shape: ResponseShape) {
        self.shapes().insert(message_id, shape);
    }

    /// Forgets `message_id`.
    pub fn remove(&self, message_id: u64) -> Option<ResponseShape> {
        self.shapes().remove(&message_id)
    }

    /// Returns the shape for `message_id` without removing it.
    pub fn get(&self, message_id: u64) -> Option<ResponseShape> {
        self.shapes().get(&message_id).copied()
    }

    /// Returns the number of tracked ids.
    pub fn len(&self) -> usize {
        self.shapes().len()
    }

    /// Returns true when no ids are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Codec for encoding and decoding Hot Rod frames.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits. Encoding a
/// frame registers its expected response shape so the decoder can parse the
/// body when the answer arrives.
#[derive(Debug, Clone)]
pub struct HotRodCodec {
    wire: Arc<WireCodec>,
    shapes: PendingShapes,
}

impl HotRodCodec {
    /// Creates a codec around a shared wire codec.
    pub fn new(wire: Arc<WireCodec>) -> Self {
        Self {
            wire,
            shapes: PendingShapes::new(),
        }
    }

    /// Returns the wire codec.
    pub fn wire(&self) -> &WireCodec {
        &self.wire
    }

    /// Returns the shape table shared by clones of this codec.
    pub fn shapes(&self) -> &PendingShapes {
        &self.shapes
    }
}

impl Encoder<RequestFrame> for HotRodCodec {
    type Error = HotRodError;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> Result<()> {
        self.wire
            .encode_request(item.message_id, item.topology_id, &item.request, dst)?;
        self.shapes
            .register(item.message_id, item.request.body.expected_shape());
        Ok(())
    }
}

impl Decoder for HotRodCodec {
    type Item = Inbound;
    type Error = HotRodError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }
        let shapes = &self.shapes;
        let decoded = self.wire.decode(&src[..], |message_id, opcode| {
            shapes
                .get(message_id)
                .unwrap_or_else(|| ResponseShape::for_opcode(opcode))
        });
        match decoded {
            Ok((inbound, consumed)) => {
                src.advance(consumed);
                if let Inbound::Response(response) = &inbound {
                    self.shapes.remove(response.header.message_id);
                }
                Ok(Some(inbound))
            }
            Err(DecodeError::Incomplete) => Ok(None),
            // Frames carry no length prefix, so a bad field leaves the stream
            // position unknown.
            Err(DecodeError::Desync(message)) | Err(DecodeError::Malformed(message)) => {
                Err(HotRodError::ProtocolDesync(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use crate::protocol::request::RequestBody;
    use crate::protocol::response::ResponseBody;
    use crate::protocol::version::{ClientIntelligence, ProtocolVersion};
    use crate::protocol::vint::{put_array, put_vlong};
    use crate::protocol::wire::write_response_header;
    use bytes::{BufMut, Bytes};

    fn codec() -> HotRodCodec {
        HotRodCodec::new(Arc::new(WireCodec::new(
            ProtocolVersion::LATEST,
            ClientIntelligence::Basic,
        )))
    }

    fn versioned_get(message_id: u64) -> RequestFrame {
        RequestFrame {
            message_id,
            topology_id: 0,
            request: Request::new(
                "",
                RequestBody::GetWithVersion {
                    key: Bytes::from_static(b"k"),
                },
            ),
        }
    }

    #[test]
    fn test_encode_registers_shape() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(versioned_get(5), &mut buf).unwrap();
        assert!(!buf.is_empty());
        assert_eq!(codec.shapes().get(5), Some(ResponseShape::Versioned));
    }

    #[test]
    fn test_decode_uses_registered_shape_and_forgets_it() {
        let mut codec = codec();
        let mut scratch = BytesMut::new();
        codec.encode(versioned_get(5), &mut scratch).unwrap();

        let mut buf = BytesMut::new();
        write_response_header(&mut buf, 5, GET_WITH_VERSION_REQUEST + 1, NO_ERROR_STATUS, None).unwrap();
        buf.put_i64(42);
        put_array(&mut buf, b"v");

        let inbound = codec.decode(&mut buf).unwrap().unwrap();
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        match response.body {
            ResponseBody::Versioned(Some(v)) => assert_eq!(v.version, 42),
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
        assert!(codec.shapes().is_empty());
    }

    #[test]
    fn test_decode_incomplete_keeps_bytes_and_shape() {
        let mut codec = codec();
        let mut scratch = BytesMut::new();
        codec.encode(versioned_get(7), &mut scratch).unwrap();

        let mut full = BytesMut::new();
        write_response_header(&mut full, 7, GET_WITH_VERSION_REQUEST + 1, NO_ERROR_STATUS, None).unwrap();
        full.put_i64(1);
        put_array(&mut full, b"value");

        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 2);
        assert_eq!(codec.shapes().get(7), Some(ResponseShape::Versioned));

        partial.extend_from_slice(&full[full.len() - 2..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        write_response_header(&mut buf, 1, PING_REQUEST + 1, NO_ERROR_STATUS, None).unwrap();
        write_response_header(&mut buf, 2, PING_REQUEST + 1, NO_ERROR_STATUS, None).unwrap();
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_runaway_vint_is_desync() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        buf.put_u8(RESPONSE_MAGIC);
        buf.put_slice(&[0xFF; 11]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, HotRodError::ProtocolDesync(_)));
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_decode_wrong_magic_is_desync() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        buf.put_u8(REQUEST_MAGIC);
        put_vlong(&mut buf, 1);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(HotRodError::ProtocolDesync(_))
        ));
    }

    #[test]
    fn test_failed_encode_registers_no_shape() {
        let mut codec = codec();
        let mut frame = versioned_get(9);
        frame.topology_id = u64::MAX;
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(HotRodError::Protocol(_))
        ));
        assert!(codec.shapes().is_empty());
    }
}
