#![no_main]

use std::sync::Arc;

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use hotrod_core::protocol::{
    ClientIntelligence, HotRodCodec, Inbound, ProtocolVersion, WireCodec,
};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, payload)) = data.split_first() else {
        return;
    };
    let version = ProtocolVersion::ALL[usize::from(selector) % ProtocolVersion::ALL.len()];
    let intelligence = match selector >> 6 {
        0 => ClientIntelligence::Basic,
        1 => ClientIntelligence::TopologyAware,
        _ => ClientIntelligence::HashDistributionAware,
    };
    let mut codec = HotRodCodec::new(Arc::new(WireCodec::new(version, intelligence)));
    let mut buf = BytesMut::from(payload);

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(Inbound::Response(response))) => {
                let _ = response.status().is_success();
                let _ = response.error_message();
                if let Some(topology) = &response.header.topology {
                    for segment in 0..topology.segment_count() {
                        let _ = topology.owners_of(segment);
                    }
                }
            }
            Ok(Some(Inbound::Event(event))) => {
                let _ = event.key();
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
});
