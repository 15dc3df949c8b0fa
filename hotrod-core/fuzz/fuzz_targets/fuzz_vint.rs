#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use hotrod_core::protocol::vint::{put_vlong, vint_size};
use hotrod_core::protocol::WireReader;

fuzz_target!(|data: &[u8]| {
    let mut reader = WireReader::new(data);
    while reader.remaining() > 0 {
        let start = reader.position();
        match reader.read_vlong() {
            Ok(value) => {
                let mut buf = BytesMut::new();
                put_vlong(&mut buf, value);
                assert_eq!(buf.len(), vint_size(value));
                assert!(buf.len() <= reader.position() - start);
            }
            Err(_) => break,
        }
    }

    let mut reader = WireReader::new(data);
    while reader.read_array().is_ok() {}
});
