//! Variable-length integer and length-prefixed field encoding.
//!
//! Hot Rod packs 7 bits per byte, least significant group first, with the
//! high bit set on every byte except the last.

use bytes::BufMut;

/// Writes an unsigned 32-bit VInt.
pub fn put_vint(dst: &mut impl BufMut, value: u32) {
    put_vlong(dst, u64::from(value));
}

/// Writes an unsigned 64-bit VLong.
pub fn put_vlong(dst: &mut impl BufMut, mut value: u64) {
    while value & !0x7F != 0 {
        dst.put_u8(((value & 0x7F) as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Writes a signed VInt using zig-zag encoding (`-1` becomes `1`).
pub fn put_signed_vint(dst: &mut impl BufMut, value: i32) {
    put_vint(dst, ((value << 1) ^ (value >> 31)) as u32);
}

/// Decodes a zig-zag encoded value back into its signed form.
pub fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Writes a VInt length prefix followed by the bytes.
pub fn put_array(dst: &mut impl BufMut, bytes: &[u8]) {
    put_vint(dst, bytes.len() as u32);
    dst.put_slice(bytes);
}

/// Writes a UTF-8 string as a length-prefixed array.
pub fn put_string(dst: &mut impl BufMut, value: &str) {
    put_array(dst, value.as_bytes());
}

/// Writes an array whose absence is encoded as signed length `-1`.
pub fn put_optional_array(dst: &mut impl BufMut, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            put_signed_vint(dst, b.len() as i32);
            dst.put_slice(b);
        }
        None => put_signed_vint(dst, -1),
    }
}

/// Returns how many bytes `value` occupies once VInt encoded.
pub fn vint_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}
