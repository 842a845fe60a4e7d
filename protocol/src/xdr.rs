//! XDR primitive encode/decode over `BytesMut`.
//!
//! NDMP messages are XDR-encoded: everything is big-endian and padded to
//! four-byte alignment.  Quantities wider than 32 bits ("hyper") are eight
//! big-endian bytes.  Variable-length opaques and strings carry a u32
//! length followed by the bytes and zero padding up to the next 4-byte
//! boundary.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};

pub fn put_u32(buf: &mut BytesMut, v: u32) {
    buf.put_u32(v);
}

pub fn put_u64(buf: &mut BytesMut, v: u64) {
    buf.put_u64(v);
}

pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_u32(buf, data.len() as u32);
    buf.put_slice(data);
    let pad = (4 - data.len() % 4) % 4;
    buf.put_bytes(0, pad);
}

pub fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Fixed-length opaque: raw bytes, no length prefix.  The caller is
/// responsible for the length being a multiple of four (all fixed opaques
/// in NDMP v4 are).
pub fn put_fixed(buf: &mut BytesMut, data: &[u8]) {
    debug_assert_eq!(data.len() % 4, 0);
    buf.put_slice(data);
}

pub fn get_u32(buf: &mut BytesMut) -> Result<u32> {
    if buf.remaining() < 4 {
        bail!("short XDR buffer: need 4 bytes, have {}", buf.remaining());
    }
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut BytesMut) -> Result<u64> {
    if buf.remaining() < 8 {
        bail!("short XDR buffer: need 8 bytes, have {}", buf.remaining());
    }
    Ok(buf.get_u64())
}

pub fn get_bytes(buf: &mut BytesMut) -> Result<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    let padded = len + (4 - len % 4) % 4;
    if buf.remaining() < padded {
        bail!(
            "short XDR buffer: opaque of {} bytes, have {}",
            padded,
            buf.remaining()
        );
    }
    let data = buf[..len].to_vec();
    buf.advance(padded);
    Ok(data)
}

pub fn get_str(buf: &mut BytesMut) -> Result<String> {
    let data = get_bytes(buf)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

pub fn get_fixed(buf: &mut BytesMut, len: usize) -> Result<Vec<u8>> {
    if buf.remaining() < len {
        bail!(
            "short XDR buffer: fixed opaque of {} bytes, have {}",
            len,
            buf.remaining()
        );
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}
