//! Length-prefixed big-endian codec for Meteor's on-disk structures.
//!
//! All multi-byte integers are big-endian. Variable-length data (`bytes`,
//! `string`) carries a `u32` length prefix. Writers append to a growable
//! `BytesMut`; readers consume from a `&mut &[u8]` cursor that advances as
//! it reads.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Errors raised while decoding a serialized structure.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("truncated input: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("invalid {what} tag: 0x{tag:02x}")]
    InvalidTag { what: &'static str, tag: u8 },
}

type Result<T> = std::result::Result<T, CodecError>;

fn ensure(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        return Err(CodecError::Truncated {
            expected: need,
            actual: buf.len(),
        });
    }
    Ok(())
}

// ── Readers ──────────────────────────────────────────────────────────────

pub fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    let v = buf[0];
    *buf = &buf[1..];
    Ok(v)
}

pub fn read_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    let v = u16::from_be_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(v)
}

pub fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    let v = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

pub fn read_u64(buf: &mut &[u8]) -> Result<u64> {
    ensure(buf, 8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[..8]);
    *buf = &buf[8..];
    Ok(u64::from_be_bytes(arr))
}

pub fn read_i8(buf: &mut &[u8]) -> Result<i8> {
    Ok(read_u8(buf)? as i8)
}

pub fn read_i16(buf: &mut &[u8]) -> Result<i16> {
    Ok(read_u16(buf)? as i16)
}

pub fn read_i32(buf: &mut &[u8]) -> Result<i32> {
    Ok(read_u32(buf)? as i32)
}

pub fn read_i64(buf: &mut &[u8]) -> Result<i64> {
    Ok(read_u64(buf)? as i64)
}

pub fn read_bool(buf: &mut &[u8]) -> Result<bool> {
    Ok(read_u8(buf)? != 0)
}

pub fn read_f32(buf: &mut &[u8]) -> Result<f32> {
    Ok(f32::from_bits(read_u32(buf)?))
}

pub fn read_f64(buf: &mut &[u8]) -> Result<f64> {
    Ok(f64::from_bits(read_u64(buf)?))
}

/// Read a `u32` length prefix followed by that many raw bytes.
pub fn read_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = read_u32(buf)? as usize;
    ensure(buf, len)?;
    let v = buf[..len].to_vec();
    *buf = &buf[len..];
    Ok(v)
}

/// Read a length-prefixed UTF-8 string.
pub fn read_string(buf: &mut &[u8], field: &'static str) -> Result<String> {
    let bytes = read_bytes(buf)?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8 { field })
}

// ── Writers ──────────────────────────────────────────────────────────────
//
// Fixed-width integers go through `BufMut` directly (big-endian is its
// default byte order); only the length-prefixed forms need helpers.

pub fn write_bytes(out: &mut BytesMut, data: &[u8]) {
    out.put_u32(data.len() as u32);
    out.put_slice(data);
}

pub fn write_string(out: &mut BytesMut, s: &str) {
    write_bytes(out, s.as_bytes());
}
