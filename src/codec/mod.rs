//! MQTT Packet Codec
//!
//! Encoding and decoding of MQTT v3.1.1 control packets.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Largest value the four-byte Remaining Length field can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default inbound packet limit when none is configured
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Decode the Remaining Length field of the fixed header.
///
/// Returns the value and the number of bytes it occupied.
#[inline]
pub fn read_remaining_length(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;
    for (pos, &byte) in buf.iter().enumerate() {
        if pos == 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        value |= u32::from(byte & 0x7F) << (7 * pos);
        if byte & 0x80 == 0 {
            return Ok((value, pos + 1));
        }
    }
    if buf.len() >= 4 {
        return Err(DecodeError::InvalidRemainingLength);
    }
    Err(DecodeError::InsufficientData)
}

/// Encode the Remaining Length field, returning the bytes written
#[inline]
pub fn write_remaining_length(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut written = 0;
    loop {
        let digit = (value & 0x7F) as u8;
        value >>= 7;
        written += 1;
        if value == 0 {
            buf.put_u8(digit);
            return Ok(written);
        }
        buf.put_u8(digit | 0x80);
    }
}

#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Split a u16-length-prefixed field off the front of `buf`.
/// Returns the field and the bytes consumed including the prefix.
#[inline]
fn read_length_prefixed(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = usize::from(read_u16(buf)?);
    let end = 2 + len;
    let field = buf.get(2..end).ok_or(DecodeError::InsufficientData)?;
    Ok((field, end))
}

/// Read a UTF-8 string field; NUL characters are rejected
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (raw, consumed) = read_length_prefixed(buf)?;
    let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket(
            "string contains null character",
        ));
    }
    Ok((s, consumed))
}

#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    read_length_prefixed(buf)
}

#[inline]
fn write_length_prefixed(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_length_prefixed(buf, s.as_bytes())
}

#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    write_length_prefixed(buf, data)
}
