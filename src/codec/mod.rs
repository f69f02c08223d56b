//! MQTT Packet Codec
//!
//! Streaming decoder and encoder for MQTT v3.1 / v3.1.1 frames.
//!
//! A frame is a one byte fixed header, a remaining-length varint of one to
//! four bytes, and exactly `remaining_length` bytes of variable header and
//! payload.

mod decode;
mod encode;
mod reader;

#[cfg(test)]
mod tests;

pub use decode::{DecodeState, Decoder};
pub use encode::Encoder;
pub use reader::PayloadReader;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default message-size limit
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Longest remaining-length encoding
pub const MAX_VARINT_BYTES: usize = 4;

/// Read a remaining-length varint from a complete buffer.
/// Returns (value, bytes_consumed) or error
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= MAX_VARINT_BYTES {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let byte = *buf.get(pos).ok_or(DecodeError::InsufficientData)?;
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a remaining-length varint to buffer
/// Returns bytes written
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Calculate the number of bytes needed to encode a remaining length
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

/// Write a UTF-8 encoded string
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}

/// Write length-prefixed binary data
#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = data.len();
    if len > u16::MAX as usize {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(len as u16);
    buf.put_slice(data);
    Ok(())
}
