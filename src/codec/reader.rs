//! Bounds-checked cursor over one frame's payload

use bytes::Bytes;

use crate::protocol::DecodeError;

/// Reads payload fields from a frame whose length is already known.
///
/// Every read is checked against the declared remaining length; running off
/// the end is `DecodeError::ReadPastEnd`.
pub struct PayloadReader {
    buf: Bytes,
    pos: usize,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<Bytes, DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::ReadPastEnd);
        }
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.pos).ok_or(DecodeError::ReadPastEnd)?;
        self.pos += 1;
        Ok(byte)
    }

    /// Big-endian 16-bit integer
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Length-prefixed binary field
    pub fn read_binary(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    /// Length-prefixed UTF-8 string; null characters are rejected
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let raw = self.read_binary()?;
        let s = std::str::from_utf8(&raw).map_err(|_| DecodeError::InvalidUtf8)?;
        if s.contains('\0') {
            return Err(DecodeError::MalformedPacket(
                "string contains null character",
            ));
        }
        Ok(s.to_owned())
    }

    /// Everything left in the frame
    pub fn read_rest(&mut self) -> Bytes {
        let out = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        out
    }

    /// Fail if any bytes are left over
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::MalformedPacket("trailing bytes after payload"))
        }
    }
}
