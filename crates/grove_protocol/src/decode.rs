use anyhow::{bail, ensure};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BytesMut};
use thiserror::Error;

use crate::crypt::{frame_len, DecryptContext};
use crate::MAX_FRAME_SIZE;

/// Splits a session's inbound byte stream into deciphered packet payloads.
pub struct FrameDecoder {
    buf: BytesMut,
    ctx: DecryptContext,
}

impl FrameDecoder {
    pub fn new(ctx: DecryptContext) -> Self {
        Self {
            buf: BytesMut::new(),
            ctx,
        }
    }

    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete payload, deciphered, or `None` if more
    /// data is needed. A header that fails the stream check or encodes an
    /// out-of-bounds length is an error; the session should be ended.
    pub fn try_next_frame(&mut self) -> anyhow::Result<Option<BytesMut>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let raw: [u8; 4] = self.buf[0..4].try_into().unwrap();
        if !self.ctx.check_header(raw) {
            bail!("frame header does not match the stream state");
        }

        let len = frame_len(raw) as usize;
        ensure!(
            (2..=MAX_FRAME_SIZE).contains(&len),
            "frame length of {len} is out of bounds"
        );

        if self.buf.len() < 4 + len {
            return Ok(None);
        }

        self.buf.advance(4);
        let mut frame = self.buf.split_to(len);
        self.ctx.decrypt(&mut frame);
        Ok(Some(frame))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("read past the end of the packet")]
    Eof,
    #[error("string field is not valid UTF-8")]
    Utf8,
    #[error("string field of {len} bytes exceeds the limit of {max}")]
    StringTooLong { len: usize, max: usize },
}

/// Cursor over a decoded packet payload, little-endian throughout.
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        if self.remaining() < len {
            return Err(ReadError::Eof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ReadError> {
        self.take(len).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        self.take(1).map(|s| s[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, ReadError> {
        self.take(1).map(|s| s[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, ReadError> {
        self.take(2).map(LittleEndian::read_u16)
    }

    pub fn read_i16(&mut self) -> Result<i16, ReadError> {
        self.take(2).map(LittleEndian::read_i16)
    }

    pub fn read_u32(&mut self) -> Result<u32, ReadError> {
        self.take(4).map(LittleEndian::read_u32)
    }

    pub fn read_i32(&mut self) -> Result<i32, ReadError> {
        self.take(4).map(LittleEndian::read_i32)
    }

    /// Reads a `u16`-prefixed string of at most `max` bytes.
    pub fn read_sized_string(&mut self, max: usize) -> Result<&'a str, ReadError> {
        let len = self.read_u16()? as usize;
        if len > max {
            return Err(ReadError::StringTooLong { len, max });
        }
        std::str::from_utf8(self.take(len)?).map_err(|_| ReadError::Utf8)
    }

    pub fn read_array(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crypt::EncryptContext;
    use crate::GAME_VERSION;

    #[test]
    fn reader_fields() {
        let data = [0x2A, 0xFE, 0xFF, 0x78, 0x56, 0x34, 0x12, 0x02, 0x00, b'h', b'i'];
        let mut r = PacketReader::new(&data);
        assert_eq!(r.read_u8(), Ok(0x2A));
        assert_eq!(r.read_i16(), Ok(-2));
        assert_eq!(r.read_u32(), Ok(0x12345678));
        assert_eq!(r.read_sized_string(16), Ok("hi"));
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.read_u8(), Err(ReadError::Eof));
    }

    #[test]
    fn reader_rejects_oversized_string() {
        let data = [0xFF, 0x00];
        let mut r = PacketReader::new(&data);
        assert_eq!(
            r.read_sized_string(8),
            Err(ReadError::StringTooLong { len: 255, max: 8 })
        );
    }

    #[test]
    fn decoder_reassembles_partial_frames() {
        let iv = [7, 7, 7, 7];
        let mut enc = EncryptContext::new(iv, GAME_VERSION);
        let mut dec = FrameDecoder::new(DecryptContext::new(iv, GAME_VERSION));

        let frame = enc.encrypt_frame(b"\x14\x00\xEF\xBE\xAD\xDE");
        dec.queue_bytes(&frame[..3]);
        assert!(dec.try_next_frame().unwrap().is_none());
        dec.queue_bytes(&frame[3..]);
        let payload = dec.try_next_frame().unwrap().unwrap();
        assert_eq!(&payload[..], b"\x14\x00\xEF\xBE\xAD\xDE");
    }

    #[test]
    fn decoder_rejects_desynced_header() {
        let mut dec = FrameDecoder::new(DecryptContext::new([1, 2, 3, 4], GAME_VERSION));
        dec.queue_bytes(&[0, 0, 0, 0]);
        assert!(dec.try_next_frame().is_err());
    }
}
