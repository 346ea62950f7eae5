use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;

/// Builds a packet payload, opcode first, little-endian throughout.
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new(opcode: u16) -> Self {
        let mut buf = Vec::with_capacity(16);
        buf.write_u16::<LittleEndian>(opcode).unwrap();
        Self { buf }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.push(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.write_u16::<LittleEndian>(value).unwrap();
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.write_i16::<LittleEndian>(value).unwrap();
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.write_u32::<LittleEndian>(value).unwrap();
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.write_i32::<LittleEndian>(value).unwrap();
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.write_u64::<LittleEndian>(value).unwrap();
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Writes a `u16`-prefixed string.
    pub fn write_sized_string(&mut self, value: &str) {
        self.write_u16(value.len() as u16);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freezes the payload for fan-out to many sessions.
    pub fn into_bytes(self) -> Bytes {
        self.buf.into()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn writer_layout() {
        let mut w = PacketWriter::new(0x00A0);
        w.write_u8(3);
        w.write_i32(-1);
        w.write_sized_string("sp");
        let bytes = w.into_bytes();
        assert_eq!(
            &bytes[..],
            &[0xA0, 0x00, 3, 0xFF, 0xFF, 0xFF, 0xFF, 2, 0, b's', b'p']
        );
    }
}
