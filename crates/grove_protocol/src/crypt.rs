//! Per-direction rolling stream ciphers.
//!
//! Each direction of a session keeps a 4-byte IV. A frame is enciphered by
//! a byte-shuffle pass followed by an AES-256/OFB keystream pass keyed by a
//! fixed user key and the IV expanded to a full block; the IV then rolls so
//! the next frame uses a fresh keystream. The 4-byte frame header doubles
//! as a stream-position check: its low half must match the current IV.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;

/// A direction IV as exchanged in the hello packet.
pub type Iv = [u8; 4];

/// The fixed 32-byte cipher key shared by every channel.
const USER_KEY: [u8; 32] = [
    0x13, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0xB4, 0x00, 0x00,
    0x00, 0x1B, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, 0x33, 0x00, 0x00, 0x00, 0x52, 0x00,
    0x00, 0x00,
];

/// Mixing table for the IV roll.
const ROLL_TABLE: [u8; 16] = [
    0xEC, 0x3F, 0x77, 0xA4, 0x45, 0xD0, 0x71, 0xBF, 0xB7, 0x98, 0x20, 0xFC, 0x4B, 0xE9, 0xB3,
    0xE1,
];

/// OFB keystream chunking. The first chunk of a frame is shorter so chunk
/// boundaries never align with the 1460-byte TCP segment payload.
const FIRST_CHUNK: usize = 1456;
const CHUNK: usize = 1460;

fn expand_iv(iv: Iv) -> [u8; 16] {
    let mut block = [0; 16];
    for (dst, src) in block.chunks_exact_mut(4).zip(std::iter::repeat(iv)) {
        dst.copy_from_slice(&src);
    }
    block
}

/// Advances an IV after a frame.
fn roll(iv: &mut Iv) {
    let mut next: Iv = [0xF2, 0x53, 0x50, 0xC6];
    for &byte in iv.iter() {
        let a = ROLL_TABLE[(byte & 0x0F) as usize];
        let b = ROLL_TABLE[(byte >> 4) as usize];
        next[0] = next[0].wrapping_add(a ^ byte);
        next[1] ^= b.wrapping_sub(byte);
        next[2] = next[2].wrapping_sub(next[1] ^ a);
        next[3] = next[3].rotate_left(3) ^ b.wrapping_add(next[0]);
    }
    *iv = next;
}

/// XORs the AES-256/OFB keystream for `iv` into `data`.
fn ofb_pass(cipher: &Aes256, iv: Iv, data: &mut [u8]) {
    let mut offset = 0;
    let mut chunk_len = FIRST_CHUNK;
    while offset < data.len() {
        let mut feedback = expand_iv(iv);
        let end = (offset + chunk_len).min(data.len());
        let chunk = &mut data[offset..end];
        for part in chunk.chunks_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut feedback));
            for (byte, key) in part.iter_mut().zip(feedback.iter()) {
                *byte ^= key;
            }
        }
        offset += chunk_len;
        chunk_len = CHUNK;
    }
}

fn shuffle_encrypt(data: &mut [u8]) {
    let len = data.len();
    for _ in 0..3 {
        // Forward pass, carry chained on the produced bytes.
        let mut carry = 0u8;
        for (i, byte) in data.iter_mut().enumerate() {
            let amount = u32::from(carry % 8) + 1;
            let mut b = byte.rotate_left(3);
            b = b.wrapping_add((i as u8).wrapping_add(1));
            b ^= carry;
            b = b.rotate_right(amount);
            b = !b;
            *byte = b;
            carry = b;
        }

        // Backward pass.
        let mut carry = 0u8;
        for i in (0..len).rev() {
            let mut b = data[i].rotate_left(4);
            b = b.wrapping_add((len.wrapping_sub(i)) as u8);
            b ^= carry;
            b ^= 0x13;
            b = b.rotate_right(3);
            data[i] = b;
            carry = b;
        }
    }
}

fn shuffle_decrypt(data: &mut [u8]) {
    let len = data.len();
    for _ in 0..3 {
        let mut carry = 0u8;
        for i in (0..len).rev() {
            let out = data[i];
            let mut b = out.rotate_left(3);
            b ^= 0x13;
            b ^= carry;
            b = b.wrapping_sub((len.wrapping_sub(i)) as u8);
            data[i] = b.rotate_right(4);
            carry = out;
        }

        let mut carry = 0u8;
        for (i, byte) in data.iter_mut().enumerate() {
            let amount = u32::from(carry % 8) + 1;
            let out = *byte;
            let mut b = !out;
            b = b.rotate_left(amount);
            b ^= carry;
            b = b.wrapping_sub((i as u8).wrapping_add(1));
            *byte = b.rotate_right(3);
            carry = out;
        }
    }
}

/// Outbound half of a session's cipher state.
pub struct EncryptContext {
    cipher: Aes256,
    iv: Iv,
    version: u16,
}

impl EncryptContext {
    pub fn new(iv: Iv, version: u16) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(&USER_KEY)),
            iv,
            version,
        }
    }

    pub fn iv(&self) -> Iv {
        self.iv
    }

    /// Enciphers `payload` and prepends the frame header, rolling the IV.
    pub fn encrypt_frame(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&header(self.iv, self.version, payload.len() as u16));
        frame.extend_from_slice(payload);

        shuffle_encrypt(&mut frame[4..]);
        ofb_pass(&self.cipher, self.iv, &mut frame[4..]);
        roll(&mut self.iv);
        frame
    }
}

/// Inbound half of a session's cipher state.
pub struct DecryptContext {
    cipher: Aes256,
    iv: Iv,
    version: u16,
}

impl DecryptContext {
    pub fn new(iv: Iv, version: u16) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(&USER_KEY)),
            iv,
            version,
        }
    }

    pub fn iv(&self) -> Iv {
        self.iv
    }

    /// Whether a frame header is consistent with the current stream state.
    pub fn check_header(&self, raw: [u8; 4]) -> bool {
        let lo = u16::from_le_bytes([raw[0], raw[1]]);
        lo == (u16::from_le_bytes([self.iv[2], self.iv[3]]) ^ self.version)
    }

    /// Deciphers a payload in place and rolls the IV.
    pub fn decrypt(&mut self, payload: &mut [u8]) {
        ofb_pass(&self.cipher, self.iv, payload);
        shuffle_decrypt(payload);
        roll(&mut self.iv);
    }
}

/// Builds a frame header for `len` payload bytes.
fn header(iv: Iv, version: u16, len: u16) -> [u8; 4] {
    let lo = u16::from_le_bytes([iv[2], iv[3]]) ^ version;
    let hi = lo ^ len;
    let mut raw = [0; 4];
    raw[0..2].copy_from_slice(&lo.to_le_bytes());
    raw[2..4].copy_from_slice(&hi.to_le_bytes());
    raw
}

/// Recovers the payload length from a frame header.
pub(crate) fn frame_len(raw: [u8; 4]) -> u16 {
    u16::from_le_bytes([raw[0], raw[1]]) ^ u16::from_le_bytes([raw[2], raw[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_round_trip() {
        let mut data: Vec<u8> = (0..=255).collect();
        let original = data.clone();
        shuffle_encrypt(&mut data);
        assert_ne!(data, original);
        shuffle_decrypt(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn frame_round_trip() {
        let iv = [0x52, 0x30, 0x78, 0x61];
        let mut enc = EncryptContext::new(iv, crate::GAME_VERSION);
        let mut dec = DecryptContext::new(iv, crate::GAME_VERSION);

        for payload in [&b"\x14\x00\x01\x02\x03\x04"[..], &[0u8; 3000][..]] {
            let frame = enc.encrypt_frame(payload);
            let raw: [u8; 4] = frame[0..4].try_into().unwrap();
            assert!(dec.check_header(raw));
            assert_eq!(frame_len(raw) as usize, payload.len());

            let mut body = frame[4..].to_vec();
            dec.decrypt(&mut body);
            assert_eq!(body, payload);
        }
    }

    #[test]
    fn iv_rolls_every_frame() {
        let mut enc = EncryptContext::new([9, 9, 9, 9], crate::GAME_VERSION);
        let before = enc.iv();
        enc.encrypt_frame(b"\x00\x00");
        assert_ne!(enc.iv(), before);
    }
}
