//! Little-endian scalar decoding, hex formatting, and a thin CRC32 wrapper.
//!
//! Kept as free functions over `&[u8]`, the way
//! `other_examples/09683ace_..gguf.rs`'s `read_u32`/`read_u64`/`read_f32`
//! helpers are shaped, generalized to cover every width the GGUF and ZIP
//! parsers need.

use crate::error::StorageError;

fn need(buf: &[u8], n: usize) -> Result<(), StorageError> {
    if buf.len() < n {
        Err(StorageError::EndOfStream {
            requested: n as u64,
            available: buf.len() as u64,
        })
    } else {
        Ok(())
    }
}

pub fn le_u16(buf: &[u8]) -> Result<u16, StorageError> {
    need(buf, 2)?;
    Ok(u16::from_le_bytes([buf[0], buf[1]]))
}

pub fn le_u32(buf: &[u8]) -> Result<u32, StorageError> {
    need(buf, 4)?;
    Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

pub fn le_u64(buf: &[u8]) -> Result<u64, StorageError> {
    need(buf, 8)?;
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    Ok(u64::from_le_bytes(b))
}

pub fn le_i32(buf: &[u8]) -> Result<i32, StorageError> {
    le_u32(buf).map(|v| v as i32)
}

pub fn le_i64(buf: &[u8]) -> Result<i64, StorageError> {
    le_u64(buf).map(|v| v as i64)
}

pub fn le_f32(buf: &[u8]) -> Result<f32, StorageError> {
    le_u32(buf).map(f32::from_bits)
}

pub fn le_f64(buf: &[u8]) -> Result<f64, StorageError> {
    le_u64(buf).map(f64::from_bits)
}

/// Format bytes as a lowercase hex string, used by diagnostics when
/// dumping magic numbers and signature mismatches.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Incremental CRC32 accumulator, used by the ZIP reader's streaming-mode
/// data-descriptor recovery to validate a candidate record boundary.
#[derive(Debug, Clone)]
pub struct Crc32(crc32fast::Hasher);

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    pub fn new() -> Self {
        Self(crc32fast::Hasher::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(&self) -> u32 {
        self.0.clone().finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian() {
        assert_eq!(le_u32(&[0x01, 0x02, 0x03, 0x04]).unwrap(), 0x04030201);
        assert_eq!(
            le_u64(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]).unwrap(),
            0x0807060504030201
        );
    }

    #[test]
    fn short_buffer_is_end_of_stream() {
        assert!(matches!(
            le_u32(&[0x01]),
            Err(StorageError::EndOfStream { .. })
        ));
    }

    #[test]
    fn hex_formats_lowercase() {
        assert_eq!(to_hex(&[0xDE, 0xAD, 0xBE, 0xEF]), "deadbeef");
    }

    #[test]
    fn crc32_matches_known_vector() {
        let mut c = Crc32::new();
        c.update(b"123456789");
        assert_eq!(c.finalize(), 0xCBF4_3926);
    }
}
