// Big-endian read/write helpers every wire format in the crate is built on

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Errors that can occur while reading a wire buffer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer ended before the field did
    #[error("truncated field: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    /// A one-byte flag held something other than 0 or 1
    #[error("invalid boolean byte {value:#04x}")]
    InvalidBool { value: u8 },
}

/// Append-only big-endian writer
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        let mut scratch = [0u8; 2];
        BigEndian::write_u16(&mut scratch, value);
        self.buf.extend_from_slice(&scratch);
    }

    pub fn put_u32(&mut self, value: u32) {
        let mut scratch = [0u8; 4];
        BigEndian::write_u32(&mut scratch, value);
        self.buf.extend_from_slice(&scratch);
    }

    pub fn put_u64(&mut self, value: u64) {
        let mut scratch = [0u8; 8];
        BigEndian::write_u64(&mut scratch, value);
        self.buf.extend_from_slice(&scratch);
    }

    pub fn put_i32(&mut self, value: i32) {
        let mut scratch = [0u8; 4];
        BigEndian::write_i32(&mut scratch, value);
        self.buf.extend_from_slice(&scratch);
    }

    pub fn put_f32(&mut self, value: f32) {
        let mut scratch = [0u8; 4];
        BigEndian::write_f32(&mut scratch, value);
        self.buf.extend_from_slice(&scratch);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a u32 length prefix followed by the bytes
    pub fn put_block(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received wire buffer
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < needed {
            return Err(WireError::Truncated {
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(WireError::InvalidBool { value }),
        }
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn f32(&mut self) -> Result<f32, WireError> {
        Ok(BigEndian::read_f32(self.take(4)?))
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.take(len)
    }

    /// Read a u32 length prefix followed by that many bytes
    pub fn block(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod wire_tests {
    use super::{WireError, WireReader, WireWriter};

    #[test]
    fn round_trips_scalars() {
        let mut writer = WireWriter::new();
        writer.put_u8(0xab);
        writer.put_u16(0xbeef);
        writer.put_u32(0xdead_beef);
        writer.put_u64(0x0123_4567_89ab_cdef);
        writer.put_i32(-42);
        writer.put_f32(1.5);
        writer.put_bool(true);
        let bytes = writer.into_bytes();

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.u8().unwrap(), 0xab);
        assert_eq!(reader.u16().unwrap(), 0xbeef);
        assert_eq!(reader.u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(reader.i32().unwrap(), -42);
        assert_eq!(reader.f32().unwrap(), 1.5);
        assert!(reader.bool().unwrap());
        assert!(reader.is_empty());
    }

    #[test]
    fn block_carries_length_prefix() {
        let mut writer = WireWriter::new();
        writer.put_block(b"treelet");
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 4 + 7);

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.block().unwrap(), b"treelet");
    }

    #[test]
    fn truncated_reads_report_sizes() {
        let mut reader = WireReader::new(&[0x01, 0x02]);
        let err = reader.u32().unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                needed: 4,
                available: 2
            }
        );
    }

    #[test]
    fn big_endian_byte_order_on_the_wire() {
        let mut writer = WireWriter::new();
        writer.put_u32(0x0102_0304);
        assert_eq!(writer.into_bytes(), vec![0x01, 0x02, 0x03, 0x04]);
    }
}
