use thiserror::Error;

use crate::crypto::{Hash, HASH_SIZE};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Not enough bytes left: expected {expected}, {left} left")]
    NotEnoughBytes { expected: usize, left: usize },

    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),

    #[error("Invalid UTF-8 string")]
    InvalidString,
}

// Reader over a borrowed byte slice
// All multi-byte integers are big-endian, matching the on-wire encodings
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, offset: 0 }
    }

    fn advance(&mut self, count: usize) -> Result<&'a [u8], ReaderError> {
        if self.left() < count {
            return Err(ReaderError::NotEnoughBytes {
                expected: count,
                left: self.left(),
            });
        }
        let bytes = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(bytes)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], ReaderError> {
        self.advance(count)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        Ok(self.advance(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        let bytes = self.advance(2)?;
        bytes
            .try_into()
            .map(u16::from_be_bytes)
            .map_err(|_| ReaderError::InvalidValue("u16"))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        let bytes = self.advance(4)?;
        bytes
            .try_into()
            .map(u32::from_be_bytes)
            .map_err(|_| ReaderError::InvalidValue("u32"))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        let bytes = self.advance(8)?;
        bytes
            .try_into()
            .map(u64::from_be_bytes)
            .map_err(|_| ReaderError::InvalidValue("u64"))
    }

    pub fn read_hash(&mut self) -> Result<Hash, ReaderError> {
        let bytes: [u8; HASH_SIZE] = self
            .advance(HASH_SIZE)?
            .try_into()
            .map_err(|_| ReaderError::InvalidValue("hash"))?;
        Ok(Hash::new(bytes))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ReaderError> {
        self.advance(N)?
            .try_into()
            .map_err(|_| ReaderError::InvalidValue("byte array"))
    }

    pub fn read_string(&mut self, count: usize) -> Result<String, ReaderError> {
        let bytes = self.advance(count)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ReaderError::InvalidString)
    }

    pub fn total_read(&self) -> usize {
        self.offset
    }

    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    pub fn left(&self) -> usize {
        self.data.len() - self.offset
    }
}

// Writer accumulating the canonical byte representation
pub struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { bytes: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Writer {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_hash(&mut self, hash: &Hash) {
        self.bytes.extend_from_slice(hash.as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn total_write(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Default for Writer {
    fn default() -> Self {
        Writer::new()
    }
}

pub trait Serializer: Sized {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;

    fn size(&self) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(self.size());
        self.write(&mut writer);
        writer.bytes()
    }

    fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(bytes);
        Self::read(&mut reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_integers() {
        let mut writer = Writer::new();
        writer.write_u8(0x7f);
        writer.write_u16(0x0102);
        writer.write_u32(0xdeadbeef);
        writer.write_u64(0x0102030405060708);

        let bytes = writer.bytes();
        assert_eq!(bytes.len(), 1 + 2 + 4 + 8);

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 0x7f);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert_eq!(reader.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(reader.read_u64().unwrap(), 0x0102030405060708);
        assert_eq!(reader.left(), 0);
    }

    #[test]
    fn test_big_endian_layout() {
        let mut writer = Writer::new();
        writer.write_u32(1);
        assert_eq!(writer.as_bytes(), &[0, 0, 0, 1]);
    }

    #[test]
    fn test_not_enough_bytes() {
        let mut reader = Reader::new(&[1, 2]);
        assert!(matches!(
            reader.read_u32(),
            Err(ReaderError::NotEnoughBytes { expected: 4, left: 2 })
        ));
    }

    #[test]
    fn test_hash_roundtrip() {
        let hash = Hash::new([42u8; HASH_SIZE]);
        let mut writer = Writer::new();
        writer.write_hash(&hash);

        let bytes = writer.bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_hash().unwrap(), hash);
        assert_eq!(reader.total_read(), HASH_SIZE);
    }
}
