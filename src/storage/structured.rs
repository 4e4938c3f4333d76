//! Structured binary I/O on top of storage inputs and outputs.
//!
//! Fixed-width integers are little-endian, lengths are varints, and every
//! file ends with a CRC32 of everything written before it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{PalisadeError, Result};
use crate::storage::{StorageInput, StorageOutput};
use crate::util::varint::{decode_u64, encode_u64};

/// Writer that tracks a running checksum.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Wrap a storage output.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            position: 0,
        }
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.track(&[value]);
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.writer.write_i64::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = encode_u64(value);
        self.writer.write_all(&encoded)?;
        self.track(&encoded);
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Length-prefixed byte slice.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.writer.write_all(value)?;
        self.track(value);
        Ok(())
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn track(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Append the checksum trailer, sync and close the output.
    pub fn close(mut self) -> Result<()> {
        let checksum = self.hasher.clone().finalize();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.flush_and_sync()?;
        self.writer.close()?;
        Ok(())
    }
}

/// Reader that recomputes the checksum as it goes.
pub struct StructReader<R: StorageInput> {
    reader: R,
    hasher: Hasher,
    position: u64,
    file_size: u64,
}

impl<R: StorageInput> StructReader<R> {
    /// Wrap a storage input.
    pub fn new(reader: R) -> Result<Self> {
        let file_size = reader.size()?;
        Ok(StructReader {
            reader,
            hasher: Hasher::new(),
            position: 0,
            file_size,
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8()?;
        self.track(&[value]);
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let value = self.reader.read_i64::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut bytes = Vec::with_capacity(10);
        loop {
            let byte = self.reader.read_u8()?;
            bytes.push(byte);
            if byte & 0x80 == 0 || bytes.len() == 10 {
                break;
            }
        }

        let (value, _) = decode_u64(&bytes)?;
        self.track(&bytes);
        Ok(value)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| PalisadeError::storage(format!("Invalid UTF-8: {e}")))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()?;
        if self.position + length > self.file_size {
            return Err(PalisadeError::storage(format!(
                "Length {length} at offset {} runs past end of file ({} bytes)",
                self.position, self.file_size
            )));
        }

        let mut bytes = vec![0u8; length as usize];
        self.reader.read_exact(&mut bytes)?;
        self.track(&bytes);
        Ok(bytes)
    }

    fn track(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Read the checksum trailer and compare it against the bytes consumed so far.
    pub fn verify_checksum(mut self) -> Result<()> {
        let expected = self.reader.read_u32::<LittleEndian>()?;
        let actual = self.hasher.clone().finalize();
        if expected != actual {
            return Err(PalisadeError::storage(format!(
                "Checksum mismatch: expected {expected:#010x}, computed {actual:#010x}"
            )));
        }
        self.reader.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn test_structured_roundtrip_with_checksum() {
        let storage = MemoryStorage::new_default();

        let mut writer = StructWriter::new(storage.create_output("data").unwrap());
        writer.write_u32(0x4C495645).unwrap();
        writer.write_i64(-1).unwrap();
        writer.write_varint(300).unwrap();
        writer.write_string("_0").unwrap();
        writer.write_bytes(&[1, 2, 3]).unwrap();
        writer.close().unwrap();

        let mut reader = StructReader::new(storage.open_input("data").unwrap()).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 0x4C495645);
        assert_eq!(reader.read_i64().unwrap(), -1);
        assert_eq!(reader.read_varint().unwrap(), 300);
        assert_eq!(reader.read_string().unwrap(), "_0");
        assert_eq!(reader.read_bytes().unwrap(), vec![1, 2, 3]);
        reader.verify_checksum().unwrap();
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("data").unwrap();
        output.write_u64::<LittleEndian>(42).unwrap();
        output.write_u32::<LittleEndian>(0xDEADBEEF).unwrap();
        output.close().unwrap();

        let mut reader = StructReader::new(storage.open_input("data").unwrap()).unwrap();
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert!(reader.verify_checksum().is_err());
    }
}
