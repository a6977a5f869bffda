use crate::errors::{CdcError, CdcResult};
use crate::utils::{buf_recv_i64, buf_recv_u64, buf_send_i64, buf_send_u64};

/// A buffer reader that manages position and provides meaningful parsing methods
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    /// Create a new buffer reader from a byte slice
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if we have at least `count` bytes remaining
    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Read a single byte at current position
    pub fn read_u8(&mut self) -> CdcResult<u8> {
        if !self.has_bytes(1) {
            return Err(CdcError::parse("Not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    /// Read a 64-bit unsigned integer at current position
    pub fn read_u64(&mut self) -> CdcResult<u64> {
        if !self.has_bytes(8) {
            return Err(CdcError::parse("Not enough bytes for u64"));
        }
        let value = buf_recv_u64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    /// Read a 64-bit signed integer at current position
    pub fn read_i64(&mut self) -> CdcResult<i64> {
        if !self.has_bytes(8) {
            return Err(CdcError::parse("Not enough bytes for i64"));
        }
        let value = buf_recv_i64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    pub(crate) fn read_char(&mut self) -> CdcResult<char> {
        if !self.has_bytes(1) {
            return Err(CdcError::parse("Not enough bytes for char"));
        }
        let val = self.buffer[self.position] as char;
        self.position += 1;
        Ok(val)
    }

    pub(crate) fn read_bytes(&mut self, count: usize) -> CdcResult<Vec<u8>> {
        if !self.has_bytes(count) {
            return Err(CdcError::parse("Not enough bytes"));
        }
        let bytes = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(bytes.to_vec())
    }
}

/// A buffer writer that manages position and provides meaningful writing methods
/// for constructing binary messages with automatic position tracking
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    /// Create a new buffer writer from a mutable byte slice
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get remaining space in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if we have at least `count` bytes remaining
    pub fn has_space(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Write a single byte at current position
    pub fn write_u8(&mut self, value: u8) -> CdcResult<()> {
        if !self.has_space(1) {
            return Err(CdcError::parse("Not enough space for u8"));
        }
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    /// Write a 64-bit unsigned integer at current position
    pub fn write_u64(&mut self, value: u64) -> CdcResult<()> {
        if !self.has_space(8) {
            return Err(CdcError::parse("Not enough space for u64"));
        }
        buf_send_u64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }

    /// Write a 64-bit signed integer at current position
    pub fn write_i64(&mut self, value: i64) -> CdcResult<()> {
        if !self.has_space(8) {
            return Err(CdcError::parse("Not enough space for i64"));
        }
        buf_send_i64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }

    /// Get the total bytes written so far
    pub fn bytes_written(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mut buf = [0u8; 17];
        {
            let mut writer = BufferWriter::new(&mut buf);
            writer.write_u8(b'r').unwrap();
            writer.write_u64(0x1_0000_0010).unwrap();
            writer.write_i64(-42).unwrap();
            assert_eq!(writer.bytes_written(), 17);
        }

        let mut reader = BufferReader::new(&buf);
        assert_eq!(reader.read_char().unwrap(), 'r');
        assert_eq!(reader.read_u64().unwrap(), 0x1_0000_0010);
        assert_eq!(reader.read_i64().unwrap(), -42);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn short_reads_and_writes_fail() {
        let buf = [0u8; 4];
        let mut reader = BufferReader::new(&buf);
        assert!(reader.read_u64().is_err());

        let mut buf = [0u8; 4];
        let mut writer = BufferWriter::new(&mut buf);
        assert!(writer.write_u64(1).is_err());
    }
}
