//! PostgreSQL replication protocol messages
//!
//! Codecs for the three COPY BOTH sub-protocol messages the receiver deals
//! with. Layouts follow the replication protocol documentation:
//! https://www.postgresql.org/docs/current/protocol-replication.html

use crate::buffer::{BufferReader, BufferWriter};
use crate::errors::{CdcError, CdcResult};

/// Primary keepalive message (B), type byte 'k'
///
/// Sent periodically by the server; carries the current end of WAL and a
/// flag requesting an immediate standby status update.
pub struct KeepaliveMessage {
    pub message_type: char,
    pub wal_end: u64,
    pub timestamp: i64,
    pub reply_requested: bool,
}

/// XLogData message (B), type byte 'w'
///
/// One decoded record from the output plugin, preceded by its starting WAL
/// position, the server's current end of WAL, and the send time.
pub struct XLogDataMessage {
    pub message_type: char,
    pub data_start: u64,
    pub wal_end: u64,
    pub send_time: i64,
    pub data: Vec<u8>,
}

/// Standby status update (F), type byte 'r'
///
/// The feedback the receiver sends: written/flushed/applied LSNs plus the
/// client clock.
pub struct StandbyStatusUpdateMessage {
    pub write_lsn: u64,
    pub flush_lsn: u64,
    pub apply_lsn: u64,
    pub send_time: i64,
    pub reply_requested: bool,
}

impl TryFrom<BufferReader<'_>> for KeepaliveMessage {
    type Error = CdcError;

    fn try_from(reader: BufferReader<'_>) -> Result<Self, Self::Error> {
        if !reader.has_bytes(18) {
            return Err(CdcError::protocol("Keepalive message too short"));
        }

        let mut reader = reader;

        let message_type = reader.read_char()?;
        let wal_end = reader.read_u64()?;
        let timestamp = reader.read_i64()?;
        let reply_requested = reader.read_u8()? != 0;

        Ok(KeepaliveMessage {
            message_type,
            wal_end,
            timestamp,
            reply_requested,
        })
    }
}

impl TryFrom<BufferReader<'_>> for XLogDataMessage {
    type Error = CdcError;

    fn try_from(reader: BufferReader<'_>) -> Result<Self, Self::Error> {
        if !reader.has_bytes(25) {
            return Err(CdcError::protocol("WAL message too short"));
        }

        let mut reader = reader;

        let message_type = reader.read_char()?;
        let data_start = reader.read_u64()?;
        let wal_end = reader.read_u64()?;
        let send_time = reader.read_i64()?;
        let data = reader.read_bytes(reader.remaining())?;

        Ok(XLogDataMessage {
            message_type,
            data_start,
            wal_end,
            send_time,
            data,
        })
    }
}

impl StandbyStatusUpdateMessage {
    /// Serialized size: type byte, three LSNs, the clock, and the reply flag
    pub const WIRE_SIZE: usize = 34;

    /// Write the message into `buf`, returning the bytes written.
    pub fn write(&self, buf: &mut [u8]) -> CdcResult<usize> {
        let mut writer = BufferWriter::new(buf);
        writer.write_u8(b'r')?;
        writer.write_u64(self.write_lsn)?;
        writer.write_u64(self.flush_lsn)?;
        writer.write_u64(self.apply_lsn)?;
        writer.write_i64(self.send_time)?;
        writer.write_u8(if self.reply_requested { 1 } else { 0 })?;
        Ok(writer.bytes_written())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_round_trip() {
        let mut buf = [0u8; 18];
        buf[0] = b'k';
        buf[1..9].copy_from_slice(&0x1_0000_0000u64.to_be_bytes());
        buf[9..17].copy_from_slice(&757_382_400_000_000i64.to_be_bytes());
        buf[17] = 1;

        let msg = KeepaliveMessage::try_from(BufferReader::new(&buf)).unwrap();
        assert_eq!(msg.message_type, 'k');
        assert_eq!(msg.wal_end, 0x1_0000_0000);
        assert!(msg.reply_requested);
    }

    #[test]
    fn xlogdata_carries_payload() {
        let mut buf = vec![0u8; 25];
        buf[0] = b'w';
        buf[1..9].copy_from_slice(&0x100u64.to_be_bytes());
        buf[9..17].copy_from_slice(&0x200u64.to_be_bytes());
        buf[17..25].copy_from_slice(&0i64.to_be_bytes());
        buf.extend_from_slice(b"BEGIN 42");

        let msg = XLogDataMessage::try_from(BufferReader::new(&buf)).unwrap();
        assert_eq!(msg.data_start, 0x100);
        assert_eq!(msg.wal_end, 0x200);
        assert_eq!(msg.data, b"BEGIN 42");
    }

    #[test]
    fn short_messages_are_rejected() {
        assert!(KeepaliveMessage::try_from(BufferReader::new(&[b'k'])).is_err());
        assert!(XLogDataMessage::try_from(BufferReader::new(&[b'w', 0, 0])).is_err());
    }

    #[test]
    fn status_update_layout() {
        let msg = StandbyStatusUpdateMessage {
            write_lsn: 0x300,
            flush_lsn: 0x200,
            apply_lsn: 0x100,
            send_time: 7,
            reply_requested: false,
        };
        let mut buf = [0u8; StandbyStatusUpdateMessage::WIRE_SIZE];
        let written = msg.write(&mut buf).unwrap();
        assert_eq!(written, StandbyStatusUpdateMessage::WIRE_SIZE);
        assert_eq!(buf[0], b'r');
        assert_eq!(u64::from_be_bytes(buf[1..9].try_into().unwrap()), 0x300);
        assert_eq!(u64::from_be_bytes(buf[9..17].try_into().unwrap()), 0x200);
        assert_eq!(u64::from_be_bytes(buf[17..25].try_into().unwrap()), 0x100);
        assert_eq!(buf[33], 0);
    }
}
