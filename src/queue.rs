//! Typed message queue between receiver and transformer
//!
//! In prefetch/catchup mode the receiver announces each completed segment to
//! the transformer through a small single-producer single-consumer queue.
//! The queue is a Unix domain socket in the CDC directory carrying
//! fixed-size typed records, so it keeps working when the two workers run as
//! separate processes. Send blocks when the socket buffer is full; receive
//! blocks when it is empty; when the sender closes its end the receiver
//! drains what is buffered and then observes `Stop`.

use crate::buffer::{BufferReader, BufferWriter};
use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Name of the queue socket inside the CDC directory
pub const QUEUE_SOCKET_NAME: &str = "transform.sock";

/// One queue record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMessage {
    /// A segment is complete; its first LSN identifies the file to transform
    Transform(Lsn),
    /// The producer is done; consume what is left and exit
    Stop,
}

const TAG_TRANSFORM: u8 = b'T';
const TAG_STOP: u8 = b'S';

/// Every record is a tag byte plus an LSN, Stop padding with zero
const WIRE_SIZE: usize = 9;

impl QueueMessage {
    fn encode(self, buf: &mut [u8; WIRE_SIZE]) -> CdcResult<()> {
        let mut writer = BufferWriter::new(buf);
        match self {
            QueueMessage::Transform(lsn) => {
                writer.write_u8(TAG_TRANSFORM)?;
                writer.write_u64(lsn.0)?;
            }
            QueueMessage::Stop => {
                writer.write_u8(TAG_STOP)?;
                writer.write_u64(0)?;
            }
        }
        Ok(())
    }

    fn decode(buf: &[u8; WIRE_SIZE]) -> CdcResult<Self> {
        let mut reader = BufferReader::new(buf);
        let tag = reader.read_u8()?;
        let lsn = Lsn(reader.read_u64()?);
        match tag {
            TAG_TRANSFORM => Ok(QueueMessage::Transform(lsn)),
            TAG_STOP => Ok(QueueMessage::Stop),
            other => Err(CdcError::parse(format!(
                "Unknown queue message tag: {:#x}",
                other
            ))),
        }
    }
}

/// Producer end of the queue
pub struct QueueSender {
    stream: UnixStream,
}

impl QueueSender {
    /// Connect to the consumer's socket, retrying while it comes up.
    pub fn connect(path: &Path, timeout: Duration) -> CdcResult<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    debug!("Connected to transform queue at {}", path.display());
                    return Ok(Self { stream });
                }
                Err(e) if Instant::now() < deadline => {
                    debug!("Transform queue not ready ({}), retrying", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(CdcError::Io(e)),
            }
        }
    }

    /// Send one record, blocking while the consumer lags.
    pub fn send(&mut self, message: QueueMessage) -> CdcResult<()> {
        let mut buf = [0u8; WIRE_SIZE];
        message.encode(&mut buf)?;
        self.stream.write_all(&buf)?;
        Ok(())
    }
}

impl From<UnixStream> for QueueSender {
    fn from(stream: UnixStream) -> Self {
        Self { stream }
    }
}

/// Bound but not yet connected consumer end
pub struct QueueListener {
    listener: UnixListener,
    path: PathBuf,
}

impl QueueListener {
    /// Bind the queue socket, replacing a stale one from a previous run.
    pub fn bind(path: &Path) -> CdcResult<Self> {
        match std::fs::remove_file(path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CdcError::Io(e)),
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Wait for the producer and return the connected receive end.
    pub fn accept(self) -> CdcResult<QueueReceiver> {
        let (stream, _) = self.listener.accept()?;
        debug!("Transform queue connected at {}", self.path.display());
        Ok(QueueReceiver { stream })
    }

    /// Like `accept`, but gives up when `stop` is raised, so a consumer
    /// whose producer died before connecting does not hang forever.
    pub fn accept_with_stop(
        self,
        stop: &std::sync::atomic::AtomicBool,
    ) -> CdcResult<QueueReceiver> {
        self.listener.set_nonblocking(true)?;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    debug!("Transform queue connected at {}", self.path.display());
                    return Ok(QueueReceiver { stream });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if stop.load(std::sync::atomic::Ordering::SeqCst) {
                        return Err(CdcError::Stopped);
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(CdcError::Io(e)),
            }
        }
    }
}

/// Consumer end of the queue
pub struct QueueReceiver {
    stream: UnixStream,
}

impl QueueReceiver {
    /// Receive the next record, blocking until one arrives.
    ///
    /// A closed producer reads as `Stop` once everything buffered has been
    /// drained.
    pub fn recv(&mut self) -> CdcResult<QueueMessage> {
        let mut buf = [0u8; WIRE_SIZE];
        match self.stream.read_exact(&mut buf) {
            Ok(()) => QueueMessage::decode(&buf),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(QueueMessage::Stop),
            Err(e) => Err(CdcError::Io(e)),
        }
    }
}

impl From<UnixStream> for QueueReceiver {
    fn from(stream: UnixStream) -> Self {
        Self { stream }
    }
}
