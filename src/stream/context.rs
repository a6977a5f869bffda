//! Receiver-side stream state
//!
//! Everything the receiver does between the replication socket and the disk
//! lives here: wrapping records into the JSON-lines envelope, rotating files
//! at segment boundaries, filtering empty transactions, synthesizing
//! KEEPALIVE records, and tracking written/flushed LSNs. Keeping this state
//! machine free of any connection makes the interesting behavior testable
//! with plain records.

use crate::errors::{CdcError, CdcResult};
use crate::jsonfile::WalJsonFile;
use crate::lsn::{Lsn, wal_segment_filename};
use crate::queue::{QueueMessage, QueueSender};
use crate::types::{MessageMetadata, StreamAction};
use crate::utils::now_pg_timestamp_text;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::mpsc::SyncSender;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long an idle stretch of filtered-out transactions may last before a
/// KEEPALIVE is synthesized so progress stays observable
pub const STREAM_EMPTY_TX_TIMEOUT: Duration = Duration::from_secs(30);

/// Receiver counters, logged at stream end
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamCounters {
    pub messages_written: u64,
    pub empty_transactions_filtered: u64,
    pub keepalives_synthesized: u64,
    pub segments_promoted: u64,
}

/// File, filter, and progress state of one receive session
pub struct StreamContext {
    dir: PathBuf,
    wal_segment_size: u64,
    timeline: u32,
    file: Option<WalJsonFile>,
    current_segment: u64,
    stashed_begin: Option<(MessageMetadata, Option<Value>)>,
    pub written_lsn: Lsn,
    pub flushed_lsn: Lsn,
    last_write_time: Instant,
    queue: Option<QueueSender>,
    downstream: Option<SyncSender<String>>,
    pub counters: StreamCounters,
}

impl StreamContext {
    pub fn new(dir: PathBuf, wal_segment_size: u64, timeline: u32) -> Self {
        Self {
            dir,
            wal_segment_size,
            timeline,
            file: None,
            current_segment: 0,
            stashed_begin: None,
            written_lsn: Lsn::INVALID,
            flushed_lsn: Lsn::INVALID,
            last_write_time: Instant::now(),
            queue: None,
            downstream: None,
            counters: StreamCounters::default(),
        }
    }

    /// Announce completed segments on this queue (prefetch/catchup mode)
    pub fn set_queue(&mut self, queue: QueueSender) {
        self.queue = Some(queue);
    }

    /// Forward every written line into this pipe (replay mode)
    pub fn set_downstream(&mut self, downstream: SyncSender<String>) {
        self.downstream = Some(downstream);
    }

    /// Name of the file currently being written, when one is open
    pub fn current_walfile(&self) -> Option<&str> {
        self.file.as_ref().map(WalJsonFile::walfile)
    }

    /// Feed one decoded record through the empty-transaction filter and on
    /// to disk.
    pub fn process(
        &mut self,
        metadata: MessageMetadata,
        payload: Option<Value>,
    ) -> CdcResult<()> {
        if metadata.action == StreamAction::Begin {
            if let Some((stashed, _)) = &self.stashed_begin {
                return Err(CdcError::parse(format!(
                    "BEGIN {} arrived while BEGIN {} is still pending",
                    metadata.xid, stashed.xid
                )));
            }
            let mut metadata = metadata;
            metadata.skipping = true;
            self.stashed_begin = Some((metadata, payload));
            return Ok(());
        }

        if let Some((mut begin, begin_payload)) = self.stashed_begin.take() {
            if metadata.action == StreamAction::Commit && metadata.xid == begin.xid {
                // empty transaction: drop the pair, but keep progress
                // observable across long filtered-out stretches
                self.counters.empty_transactions_filtered += 1;
                if self.last_write_time.elapsed() >= STREAM_EMPTY_TX_TIMEOUT {
                    let keepalive = MessageMetadata::new(
                        StreamAction::Keepalive,
                        0,
                        metadata.lsn,
                        metadata.timestamp.clone(),
                    );
                    self.counters.keepalives_synthesized += 1;
                    self.write(keepalive, None)?;
                }
                return Ok(());
            }
            begin.skipping = false;
            self.write(begin, begin_payload)?;
        }

        self.write(metadata, payload)
    }

    /// Write one record, rotating to the matching segment file first.
    fn write(&mut self, metadata: MessageMetadata, payload: Option<Value>) -> CdcResult<()> {
        let segment = metadata.lsn.segment_number(self.wal_segment_size);

        match &self.file {
            None => self.open_segment(segment, metadata.lsn)?,
            Some(_) if segment != self.current_segment => {
                self.rotate(segment, metadata.lsn)?;
            }
            Some(_) => {}
        }

        let line = envelope_line(&metadata, payload.as_ref());
        self.append_line(&line)?;
        self.written_lsn = metadata.lsn;
        Ok(())
    }

    fn open_segment(&mut self, segment: u64, first_lsn: Lsn) -> CdcResult<()> {
        let walfile = wal_segment_filename(self.timeline, segment, self.wal_segment_size);
        let mut file = WalJsonFile::open(&self.dir, &walfile)?;
        file.first_lsn = first_lsn;
        self.file = Some(file);
        self.current_segment = segment;
        Ok(())
    }

    /// Segment boundary: SWITCH into the old file, promote it, announce it,
    /// open the next one.
    fn rotate(&mut self, segment: u64, first_lsn: Lsn) -> CdcResult<()> {
        let switch = MessageMetadata::new(StreamAction::Switch, 0, first_lsn, String::new());
        let line = envelope_line(&switch, None);
        self.append_line(&line)?;

        let file = self
            .file
            .take()
            .expect("rotate called without an open file");
        let completed_first_lsn = file.first_lsn;
        file.close_and_promote()?;
        self.counters.segments_promoted += 1;

        if let Some(queue) = &mut self.queue {
            debug!(
                "Announcing completed segment at {} to the transformer",
                completed_first_lsn
            );
            queue.send(QueueMessage::Transform(completed_first_lsn))?;
        }

        self.open_segment(segment, first_lsn)
    }

    /// Append to the current file and forward into the replay pipe when one
    /// is attached.
    fn append_line(&mut self, line: &str) -> CdcResult<()> {
        let file = self
            .file
            .as_mut()
            .expect("append_line called without an open file");
        file.append(line)?;
        self.counters.messages_written += 1;
        self.last_write_time = Instant::now();

        if let Some(downstream) = &self.downstream {
            downstream
                .send(line.to_string())
                .map_err(|_| CdcError::protocol("Downstream pipe is closed"))?;
        }
        Ok(())
    }

    /// Flush boundary: emit a synthetic KEEPALIVE so an otherwise-idle
    /// stream still shows progress, then fsync and advance `flushed_lsn`.
    pub fn flush(&mut self) -> CdcResult<()> {
        if self.file.is_none() || self.written_lsn == self.flushed_lsn {
            // nothing outstanding
            return Ok(());
        }

        let keepalive = MessageMetadata::new(
            StreamAction::Keepalive,
            0,
            self.written_lsn,
            now_pg_timestamp_text(),
        );
        let line = envelope_line(&keepalive, None);
        self.append_line(&line)?;

        if let Some(file) = &mut self.file {
            file.flush_and_sync()?;
        }
        self.flushed_lsn = self.written_lsn;
        Ok(())
    }

    /// Stream termination: flush, promote the current file, announce it,
    /// tell the transformer to stop.
    pub fn close(&mut self) -> CdcResult<()> {
        self.flush()?;

        let mut final_first_lsn = None;
        if let Some(file) = self.file.take() {
            final_first_lsn = Some(file.first_lsn);
            file.close_and_promote()?;
            self.counters.segments_promoted += 1;
        }

        if let Some(queue) = &mut self.queue {
            if let Some(first_lsn) = final_first_lsn {
                queue.send(QueueMessage::Transform(first_lsn))?;
            }
            queue.send(QueueMessage::Stop)?;
        }

        info!(
            "Stream closed: {} message(s) written, {} empty transaction(s) filtered, \
             {} keepalive(s) synthesized, {} segment(s) promoted",
            self.counters.messages_written,
            self.counters.empty_transactions_filtered,
            self.counters.keepalives_synthesized,
            self.counters.segments_promoted,
        );
        Ok(())
    }
}

/// Render the JSON-lines envelope of one record
fn envelope_line(metadata: &MessageMetadata, payload: Option<&Value>) -> String {
    let mut envelope = json!({
        "action": metadata.action.as_char().to_string(),
        "lsn": metadata.lsn,
    });
    let object = envelope.as_object_mut().expect("envelope is an object");
    if metadata.xid != 0 {
        object.insert("xid".into(), Value::String(metadata.xid.to_string()));
    }
    if !metadata.timestamp.is_empty() {
        object.insert(
            "timestamp".into(),
            Value::String(metadata.timestamp.clone()),
        );
    }
    if let Some(payload) = payload {
        object.insert("message".into(), payload.clone());
    }
    envelope.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::WAL_SEG_DEFAULT_SIZE;
    use std::fs;

    fn meta(action: StreamAction, xid: u32, lsn: u64) -> MessageMetadata {
        MessageMetadata::new(action, xid, Lsn(lsn), "2024-01-01 00:00:00+00".into())
    }

    fn context(dir: &std::path::Path) -> StreamContext {
        StreamContext::new(dir.to_path_buf(), WAL_SEG_DEFAULT_SIZE, 1)
    }

    fn written_lines(dir: &std::path::Path) -> Vec<String> {
        let mut lines = Vec::new();
        let mut paths: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                let name = p.file_name().unwrap().to_string_lossy().into_owned();
                name != crate::jsonfile::LATEST_SYMLINK
            })
            .collect();
        paths.sort();
        for path in paths {
            lines.extend(fs::read_to_string(path).unwrap().lines().map(String::from));
        }
        lines
    }

    #[test]
    fn records_are_wrapped_and_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        ctx.process(meta(StreamAction::Begin, 42, 0x100), None).unwrap();
        ctx.process(
            meta(StreamAction::Insert, 42, 0x110),
            Some(json!({"schema":"public","table":"t"})),
        )
        .unwrap();
        ctx.process(meta(StreamAction::Commit, 42, 0x120), None).unwrap();
        ctx.close().unwrap();

        let lines = written_lines(dir.path());
        // BEGIN, INSERT, COMMIT, plus the KEEPALIVE emitted by the closing flush
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("\"action\":\"B\""));
        assert!(lines[0].contains("\"xid\":\"42\""));
        assert!(lines[0].contains("\"lsn\":\"0/100\""));
        assert!(lines[1].contains("\"message\""));
        assert!(lines[2].contains("\"action\":\"C\""));
        assert!(lines[3].contains("\"action\":\"K\""));
    }

    #[test]
    fn lsns_written_to_one_file_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        for (i, lsn) in [0x100u64, 0x110, 0x120, 0x130].iter().enumerate() {
            ctx.process(
                meta(StreamAction::Insert, 42, *lsn),
                Some(json!({"n": i})),
            )
            .unwrap();
        }
        ctx.close().unwrap();

        let lines = written_lines(dir.path());
        let lsns: Vec<Lsn> = lines
            .iter()
            .map(|l| {
                let v: Value = serde_json::from_str(l).unwrap();
                v["lsn"].as_str().unwrap().parse().unwrap()
            })
            .collect();
        assert!(lsns.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn empty_transaction_produces_no_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        for i in 0..5u64 {
            ctx.process(meta(StreamAction::Begin, 100 + i as u32, 0x200 + i * 0x10), None)
                .unwrap();
            ctx.process(
                meta(StreamAction::Commit, 100 + i as u32, 0x208 + i * 0x10),
                None,
            )
            .unwrap();
        }

        assert_eq!(ctx.counters.empty_transactions_filtered, 5);
        assert_eq!(ctx.counters.messages_written, 0);
        assert!(ctx.current_walfile().is_none());
    }

    #[test]
    fn stale_empty_transactions_synthesize_one_keepalive() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        // pretend the last write happened long ago
        ctx.last_write_time = Instant::now() - STREAM_EMPTY_TX_TIMEOUT - Duration::from_secs(1);

        ctx.process(meta(StreamAction::Begin, 7, 0x200), None).unwrap();
        ctx.process(meta(StreamAction::Commit, 7, 0x210), None).unwrap();

        // the keepalive reset the timer, further pairs stay silent
        ctx.process(meta(StreamAction::Begin, 8, 0x220), None).unwrap();
        ctx.process(meta(StreamAction::Commit, 8, 0x230), None).unwrap();

        assert_eq!(ctx.counters.keepalives_synthesized, 1);
        ctx.close().unwrap();

        let lines = written_lines(dir.path());
        let keepalives: Vec<_> = lines
            .iter()
            .filter(|l| l.contains("\"action\":\"K\""))
            .collect();
        // the synthesized one at the commit LSN, plus the closing flush
        assert_eq!(keepalives.len(), 2);
        assert!(keepalives[0].contains("\"lsn\":\"0/210\""));
    }

    #[test]
    fn interleaved_dml_flushes_the_stashed_begin() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        ctx.process(meta(StreamAction::Begin, 42, 0x100), None).unwrap();
        ctx.process(meta(StreamAction::Insert, 42, 0x110), Some(json!({})))
            .unwrap();
        ctx.process(meta(StreamAction::Commit, 42, 0x120), None).unwrap();
        ctx.close().unwrap();

        let lines = written_lines(dir.path());
        assert!(lines[0].contains("\"action\":\"B\""));
        assert!(lines[1].contains("\"action\":\"I\""));
    }

    #[test]
    fn segment_rotation_writes_switch_and_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        let boundary = 0x1_0000_0000u64; // segment 256 with 16MB segments
        ctx.process(
            meta(StreamAction::Insert, 42, boundary - 8),
            Some(json!({})),
        )
        .unwrap();
        ctx.process(
            meta(StreamAction::Insert, 42, boundary + 16),
            Some(json!({})),
        )
        .unwrap();
        ctx.close().unwrap();

        let old = dir.path().join("0000000100000000000000FF.json");
        let new = dir.path().join("000000010000000100000000.json");
        assert!(old.exists(), "old segment file must be promoted");
        assert!(new.exists(), "new segment file must be promoted at close");

        let old_content = fs::read_to_string(&old).unwrap();
        let last_old = old_content.lines().last().unwrap();
        assert!(last_old.contains("\"action\":\"X\""));
        assert!(last_old.contains("\"lsn\":\"1/10\""));

        let new_content = fs::read_to_string(&new).unwrap();
        assert!(new_content.lines().next().unwrap().contains("\"lsn\":\"1/10\""));
    }

    #[test]
    fn flush_is_a_no_op_without_outstanding_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        ctx.flush().unwrap();
        assert_eq!(ctx.counters.messages_written, 0);

        ctx.process(meta(StreamAction::Insert, 42, 0x100), Some(json!({})))
            .unwrap();
        ctx.flush().unwrap();
        assert_eq!(ctx.flushed_lsn, Lsn(0x100));
        let after_first_flush = ctx.counters.messages_written;

        // no new writes: the second flush adds nothing
        ctx.flush().unwrap();
        assert_eq!(ctx.counters.messages_written, after_first_flush);
    }

    #[test]
    fn downstream_receives_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let (tx, rx) = std::sync::mpsc::sync_channel(64);
        ctx.set_downstream(tx);

        ctx.process(meta(StreamAction::Begin, 42, 0x100), None).unwrap();
        ctx.process(meta(StreamAction::Insert, 42, 0x110), Some(json!({})))
            .unwrap();
        ctx.process(meta(StreamAction::Commit, 42, 0x120), None).unwrap();

        let forwarded: Vec<String> = rx.try_iter().collect();
        assert_eq!(forwarded.len(), 3);
        assert!(forwarded[0].contains("\"action\":\"B\""));
    }
}
