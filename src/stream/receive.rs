//! Stream receiver
//!
//! Consumes the logical replication protocol against a pre-existing slot and
//! buffers every decoded record as a JSON line (see `context`). Feedback
//! runs on a fixed cadence: the file is fsynced, progress is published to
//! the sentinel (which hands back `endpos` and the applier's replay
//! position), and a standby status update goes to the server. Any error
//! other than a user stop is retried forever with a fixed backoff, resuming
//! from the last flushed position.

use crate::config::CdcConfig;
use crate::errors::{CdcError, CdcResult};
use crate::jsonfile::{find_latest_json_file, read_last_line};
use crate::lsn::{Lsn, parse_wal_segment_size};
use crate::protocol::{KeepaliveMessage, StandbyStatusUpdateMessage, XLogDataMessage};
use crate::queue::QueueSender;
use crate::buffer::BufferReader;
use crate::sentinel::SentinelStore;
use crate::stream::context::StreamContext;
use crate::stream::parser::parse_raw_record;
use crate::types::{MessageMetadata, StreamAction, StreamOutputPlugin};
use crate::utils::{
    ConnKind, CopyData, PgConnection, format_pg_timestamp_tz, system_time_to_postgres_timestamp,
};
use libpq_sys::ExecStatusType;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, instrument, warn};

/// Cadence of sentinel sync and standby status updates
const FEEDBACK_INTERVAL: Duration = Duration::from_secs(1);
/// Fixed sleep between replication reconnect attempts
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub const SIDECAR_WAL_SEGMENT_SIZE: &str = "wal_segment_size";
pub const SIDECAR_TIMELINE: &str = "tli";
pub const SIDECAR_TIMELINE_HISTORY: &str = "tli.history";

/// Write the sidecar files the transformer reads: segment geometry,
/// timeline, and the server's timeline history when there is one.
pub fn write_sidecar_files(
    dir: &Path,
    wal_segment_size: u64,
    timeline: u32,
    history: Option<&str>,
) -> CdcResult<()> {
    fs::create_dir_all(dir)?;
    fs::write(
        dir.join(SIDECAR_WAL_SEGMENT_SIZE),
        format!("{}\n", wal_segment_size),
    )?;
    fs::write(dir.join(SIDECAR_TIMELINE), format!("{}\n", timeline))?;
    if let Some(history) = history {
        fs::write(dir.join(SIDECAR_TIMELINE_HISTORY), history)?;
    }
    Ok(())
}

pub fn read_sidecar_wal_segment_size(dir: &Path) -> CdcResult<u64> {
    let text = fs::read_to_string(dir.join(SIDECAR_WAL_SEGMENT_SIZE))?;
    parse_wal_segment_size(text.trim())
}

pub fn read_sidecar_timeline(dir: &Path) -> CdcResult<u32> {
    let text = fs::read_to_string(dir.join(SIDECAR_TIMELINE))?;
    text.trim()
        .parse()
        .map_err(|_| CdcError::parse_with_context("Invalid timeline sidecar file", text.trim()))
}

/// Remove sidecar files left behind by a previous run
pub fn remove_sidecar_files(dir: &Path) -> CdcResult<()> {
    for name in [
        SIDECAR_WAL_SEGMENT_SIZE,
        SIDECAR_TIMELINE,
        SIDECAR_TIMELINE_HISTORY,
    ] {
        match fs::remove_file(dir.join(name)) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CdcError::Io(e)),
        }
    }
    Ok(())
}

/// Result row of IDENTIFY_SYSTEM
struct SourceIdentity {
    timeline: u32,
    xlogpos: Lsn,
}

/// The receive worker: one replication session at a time, reconnecting
/// forever until stopped or the end position is reached.
pub struct StreamReceiver {
    config: CdcConfig,
    stop: Arc<AtomicBool>,
    stop_fast: Arc<AtomicBool>,
    queue: Option<QueueSender>,
    downstream: Option<SyncSender<String>>,
    context: Option<StreamContext>,
    endpos: Lsn,
    replay_lsn: Lsn,
    reconnects: u64,
}

impl StreamReceiver {
    pub fn new(config: CdcConfig, stop: Arc<AtomicBool>, stop_fast: Arc<AtomicBool>) -> Self {
        let endpos = config.endpos.unwrap_or(Lsn::INVALID);
        Self {
            config,
            stop,
            stop_fast,
            queue: None,
            downstream: None,
            context: None,
            endpos,
            replay_lsn: Lsn::INVALID,
            reconnects: 0,
        }
    }

    /// Announce completed segments on this queue (prefetch/catchup mode)
    pub fn set_queue(&mut self, queue: QueueSender) {
        self.queue = Some(queue);
    }

    /// Forward every JSON line into this pipe (replay mode)
    pub fn set_downstream(&mut self, downstream: SyncSender<String>) {
        self.downstream = Some(downstream);
    }

    /// Run the receiver until the end position is reached or a stop is
    /// requested. Transient errors reconnect with a fixed backoff.
    #[instrument(skip_all, fields(slot = %self.config.slot_name))]
    pub fn run(&mut self) -> CdcResult<()> {
        let sentinel = SentinelStore::connect(&self.config.source_pguri)?;
        let sql_conn = PgConnection::connect(&self.config.source_pguri, ConnKind::Source)?;
        check_not_in_recovery(&sql_conn)?;

        loop {
            match self.session(&sentinel, &sql_conn) {
                Ok(()) => {
                    info!(
                        "Stream receiver done after {} reconnect(s)",
                        self.reconnects
                    );
                    return Ok(());
                }
                Err(_) if self.stop.load(Ordering::SeqCst) => {
                    // the failure came from tearing the session down
                    return Ok(());
                }
                Err(e) => {
                    warn!("Replication session failed: {}, reconnecting", e);
                    self.reconnects += 1;
                    std::thread::sleep(RECONNECT_BACKOFF);
                }
            }
        }
    }

    /// One replication session: connect, resolve the start position, stream
    /// until endpos, stop, or error.
    fn session(&mut self, sentinel: &SentinelStore, sql_conn: &PgConnection) -> CdcResult<()> {
        let conn = PgConnection::connect_replication(&self.config.source_pguri)?;
        let identity = identify_system(&conn)?;
        let wal_segment_size = retrieve_wal_segment_size(&conn)?;

        if self.context.is_none() {
            let history = timeline_history(&conn, identity.timeline)?;
            write_sidecar_files(
                &self.config.dir,
                wal_segment_size,
                identity.timeline,
                history.as_deref(),
            )?;

            let mut context = StreamContext::new(
                self.config.dir.clone(),
                wal_segment_size,
                identity.timeline,
            );
            if let Some(queue) = self.queue.take() {
                context.set_queue(queue);
            }
            if let Some(downstream) = self.downstream.take() {
                context.set_downstream(downstream);
            }
            self.context = Some(context);
        }

        let startpos = self.resolve_startpos(sentinel, sql_conn, &identity)?;
        start_replication(&conn, &self.config.slot_name, startpos, self.config.plugin)?;
        info!(
            "Streaming changes from {} with plugin {}",
            startpos,
            self.config.plugin.name()
        );

        self.stream_loop(&conn, sentinel)
    }

    /// Initialize the start position: the tail of the most recent JSON
    /// file, else the sentinel, else the slot's confirmed flush position.
    /// A position behind the slot means lost WAL, which is fatal.
    fn resolve_startpos(
        &mut self,
        sentinel: &SentinelStore,
        sql_conn: &PgConnection,
        identity: &SourceIdentity,
    ) -> CdcResult<Lsn> {
        if let Some(context) = &self.context {
            if context.flushed_lsn.is_valid() {
                // reconnect: resume from what reached disk
                return Ok(context.flushed_lsn);
            }
        }

        let slot_lsn = slot_position(sql_conn, &self.config.slot_name)?;

        let resume = match latest_file_lsn(&self.config.dir)? {
            Some(lsn) => {
                debug!("Resuming from the latest JSON file at {}", lsn);
                Some(lsn)
            }
            None => {
                let startpos = sentinel.get()?.startpos;
                startpos.is_valid().then_some(startpos)
            }
        };

        match resume {
            Some(lsn) => {
                if lsn < slot_lsn {
                    return Err(CdcError::source(format!(
                        "Resume position {} is behind the slot position {}: \
                         that WAL is gone from the slot",
                        lsn, slot_lsn
                    )));
                }
                Ok(lsn)
            }
            None if slot_lsn.is_valid() => Ok(slot_lsn),
            None => Ok(identity.xlogpos),
        }
    }

    fn stream_loop(&mut self, conn: &PgConnection, sentinel: &SentinelStore) -> CdcResult<()> {
        // force an immediate first feedback round
        let mut last_feedback = Instant::now() - FEEDBACK_INTERVAL;

        loop {
            if self.stop_fast.load(Ordering::SeqCst) {
                // fast stop skips the final flush
                return Ok(());
            }
            if self.stop.load(Ordering::SeqCst) {
                return self.shutdown(conn);
            }

            if last_feedback.elapsed() >= FEEDBACK_INTERVAL {
                self.feedback_round(conn, sentinel)?;
                last_feedback = Instant::now();
                if self.endpos_reached() {
                    info!("Reached endpos {}", self.endpos);
                    return self.shutdown(conn);
                }
            }

            let wait = FEEDBACK_INTERVAL.saturating_sub(last_feedback.elapsed());
            if !conn.await_readable(wait)? {
                continue;
            }
            conn.consume_input()?;

            loop {
                match conn.get_copy_data_async()? {
                    CopyData::WouldBlock => break,
                    CopyData::Done => {
                        return Err(CdcError::protocol("Server ended the replication stream"));
                    }
                    CopyData::Row(data) => self.handle_copy_row(conn, &data)?,
                }

                if self.endpos_reached() {
                    info!("Reached endpos {}", self.endpos);
                    return self.shutdown(conn);
                }
                if self.stop.load(Ordering::SeqCst) || self.stop_fast.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    fn handle_copy_row(&mut self, conn: &PgConnection, data: &[u8]) -> CdcResult<()> {
        match data.first().copied().map(char::from) {
            Some('k') => {
                let keepalive = KeepaliveMessage::try_from(BufferReader::new(data))?;
                let metadata = MessageMetadata::new(
                    StreamAction::Keepalive,
                    0,
                    Lsn(keepalive.wal_end),
                    format_pg_timestamp_tz(keepalive.timestamp),
                );
                self.context_mut().process(metadata, None)?;
                if keepalive.reply_requested {
                    debug!("Server requested feedback in keepalive");
                    self.send_feedback(conn)?;
                }
                Ok(())
            }
            Some('w') => {
                let xlog = XLogDataMessage::try_from(BufferReader::new(data))?;
                let payload = std::str::from_utf8(&xlog.data).map_err(|_| {
                    CdcError::parse("Output plugin sent a record that is not UTF-8")
                })?;
                let (metadata, value) = parse_raw_record(
                    self.config.plugin,
                    payload,
                    Lsn(xlog.data_start),
                    format_pg_timestamp_tz(xlog.send_time),
                )?;
                self.context_mut().process(metadata, Some(value))
            }
            Some(other) => {
                warn!("Ignoring unknown replication message type: {}", other);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Flush to disk, publish progress to the sentinel, refresh endpos, and
    /// send a standby status update.
    fn feedback_round(&mut self, conn: &PgConnection, sentinel: &SentinelStore) -> CdcResult<()> {
        self.context_mut().flush()?;

        let (written, flushed) = {
            let context = self.context_ref();
            (context.written_lsn, context.flushed_lsn)
        };
        match sentinel.sync_receive(written, flushed) {
            Ok(snapshot) => {
                self.endpos = snapshot.endpos;
                self.replay_lsn = snapshot.replay_lsn;
            }
            Err(e) => {
                // never block the stream on sentinel trouble; retry at the
                // next cadence
                warn!("Sentinel sync failed: {}", e);
            }
        }

        self.send_feedback(conn)
    }

    fn send_feedback(&mut self, conn: &PgConnection) -> CdcResult<()> {
        let context = self.context_ref();
        let message = StandbyStatusUpdateMessage {
            write_lsn: context.written_lsn.0,
            flush_lsn: context.flushed_lsn.0,
            apply_lsn: self.replay_lsn.0,
            send_time: system_time_to_postgres_timestamp(SystemTime::now()),
            reply_requested: false,
        };
        let mut buf = [0u8; StandbyStatusUpdateMessage::WIRE_SIZE];
        message.write(&mut buf)?;
        conn.put_copy_data(&buf)?;
        conn.flush()?;

        debug!(
            "Sent feedback write {} flush {} replay {}",
            context.written_lsn, context.flushed_lsn, self.replay_lsn
        );
        Ok(())
    }

    fn endpos_reached(&self) -> bool {
        self.endpos.is_valid()
            && self
                .context
                .as_ref()
                .is_some_and(|c| c.written_lsn.is_valid() && self.endpos <= c.written_lsn)
    }

    /// Clean termination: flush, promote, tell the transformer, final
    /// feedback.
    fn shutdown(&mut self, conn: &PgConnection) -> CdcResult<()> {
        self.context_mut().close()?;
        if let Err(e) = self.send_feedback(conn) {
            warn!("Failed to send final feedback: {}", e);
        }
        Ok(())
    }

    fn context_mut(&mut self) -> &mut StreamContext {
        self.context.as_mut().expect("stream context is initialized")
    }

    fn context_ref(&self) -> &StreamContext {
        self.context.as_ref().expect("stream context is initialized")
    }
}

fn check_not_in_recovery(conn: &PgConnection) -> CdcResult<()> {
    let result = conn.exec_ok("SELECT pg_is_in_recovery()")?;
    if result.getvalue(0, 0).as_deref() == Some("t") {
        return Err(CdcError::source(
            "Source server is in recovery; streaming requires a primary",
        ));
    }
    Ok(())
}

fn identify_system(conn: &PgConnection) -> CdcResult<SourceIdentity> {
    let result = conn.exec_ok("IDENTIFY_SYSTEM")?;
    let timeline = result
        .getvalue(0, 1)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| conn.error("IDENTIFY_SYSTEM returned no timeline"))?;
    let xlogpos = result
        .getvalue(0, 2)
        .ok_or_else(|| conn.error("IDENTIFY_SYSTEM returned no xlogpos"))?
        .parse()?;
    info!("Source is on timeline {} at {}", timeline, xlogpos);
    Ok(SourceIdentity { timeline, xlogpos })
}

fn retrieve_wal_segment_size(conn: &PgConnection) -> CdcResult<u64> {
    let result = conn.exec_ok("SHOW wal_segment_size")?;
    let text = result
        .getvalue(0, 0)
        .ok_or_else(|| conn.error("SHOW wal_segment_size returned nothing"))?;
    parse_wal_segment_size(&text)
}

/// Fetch the server's timeline history file content, absent on timeline 1.
fn timeline_history(conn: &PgConnection, timeline: u32) -> CdcResult<Option<String>> {
    if timeline <= 1 {
        return Ok(None);
    }
    let result = conn.exec_ok(&format!("TIMELINE_HISTORY {}", timeline))?;
    Ok(result.getvalue(0, 1))
}

/// The slot's confirmed flush position; fails when the slot is missing.
fn slot_position(conn: &PgConnection, slot_name: &str) -> CdcResult<Lsn> {
    let result = conn.exec_params_ok(
        "SELECT confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = $1",
        &[Some(slot_name)],
    )?;
    if result.ntuples() == 0 {
        return Err(CdcError::source(format!(
            "Replication slot {:?} does not exist on the source; \
             create it before streaming",
            slot_name
        )));
    }
    match result.getvalue(0, 0) {
        Some(text) => text.parse(),
        None => Ok(Lsn::INVALID),
    }
}

/// LSN of the last record in the most recently touched JSON file
fn latest_file_lsn(dir: &Path) -> CdcResult<Option<Lsn>> {
    let Some(path) = find_latest_json_file(dir)? else {
        return Ok(None);
    };
    let Some(line) = read_last_line(&path)? else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(&line)
        .map_err(|e| CdcError::parse_with_context(format!("Invalid JSON line: {}", e), &line))?;
    match value.get("lsn").and_then(Value::as_str) {
        Some(text) => Ok(Some(text.parse()?)),
        None => Ok(None),
    }
}

fn start_replication(
    conn: &PgConnection,
    slot_name: &str,
    startpos: Lsn,
    plugin: StreamOutputPlugin,
) -> CdcResult<()> {
    let options = plugin_options(plugin)
        .iter()
        .map(|(name, value)| format!("\"{}\" '{}'", name, value))
        .collect::<Vec<_>>()
        .join(", ");
    let command = format!(
        "START_REPLICATION SLOT \"{}\" LOGICAL {} ({})",
        slot_name, startpos, options
    );
    debug!("Starting replication: {}", command);

    let result = conn.exec(&command)?;
    if result.status() != ExecStatusType::PGRES_COPY_BOTH {
        return Err(conn.error("Failed to start replication"));
    }
    Ok(())
}

/// Output-plugin options, per plugin
fn plugin_options(plugin: StreamOutputPlugin) -> Vec<(&'static str, &'static str)> {
    match plugin {
        StreamOutputPlugin::TestDecoding => vec![("include-xids", "true")],
        StreamOutputPlugin::Wal2json => vec![
            ("format-version", "2"),
            ("include-xids", "true"),
            ("include-schemas", "true"),
            ("include-transaction", "true"),
            ("include-types", "true"),
            ("filter-tables", "pgcopydb.*"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_sidecar_files(dir.path(), 16 * 1024 * 1024, 3, Some("1\t0/1000000\tno reason\n"))
            .unwrap();

        assert_eq!(
            read_sidecar_wal_segment_size(dir.path()).unwrap(),
            16 * 1024 * 1024
        );
        assert_eq!(read_sidecar_timeline(dir.path()).unwrap(), 3);
        assert!(dir.path().join(SIDECAR_TIMELINE_HISTORY).exists());

        remove_sidecar_files(dir.path()).unwrap();
        assert!(!dir.path().join(SIDECAR_WAL_SEGMENT_SIZE).exists());
        assert!(!dir.path().join(SIDECAR_TIMELINE).exists());
        assert!(!dir.path().join(SIDECAR_TIMELINE_HISTORY).exists());
        // removing again is fine
        remove_sidecar_files(dir.path()).unwrap();
    }

    #[test]
    fn latest_file_lsn_reads_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_file_lsn(dir.path()).unwrap().is_none());

        let mut file =
            crate::jsonfile::WalJsonFile::open(dir.path(), "000000010000000000000000").unwrap();
        file.append(r#"{"action":"B","lsn":"0/100"}"#).unwrap();
        file.append(r#"{"action":"C","lsn":"0/120"}"#).unwrap();
        file.close_and_promote().unwrap();

        assert_eq!(latest_file_lsn(dir.path()).unwrap(), Some(Lsn(0x120)));
    }

    #[test]
    fn plugin_options_follow_the_plugin() {
        let options = plugin_options(StreamOutputPlugin::TestDecoding);
        assert_eq!(options, vec![("include-xids", "true")]);

        let options = plugin_options(StreamOutputPlugin::Wal2json);
        assert!(options.contains(&("format-version", "2")));
        assert!(options.contains(&("filter-tables", "pgcopydb.*")));
    }
}
