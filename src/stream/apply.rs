//! SQL stream applier
//!
//! Reads the transformed SQL stream line by line and applies it to the
//! target behind a replication origin: the origin session is set up before
//! the first BEGIN, each transaction is stamped with its source commit LSN,
//! and transactions at or below the origin's recorded progress are skipped,
//! which makes replay after a restart idempotent. PREPARE handles are
//! tracked per session so identical statements prepare once and rebind
//! thereafter.

use crate::config::CdcConfig;
use crate::errors::{CdcError, CdcResult};
use crate::lsn::{Lsn, wal_segment_filename};
use crate::sentinel::SentinelStore;
use crate::stream::receive::{read_sidecar_timeline, read_sidecar_wal_segment_size};
use crate::utils::{ConnKind, PgConnection, Xid};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Sentinel poll interval while apply is disabled or input is exhausted
const APPLY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// JSON metadata of BEGIN/COMMIT/ROLLBACK records
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TxnMeta {
    pub xid: Xid,
    pub lsn: Lsn,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub commit_lsn: Option<Lsn>,
}

/// One parsed line of the SQL stream
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyInstruction {
    Begin(TxnMeta),
    Commit(TxnMeta),
    Rollback(TxnMeta),
    Switch(Lsn),
    Keepalive { lsn: Lsn },
    Endpos(Lsn),
    Prepare { handle: String, sql: String },
    Execute { handle: String, params: Vec<Option<String>> },
}

#[derive(Debug, Deserialize)]
struct LsnMeta {
    lsn: Lsn,
}

/// Parse one line of the SQL stream into its instruction.
pub fn parse_sql_line(line: &str) -> CdcResult<ApplyInstruction> {
    if let Some(json) = line.strip_prefix("BEGIN ") {
        return Ok(ApplyInstruction::Begin(serde_json::from_str(json)?));
    }
    if let Some(json) = line.strip_prefix("COMMIT ") {
        return Ok(ApplyInstruction::Commit(serde_json::from_str(json)?));
    }
    if let Some(json) = line.strip_prefix("ROLLBACK ") {
        return Ok(ApplyInstruction::Rollback(serde_json::from_str(json)?));
    }
    if let Some(json) = line.strip_prefix("SWITCH ") {
        let meta: LsnMeta = serde_json::from_str(json)?;
        return Ok(ApplyInstruction::Switch(meta.lsn));
    }
    if let Some(json) = line.strip_prefix("KEEPALIVE ") {
        let meta: LsnMeta = serde_json::from_str(json)?;
        return Ok(ApplyInstruction::Keepalive { lsn: meta.lsn });
    }
    if let Some(json) = line.strip_prefix("ENDPOS ") {
        let meta: LsnMeta = serde_json::from_str(json)?;
        return Ok(ApplyInstruction::Endpos(meta.lsn));
    }
    if let Some(rest) = line.strip_prefix("PREPARE ") {
        let (handle, sql) = rest.split_once(" AS ").ok_or_else(|| {
            CdcError::parse_with_context("PREPARE line is missing AS", line)
        })?;
        let sql = sql.strip_suffix(';').unwrap_or(sql);
        return Ok(ApplyInstruction::Prepare {
            handle: handle.to_string(),
            sql: sql.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("EXECUTE ") {
        let bracket = rest.find('[').ok_or_else(|| {
            CdcError::parse_with_context("EXECUTE line is missing its parameters", line)
        })?;
        let handle = &rest[..bracket];
        let params = rest[bracket..].strip_suffix(';').unwrap_or(&rest[bracket..]);
        let params: Vec<Option<String>> = serde_json::from_str(params)?;
        return Ok(ApplyInstruction::Execute {
            handle: handle.to_string(),
            params,
        });
    }
    Err(CdcError::parse_with_context(
        "Unrecognized SQL stream line",
        line,
    ))
}

/// Whether the stream should keep going after an instruction
#[derive(Debug, PartialEq, Eq)]
enum ApplyOutcome {
    Continue,
    /// Endpos reached; terminate with success
    Done,
}

/// The apply worker: one target session behind a replication origin
pub struct SqlApplier {
    conn: PgConnection,
    sentinel: SentinelStore,
    origin: String,
    stop: Arc<AtomicBool>,
    stop_fast: Arc<AtomicBool>,
    /// handle → SQL text, for collision detection
    prepared: HashMap<String, String>,
    origin_session_ready: bool,
    /// origin progress at session start; transactions at or below it were
    /// already applied
    previous_progress: Lsn,
    in_transaction: bool,
    skipping_transaction: bool,
    xact_lsn_known: bool,
    replay_lsn: Lsn,
    endpos: Lsn,
}

impl SqlApplier {
    pub fn connect(
        config: &CdcConfig,
        stop: Arc<AtomicBool>,
        stop_fast: Arc<AtomicBool>,
    ) -> CdcResult<Self> {
        let conn = PgConnection::connect(&config.target_pguri, ConnKind::Target)?;
        let sentinel = SentinelStore::connect(&config.source_pguri)?;
        Ok(Self {
            conn,
            sentinel,
            origin: config.origin.clone(),
            stop,
            stop_fast,
            prepared: HashMap::new(),
            origin_session_ready: false,
            previous_progress: Lsn::INVALID,
            in_transaction: false,
            skipping_transaction: false,
            xact_lsn_known: false,
            replay_lsn: Lsn::INVALID,
            endpos: config.endpos.unwrap_or(Lsn::INVALID),
        })
    }

    /// Apply lines arriving on a pipe (replay mode) until the pipe closes,
    /// endpos is reached, or a stop is requested.
    #[instrument(skip_all)]
    pub fn run_pipe(&mut self, input: Receiver<String>) -> CdcResult<()> {
        while let Ok(line) = input.recv() {
            if self.stop_fast.load(Ordering::SeqCst) {
                return Ok(());
            }
            let instruction = parse_sql_line(&line)?;
            if self.apply(instruction)? == ApplyOutcome::Done {
                return Ok(());
            }
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Apply lines from any buffered reader (e.g. a SQL stream on stdin).
    pub fn run_reader<R: BufRead>(&mut self, reader: R) -> CdcResult<()> {
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            if self.stop_fast.load(Ordering::SeqCst) {
                return Ok(());
            }
            let instruction = parse_sql_line(&line)?;
            if self.apply(instruction)? == ApplyOutcome::Done {
                return Ok(());
            }
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Apply SQL files from disk (catchup mode), following segment switches.
    ///
    /// With `wait_for_more` the applier waits for the transformer whenever
    /// it runs out of files or lines; without it the call returns as soon as
    /// the on-disk backlog is applied, which is what the supervisor's
    /// synchronous catchup pass needs.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn run_catchup(&mut self, dir: &Path, wait_for_more: bool) -> CdcResult<()> {
        let wal_segment_size = read_sidecar_wal_segment_size(dir)?;
        let timeline = read_sidecar_timeline(dir)?;

        let snapshot = self.sentinel.get()?;
        self.endpos = snapshot.endpos;
        let position = if snapshot.replay_lsn.is_valid() {
            snapshot.replay_lsn
        } else {
            snapshot.startpos
        };
        let mut segment = position.segment_number(wal_segment_size);
        let mut consumed = 0u64;

        info!("Catching up from {} (segment {})", position, segment);

        loop {
            if self.should_stop() {
                return Ok(());
            }

            let walfile = wal_segment_filename(timeline, segment, wal_segment_size);
            let path = dir.join(format!("{}.sql", walfile));
            if !path.exists() {
                if !wait_for_more {
                    return Ok(());
                }
                if self.wait_for_input()? {
                    return Ok(());
                }
                continue;
            }

            let reader = BufReader::new(File::open(&path)?);
            let mut switched_to = None;
            let mut line_no = 0u64;
            for line in reader.lines() {
                let line = line?;
                line_no += 1;
                if line_no <= consumed {
                    continue;
                }
                if self.stop_fast.load(Ordering::SeqCst) {
                    return Ok(());
                }

                let instruction = parse_sql_line(&line)?;
                if let ApplyInstruction::Switch(lsn) = &instruction {
                    switched_to = Some(*lsn);
                }
                if self.apply(instruction)? == ApplyOutcome::Done {
                    return Ok(());
                }
                consumed = line_no;
            }

            match switched_to {
                Some(lsn) => {
                    segment = lsn.segment_number(wal_segment_size);
                    consumed = 0;
                    debug!("Following switch to segment {}", segment);
                }
                None => {
                    if !wait_for_more {
                        return Ok(());
                    }
                    // tail of the stream so far; wait for the transformer
                    if self.wait_for_input()? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.stop_fast.load(Ordering::SeqCst)
    }

    /// Sleep one poll interval and refresh control state. Returns true when
    /// the applier should terminate successfully.
    fn wait_for_input(&mut self) -> CdcResult<bool> {
        if self.should_stop() {
            return Ok(true);
        }
        std::thread::sleep(APPLY_POLL_INTERVAL);
        match self.sentinel.get() {
            Ok(snapshot) => {
                self.endpos = snapshot.endpos;
                if self.endpos.is_valid()
                    && self.replay_lsn.is_valid()
                    && self.endpos <= self.replay_lsn
                {
                    info!("Reached endpos {} while waiting for input", self.endpos);
                    return Ok(true);
                }
            }
            Err(e) => warn!("Sentinel read failed while waiting: {}", e),
        }
        Ok(false)
    }

    fn apply(&mut self, instruction: ApplyInstruction) -> CdcResult<ApplyOutcome> {
        match instruction {
            ApplyInstruction::Begin(meta) => self.on_begin(meta),
            ApplyInstruction::Commit(meta) => self.on_commit(meta),
            ApplyInstruction::Rollback(meta) => self.on_rollback(meta),
            ApplyInstruction::Prepare { handle, sql } => {
                self.on_prepare(&handle, &sql)?;
                Ok(ApplyOutcome::Continue)
            }
            ApplyInstruction::Execute { handle, params } => {
                self.on_execute(&handle, &params)?;
                Ok(ApplyOutcome::Continue)
            }
            ApplyInstruction::Keepalive { lsn } => {
                if lsn > self.replay_lsn {
                    self.replay_lsn = lsn;
                    let _ = self.sentinel.update_replay(lsn);
                }
                Ok(ApplyOutcome::Continue)
            }
            ApplyInstruction::Switch(_) => Ok(ApplyOutcome::Continue),
            ApplyInstruction::Endpos(lsn) => {
                match self.sentinel.get() {
                    Ok(snapshot) => self.endpos = snapshot.endpos,
                    Err(e) => warn!("Sentinel read failed on ENDPOS: {}", e),
                }
                if self.endpos.is_valid() && self.endpos <= lsn {
                    info!("ENDPOS {} at or past endpos {}", lsn, self.endpos);
                    return Ok(ApplyOutcome::Done);
                }
                Ok(ApplyOutcome::Continue)
            }
        }
    }

    fn on_begin(&mut self, meta: TxnMeta) -> CdcResult<ApplyOutcome> {
        self.ensure_origin_session()?;

        // apply may be switched off while catching up; hold here rather
        // than start a transaction that would have to be abandoned
        loop {
            match self.sentinel.get() {
                Ok(snapshot) => {
                    self.endpos = snapshot.endpos;
                    if snapshot.apply {
                        break;
                    }
                    if self.endpos.is_valid()
                        && self.replay_lsn.is_valid()
                        && self.endpos <= self.replay_lsn
                    {
                        return Ok(ApplyOutcome::Done);
                    }
                }
                Err(e) => warn!("Sentinel read failed before BEGIN: {}", e),
            }
            if self.should_stop() {
                return Ok(ApplyOutcome::Done);
            }
            debug!("apply is disabled, waiting");
            std::thread::sleep(APPLY_POLL_INTERVAL);
        }

        // skip transactions the origin has already seen
        if let Some(commit_lsn) = meta.commit_lsn {
            if self.previous_progress.is_valid() && commit_lsn <= self.previous_progress {
                debug!(
                    "Skipping already-applied transaction {} (commit {} <= progress {})",
                    meta.xid, commit_lsn, self.previous_progress
                );
                self.skipping_transaction = true;
                return Ok(ApplyOutcome::Continue);
            }
        }

        self.exec_target("BEGIN")?;
        self.in_transaction = true;
        self.xact_lsn_known = false;

        // with the commit LSN already known, stamp the origin now
        if let Some(commit_lsn) = meta.commit_lsn {
            self.origin_xact_setup(commit_lsn, &meta.timestamp)?;
            self.xact_lsn_known = true;
        }
        Ok(ApplyOutcome::Continue)
    }

    fn on_commit(&mut self, meta: TxnMeta) -> CdcResult<ApplyOutcome> {
        if self.skipping_transaction {
            self.skipping_transaction = false;
        } else {
            if self.in_transaction && !self.xact_lsn_known {
                self.origin_xact_setup(meta.lsn, &meta.timestamp)?;
            }
            if self.in_transaction {
                self.exec_target("COMMIT")?;
                self.in_transaction = false;
            }
        }

        self.replay_lsn = meta.lsn;
        let _ = self.sentinel.update_replay(meta.lsn);

        if self.endpos.is_valid() && self.endpos <= self.replay_lsn {
            info!("Reached endpos {} at commit {}", self.endpos, meta.lsn);
            return Ok(ApplyOutcome::Done);
        }
        Ok(ApplyOutcome::Continue)
    }

    fn on_rollback(&mut self, meta: TxnMeta) -> CdcResult<ApplyOutcome> {
        if self.skipping_transaction {
            self.skipping_transaction = false;
        } else if self.in_transaction {
            self.exec_target("ROLLBACK")?;
            self.in_transaction = false;
        }
        self.replay_lsn = meta.lsn;
        let _ = self.sentinel.update_replay(meta.lsn);
        Ok(ApplyOutcome::Continue)
    }

    fn on_prepare(&mut self, handle: &str, sql: &str) -> CdcResult<()> {
        match self.prepared.get(handle) {
            Some(known) if known == sql => Ok(()),
            Some(_) => {
                // content-hash collision within this session: replace the
                // server-side statement
                warn!("Statement handle collision on {}, re-preparing", handle);
                self.exec_target(&format!("DEALLOCATE \"{}\"", handle))?;
                self.conn.prepare(handle, sql)?;
                self.prepared.insert(handle.to_string(), sql.to_string());
                Ok(())
            }
            None => {
                self.conn.prepare(handle, sql)?;
                self.prepared.insert(handle.to_string(), sql.to_string());
                Ok(())
            }
        }
    }

    fn on_execute(&mut self, handle: &str, params: &[Option<String>]) -> CdcResult<()> {
        if self.skipping_transaction {
            return Ok(());
        }
        if !self.prepared.contains_key(handle) {
            return Err(CdcError::target(format!(
                "EXECUTE {} without a preceding PREPARE",
                handle
            )));
        }
        let params: Vec<Option<&str>> = params.iter().map(Option::as_deref).collect();
        let result = self.conn.exec_prepared(handle, &params)?;
        if !result.is_ok() {
            return Err(self.conn.error(&format!("EXECUTE {} failed", handle)));
        }
        Ok(())
    }

    /// Create the origin if needed, set up the origin session, and read the
    /// origin's recorded progress for idempotent replay.
    fn ensure_origin_session(&mut self) -> CdcResult<()> {
        if self.origin_session_ready {
            return Ok(());
        }

        let result = self.conn.exec_params_ok(
            "SELECT pg_replication_origin_oid($1)",
            &[Some(&self.origin)],
        )?;
        if result.getvalue(0, 0).is_none() {
            info!("Creating replication origin {:?}", self.origin);
            self.conn.exec_params_ok(
                "SELECT pg_replication_origin_create($1)",
                &[Some(&self.origin)],
            )?;
        } else {
            let progress = self.conn.exec_params_ok(
                "SELECT pg_replication_origin_progress($1, true)",
                &[Some(&self.origin)],
            )?;
            if let Some(text) = progress.getvalue(0, 0) {
                self.previous_progress = text.parse()?;
                info!(
                    "Replication origin {:?} is at {}",
                    self.origin, self.previous_progress
                );
            }
        }

        self.conn.exec_params_ok(
            "SELECT pg_replication_origin_session_setup($1)",
            &[Some(&self.origin)],
        )?;
        self.origin_session_ready = true;
        Ok(())
    }

    /// Stamp the current transaction with its source commit position; the
    /// origin advances when the transaction commits.
    fn origin_xact_setup(&mut self, commit_lsn: Lsn, timestamp: &str) -> CdcResult<()> {
        let timestamp = if timestamp.is_empty() {
            None
        } else {
            Some(timestamp)
        };
        self.conn.exec_params_ok(
            "SELECT pg_replication_origin_xact_setup($1, $2)",
            &[Some(&commit_lsn.to_string()), timestamp],
        )?;
        Ok(())
    }

    fn exec_target(&mut self, sql: &str) -> CdcResult<()> {
        self.conn.exec_ok(sql)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_txn_metadata_records() {
        let begin = parse_sql_line(
            r#"BEGIN {"xid":42,"lsn":"0/100","timestamp":"2024-01-01 00:00:00+00","commit_lsn":"0/120"}"#,
        )
        .unwrap();
        match begin {
            ApplyInstruction::Begin(meta) => {
                assert_eq!(meta.xid, 42);
                assert_eq!(meta.lsn, Lsn(0x100));
                assert_eq!(meta.commit_lsn, Some(Lsn(0x120)));
            }
            other => panic!("expected begin, got {:?}", other),
        }

        let commit = parse_sql_line(
            r#"COMMIT {"xid":42,"lsn":"0/120","timestamp":"2024-01-01 00:00:00+00"}"#,
        )
        .unwrap();
        match commit {
            ApplyInstruction::Commit(meta) => {
                assert_eq!(meta.lsn, Lsn(0x120));
                assert_eq!(meta.commit_lsn, None);
            }
            other => panic!("expected commit, got {:?}", other),
        }
    }

    #[test]
    fn parses_prepare_and_execute() {
        let prepare = parse_sql_line(
            "PREPARE abcd1234 AS INSERT INTO \"public\".\"t\" (id) overriding system value VALUES ($1);",
        )
        .unwrap();
        match prepare {
            ApplyInstruction::Prepare { handle, sql } => {
                assert_eq!(handle, "abcd1234");
                assert_eq!(
                    sql,
                    "INSERT INTO \"public\".\"t\" (id) overriding system value VALUES ($1)"
                );
            }
            other => panic!("expected prepare, got {:?}", other),
        }

        let execute = parse_sql_line(r#"EXECUTE abcd1234["1","a",null];"#).unwrap();
        match execute {
            ApplyInstruction::Execute { handle, params } => {
                assert_eq!(handle, "abcd1234");
                assert_eq!(
                    params,
                    vec![Some("1".to_string()), Some("a".to_string()), None]
                );
            }
            other => panic!("expected execute, got {:?}", other),
        }
    }

    #[test]
    fn parses_control_records() {
        assert_eq!(
            parse_sql_line(r#"SWITCH {"lsn":"1/0"}"#).unwrap(),
            ApplyInstruction::Switch(Lsn(0x1_0000_0000))
        );
        assert_eq!(
            parse_sql_line(r#"KEEPALIVE {"lsn":"0/200","timestamp":"ts"}"#).unwrap(),
            ApplyInstruction::Keepalive { lsn: Lsn(0x200) }
        );
        assert_eq!(
            parse_sql_line(r#"ENDPOS {"lsn":"0/500"}"#).unwrap(),
            ApplyInstruction::Endpos(Lsn(0x500))
        );
    }

    #[test]
    fn rejects_unknown_lines() {
        assert!(parse_sql_line("DROP TABLE students;").is_err());
        assert!(parse_sql_line("").is_err());
        assert!(parse_sql_line("EXECUTE abcd1234;").is_err());
    }

    #[test]
    fn emitted_output_parses_back() {
        // what the emitter writes, the applier must read
        use crate::stream::emit::SqlEmitter;
        use crate::types::{
            LogicalMessageAttribute, LogicalMessageRelation, LogicalMessageTuple,
            LogicalMessageValue, LogicalTransaction, LogicalTransactionStatement,
        };

        let mut tuple = LogicalMessageTuple::default();
        tuple.attributes.push(LogicalMessageAttribute::new("id", 23));
        tuple.rows.push(vec![LogicalMessageValue::Int(1)]);

        let mut txn = LogicalTransaction::open(42, Lsn(0x100), "ts".into());
        txn.statements.push(LogicalTransactionStatement::Insert {
            relation: LogicalMessageRelation::new("public", "t"),
            new: tuple,
        });
        txn.commit = true;
        txn.commit_lsn = Lsn(0x120);

        let mut emitter = SqlEmitter::new(Vec::new());
        emitter.emit_transaction(&txn).unwrap();
        let output = String::from_utf8(emitter.into_inner()).unwrap();

        for line in output.lines() {
            parse_sql_line(line).unwrap();
        }
    }
}
