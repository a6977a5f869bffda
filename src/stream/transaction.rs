//! Transaction assembly
//!
//! Consumes parsed stream records, maintains the current in-memory
//! transaction, and hands completed transactions to the SQL emitter.
//! Consecutive compatible INSERTs coalesce into one multi-row statement, and
//! control records received mid-transaction force a split: the open
//! transaction is emitted without COMMIT and a continuation picks up the
//! rest, which keeps each SQL file self-contained for its WAL segment.

use crate::catalog::GeneratedColumnCache;
use crate::errors::{CdcError, CdcResult};
use crate::stream::emit::SqlEmitter;
use crate::stream::parser::ParsedMessage;
use crate::types::{
    LogicalTransaction, LogicalTransactionStatement, MAX_PREPARED_PARAMS, MessageMetadata,
    StreamAction,
};
use std::io::Write;
use tracing::debug;

/// Builds transactions out of the record stream
pub struct TransactionAssembler {
    current: Option<LogicalTransaction>,
    cache: GeneratedColumnCache,
}

impl TransactionAssembler {
    pub fn new(cache: GeneratedColumnCache) -> Self {
        Self {
            current: None,
            cache,
        }
    }

    /// Feed one parsed record; completed transactions go to `emitter`.
    pub fn process<W: Write>(
        &mut self,
        message: ParsedMessage,
        emitter: &mut SqlEmitter<W>,
    ) -> CdcResult<()> {
        let metadata = message.metadata;
        match metadata.action {
            StreamAction::Begin => self.on_begin(&metadata),
            StreamAction::Commit => self.on_commit(&metadata, emitter),
            StreamAction::Rollback => self.on_rollback(&metadata, emitter),
            StreamAction::Insert
            | StreamAction::Update
            | StreamAction::Delete
            | StreamAction::Truncate => {
                let statement = message.statement.ok_or_else(|| {
                    CdcError::parse("DML record reached the assembler without a statement")
                })?;
                self.on_dml(&metadata, statement)
            }
            StreamAction::Switch => self.on_control(
                LogicalTransactionStatement::Switch { lsn: metadata.lsn },
                emitter,
            ),
            StreamAction::Keepalive => self.on_control(
                LogicalTransactionStatement::Keepalive {
                    lsn: metadata.lsn,
                    timestamp: metadata.timestamp.clone(),
                },
                emitter,
            ),
            StreamAction::Endpos => self.on_control(
                LogicalTransactionStatement::Endpos { lsn: metadata.lsn },
                emitter,
            ),
            StreamAction::Message => Ok(()),
        }
    }

    /// Emit whatever transaction is still open, without a commit marker.
    ///
    /// Called at the end of a partial file so its SQL rendition is complete;
    /// the next file carries the continuation.
    pub fn finish<W: Write>(&mut self, emitter: &mut SqlEmitter<W>) -> CdcResult<()> {
        if let Some(txn) = self.current.take() {
            debug!(
                "Emitting open transaction {} with {} statement(s) at end of input",
                txn.xid,
                txn.count()
            );
            self.emit(txn, emitter)?;
        }
        Ok(())
    }

    fn on_begin(&mut self, metadata: &MessageMetadata) -> CdcResult<()> {
        if let Some(current) = &self.current {
            return Err(CdcError::parse(format!(
                "BEGIN {} arrived while transaction {} is still open",
                metadata.xid, current.xid
            )));
        }
        let mut txn = LogicalTransaction::open(
            metadata.xid,
            metadata.lsn,
            metadata.timestamp.clone(),
        );
        txn.begin_commit_lsn = metadata.commit_lsn;
        self.current = Some(txn);
        Ok(())
    }

    fn on_commit<W: Write>(
        &mut self,
        metadata: &MessageMetadata,
        emitter: &mut SqlEmitter<W>,
    ) -> CdcResult<()> {
        // a commit with no open transaction closes one split across files
        let mut txn = self
            .current
            .take()
            .unwrap_or_else(|| continued_from(metadata));
        txn.commit = true;
        txn.commit_lsn = metadata.lsn;
        if !metadata.timestamp.is_empty() {
            txn.timestamp = metadata.timestamp.clone();
        }
        self.emit(txn, emitter)
    }

    fn on_rollback<W: Write>(
        &mut self,
        metadata: &MessageMetadata,
        emitter: &mut SqlEmitter<W>,
    ) -> CdcResult<()> {
        let mut txn = self
            .current
            .take()
            .unwrap_or_else(|| continued_from(metadata));
        txn.rollback = true;
        txn.rollback_lsn = metadata.lsn;
        self.emit(txn, emitter)
    }

    fn on_dml(
        &mut self,
        metadata: &MessageMetadata,
        statement: LogicalTransactionStatement,
    ) -> CdcResult<()> {
        let txn = self
            .current
            .get_or_insert_with(|| continued_from(metadata));

        if let LogicalTransactionStatement::Insert { relation, new } = statement {
            // coalesce into the previous statement when compatible
            if let Some(LogicalTransactionStatement::Insert {
                relation: last_relation,
                new: last_new,
            }) = txn.statements.last_mut()
            {
                let new_cells = new.cell_count();
                if *last_relation == relation
                    && last_new.columns_match(&new)
                    && last_new.cell_count() + new_cells <= MAX_PREPARED_PARAMS
                {
                    last_new.rows.extend(new.rows);
                    return Ok(());
                }
            }
            txn.statements
                .push(LogicalTransactionStatement::Insert { relation, new });
            return Ok(());
        }

        txn.statements.push(statement);
        Ok(())
    }

    /// SWITCH/KEEPALIVE/ENDPOS: append to the open transaction, emit it
    /// without COMMIT, and continue in a fresh continuation. Outside a
    /// transaction the control record is emitted standalone.
    fn on_control<W: Write>(
        &mut self,
        statement: LogicalTransactionStatement,
        emitter: &mut SqlEmitter<W>,
    ) -> CdcResult<()> {
        match self.current.take() {
            Some(mut txn) => {
                txn.statements.push(statement);
                let continuation = txn.continuation();
                self.emit(txn, emitter)?;
                self.current = Some(continuation);
                Ok(())
            }
            None => match statement {
                LogicalTransactionStatement::Switch { lsn } => emitter.emit_switch(lsn),
                LogicalTransactionStatement::Keepalive { lsn, timestamp } => {
                    emitter.emit_keepalive(lsn, &timestamp)
                }
                LogicalTransactionStatement::Endpos { lsn } => emitter.emit_endpos(lsn),
                other => Err(CdcError::parse(format!(
                    "Unexpected control statement: {:?}",
                    other
                ))),
            },
        }
    }

    /// Mark generated columns from the cache, then emit.
    fn emit<W: Write>(
        &mut self,
        mut txn: LogicalTransaction,
        emitter: &mut SqlEmitter<W>,
    ) -> CdcResult<()> {
        if !self.cache.is_empty() {
            for statement in &mut txn.statements {
                match statement {
                    LogicalTransactionStatement::Insert { relation, new } => {
                        self.cache.mark_generated(relation, new);
                    }
                    LogicalTransactionStatement::Update { relation, old, new } => {
                        self.cache.mark_generated(relation, old);
                        self.cache.mark_generated(relation, new);
                    }
                    LogicalTransactionStatement::Delete { relation, old } => {
                        self.cache.mark_generated(relation, old);
                    }
                    _ => {}
                }
            }
        }
        emitter.emit_transaction(&txn)
    }
}

/// Open a transaction continued from a previous file: same identity, no
/// BEGIN to emit.
fn continued_from(metadata: &MessageMetadata) -> LogicalTransaction {
    let mut txn = LogicalTransaction::open(
        metadata.xid,
        metadata.lsn,
        metadata.timestamp.clone(),
    );
    txn.continued = true;
    txn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;
    use crate::stream::parser::parse_json_line;
    use crate::types::StreamOutputPlugin;

    fn run(lines: &[&str]) -> String {
        run_with_cache(lines, GeneratedColumnCache::empty())
    }

    fn run_with_cache(lines: &[&str], cache: GeneratedColumnCache) -> String {
        let mut assembler = TransactionAssembler::new(cache);
        let mut emitter = SqlEmitter::new(Vec::new());
        for line in lines {
            if let Some(message) =
                parse_json_line(StreamOutputPlugin::Wal2json, line).unwrap()
            {
                assembler.process(message, &mut emitter).unwrap();
            }
        }
        assembler.finish(&mut emitter).unwrap();
        String::from_utf8(emitter.into_inner()).unwrap()
    }

    fn insert_line(lsn: &str, id: i64, x: &str) -> String {
        format!(
            r#"{{"action":"I","xid":42,"lsn":"{}","timestamp":"ts","message":{{"schema":"public","table":"t","columns":[{{"name":"id","type":"integer","value":{}}},{{"name":"x","type":"text","value":"{}"}}]}}}}"#,
            lsn, id, x
        )
    }

    #[test]
    fn consecutive_compatible_inserts_coalesce() {
        let output = run(&[
            r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"ts"}"#,
            &insert_line("0/110", 1, "a"),
            &insert_line("0/111", 2, "b"),
            &insert_line("0/112", 3, "c"),
            r#"{"action":"C","xid":42,"lsn":"0/120","timestamp":"ts"}"#,
        ]);

        // one PREPARE with three value groups, one EXECUTE with six params
        assert_eq!(output.matches("PREPARE").count(), 1);
        assert_eq!(output.matches("EXECUTE").count(), 1);
        assert!(output.contains("VALUES ($1, $2), ($3, $4), ($5, $6)"));
        assert!(output.contains("[\"1\",\"a\",\"2\",\"b\",\"3\",\"c\"]"));
    }

    #[test]
    fn begin_carries_commit_lsn_only_when_the_source_announced_it() {
        let output = run(&[
            r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"ts"}"#,
            &insert_line("0/110", 1, "a"),
            r#"{"action":"C","xid":42,"lsn":"0/120","timestamp":"ts"}"#,
        ]);
        assert!(output.starts_with("BEGIN {\"xid\":42,\"lsn\":\"0/100\",\"timestamp\":\"ts\"}\n"));

        let output = run(&[
            r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"ts","message":{"action":"B","commit_lsn":"0/120"}}"#,
            &insert_line("0/110", 1, "a"),
            r#"{"action":"C","xid":42,"lsn":"0/120","timestamp":"ts"}"#,
        ]);
        assert!(output.starts_with(
            "BEGIN {\"xid\":42,\"lsn\":\"0/100\",\"timestamp\":\"ts\",\"commit_lsn\":\"0/120\"}\n"
        ));
    }

    #[test]
    fn inserts_into_different_tables_do_not_coalesce() {
        let other = r#"{"action":"I","xid":42,"lsn":"0/111","timestamp":"ts","message":{"schema":"public","table":"u","columns":[{"name":"id","type":"integer","value":2},{"name":"x","type":"text","value":"b"}]}}"#;
        let output = run(&[
            r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"ts"}"#,
            &insert_line("0/110", 1, "a"),
            other,
            r#"{"action":"C","xid":42,"lsn":"0/120","timestamp":"ts"}"#,
        ]);
        assert_eq!(output.matches("PREPARE").count(), 2);
    }

    #[test]
    fn coalescing_respects_the_parameter_budget() {
        // two-column rows: the budget caps rows at MAX_PREPARED_PARAMS / 2
        let mut assembler = TransactionAssembler::new(GeneratedColumnCache::empty());
        let mut emitter = SqlEmitter::new(Vec::new());

        let begin = r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"ts"}"#;
        assembler
            .process(
                parse_json_line(StreamOutputPlugin::Wal2json, begin)
                    .unwrap()
                    .unwrap(),
                &mut emitter,
            )
            .unwrap();

        let max_rows = MAX_PREPARED_PARAMS / 2;
        for i in 0..(max_rows + 1) {
            let line = insert_line("0/200", i as i64, "v");
            assembler
                .process(
                    parse_json_line(StreamOutputPlugin::Wal2json, &line)
                        .unwrap()
                        .unwrap(),
                    &mut emitter,
                )
                .unwrap();
        }
        let commit = r#"{"action":"C","xid":42,"lsn":"0/300","timestamp":"ts"}"#;
        assembler
            .process(
                parse_json_line(StreamOutputPlugin::Wal2json, commit)
                    .unwrap()
                    .unwrap(),
                &mut emitter,
            )
            .unwrap();

        let output = String::from_utf8(emitter.into_inner()).unwrap();
        // the row over budget starts a second statement
        assert_eq!(output.matches("PREPARE").count(), 2);
    }

    #[test]
    fn switch_splits_the_transaction() {
        let output = run(&[
            r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"ts"}"#,
            &insert_line("0/110", 1, "a"),
            r#"{"action":"X","lsn":"1/0"}"#,
            &insert_line("1/10", 2, "b"),
            r#"{"action":"C","xid":42,"lsn":"1/20","timestamp":"ts"}"#,
        ]);

        // first part: BEGIN + insert + SWITCH, no COMMIT
        // second part: no BEGIN, insert + COMMIT
        let begin_pos = output.find("BEGIN").unwrap();
        let switch_pos = output.find("SWITCH").unwrap();
        let commit_pos = output.find("COMMIT").unwrap();
        assert!(begin_pos < switch_pos && switch_pos < commit_pos);
        assert_eq!(output.matches("BEGIN").count(), 1);
        assert_eq!(output.matches("COMMIT").count(), 1);
        assert_eq!(output.matches("PREPARE").count(), 2);
    }

    #[test]
    fn keepalive_outside_a_transaction_is_standalone() {
        let output = run(&[r#"{"action":"K","lsn":"0/200","timestamp":"ts"}"#]);
        assert_eq!(output, "KEEPALIVE {\"lsn\":\"0/200\",\"timestamp\":\"ts\"}\n");
    }

    #[test]
    fn dml_without_begin_opens_a_continued_transaction() {
        let output = run(&[
            &insert_line("1/10", 2, "b"),
            r#"{"action":"C","xid":42,"lsn":"1/20","timestamp":"ts"}"#,
        ]);
        assert!(!output.contains("BEGIN"));
        assert!(output.contains("COMMIT"));
        assert!(output.contains("PREPARE"));
    }

    #[test]
    fn commit_without_begin_closes_a_split_transaction() {
        let output = run(&[r#"{"action":"C","xid":42,"lsn":"1/20","timestamp":"ts"}"#]);
        assert_eq!(output, "COMMIT {\"xid\":42,\"lsn\":\"1/20\",\"timestamp\":\"ts\"}\n");
    }

    #[test]
    fn nested_begin_is_an_error() {
        let mut assembler = TransactionAssembler::new(GeneratedColumnCache::empty());
        let mut emitter = SqlEmitter::new(Vec::new());
        let begin = r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"ts"}"#;
        let message = parse_json_line(StreamOutputPlugin::Wal2json, begin)
            .unwrap()
            .unwrap();
        assembler.process(message.clone(), &mut emitter).unwrap();
        assert!(assembler.process(message, &mut emitter).is_err());
    }

    #[test]
    fn generated_columns_are_marked_before_emission() {
        let mut cache = GeneratedColumnCache::empty();
        cache.add("public", "t", "x");

        let output = run_with_cache(
            &[
                r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"ts"}"#,
                &insert_line("0/110", 1, "a"),
                r#"{"action":"C","xid":42,"lsn":"0/120","timestamp":"ts"}"#,
            ],
            cache,
        );

        // x is generated: omitted from the column list and the params
        assert!(output.contains("(id) overriding system value VALUES ($1)"));
        assert!(output.contains("EXECUTE"));
        assert!(output.contains("[\"1\"]"));
    }

    #[test]
    fn rollback_closes_the_transaction() {
        let output = run(&[
            r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"ts"}"#,
            &insert_line("0/110", 1, "a"),
            r#"{"action":"R","xid":42,"lsn":"0/120","timestamp":"ts"}"#,
        ]);
        assert!(output.contains("ROLLBACK {\"xid\":42,\"lsn\":\"0/120\""));
    }
}
