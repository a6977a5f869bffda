//! Sentinel store
//!
//! The sentinel is the single shared control record of a migration: a
//! one-row table on the source database carrying the stream boundaries
//! (`startpos`, `endpos`), the apply switch, and the progress landmarks
//! published by the receiver (`write_lsn`, `flush_lsn`) and the applier
//! (`replay_lsn`). Every update is one short transaction touching that row;
//! `sync_receive` both publishes the receiver's progress and returns the
//! control fields in a single statement.

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::utils::{ConnKind, PgConnection, PgResult};
use tracing::{info, warn};

/// Schema holding pgcdc's own state on the source database
pub const SENTINEL_SCHEMA: &str = "pgcopydb";

const SENTINEL_FIELDS: &str = "startpos, endpos, apply, write_lsn, flush_lsn, replay_lsn";

/// Snapshot of the sentinel row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinel {
    pub startpos: Lsn,
    pub endpos: Lsn,
    pub apply: bool,
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub replay_lsn: Lsn,
}

/// Handle on the sentinel row; wraps one source connection
pub struct SentinelStore {
    conn: PgConnection,
}

impl SentinelStore {
    pub fn connect(source_pguri: &str) -> CdcResult<Self> {
        let conn = PgConnection::connect(source_pguri, ConnKind::Source)?;
        Ok(Self { conn })
    }

    pub fn new(conn: PgConnection) -> Self {
        Self { conn }
    }

    /// Idempotently create the sentinel storage and write the initial row.
    ///
    /// Fails when the row already exists with a different `startpos`: that
    /// means another migration owns this source.
    pub fn setup(&self, startpos: Lsn, endpos: Lsn) -> CdcResult<()> {
        self.conn.exec_ok(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            SENTINEL_SCHEMA
        ))?;
        self.conn.exec_ok(&format!(
            "CREATE TABLE IF NOT EXISTS {}.sentinel \
             (startpos pg_lsn, endpos pg_lsn, apply bool, \
              write_lsn pg_lsn, flush_lsn pg_lsn, replay_lsn pg_lsn)",
            SENTINEL_SCHEMA
        ))?;
        // single row enforced by a unique index on a constant expression
        self.conn.exec_ok(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS sentinel_single_row \
             ON {}.sentinel ((1))",
            SENTINEL_SCHEMA
        ))?;

        let existing = self.conn.exec_ok(&format!(
            "SELECT {} FROM {}.sentinel",
            SENTINEL_FIELDS, SENTINEL_SCHEMA
        ))?;

        if existing.ntuples() == 0 {
            self.conn.exec_params_ok(
                &format!(
                    "INSERT INTO {}.sentinel({}) \
                     VALUES ($1, $2, false, '0/0', '0/0', '0/0') \
                     ON CONFLICT DO NOTHING",
                    SENTINEL_SCHEMA, SENTINEL_FIELDS
                ),
                &[
                    Some(&startpos.to_string()),
                    Some(&endpos.to_string()),
                ],
            )?;
            info!("Created sentinel with startpos {} endpos {}", startpos, endpos);
            return Ok(());
        }

        let current = sentinel_from_result(&existing, 0)?;
        if current.startpos != startpos {
            return Err(CdcError::source(format!(
                "Sentinel already exists with startpos {}, refusing to replace it with {}",
                current.startpos, startpos
            )));
        }

        info!("Sentinel already set up at startpos {}", current.startpos);
        Ok(())
    }

    /// Read a snapshot of the sentinel row.
    pub fn get(&self) -> CdcResult<Sentinel> {
        let result = self.conn.exec_ok(&format!(
            "SELECT {} FROM {}.sentinel",
            SENTINEL_FIELDS, SENTINEL_SCHEMA
        ))?;
        if result.ntuples() == 0 {
            return Err(CdcError::source(
                "Sentinel has not been set up on the source database",
            ));
        }
        sentinel_from_result(&result, 0)
    }

    /// Change the stream starting position.
    ///
    /// Rejected once the receiver has published any progress; the start of
    /// an active stream is immutable.
    pub fn update_startpos(&self, startpos: Lsn) -> CdcResult<()> {
        let result = self.conn.exec_params_ok(
            &format!(
                "UPDATE {}.sentinel SET startpos = $1 WHERE write_lsn = '0/0'",
                SENTINEL_SCHEMA
            ),
            &[Some(&startpos.to_string())],
        )?;
        if result.cmd_tuples() == 0 {
            return Err(CdcError::source(
                "Cannot update startpos: the receiver has already published progress",
            ));
        }
        Ok(())
    }

    /// Set the stream end position; the invalid LSN clears it.
    pub fn update_endpos(&self, endpos: Lsn) -> CdcResult<()> {
        self.conn.exec_params_ok(
            &format!("UPDATE {}.sentinel SET endpos = $1", SENTINEL_SCHEMA),
            &[Some(&endpos.to_string())],
        )?;
        Ok(())
    }

    /// Flip the apply switch.
    pub fn update_apply(&self, apply: bool) -> CdcResult<()> {
        self.conn.exec_params_ok(
            &format!("UPDATE {}.sentinel SET apply = $1", SENTINEL_SCHEMA),
            &[Some(if apply { "true" } else { "false" })],
        )?;
        Ok(())
    }

    /// Publish receiver progress and fetch the control fields back, in one
    /// statement so the returned snapshot is consistent with the write.
    pub fn sync_receive(&self, write_lsn: Lsn, flush_lsn: Lsn) -> CdcResult<Sentinel> {
        let result = self.conn.exec_params_ok(
            &format!(
                "UPDATE {}.sentinel SET write_lsn = $1, flush_lsn = $2 RETURNING {}",
                SENTINEL_SCHEMA, SENTINEL_FIELDS
            ),
            &[
                Some(&write_lsn.to_string()),
                Some(&flush_lsn.to_string()),
            ],
        )?;
        if result.ntuples() == 0 {
            return Err(CdcError::source(
                "Sentinel row disappeared while streaming",
            ));
        }
        sentinel_from_result(&result, 0)
    }

    /// Publish the applier's replay position.
    pub fn update_replay(&self, replay_lsn: Lsn) -> CdcResult<()> {
        if let Err(e) = self.conn.exec_params_ok(
            &format!("UPDATE {}.sentinel SET replay_lsn = $1", SENTINEL_SCHEMA),
            &[Some(&replay_lsn.to_string())],
        ) {
            // progress publication must not take the applier down; the next
            // commit retries with a fresher position anyway
            warn!("Failed to update sentinel replay_lsn: {}", e);
            return Err(e);
        }
        Ok(())
    }
}

fn sentinel_from_result(result: &PgResult, row: i32) -> CdcResult<Sentinel> {
    Ok(Sentinel {
        startpos: parse_lsn_field(result.getvalue(row, 0))?,
        endpos: parse_lsn_field(result.getvalue(row, 1))?,
        apply: parse_bool_field(result.getvalue(row, 2)),
        write_lsn: parse_lsn_field(result.getvalue(row, 3))?,
        flush_lsn: parse_lsn_field(result.getvalue(row, 4))?,
        replay_lsn: parse_lsn_field(result.getvalue(row, 5))?,
    })
}

fn parse_lsn_field(value: Option<String>) -> CdcResult<Lsn> {
    match value {
        None => Ok(Lsn::INVALID),
        Some(text) => text.parse(),
    }
}

fn parse_bool_field(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("t") | Some("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_fields_parse_pg_lsn_text() {
        assert_eq!(parse_lsn_field(None).unwrap(), Lsn::INVALID);
        assert_eq!(parse_lsn_field(Some("0/0".into())).unwrap(), Lsn::INVALID);
        assert_eq!(
            parse_lsn_field(Some("1/2345ABCD".into())).unwrap(),
            Lsn(0x1_2345_ABCD)
        );
        assert!(parse_lsn_field(Some("nope".into())).is_err());
    }

    #[test]
    fn bool_fields_parse_pg_text() {
        assert!(parse_bool_field(Some("t".into())));
        assert!(parse_bool_field(Some("true".into())));
        assert!(!parse_bool_field(Some("f".into())));
        assert!(!parse_bool_field(None));
    }
}
