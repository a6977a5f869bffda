//! SQL stream emission
//!
//! The transformer renders each completed transaction as a line-oriented SQL
//! stream: metadata records (BEGIN/COMMIT/ROLLBACK/SWITCH/KEEPALIVE/ENDPOS)
//! carrying JSON, and `PREPARE <handle> AS <sql>;` / `EXECUTE
//! <handle>[params];` pairs for DML. The handle is a content hash of the SQL
//! text, so identical statements map to identical handles across processes
//! and the applier can prepare once per session.

use crate::errors::CdcResult;
use crate::hash::statement_handle;
use crate::lsn::Lsn;
use crate::types::{
    LogicalMessageRelation, LogicalMessageTuple, LogicalMessageValue, LogicalTransaction,
    LogicalTransactionStatement,
};
use crate::utils::Xid;
use serde::Serialize;
use std::io::Write;

/// JSON metadata of BEGIN/COMMIT/ROLLBACK records
#[derive(Serialize)]
struct TxnMetadata<'a> {
    xid: Xid,
    lsn: Lsn,
    timestamp: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit_lsn: Option<Lsn>,
}

#[derive(Serialize)]
struct LsnMetadata {
    lsn: Lsn,
}

#[derive(Serialize)]
struct KeepaliveMetadata<'a> {
    lsn: Lsn,
    timestamp: &'a str,
}

/// Writes the SQL stream for one segment (or one live pipe)
pub struct SqlEmitter<W: Write> {
    out: W,
}

impl<W: Write> SqlEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn flush(&mut self) -> CdcResult<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Emit a whole transaction: BEGIN (unless continued), its statements,
    /// and the COMMIT/ROLLBACK marker when the transaction carries one.
    pub fn emit_transaction(&mut self, txn: &LogicalTransaction) -> CdcResult<()> {
        if txn.continued && txn.statements.is_empty() && !txn.commit && !txn.rollback {
            // a split left nothing to say for this segment
            return Ok(());
        }

        if !txn.continued {
            // commit_lsn is echoed only when the source BEGIN announced it
            let metadata = TxnMetadata {
                xid: txn.xid,
                lsn: txn.begin_lsn,
                timestamp: &txn.timestamp,
                commit_lsn: txn.begin_commit_lsn,
            };
            writeln!(self.out, "BEGIN {}", serde_json::to_string(&metadata)?)?;
        }

        for statement in &txn.statements {
            self.emit_statement(statement)?;
        }

        if txn.commit {
            let metadata = TxnMetadata {
                xid: txn.xid,
                lsn: txn.commit_lsn,
                timestamp: &txn.timestamp,
                commit_lsn: None,
            };
            writeln!(self.out, "COMMIT {}", serde_json::to_string(&metadata)?)?;
        } else if txn.rollback {
            let metadata = TxnMetadata {
                xid: txn.xid,
                lsn: txn.rollback_lsn,
                timestamp: &txn.timestamp,
                commit_lsn: None,
            };
            writeln!(self.out, "ROLLBACK {}", serde_json::to_string(&metadata)?)?;
        }

        Ok(())
    }

    fn emit_statement(&mut self, statement: &LogicalTransactionStatement) -> CdcResult<()> {
        match statement {
            LogicalTransactionStatement::Switch { lsn } => self.emit_switch(*lsn),
            LogicalTransactionStatement::Keepalive { lsn, timestamp } => {
                self.emit_keepalive(*lsn, timestamp)
            }
            LogicalTransactionStatement::Endpos { lsn } => self.emit_endpos(*lsn),
            dml => {
                let (sql, params) = statement_sql(dml);
                let handle = statement_handle(&sql);
                writeln!(self.out, "PREPARE {} AS {};", handle, sql)?;
                writeln!(
                    self.out,
                    "EXECUTE {}{};",
                    handle,
                    serde_json::to_string(&params)?
                )?;
                Ok(())
            }
        }
    }

    pub fn emit_switch(&mut self, lsn: Lsn) -> CdcResult<()> {
        writeln!(
            self.out,
            "SWITCH {}",
            serde_json::to_string(&LsnMetadata { lsn })?
        )?;
        Ok(())
    }

    pub fn emit_keepalive(&mut self, lsn: Lsn, timestamp: &str) -> CdcResult<()> {
        writeln!(
            self.out,
            "KEEPALIVE {}",
            serde_json::to_string(&KeepaliveMetadata { lsn, timestamp })?
        )?;
        Ok(())
    }

    pub fn emit_endpos(&mut self, lsn: Lsn) -> CdcResult<()> {
        writeln!(
            self.out,
            "ENDPOS {}",
            serde_json::to_string(&LsnMetadata { lsn })?
        )?;
        Ok(())
    }
}

/// Build the SQL template and parameter array of one DML statement.
pub fn statement_sql(
    statement: &LogicalTransactionStatement,
) -> (String, Vec<Option<String>>) {
    match statement {
        LogicalTransactionStatement::Insert { relation, new } => insert_sql(relation, new),
        LogicalTransactionStatement::Update { relation, old, new } => {
            update_sql(relation, old, new)
        }
        LogicalTransactionStatement::Delete { relation, old } => delete_sql(relation, old),
        LogicalTransactionStatement::Truncate { relation } => {
            (format!("TRUNCATE ONLY {}", relation.qualified()), vec![])
        }
        other => unreachable!("not a DML statement: {:?}", other),
    }
}

/// Render a normalized attribute name the way it appears in emitted SQL:
/// bare when it is a safe identifier, quoted otherwise.
fn sql_identifier(attname: &str) -> String {
    let bare = attname.trim_matches('"');
    let safe = !bare.is_empty()
        && bare
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && bare
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if safe {
        bare.to_string()
    } else {
        format!("\"{}\"", bare.replace('"', "\"\""))
    }
}

/// Serialize one typed value for the EXECUTE parameter array
pub fn serialize_value(value: &LogicalMessageValue) -> Option<String> {
    match value {
        LogicalMessageValue::Null => None,
        LogicalMessageValue::Bool(true) => Some("t".to_string()),
        LogicalMessageValue::Bool(false) => Some("f".to_string()),
        LogicalMessageValue::Int(i) => Some(i.to_string()),
        // integral floats render without a fractional part
        LogicalMessageValue::Float(f) => Some(f.to_string()),
        LogicalMessageValue::Text { value, .. } => Some(value.clone()),
        LogicalMessageValue::Bytea { value } => Some(value.clone()),
    }
}

/// Multi-row INSERT with generated columns omitted from the column list
/// entirely (they cannot take DEFAULT in a multi-row VALUES on older
/// targets).
fn insert_sql(
    relation: &LogicalMessageRelation,
    new: &LogicalMessageTuple,
) -> (String, Vec<Option<String>>) {
    let kept: Vec<usize> = (0..new.attributes.len())
        .filter(|&i| !new.attributes[i].is_generated)
        .collect();

    let columns = kept
        .iter()
        .map(|&i| sql_identifier(&new.attributes[i].attname))
        .collect::<Vec<_>>()
        .join(", ");

    let mut params = Vec::with_capacity(kept.len() * new.rows.len());
    let mut groups = Vec::with_capacity(new.rows.len());
    let mut placeholder = 1;
    for row in &new.rows {
        let group = kept
            .iter()
            .map(|&i| {
                params.push(serialize_value(&row[i]));
                let p = format!("${}", placeholder);
                placeholder += 1;
                p
            })
            .collect::<Vec<_>>()
            .join(", ");
        groups.push(format!("({})", group));
    }

    let sql = format!(
        "INSERT INTO {} ({}) overriding system value VALUES {}",
        relation.qualified(),
        columns,
        groups.join(", ")
    );
    (sql, params)
}

/// UPDATE with SET-diffing: unchanged columns are omitted, generated columns
/// are rewritten to DEFAULT, NULL matches in WHERE use IS NULL.
fn update_sql(
    relation: &LogicalMessageRelation,
    old: &LogicalMessageTuple,
    new: &LogicalMessageTuple,
) -> (String, Vec<Option<String>>) {
    let old_row = old.rows.first();
    let new_row = &new.rows[0];

    let old_value_of = |attname: &str| -> Option<&LogicalMessageValue> {
        let row = old_row?;
        old.attributes
            .iter()
            .position(|a| a.attname == attname)
            .and_then(|i| row.get(i))
    };

    // a column differing from its old value is worth assigning; when every
    // column is unchanged keep them all rather than emit an empty SET list
    let changed: Vec<usize> = (0..new.attributes.len())
        .filter(|&i| {
            !new.attributes[i].is_generated
                && old_value_of(&new.attributes[i].attname) != Some(&new_row[i])
        })
        .collect();
    let assigned: Vec<usize> = if changed.is_empty() {
        (0..new.attributes.len())
            .filter(|&i| !new.attributes[i].is_generated)
            .collect()
    } else {
        changed
    };

    let mut params = Vec::new();
    let mut placeholder = 1;

    let mut set_items = Vec::new();
    for &i in &assigned {
        params.push(serialize_value(&new_row[i]));
        set_items.push(format!(
            "{} = ${}",
            sql_identifier(&new.attributes[i].attname),
            placeholder
        ));
        placeholder += 1;
    }
    for attribute in &new.attributes {
        if attribute.is_generated {
            set_items.push(format!("{} = DEFAULT", sql_identifier(&attribute.attname)));
        }
    }

    let (where_clause, where_params) = where_clause(old, &mut placeholder);
    params.extend(where_params);

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        relation.qualified(),
        set_items.join(", "),
        where_clause
    );
    (sql, params)
}

fn delete_sql(
    relation: &LogicalMessageRelation,
    old: &LogicalMessageTuple,
) -> (String, Vec<Option<String>>) {
    let mut placeholder = 1;
    let (where_clause, params) = where_clause(old, &mut placeholder);
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        relation.qualified(),
        where_clause
    );
    (sql, params)
}

/// Equality conditions over the old tuple; NULL values compare with IS NULL
/// and contribute no parameter.
fn where_clause(old: &LogicalMessageTuple, placeholder: &mut usize) -> (String, Vec<Option<String>>) {
    let mut conditions = Vec::new();
    let mut params = Vec::new();

    if let Some(row) = old.rows.first() {
        for (attribute, value) in old.attributes.iter().zip(row.iter()) {
            if matches!(value, LogicalMessageValue::Null) {
                conditions.push(format!("{} IS NULL", sql_identifier(&attribute.attname)));
            } else {
                params.push(serialize_value(value));
                conditions.push(format!(
                    "{} = ${}",
                    sql_identifier(&attribute.attname),
                    placeholder
                ));
                *placeholder += 1;
            }
        }
    }

    (conditions.join(" AND "), params)
}
