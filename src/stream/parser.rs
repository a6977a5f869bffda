//! Decoded-stream message parsing
//!
//! One JSON line of the buffered stream carries an outer envelope
//! (`action`, `xid`, `lsn`, `timestamp`, `message`) shared by both supported
//! output plugins, and a plugin-specific payload under `message`:
//! test_decoding packs its text form, wal2json (format-version 2) a nested
//! object. The envelope is extracted first, then a per-dialect payload
//! parser builds the typed statement.
//!
//! Logical-decoding messages (action `M`) are always skipped. Unknown action
//! characters are a fatal parse error, never silently dropped.

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::types::{
    LogicalMessageAttribute, LogicalMessageRelation, LogicalMessageTuple, LogicalMessageValue,
    LogicalTransactionStatement, MessageMetadata, StreamAction, StreamOutputPlugin,
};
use crate::utils::Oid;
use serde_json::Value;

/// One fully parsed stream record
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub metadata: MessageMetadata,
    /// Present for DML actions only
    pub statement: Option<LogicalTransactionStatement>,
}

/// Payload parser seam between the two output-plugin dialects
pub trait OutputPluginParser {
    /// Build the DML statement carried by `message`
    fn parse_payload(
        &self,
        metadata: &MessageMetadata,
        message: &Value,
    ) -> CdcResult<LogicalTransactionStatement>;
}

pub fn payload_parser(plugin: StreamOutputPlugin) -> &'static dyn OutputPluginParser {
    match plugin {
        StreamOutputPlugin::TestDecoding => &TestDecodingParser,
        StreamOutputPlugin::Wal2json => &Wal2jsonParser,
    }
}

/// Parse one line of the JSON-lines stream.
///
/// Returns `None` for records the transformer must skip (action `M`).
pub fn parse_json_line(
    plugin: StreamOutputPlugin,
    line: &str,
) -> CdcResult<Option<ParsedMessage>> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| CdcError::parse_with_context(format!("Invalid JSON line: {}", e), line))?;

    let metadata = parse_envelope(&value, line)?;

    match metadata.action {
        StreamAction::Message => Ok(None),
        StreamAction::Begin
        | StreamAction::Commit
        | StreamAction::Rollback
        | StreamAction::Switch
        | StreamAction::Keepalive
        | StreamAction::Endpos => Ok(Some(ParsedMessage {
            metadata,
            statement: None,
        })),
        StreamAction::Insert
        | StreamAction::Update
        | StreamAction::Delete
        | StreamAction::Truncate => {
            let message = value.get("message").ok_or_else(|| {
                CdcError::parse_with_context("DML record is missing its message payload", line)
            })?;
            let statement = payload_parser(plugin).parse_payload(&metadata, message)?;
            Ok(Some(ParsedMessage {
                metadata,
                statement: Some(statement),
            }))
        }
    }
}

/// Extract the outer envelope of one JSON line
fn parse_envelope(value: &Value, line: &str) -> CdcResult<MessageMetadata> {
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| CdcError::parse_with_context("Record is missing its action", line))?;
    let mut chars = action.chars();
    let action = match (chars.next(), chars.next()) {
        (Some(c), None) => StreamAction::from_char(c)?,
        _ => {
            return Err(CdcError::parse_with_context(
                "Action must be a single character",
                line,
            ));
        }
    };

    let xid = match value.get("xid") {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as u32,
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| CdcError::parse_with_context("Invalid xid", line))?,
        Some(_) => return Err(CdcError::parse_with_context("Invalid xid", line)),
    };

    let lsn = match value.get("lsn").and_then(Value::as_str) {
        Some(text) => text.parse()?,
        None => Lsn::INVALID,
    };

    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // wal2json may announce the commit position already in BEGIN; it sits
    // at the top level of a raw record and under `message` once wrapped
    let commit_lsn = value
        .get("commit_lsn")
        .or_else(|| value.get("message").and_then(|m| m.get("commit_lsn")))
        .and_then(Value::as_str)
        .map(str::parse)
        .transpose()?;

    let mut metadata = MessageMetadata::new(action, xid, lsn, timestamp);
    metadata.commit_lsn = commit_lsn;
    Ok(metadata)
}

/// Determine the envelope metadata of a raw output-plugin record, before it
/// is wrapped into a JSON line. The receiver calls this on every XLogData
/// payload; the LSN and timestamp come from the protocol header.
///
/// Returns the metadata together with the payload value to embed under
/// `message` in the envelope.
pub fn parse_raw_record(
    plugin: StreamOutputPlugin,
    payload: &str,
    lsn: Lsn,
    timestamp: String,
) -> CdcResult<(MessageMetadata, Value)> {
    match plugin {
        StreamOutputPlugin::Wal2json => {
            let value: Value = serde_json::from_str(payload).map_err(|e| {
                CdcError::parse_with_context(format!("Invalid wal2json record: {}", e), payload)
            })?;
            let mut metadata = parse_envelope(&value, payload)?;
            if !metadata.lsn.is_valid() {
                metadata.lsn = lsn;
            }
            if metadata.timestamp.is_empty() {
                metadata.timestamp = timestamp;
            }
            Ok((metadata, value))
        }
        StreamOutputPlugin::TestDecoding => {
            let (action, xid) = if let Some(rest) = payload.strip_prefix("BEGIN ") {
                (StreamAction::Begin, rest.trim().parse().unwrap_or(0))
            } else if let Some(rest) = payload.strip_prefix("COMMIT ") {
                (StreamAction::Commit, rest.trim().parse().unwrap_or(0))
            } else if let Some(rest) = payload.strip_prefix("table ") {
                (test_decoding_dml_action(rest, payload)?, 0)
            } else if payload.starts_with("message") {
                (StreamAction::Message, 0)
            } else {
                return Err(CdcError::parse_with_context(
                    "Unrecognized test_decoding record",
                    payload,
                ));
            };
            Ok((
                MessageMetadata::new(action, xid, lsn, timestamp),
                Value::String(payload.to_string()),
            ))
        }
    }
}

fn test_decoding_dml_action(rest: &str, payload: &str) -> CdcResult<StreamAction> {
    // `table <name-list>: <OP>: ...`
    let after_table = skip_qualified_names(rest);
    let op = after_table
        .strip_prefix(": ")
        .and_then(|s| s.split(':').next())
        .ok_or_else(|| {
            CdcError::parse_with_context("Malformed test_decoding DML record", payload)
        })?;
    match op {
        "INSERT" => Ok(StreamAction::Insert),
        "UPDATE" => Ok(StreamAction::Update),
        "DELETE" => Ok(StreamAction::Delete),
        "TRUNCATE" => Ok(StreamAction::Truncate),
        other => Err(CdcError::parse_with_context(
            format!("Unknown test_decoding operation: {}", other),
            payload,
        )),
    }
}

/// Advance past a comma separated list of possibly-quoted qualified names,
/// returning the remainder (starting at the `: ` before the operation).
fn skip_qualified_names(input: &str) -> &str {
    let bytes = input.as_bytes();
    let mut i = 0;
    let mut in_quotes = false;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b':' if !in_quotes => return &input[i..],
            _ => {}
        }
        i += 1;
    }
    ""
}

/// Map an output-plugin type name to the OID the value model keys off
fn type_name_to_oid(name: &str) -> Oid {
    match name {
        "boolean" => 16,
        "bytea" => 17,
        "bigint" => 20,
        "smallint" => 21,
        "integer" => 23,
        "text" => 25,
        "real" => 700,
        "double precision" => 701,
        "numeric" => 1700,
        _ => 0,
    }
}

fn is_integer_oid(oid: Oid) -> bool {
    matches!(oid, 20 | 21 | 23)
}

fn is_float_oid(oid: Oid) -> bool {
    matches!(oid, 700 | 701)
}

/// wal2json format-version 2 payload parser
pub struct Wal2jsonParser;

impl OutputPluginParser for Wal2jsonParser {
    fn parse_payload(
        &self,
        metadata: &MessageMetadata,
        message: &Value,
    ) -> CdcResult<LogicalTransactionStatement> {
        let relation = wal2json_relation(message)?;

        match metadata.action {
            StreamAction::Insert => Ok(LogicalTransactionStatement::Insert {
                relation,
                new: wal2json_tuple(message, "columns")?,
            }),
            StreamAction::Update => Ok(LogicalTransactionStatement::Update {
                relation: relation.clone(),
                old: require_identity(wal2json_tuple(message, "identity")?, &relation)?,
                new: wal2json_tuple(message, "columns")?,
            }),
            StreamAction::Delete => Ok(LogicalTransactionStatement::Delete {
                relation: relation.clone(),
                old: require_identity(wal2json_tuple(message, "identity")?, &relation)?,
            }),
            StreamAction::Truncate => Ok(LogicalTransactionStatement::Truncate { relation }),
            action => Err(CdcError::parse(format!(
                "wal2json payload parser called for action {:?}",
                action
            ))),
        }
    }
}

/// UPDATE and DELETE need key columns for their WHERE clause; a table
/// without a replica identity cannot be followed.
fn require_identity(
    tuple: LogicalMessageTuple,
    relation: &LogicalMessageRelation,
) -> CdcResult<LogicalMessageTuple> {
    if tuple.attributes.is_empty() {
        return Err(CdcError::parse(format!(
            "Table {} has no replica identity; cannot build a WHERE clause",
            relation.qualified()
        )));
    }
    Ok(tuple)
}

fn wal2json_relation(message: &Value) -> CdcResult<LogicalMessageRelation> {
    let schema = message
        .get("schema")
        .and_then(Value::as_str)
        .ok_or_else(|| CdcError::parse("wal2json record is missing its schema"))?;
    let table = message
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| CdcError::parse("wal2json record is missing its table"))?;
    Ok(LogicalMessageRelation::new(schema, table))
}

fn wal2json_tuple(message: &Value, key: &str) -> CdcResult<LogicalMessageTuple> {
    let columns = message
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| CdcError::parse(format!("wal2json record is missing {}", key)))?;

    let mut tuple = LogicalMessageTuple::default();
    let mut row = Vec::with_capacity(columns.len());

    for column in columns {
        let name = column
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| CdcError::parse("wal2json column is missing its name"))?;
        let type_name = column
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let oid = type_name_to_oid(type_name);

        tuple
            .attributes
            .push(LogicalMessageAttribute::new(name, oid));

        let value = column.get("value").unwrap_or(&Value::Null);
        row.push(wal2json_value(value, oid)?);
    }

    tuple.rows.push(row);
    Ok(tuple)
}

fn wal2json_value(value: &Value, oid: Oid) -> CdcResult<LogicalMessageValue> {
    match value {
        Value::Null => Ok(LogicalMessageValue::Null),
        Value::Bool(b) => Ok(LogicalMessageValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if is_float_oid(oid) {
                    Ok(LogicalMessageValue::Float(i as f64))
                } else {
                    Ok(LogicalMessageValue::Int(i))
                }
            } else {
                Ok(LogicalMessageValue::Float(n.as_f64().ok_or_else(|| {
                    CdcError::parse("Numeric value out of range")
                })?))
            }
        }
        Value::String(s) => {
            if oid == 17 {
                Ok(LogicalMessageValue::Bytea { value: s.clone() })
            } else {
                Ok(LogicalMessageValue::quoted_text(s.clone()))
            }
        }
        other => Err(CdcError::parse(format!(
            "Unsupported wal2json value: {}",
            other
        ))),
    }
}

/// test_decoding payload parser
pub struct TestDecodingParser;

impl OutputPluginParser for TestDecodingParser {
    fn parse_payload(
        &self,
        metadata: &MessageMetadata,
        message: &Value,
    ) -> CdcResult<LogicalTransactionStatement> {
        let text = message
            .as_str()
            .ok_or_else(|| CdcError::parse("test_decoding payload must be a string"))?;

        let rest = text
            .strip_prefix("table ")
            .ok_or_else(|| CdcError::parse_with_context("Not a test_decoding DML record", text))?;

        let names_end = rest.len() - skip_qualified_names(rest).len();
        let relation = parse_first_qualified_name(&rest[..names_end], text)?;
        let after = &rest[names_end..];

        // `: <OP>: <columns...>`
        let after = after
            .strip_prefix(": ")
            .ok_or_else(|| CdcError::parse_with_context("Malformed DML record", text))?;
        let (op, columns_text) = after
            .split_once(':')
            .ok_or_else(|| CdcError::parse_with_context("Malformed DML record", text))?;
        let columns_text = columns_text.trim_start();

        match (metadata.action, op) {
            (StreamAction::Insert, "INSERT") => Ok(LogicalTransactionStatement::Insert {
                relation,
                new: parse_test_decoding_columns(columns_text, text)?,
            }),
            (StreamAction::Update, "UPDATE") => {
                // optional `old-key: ... new-tuple: ...` split
                if let Some(old_start) = columns_text.strip_prefix("old-key:") {
                    let (old_text, new_text) =
                        old_start.split_once("new-tuple:").ok_or_else(|| {
                            CdcError::parse_with_context("UPDATE record has no new tuple", text)
                        })?;
                    Ok(LogicalTransactionStatement::Update {
                        relation,
                        old: parse_test_decoding_columns(old_text.trim(), text)?,
                        new: parse_test_decoding_columns(new_text.trim(), text)?,
                    })
                } else {
                    // without replica identity the new tuple doubles as the key
                    let new = parse_test_decoding_columns(columns_text, text)?;
                    Ok(LogicalTransactionStatement::Update {
                        relation,
                        old: new.clone(),
                        new,
                    })
                }
            }
            (StreamAction::Delete, "DELETE") => Ok(LogicalTransactionStatement::Delete {
                relation: relation.clone(),
                old: require_identity(
                    parse_test_decoding_columns(columns_text, text)?,
                    &relation,
                )?,
            }),
            (StreamAction::Truncate, "TRUNCATE") => {
                Ok(LogicalTransactionStatement::Truncate { relation })
            }
            (action, op) => Err(CdcError::parse_with_context(
                format!("Action {:?} does not match operation {}", action, op),
                text,
            )),
        }
    }
}

/// First name of a comma separated qualified-name list
fn parse_first_qualified_name(
    names: &str,
    context: &str,
) -> CdcResult<LogicalMessageRelation> {
    let first = split_outside_quotes(names, ',')
        .into_iter()
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CdcError::parse_with_context("Missing table name", context))?;

    let parts = split_outside_quotes(first, '.');
    match parts.as_slice() {
        [schema, table] => Ok(LogicalMessageRelation::new(schema, table)),
        _ => Err(CdcError::parse_with_context(
            format!("Not a schema-qualified name: {}", first),
            context,
        )),
    }
}

/// Split on `sep`, ignoring separators inside double quotes
fn split_outside_quotes(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(&input[start..i]);
                start = i + sep.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Parse a test_decoding column list: `name[type]:value ...`
fn parse_test_decoding_columns(input: &str, context: &str) -> CdcResult<LogicalMessageTuple> {
    let mut tuple = LogicalMessageTuple::default();
    let mut row = Vec::new();

    let mut rest = input.trim();
    while !rest.is_empty() {
        // `(no-flags)` and the like terminate a TRUNCATE; nothing to parse
        if rest.starts_with('(') {
            break;
        }

        let bracket = rest.find('[').ok_or_else(|| {
            CdcError::parse_with_context("Column is missing its type", context)
        })?;
        let attname = &rest[..bracket];

        let type_end = rest[bracket..]
            .find("]:")
            .map(|off| bracket + off)
            .ok_or_else(|| {
                CdcError::parse_with_context("Column type is not terminated", context)
            })?;
        let type_name = &rest[bracket + 1..type_end];
        let oid = type_name_to_oid(type_name);

        let value_start = type_end + 2;
        let (value, consumed) = parse_test_decoding_value(&rest[value_start..], oid, context)?;

        tuple
            .attributes
            .push(LogicalMessageAttribute::new(attname, oid));
        row.push(value);

        rest = rest[value_start + consumed..].trim_start();
    }

    tuple.rows.push(row);
    Ok(tuple)
}

/// Parse one value token, returning it and the bytes consumed
fn parse_test_decoding_value(
    input: &str,
    oid: Oid,
    context: &str,
) -> CdcResult<(LogicalMessageValue, usize)> {
    if let Some(rest) = input.strip_prefix('\'') {
        // quoted literal with '' escaping
        let mut value = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    value.push('\'');
                    chars.next();
                } else {
                    let consumed = 1 + i + 1;
                    let value = if oid == 17 {
                        LogicalMessageValue::Bytea { value }
                    } else {
                        LogicalMessageValue::quoted_text(value)
                    };
                    return Ok((value, consumed));
                }
            } else {
                value.push(c);
            }
        }
        Err(CdcError::parse_with_context(
            "Unterminated quoted value",
            context,
        ))
    } else {
        let end = input.find(' ').unwrap_or(input.len());
        let token = &input[..end];
        let value = match token {
            "null" => LogicalMessageValue::Null,
            "true" => LogicalMessageValue::Bool(true),
            "false" => LogicalMessageValue::Bool(false),
            _ if is_integer_oid(oid) => LogicalMessageValue::Int(token.parse().map_err(|_| {
                CdcError::parse_with_context(format!("Invalid integer: {}", token), context)
            })?),
            _ if is_float_oid(oid) => LogicalMessageValue::Float(token.parse().map_err(
                |_| CdcError::parse_with_context(format!("Invalid float: {}", token), context),
            )?),
            _ => LogicalMessageValue::text(token),
        };
        Ok((value, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(action: StreamAction) -> MessageMetadata {
        MessageMetadata::new(action, 42, Lsn(0x100), "2024-01-01 00:00:00+00".into())
    }

    #[test]
    fn envelope_extraction() {
        let line = r#"{"action":"B","xid":"42","lsn":"0/100","timestamp":"2024-01-01 00:00:00+00"}"#;
        let parsed = parse_json_line(StreamOutputPlugin::Wal2json, line)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.metadata.action, StreamAction::Begin);
        assert_eq!(parsed.metadata.xid, 42);
        assert_eq!(parsed.metadata.lsn, Lsn(0x100));
        assert!(parsed.statement.is_none());
    }

    #[test]
    fn begin_commit_lsn_is_extracted_when_announced() {
        // raw wal2json record, commit_lsn at the top level
        let (meta, _) = parse_raw_record(
            StreamOutputPlugin::Wal2json,
            r#"{"action":"B","xid":7,"commit_lsn":"0/120"}"#,
            Lsn(0x100),
            "ts".into(),
        )
        .unwrap();
        assert_eq!(meta.commit_lsn, Some(Lsn(0x120)));

        // buffered envelope line, commit_lsn nested under message
        let line = r#"{"action":"B","xid":"7","lsn":"0/100","timestamp":"ts","message":{"action":"B","xid":7,"commit_lsn":"0/120"}}"#;
        let parsed = parse_json_line(StreamOutputPlugin::Wal2json, line)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.metadata.commit_lsn, Some(Lsn(0x120)));

        // a BEGIN without the announcement stays without it
        let line = r#"{"action":"B","xid":"7","lsn":"0/100","timestamp":"ts"}"#;
        let parsed = parse_json_line(StreamOutputPlugin::Wal2json, line)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.metadata.commit_lsn, None);
    }

    #[test]
    fn message_action_is_skipped() {
        let line = r#"{"action":"M","lsn":"0/100","message":{"prefix":"x"}}"#;
        assert!(
            parse_json_line(StreamOutputPlugin::Wal2json, line)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn unknown_action_is_fatal() {
        let line = r#"{"action":"Z","lsn":"0/100"}"#;
        assert!(parse_json_line(StreamOutputPlugin::Wal2json, line).is_err());
        let line = r#"{"action":"BC","lsn":"0/100"}"#;
        assert!(parse_json_line(StreamOutputPlugin::Wal2json, line).is_err());
    }

    #[test]
    fn wal2json_insert_payload() {
        let line = r#"{"action":"I","xid":42,"lsn":"0/110","timestamp":"t","message":{"action":"I","schema":"public","table":"t","columns":[{"name":"id","type":"integer","value":1},{"name":"x","type":"text","value":"a"}]}}"#;
        let parsed = parse_json_line(StreamOutputPlugin::Wal2json, line)
            .unwrap()
            .unwrap();
        match parsed.statement.unwrap() {
            LogicalTransactionStatement::Insert { relation, new } => {
                assert_eq!(relation.qualified(), "\"public\".\"t\"");
                assert_eq!(new.attributes.len(), 2);
                assert_eq!(new.attributes[0].attname, "\"id\"");
                assert_eq!(new.rows.len(), 1);
                assert_eq!(new.rows[0][0], LogicalMessageValue::Int(1));
                assert_eq!(new.rows[0][1], LogicalMessageValue::quoted_text("a"));
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn wal2json_update_splits_identity_and_columns() {
        let message: Value = serde_json::from_str(
            r#"{"schema":"s","table":"t",
                "columns":[{"name":"id","type":"integer","value":1},{"name":"x","type":"text","value":"z"}],
                "identity":[{"name":"id","type":"integer","value":1},{"name":"x","type":"text","value":null}]}"#,
        )
        .unwrap();
        let statement = Wal2jsonParser
            .parse_payload(&meta(StreamAction::Update), &message)
            .unwrap();
        match statement {
            LogicalTransactionStatement::Update { old, new, .. } => {
                assert_eq!(old.rows[0][1], LogicalMessageValue::Null);
                assert_eq!(new.rows[0][1], LogicalMessageValue::quoted_text("z"));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_decoding_insert_payload() {
        let message = Value::String(
            "table public.t: INSERT: id[integer]:1 x[text]:'a' note[text]:'it''s quoted'".into(),
        );
        let statement = TestDecodingParser
            .parse_payload(&meta(StreamAction::Insert), &message)
            .unwrap();
        match statement {
            LogicalTransactionStatement::Insert { relation, new } => {
                assert_eq!(relation.qualified(), "\"public\".\"t\"");
                assert_eq!(new.rows[0][0], LogicalMessageValue::Int(1));
                assert_eq!(new.rows[0][1], LogicalMessageValue::quoted_text("a"));
                assert_eq!(
                    new.rows[0][2],
                    LogicalMessageValue::quoted_text("it's quoted")
                );
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decoding_update_with_old_key() {
        let message = Value::String(
            "table s.t: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:1 x[text]:'b'"
                .into(),
        );
        let statement = TestDecodingParser
            .parse_payload(&meta(StreamAction::Update), &message)
            .unwrap();
        match statement {
            LogicalTransactionStatement::Update { old, new, .. } => {
                assert_eq!(old.attributes.len(), 1);
                assert_eq!(new.attributes.len(), 2);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_decoding_null_and_numeric_values() {
        let message = Value::String(
            "table public.m: INSERT: id[bigint]:9 r[double precision]:1.5 n[text]:null".into(),
        );
        let statement = TestDecodingParser
            .parse_payload(&meta(StreamAction::Insert), &message)
            .unwrap();
        match statement {
            LogicalTransactionStatement::Insert { new, .. } => {
                assert_eq!(new.rows[0][0], LogicalMessageValue::Int(9));
                assert_eq!(new.rows[0][1], LogicalMessageValue::Float(1.5));
                assert_eq!(new.rows[0][2], LogicalMessageValue::Null);
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decoding_quoted_identifiers() {
        let message = Value::String(
            "table \"My Schema\".\"My.Table\": DELETE: id[integer]:1".into(),
        );
        let statement = TestDecodingParser
            .parse_payload(&meta(StreamAction::Delete), &message)
            .unwrap();
        match statement {
            LogicalTransactionStatement::Delete { relation, .. } => {
                assert_eq!(relation.nspname, "\"My Schema\"");
                assert_eq!(relation.relname, "\"My.Table\"");
            }
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[test]
    fn raw_record_for_test_decoding() {
        let (meta, payload) = parse_raw_record(
            StreamOutputPlugin::TestDecoding,
            "BEGIN 42",
            Lsn(0x100),
            "ts".into(),
        )
        .unwrap();
        assert_eq!(meta.action, StreamAction::Begin);
        assert_eq!(meta.xid, 42);
        assert_eq!(payload, Value::String("BEGIN 42".into()));

        let (meta, _) = parse_raw_record(
            StreamOutputPlugin::TestDecoding,
            "table public.t: INSERT: id[integer]:1",
            Lsn(0x110),
            "ts".into(),
        )
        .unwrap();
        assert_eq!(meta.action, StreamAction::Insert);
        assert_eq!(meta.xid, 0);
        assert_eq!(meta.lsn, Lsn(0x110));
    }

    #[test]
    fn raw_record_for_wal2json() {
        let (meta, payload) = parse_raw_record(
            StreamOutputPlugin::Wal2json,
            r#"{"action":"C","xid":7}"#,
            Lsn(0x120),
            "ts".into(),
        )
        .unwrap();
        assert_eq!(meta.action, StreamAction::Commit);
        assert_eq!(meta.xid, 7);
        assert_eq!(meta.lsn, Lsn(0x120));
        assert_eq!(meta.timestamp, "ts");
        assert!(payload.get("action").is_some());
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(parse_json_line(StreamOutputPlugin::Wal2json, "not json").is_err());
        assert!(parse_json_line(StreamOutputPlugin::Wal2json, "{}").is_err());
        let missing_payload = r#"{"action":"I","lsn":"0/1"}"#;
        assert!(parse_json_line(StreamOutputPlugin::Wal2json, missing_payload).is_err());
    }
}
