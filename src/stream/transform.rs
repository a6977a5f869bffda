//! Transform worker
//!
//! Turns buffered JSON lines into the SQL stream. Three drivers share the
//! same parse/assemble/emit core:
//! - whole-file transform (`transform_file`), used by `stream transform`
//!   and the supervisor's synchronous catchup pass
//! - queue-driven (`run_queue`), transforming each segment the receiver
//!   announces in prefetch/catchup mode
//! - pipe-driven (`run_pipe`), for live replay with no intermediate files

use crate::catalog::GeneratedColumnCache;
use crate::errors::{CdcError, CdcResult};
use crate::lsn::{Lsn, wal_segment_filename};
use crate::queue::{QueueMessage, QueueReceiver};
use crate::stream::emit::SqlEmitter;
use crate::stream::parser::parse_json_line;
use crate::stream::receive::{read_sidecar_timeline, read_sidecar_wal_segment_size};
use crate::stream::transaction::TransactionAssembler;
use crate::types::StreamOutputPlugin;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use tracing::{debug, info, instrument};

/// Transform one JSON-lines file into its SQL file.
#[instrument(skip_all, fields(json = %json_path.display()))]
pub fn transform_file(
    plugin: StreamOutputPlugin,
    cache: &GeneratedColumnCache,
    json_path: &Path,
    sql_path: &Path,
) -> CdcResult<()> {
    let input = BufReader::new(File::open(json_path)?);

    // write to a work file and rename, so a concurrent reader of the SQL
    // file never sees a truncated rendition
    let work_path = sql_path.with_extension("sql.partial");
    let output = BufWriter::new(File::create(&work_path)?);

    let mut assembler = TransactionAssembler::new(cache.clone());
    let mut emitter = SqlEmitter::new(output);

    let mut lines = 0u64;
    for line in input.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        lines += 1;
        if let Some(message) = parse_json_line(plugin, &line)? {
            assembler.process(message, &mut emitter)?;
        }
    }
    assembler.finish(&mut emitter)?;

    let mut output = emitter.into_inner();
    output.flush()?;
    output.get_ref().sync_data()?;
    drop(output);
    fs::rename(&work_path, sql_path)?;

    info!(
        "Transformed {} line(s) into {}",
        lines,
        sql_path.display()
    );
    Ok(())
}

/// Queue-driven transform loop for prefetch/catchup mode.
///
/// Waits for the receiver to announce completed segments and transforms each
/// one; returns cleanly on `Stop` (explicit or by sender close).
pub fn run_queue(
    plugin: StreamOutputPlugin,
    cache: &GeneratedColumnCache,
    dir: &Path,
    mut queue: QueueReceiver,
    stop: &AtomicBool,
) -> CdcResult<()> {
    // the receiver writes the sidecar files before it announces anything
    let mut geometry: Option<(u64, u32)> = None;

    loop {
        match queue.recv()? {
            QueueMessage::Stop => {
                info!("Transform queue drained, stopping");
                return Ok(());
            }
            QueueMessage::Transform(lsn) => {
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }

                let (wal_segment_size, timeline) = match geometry {
                    Some(g) => g,
                    None => {
                        let g = (
                            read_sidecar_wal_segment_size(dir)?,
                            read_sidecar_timeline(dir)?,
                        );
                        geometry = Some(g);
                        g
                    }
                };

                let (json_path, sql_path) =
                    segment_paths(dir, lsn, wal_segment_size, timeline)?;
                transform_file(plugin, cache, &json_path, &sql_path)?;
            }
        }
    }
}

/// JSON and SQL paths of the segment containing `lsn`, preferring the
/// promoted file over a partial one.
fn segment_paths(
    dir: &Path,
    lsn: Lsn,
    wal_segment_size: u64,
    timeline: u32,
) -> CdcResult<(PathBuf, PathBuf)> {
    let walfile = wal_segment_filename(
        timeline,
        lsn.segment_number(wal_segment_size),
        wal_segment_size,
    );
    let promoted = dir.join(format!("{}.json", walfile));
    let partial = dir.join(format!("{}.json.partial", walfile));

    let json_path = if promoted.exists() {
        promoted
    } else if partial.exists() {
        partial
    } else {
        return Err(CdcError::parse(format!(
            "No JSON file for segment {} at {}",
            walfile, lsn
        )));
    };

    Ok((json_path, dir.join(format!("{}.sql", walfile))))
}

/// Pipe-driven transform for replay mode: JSON lines in, SQL lines out.
pub fn run_pipe(
    plugin: StreamOutputPlugin,
    cache: &GeneratedColumnCache,
    input: Receiver<String>,
    output: SyncSender<String>,
    stop: &AtomicBool,
) -> CdcResult<()> {
    let mut assembler = TransactionAssembler::new(cache.clone());
    let mut emitter = SqlEmitter::new(LinePipeWriter::new(output));

    while let Ok(line) = input.recv() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if line.is_empty() {
            continue;
        }
        if let Some(message) = parse_json_line(plugin, &line)? {
            assembler.process(message, &mut emitter)?;
        }
    }

    // upstream closed (or stop requested): render what is still open
    assembler.finish(&mut emitter)?;
    emitter.flush()?;
    Ok(())
}

/// Synchronous catchup pass: transform every JSON file that has no
/// up-to-date SQL rendition. Returns the number of files transformed.
pub fn transform_directory(
    plugin: StreamOutputPlugin,
    cache: &GeneratedColumnCache,
    dir: &Path,
) -> CdcResult<usize> {
    let mut json_files: Vec<PathBuf> = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(CdcError::Io(e)),
    };
    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if name.ends_with(".json") || name.ends_with(".json.partial") {
            json_files.push(path);
        }
    }
    json_files.sort();

    let mut transformed = 0;
    for json_path in json_files {
        let name = json_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();
        let walfile = name
            .trim_end_matches(".partial")
            .trim_end_matches(".json")
            .to_string();
        let sql_path = dir.join(format!("{}.sql", walfile));

        let needs_transform = match (fs::metadata(&json_path), fs::metadata(&sql_path)) {
            (Ok(json_meta), Ok(sql_meta)) => {
                json_meta.modified()? > sql_meta.modified()?
            }
            (Ok(_), Err(_)) => true,
            _ => false,
        };

        if needs_transform {
            debug!("Catchup transform of {}", json_path.display());
            transform_file(plugin, cache, &json_path, &sql_path)?;
            transformed += 1;
        }
    }

    Ok(transformed)
}

/// Adapts the emitter's byte stream onto a line-oriented pipe
struct LinePipeWriter {
    sender: SyncSender<String>,
    buffer: Vec<u8>,
}

impl LinePipeWriter {
    fn new(sender: SyncSender<String>) -> Self {
        Self {
            sender,
            buffer: Vec::new(),
        }
    }
}

impl Write for LinePipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                self.sender
                    .send(line)
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
            } else {
                self.buffer.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc::sync_channel;

    fn write_json_fixture(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    const BEGIN: &str = r#"{"action":"B","xid":42,"lsn":"0/100","timestamp":"2024-01-01 00:00:00+00"}"#;
    const INSERT: &str = r#"{"action":"I","xid":42,"lsn":"0/110","timestamp":"2024-01-01 00:00:00+00","message":{"schema":"public","table":"t","columns":[{"name":"id","type":"integer","value":1},{"name":"x","type":"text","value":"a"}]}}"#;
    const COMMIT: &str = r#"{"action":"C","xid":42,"lsn":"0/120","timestamp":"2024-01-01 00:00:00+00"}"#;

    #[test]
    fn whole_file_transform_renders_the_simple_commit() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json_fixture(
            dir.path(),
            "000000010000000000000000.json",
            &[BEGIN, INSERT, COMMIT],
        );
        let sql = dir.path().join("000000010000000000000000.sql");

        transform_file(
            StreamOutputPlugin::Wal2json,
            &GeneratedColumnCache::empty(),
            &json,
            &sql,
        )
        .unwrap();

        let content = fs::read_to_string(&sql).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);

        let insert =
            "INSERT INTO \"public\".\"t\" (id, x) overriding system value VALUES ($1, $2)";
        let handle = crate::hash::statement_handle(insert);
        assert_eq!(handle.len(), 8);
        assert_eq!(
            lines[0],
            "BEGIN {\"xid\":42,\"lsn\":\"0/100\",\"timestamp\":\"2024-01-01 00:00:00+00\"}"
        );
        assert_eq!(lines[1], format!("PREPARE {} AS {};", handle, insert));
        assert_eq!(lines[2], format!("EXECUTE {}[\"1\",\"a\"];", handle));
        assert_eq!(
            lines[3],
            "COMMIT {\"xid\":42,\"lsn\":\"0/120\",\"timestamp\":\"2024-01-01 00:00:00+00\"}"
        );
    }

    #[test]
    fn queue_driven_transform_handles_announced_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("wal_segment_size"), "16777216\n").unwrap();
        fs::write(dir.path().join("tli"), "1\n").unwrap();
        write_json_fixture(
            dir.path(),
            "000000010000000000000000.json",
            &[BEGIN, INSERT, COMMIT],
        );

        let (tx, rx) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut sender = crate::queue::QueueSender::from(tx);
        sender
            .send(QueueMessage::Transform(Lsn(0x100)))
            .unwrap();
        sender.send(QueueMessage::Stop).unwrap();

        run_queue(
            StreamOutputPlugin::Wal2json,
            &GeneratedColumnCache::empty(),
            dir.path(),
            crate::queue::QueueReceiver::from(rx),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert!(dir.path().join("000000010000000000000000.sql").exists());
    }

    #[test]
    fn pipe_driven_transform_streams_sql_lines() {
        let (json_tx, json_rx) = sync_channel(16);
        let (sql_tx, sql_rx) = sync_channel(16);

        for line in [BEGIN, INSERT, COMMIT] {
            json_tx.send(line.to_string()).unwrap();
        }
        drop(json_tx);

        run_pipe(
            StreamOutputPlugin::Wal2json,
            &GeneratedColumnCache::empty(),
            json_rx,
            sql_tx,
            &AtomicBool::new(false),
        )
        .unwrap();

        let lines: Vec<String> = sql_rx.try_iter().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("BEGIN "));
        assert!(lines[3].starts_with("COMMIT "));
    }

    #[test]
    fn catchup_pass_transforms_stale_files_only() {
        let dir = tempfile::tempdir().unwrap();
        write_json_fixture(
            dir.path(),
            "000000010000000000000000.json",
            &[BEGIN, INSERT, COMMIT],
        );
        write_json_fixture(
            dir.path(),
            "000000010000000000000001.json.partial",
            &[r#"{"action":"K","lsn":"0/2000000","timestamp":"ts"}"#],
        );

        let transformed = transform_directory(
            StreamOutputPlugin::Wal2json,
            &GeneratedColumnCache::empty(),
            dir.path(),
        )
        .unwrap();
        assert_eq!(transformed, 2);
        assert!(dir.path().join("000000010000000000000000.sql").exists());
        assert!(dir.path().join("000000010000000000000001.sql").exists());

        // nothing changed: the second pass is a no-op
        let transformed = transform_directory(
            StreamOutputPlugin::Wal2json,
            &GeneratedColumnCache::empty(),
            dir.path(),
        )
        .unwrap();
        assert_eq!(transformed, 0);
    }

    #[test]
    fn segment_rotation_mid_transaction_keeps_files_self_contained() {
        let dir = tempfile::tempdir().unwrap();
        // segment boundary at 1/0 with 16MB segments
        let seg0 = write_json_fixture(
            dir.path(),
            "0000000100000000000000FF.json",
            &[
                r#"{"action":"B","xid":9,"lsn":"0/FFFFFF8","timestamp":"ts"}"#,
                r#"{"action":"I","xid":9,"lsn":"0/FFFFFFC","timestamp":"ts","message":{"schema":"s","table":"t","columns":[{"name":"id","type":"integer","value":1}]}}"#,
                r#"{"action":"X","lsn":"1/10"}"#,
            ],
        );
        let seg1 = write_json_fixture(
            dir.path(),
            "000000010000000100000000.json",
            &[
                r#"{"action":"I","xid":9,"lsn":"1/10","timestamp":"ts","message":{"schema":"s","table":"t","columns":[{"name":"id","type":"integer","value":2}]}}"#,
                r#"{"action":"C","xid":9,"lsn":"1/20","timestamp":"ts"}"#,
            ],
        );

        let sql0 = dir.path().join("0000000100000000000000FF.sql");
        let sql1 = dir.path().join("000000010000000100000000.sql");
        let cache = GeneratedColumnCache::empty();
        transform_file(StreamOutputPlugin::Wal2json, &cache, &seg0, &sql0).unwrap();
        transform_file(StreamOutputPlugin::Wal2json, &cache, &seg1, &sql1).unwrap();

        let first = fs::read_to_string(&sql0).unwrap();
        assert!(first.contains("BEGIN "));
        assert!(!first.contains("COMMIT"));
        assert!(first.lines().last().unwrap().starts_with("SWITCH "));

        let second = fs::read_to_string(&sql1).unwrap();
        assert!(!second.contains("BEGIN"));
        assert!(second.contains("EXECUTE"));
        assert!(second.lines().last().unwrap().starts_with("COMMIT "));
    }
}
