//! Per-segment JSON-lines files
//!
//! The receiver buffers decoded WAL as one JSON object per line, in a file
//! named after the WAL segment it covers: `<dir>/<WALFILE>.json.partial`
//! while the segment is open, atomically renamed to `<dir>/<WALFILE>.json`
//! at rotation. A `latest` symlink always points at the file currently being
//! written (or last promoted), so the transformer and resume logic can find
//! the tail of the stream without scanning.
//!
//! Crash consistency is only guaranteed on fsync boundaries; duplicate
//! records after a restart are harmless because apply is idempotent through
//! the replication origin.

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the symlink pointing at the most recently touched JSON file
pub const LATEST_SYMLINK: &str = "latest";

/// An open, append-only JSON-lines file for one WAL segment
pub struct WalJsonFile {
    dir: PathBuf,
    walfile: String,
    partial_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    /// First LSN written to this file, recorded by the receiver at open
    pub first_lsn: Lsn,
    lines_written: u64,
    dirty: bool,
}

impl WalJsonFile {
    /// Open the JSON file for a segment, resuming across restarts.
    ///
    /// If the promoted `.json` already exists the segment was completed by a
    /// previous run that is being replayed; its content is copied back to
    /// `.partial` and appended to. An existing `.partial` is appended to
    /// directly. Otherwise a fresh `.partial` is created.
    pub fn open(dir: &Path, walfile: &str) -> CdcResult<Self> {
        let final_path = dir.join(format!("{}.json", walfile));
        let partial_path = dir.join(format!("{}.json.partial", walfile));

        if final_path.exists() {
            debug!(
                "Segment file {} exists, copying back to partial",
                final_path.display()
            );
            fs::copy(&final_path, &partial_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial_path)?;

        update_latest_symlink(dir, &format!("{}.json.partial", walfile))?;

        info!("Writing to JSON file {}", partial_path.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            walfile: walfile.to_string(),
            partial_path,
            final_path,
            writer: BufWriter::new(file),
            first_lsn: Lsn::INVALID,
            lines_written: 0,
            dirty: false,
        })
    }

    pub fn walfile(&self) -> &str {
        &self.walfile
    }

    /// Append one JSON line (the newline is added here)
    pub fn append(&mut self, line: &str) -> CdcResult<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.lines_written += 1;
        self.dirty = true;
        Ok(())
    }

    /// Flush buffered lines and fsync the file.
    ///
    /// A no-op when nothing was written since the last sync.
    pub fn flush_and_sync(&mut self) -> CdcResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.dirty = false;
        Ok(())
    }

    /// Close the file, fsync it, rename `.partial` to its final name, and
    /// repoint the `latest` symlink at the promoted file.
    pub fn close_and_promote(mut self) -> CdcResult<PathBuf> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        fs::rename(&self.partial_path, &self.final_path)?;
        sync_directory(&self.dir)?;
        update_latest_symlink(&self.dir, &format!("{}.json", self.walfile))?;

        info!(
            "Promoted {} ({} lines)",
            self.final_path.display(),
            self.lines_written
        );

        Ok(self.final_path.clone())
    }
}

/// Point `<dir>/latest` at `target`, replacing any previous link
fn update_latest_symlink(dir: &Path, target: &str) -> CdcResult<()> {
    let link = dir.join(LATEST_SYMLINK);
    match fs::symlink_metadata(&link) {
        Ok(_) => fs::remove_file(&link)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(CdcError::Io(e)),
    }
    symlink(target, &link)?;
    Ok(())
}

/// fsync the directory so a rename survives a crash
fn sync_directory(dir: &Path) -> CdcResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Find the most recently modified JSON file (partial or promoted) in the
/// CDC directory, used to resume the stream after a restart.
pub fn find_latest_json_file(dir: &Path) -> CdcResult<Option<PathBuf>> {
    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CdcError::Io(e)),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.ends_with(".json") || name.ends_with(".json.partial")) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if latest.as_ref().is_none_or(|(t, _)| modified > *t) {
            latest = Some((modified, entry.path()));
        }
    }

    Ok(latest.map(|(_, path)| path))
}

/// Read the last line of a file, if any
pub fn read_last_line(path: &Path) -> CdcResult<Option<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content.lines().last().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn create_append_promote() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = WalJsonFile::open(dir.path(), "000000010000000000000001").unwrap();
        file.append("{\"action\":\"B\"}").unwrap();
        file.append("{\"action\":\"C\"}").unwrap();
        file.flush_and_sync().unwrap();

        let partial = dir.path().join("000000010000000000000001.json.partial");
        assert!(partial.exists());

        let promoted = file.close_and_promote().unwrap();
        assert!(!partial.exists());
        assert_eq!(
            promoted,
            dir.path().join("000000010000000000000001.json")
        );

        let content = fs::read_to_string(&promoted).unwrap();
        assert_eq!(content, "{\"action\":\"B\"}\n{\"action\":\"C\"}\n");
    }

    #[test]
    fn latest_symlink_follows_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let file = WalJsonFile::open(dir.path(), "000000010000000000000001").unwrap();

        let latest = dir.path().join(LATEST_SYMLINK);
        assert_eq!(
            fs::read_link(&latest).unwrap().to_string_lossy(),
            "000000010000000000000001.json.partial"
        );

        file.close_and_promote().unwrap();
        assert_eq!(
            fs::read_link(&latest).unwrap().to_string_lossy(),
            "000000010000000000000001.json"
        );
    }

    #[test]
    fn resume_appends_to_existing_partial() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = WalJsonFile::open(dir.path(), "000000010000000000000002").unwrap();
        file.append("one").unwrap();
        file.flush_and_sync().unwrap();
        drop(file);

        // restart: partial still on disk, lines are preserved
        let mut file = WalJsonFile::open(dir.path(), "000000010000000000000002").unwrap();
        file.append("two").unwrap();
        let promoted = file.close_and_promote().unwrap();

        let content = fs::read_to_string(promoted).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[test]
    fn resume_copies_promoted_file_back_to_partial() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = WalJsonFile::open(dir.path(), "000000010000000000000003").unwrap();
        file.append("one").unwrap();
        file.close_and_promote().unwrap();

        // replaying the same segment after a restart
        let mut file = WalJsonFile::open(dir.path(), "000000010000000000000003").unwrap();
        file.append("two").unwrap();
        let promoted = file.close_and_promote().unwrap();

        let content = fs::read_to_string(promoted).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[test]
    fn latest_json_file_discovery() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_latest_json_file(dir.path()).unwrap().is_none());

        let mut a = WalJsonFile::open(dir.path(), "000000010000000000000001").unwrap();
        a.append("{\"lsn\":\"0/100\"}").unwrap();
        a.close_and_promote().unwrap();

        let found = find_latest_json_file(dir.path()).unwrap().unwrap();
        assert!(found.to_string_lossy().ends_with(".json"));
        assert_eq!(
            read_last_line(&found).unwrap().unwrap(),
            "{\"lsn\":\"0/100\"}"
        );
    }
}
