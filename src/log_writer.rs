//! Append-only JSON-lines probe log with daily (UTC) rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use parking_lot::Mutex;
use thiserror::Error;

use crate::models::{LogEntry, ProbeOutcome};

/// Log writer error types.
#[derive(Error, Debug)]
pub enum LogWriteError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode log entry: {0}")]
    Encode(#[from] serde_json::Error),
}

struct ActiveFile {
    date: NaiveDate,
    path: PathBuf,
    file: File,
}

/// Writes one JSON line per outcome to `ping-YYYY-MM-DD.jsonl`.
///
/// The file handle is only touched while holding `active`, which makes the
/// lock the single sequence point for concurrent producers.
pub struct LogWriter {
    log_dir: PathBuf,
    active: Mutex<Option<ActiveFile>>,
}

impl LogWriter {
    /// Create a writer rooted at `log_dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Result<Self, LogWriteError> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir).map_err(|source| LogWriteError::Io {
            path: log_dir.clone(),
            source,
        })?;

        Ok(Self {
            log_dir,
            active: Mutex::new(None),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Path of the file holding entries for `date`.
    pub fn log_file_path(&self, date: NaiveDate) -> PathBuf {
        self.log_dir.join(format!("ping-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append an outcome and sync it to disk before returning.
    ///
    /// The file is chosen by the outcome's UTC date. On failure the handle is
    /// dropped so the next append reopens the file, trimming any partial line
    /// the failed write left behind.
    pub fn append(&self, outcome: &ProbeOutcome) -> Result<(), LogWriteError> {
        let mut line = serde_json::to_string(&outcome.to_log_entry())?;
        line.push('\n');
        let date = outcome.timestamp.date_naive();

        let mut active = self.active.lock();

        if active.as_ref().map_or(true, |a| a.date != date) {
            if let Some(prev) = active.take() {
                if let Err(e) = prev.file.sync_all() {
                    tracing::warn!("LogWriter: failed to sync {:?} on rotation: {}", prev.path, e);
                }
            }

            let path = self.log_file_path(date);
            let io_err = |source| LogWriteError::Io {
                path: path.clone(),
                source,
            };
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)
                .map_err(io_err)?;

            let torn = trim_torn_tail(&mut file).map_err(io_err)?;
            if torn > 0 {
                tracing::warn!("LogWriter: dropped {} bytes of partial line from {:?}", torn, path);
            }

            tracing::info!("LogWriter: opened log file {:?}", path);
            *active = Some(ActiveFile { date, path, file });
        }

        let Some(current) = active.as_mut() else {
            return Ok(());
        };

        let written = current
            .file
            .write_all(line.as_bytes())
            .and_then(|_| current.file.sync_data());

        if let Err(source) = written {
            let path = current.path.clone();
            *active = None;
            return Err(LogWriteError::Io { path, source });
        }

        Ok(())
    }

    /// Sync and release the active handle.
    pub fn close(&self) -> Result<(), LogWriteError> {
        if let Some(prev) = self.active.lock().take() {
            prev.file
                .sync_all()
                .map_err(|source| LogWriteError::Io { path: prev.path, source })?;
        }
        Ok(())
    }

    /// All `.jsonl` files in the log directory, sorted by name (and so by date).
    pub fn list_log_files(&self) -> Result<Vec<PathBuf>, LogWriteError> {
        let io_err = |source| LogWriteError::Io {
            path: self.log_dir.clone(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.log_dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().is_some_and(|e| e == "jsonl") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read a log file back, skipping lines that do not parse.
    pub fn read_log_file(&self, path: &Path) -> Result<Vec<LogEntry>, LogWriteError> {
        let content = fs::read_to_string(path).map_err(|source| LogWriteError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

/// Cut the file back to just after its last newline so appends always start
/// on a fresh line. Returns the number of bytes removed.
fn trim_torn_tail(file: &mut File) -> io::Result<u64> {
    let len = file.metadata()?.len();
    let mut buf = [0u8; 4096];
    let mut end = len;

    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;

        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            end = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    if end < len {
        file.set_len(end)?;
        file.sync_data()?;
    }
    Ok(len - end)
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Some(prev) = self.active.get_mut().take() {
            let _ = prev.file.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PingTarget;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn outcome_at(target: &PingTarget, ts: chrono::DateTime<Utc>, seq: u64) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::success(target, ts, Duration::from_millis(10));
        outcome.sequence = seq;
        outcome
    }

    #[test]
    fn test_rotates_at_utc_midnight() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::new(dir.path()).unwrap();
        let target = PingTarget::new("1.1.1.1", "Cloudflare");

        let before = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();

        writer.append(&outcome_at(&target, before, 1)).unwrap();
        writer.append(&outcome_at(&target, before, 2)).unwrap();
        writer.append(&outcome_at(&target, after, 3)).unwrap();

        let files = writer.list_log_files().unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("ping-2024-05-01.jsonl"),
                dir.path().join("ping-2024-05-02.jsonl"),
            ]
        );

        let first = writer.read_log_file(&files[0]).unwrap();
        let second = writer.read_log_file(&files[1]).unwrap();
        assert_eq!(first.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3]);
        assert!(first.iter().all(|e| e.timestamp.date_naive() == before.date_naive()));
        assert!(second.iter().all(|e| e.timestamp.date_naive() == after.date_naive()));
    }

    #[test]
    fn test_append_is_visible_without_close() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::new(dir.path()).unwrap();
        let target = PingTarget::new("1.1.1.1", "");
        let ts = Utc::now();

        writer.append(&outcome_at(&target, ts, 1)).unwrap();

        // Read through an independent handle while the writer still holds its own.
        let raw = fs::read_to_string(writer.log_file_path(ts.date_naive())).unwrap();
        assert_eq!(raw.lines().count(), 1);
        let entry: LogEntry = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(entry.target, "1.1.1.1");
        assert_eq!(entry.sequence, 1);
        std::mem::forget(writer);
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(LogWriter::new(dir.path()).unwrap());
        let ts = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let writer = writer.clone();
                std::thread::spawn(move || {
                    let target = PingTarget::new(&format!("10.0.0.{}", i + 1), "");
                    for seq in 1..=25 {
                        writer.append(&outcome_at(&target, ts, seq)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let raw = fs::read_to_string(writer.log_file_path(ts.date_naive())).unwrap();
        assert_eq!(raw.lines().count(), 200);
        assert!(raw
            .lines()
            .all(|line| serde_json::from_str::<LogEntry>(line).is_ok()));
    }

    #[test]
    fn test_partial_trailing_line_is_discarded_on_open() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::new(dir.path()).unwrap();
        let target = PingTarget::new("1.1.1.1", "");
        let ts = Utc::now();
        let path = writer.log_file_path(ts.date_naive());

        // One complete entry followed by the remains of an interrupted append.
        let complete = serde_json::to_string(&outcome_at(&target, ts, 1).to_log_entry()).unwrap();
        fs::write(&path, format!("{}\n{{\"timestamp\":\"20", complete)).unwrap();

        writer.append(&outcome_at(&target, ts, 2)).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));
        assert!(raw
            .lines()
            .all(|line| serde_json::from_str::<LogEntry>(line).is_ok()));
        let entries = writer.read_log_file(&path).unwrap();
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_file_holding_only_a_fragment_is_reset() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::new(dir.path()).unwrap();
        let target = PingTarget::new("1.1.1.1", "");
        let ts = Utc::now();
        let path = writer.log_file_path(ts.date_naive());
        fs::write(&path, "{\"timestamp\":\"20").unwrap();

        writer.append(&outcome_at(&target, ts, 1)).unwrap();

        let entries = writer.read_log_file(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_failed_write_reports_error_and_recovers() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");
        let writer = LogWriter::new(&log_dir).unwrap();
        let target = PingTarget::new("1.1.1.1", "");
        let ts = Utc::now();

        // A directory squatting on the file name makes the open fail.
        let blocked = writer.log_file_path(ts.date_naive());
        fs::create_dir(&blocked).unwrap();
        assert!(matches!(
            writer.append(&outcome_at(&target, ts, 1)),
            Err(LogWriteError::Io { .. })
        ));

        fs::remove_dir(&blocked).unwrap();
        writer.append(&outcome_at(&target, ts, 2)).unwrap();
        let entries = writer.read_log_file(&blocked).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 2);
    }
}
