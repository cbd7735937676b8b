//! Durable, append-only console log with process-start rotation.
//!
//! This module provides:
//! - [`DurableLog`] — Buffered multi-producer writer over a single log file
//! - [`Rotation`] — What happened to the previous log when the log was opened
//! - [`read_tail`] — Bounded streaming reader keeping only the last N records
//!
//! Producers append encoded records into a shared buffer guarded by a short
//! mutex. The buffer is written out when it holds `flush_threshold` records
//! or when its oldest record is `flush_interval` old, whichever comes first.
//! A failed write keeps the buffer intact for the next attempt.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{decode_record, encode_fields, encode_record};
use crate::config::DurableLogConfig;
use crate::error::{ConsoleError, Result};
use crate::types::{Entry, RawEvent};

/// Outcome of the rotation check performed when the log is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// A previous process left a log; it was moved to this backup path.
    Rotated(PathBuf),
    /// The marker matched the current process; the log was kept as is.
    SameProcess,
    /// New process, but there was no previous log to move.
    Fresh,
}

/// Records waiting to be written.
#[derive(Debug, Default)]
struct WriteBuffer {
    lines: Vec<String>,
    first_pending_at: Option<Instant>,
}

/// Process-wide durable log.
///
/// Safe to share between threads behind an `Arc`; every method takes `&self`.
pub struct DurableLog {
    config: DurableLogConfig,
    path: PathBuf,
    rotation: Rotation,
    buffer: Mutex<WriteBuffer>,
}

impl DurableLog {
    /// Opens the log for the current OS process.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the rotation
    /// marker cannot be written.
    pub fn open(config: DurableLogConfig) -> Result<Self> {
        Self::open_for_process(config, std::process::id())
    }

    /// Opens the log on behalf of the given process identifier.
    ///
    /// When the persisted marker names a different process and a log file
    /// exists, that file is renamed to a timestamped backup first. Opening
    /// again with the same identifier never rotates.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::Config`] for an invalid configuration, or an
    /// I/O error if the directory cannot be created, the old log cannot be
    /// renamed, or the marker cannot be written.
    pub fn open_for_process(config: DurableLogConfig, process_id: u32) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;
        let path = config.log_path();
        let rotation = rotate_if_new_process(&config, &path, process_id)?;

        Ok(Self {
            config,
            path,
            rotation,
            buffer: Mutex::new(WriteBuffer::default()),
        })
    }

    /// Appends an entry, flushing if a threshold is crossed.
    pub fn append(&self, entry: &Entry) {
        self.push_line(encode_record(entry));
    }

    /// Appends a raw producer event, flushing if a threshold is crossed.
    pub fn append_event(&self, event: &RawEvent) {
        self.push_line(encode_fields(
            event.severity,
            &event.timestamp,
            &event.content,
            &event.detail,
            event.sequence.unwrap_or(0),
        ));
    }

    fn push_line(&self, line: String) {
        let mut buffer = self.buffer.lock();
        buffer.lines.push(line);
        let now = Instant::now();
        let first = *buffer.first_pending_at.get_or_insert(now);

        let due = buffer.lines.len() >= self.config.flush_threshold
            || now.duration_since(first) >= self.config.flush_interval();
        if due {
            if let Err(e) = self.flush_locked(&mut buffer) {
                warn!(
                    error = %e,
                    path = %self.path.display(),
                    pending = buffer.lines.len(),
                    "durable log flush failed, keeping records for retry"
                );
            }
        }
    }

    /// Writes all buffered records to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written. The buffer is kept.
    pub fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        self.flush_locked(&mut buffer)
    }

    /// Flushes if the oldest buffered record has waited at least the flush
    /// interval. Failures are logged and the records kept.
    ///
    /// Returns true if a flush was attempted.
    pub fn flush_if_due(&self, now: Instant) -> bool {
        let mut buffer = self.buffer.lock();
        let Some(first) = buffer.first_pending_at else {
            return false;
        };
        if now.saturating_duration_since(first) < self.config.flush_interval() {
            return false;
        }
        if let Err(e) = self.flush_locked(&mut buffer) {
            warn!(error = %e, path = %self.path.display(), "durable log flush failed");
        }
        true
    }

    fn flush_locked(&self, buffer: &mut WriteBuffer) -> Result<()> {
        if buffer.lines.is_empty() {
            buffer.first_pending_at = None;
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        append_lines(&mut file, &buffer.lines)?;

        debug!(records = buffer.lines.len(), "flushed durable log");
        buffer.lines.clear();
        buffer.first_pending_at = None;
        Ok(())
    }

    /// Loads the last `cap` records; `cap == 0` loads everything.
    ///
    /// Pending writes are flushed first. Any failure yields an empty result.
    #[must_use]
    pub fn load(&self, cap: usize) -> Vec<Entry> {
        if let Err(e) = self.flush() {
            warn!(error = %e, "flush before load failed");
        }
        match read_tail(&self.path, cap) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to load durable log");
                Vec::new()
            }
        }
    }

    /// Replaces the file contents with exactly `retained`. An entry with a
    /// repeat count of N is written as N records.
    ///
    /// Pending writes are flushed first so they cannot land after the
    /// rewrite. The replacement goes through a temporary file and a rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement file cannot be written or moved
    /// into place. The previous contents are left untouched in that case.
    pub fn rewrite(&self, retained: &[Entry]) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if let Err(e) = self.flush_locked(&mut buffer) {
            warn!(error = %e, "flush before rewrite failed");
        }

        let tmp = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            for entry in retained {
                let line = encode_record(entry);
                // One record per occurrence so a reload sees the same count.
                for _ in 0..entry.repeat_count.max(1) {
                    writer.write_all(line.as_bytes())?;
                    writer.write_all(b"\n")?;
                }
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        // Anything still buffered predates the rewrite and is superseded.
        buffer.lines.clear();
        buffer.first_pending_at = None;
        info!(retained = retained.len(), path = %self.path.display(), "rewrote durable log");
        Ok(())
    }

    /// Empties the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be replaced.
    pub fn clear(&self) -> Result<()> {
        self.rewrite(&[])
    }

    /// Number of records waiting to be written.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.lock().lines.len()
    }

    /// Path of the active log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rotation outcome decided at open time.
    #[must_use]
    pub const fn rotation(&self) -> &Rotation {
        &self.rotation
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DurableLogConfig {
        &self.config
    }

    /// Lists rotated backups of this log, oldest first.
    #[must_use]
    pub fn backups(&self) -> Vec<PathBuf> {
        let (stem, ext) = stem_and_ext(&self.path);
        let prefix = format!("{stem}_");
        let Ok(dir) = fs::read_dir(&self.config.dir) else {
            return Vec::new();
        };
        let mut backups: Vec<PathBuf> = dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name().is_some_and(|n| {
                    let n = n.to_string_lossy();
                    n.starts_with(&prefix) && n.ends_with(&ext)
                })
            })
            .collect();
        backups.sort();
        backups
    }
}

impl Drop for DurableLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, path = %self.path.display(), "final durable log flush failed");
        }
    }
}

/// Streams `path` and returns only the last `cap` decodable records, in
/// file order. `cap == 0` returns every record.
///
/// Memory is bounded by `cap`; malformed lines are skipped. A missing file
/// is an empty log.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_tail(path: &Path, cap: usize) -> Result<Vec<Entry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);

    let mut window: VecDeque<Entry> = VecDeque::with_capacity(cap.min(4096));
    let mut malformed = 0usize;
    for line in reader.split(b'\n') {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let decoded = std::str::from_utf8(&line)
            .map_err(|e| ConsoleError::MalformedRecord(e.to_string()))
            .and_then(decode_record);
        match decoded {
            Ok(entry) => {
                if cap > 0 && window.len() == cap {
                    window.pop_front();
                }
                window.push_back(entry);
            }
            Err(e) => {
                malformed += 1;
                debug!(error = %e, "skipping malformed record");
            }
        }
    }

    if malformed > 0 {
        warn!(malformed, path = %path.display(), "skipped malformed durable log records");
    }
    Ok(window.into())
}

/// File the durable log appends to. A failed append is rolled back to the
/// previous length so a retry cannot duplicate or tear records.
trait AppendTarget: Write {
    fn end_offset(&mut self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn end_offset(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Appends `lines` newline-terminated, all or nothing.
fn append_lines<T: AppendTarget>(target: &mut T, lines: &[String]) -> io::Result<()> {
    let start = target.end_offset()?;
    let mut payload = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        payload.push_str(line);
        payload.push('\n');
    }

    let written = target
        .write_all(payload.as_bytes())
        .and_then(|()| target.flush());
    if let Err(e) = written {
        if let Err(rollback) = target.truncate_to(start) {
            warn!(error = %rollback, "could not roll back partial durable log append");
        }
        return Err(e);
    }
    Ok(())
}

fn rotate_if_new_process(
    config: &DurableLogConfig,
    path: &Path,
    process_id: u32,
) -> Result<Rotation> {
    let marker = config.marker_path();
    let previous = fs::read_to_string(&marker)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok());

    if previous == Some(process_id) {
        debug!(process_id, "same process, skipping rotation");
        return Ok(Rotation::SameProcess);
    }

    let rotation = if path.exists() {
        let backup = backup_path(path);
        fs::rename(path, &backup)?;
        info!(backup = %backup.display(), "rotated durable log from previous process");
        Rotation::Rotated(backup)
    } else {
        Rotation::Fresh
    };

    fs::write(&marker, process_id.to_string())?;
    Ok(rotation)
}

fn stem_and_ext(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

fn backup_path(path: &Path) -> PathBuf {
    let (stem, ext) = stem_and_ext(path);
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let mut candidate = path.with_file_name(format!("{stem}_{stamp}{ext}"));
    let mut seq = 1u32;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{stem}_{stamp}_{seq}{ext}"));
        seq += 1;
    }
    candidate
}
