//! Operation-log writer for metadata mutations.
//!
//! Mutations append as text records stamped with the next sequence number.
//! Durability is a watermark: records are on disk only once
//! [`OpLogger::flush_committed`] has run, and a response must not leave the
//! server before its record's sequence number is committed.

use crate::record::LogRecord;
use crate::replay::log_file_number;
use cfs_error::Result;
use cfs_types::{LATEST_LINK, LOG_PREFIX, LogFileNumber, SeqNo};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

#[derive(Debug)]
pub struct OpLogger {
    logdir: PathBuf,
    writer: BufWriter<File>,
    number: LogFileNumber,
    /// Sequence number the next appended record will carry.
    next_seq: SeqNo,
    /// Highest sequence number known durable.
    committed: SeqNo,
}

impl OpLogger {
    /// Open the active log file.
    ///
    /// After replay the file for this number may already exist; until the
    /// next checkpoint we keep appending to it rather than clobbering the
    /// replayed records. A fresh file gets `version` and `time` headers.
    pub fn start_log(
        logdir: &Path,
        number: LogFileNumber,
        next_seq: SeqNo,
    ) -> Result<Self> {
        let path = log_path(logdir, number);
        let exists = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        if !exists {
            writeln!(writer, "version/1")?;
            writeln!(writer, "time/{}", unix_seconds())?;
        }
        info!(
            target: "cfs::meta",
            event = "log_opened",
            path = %path.display(),
            number = number.0,
            append = exists,
            next_seq = next_seq.0
        );
        Ok(Self {
            logdir: logdir.to_owned(),
            writer,
            number,
            next_seq,
            committed: SeqNo(next_seq.0.saturating_sub(1)),
        })
    }

    #[must_use]
    pub fn number(&self) -> LogFileNumber {
        self.number
    }

    /// Sequence number of the most recently appended record.
    #[must_use]
    pub fn last_assigned(&self) -> SeqNo {
        SeqNo(self.next_seq.0.saturating_sub(1))
    }

    /// Highest sequence number flushed and data-synced to disk.
    #[must_use]
    pub fn committed(&self) -> SeqNo {
        self.committed
    }

    /// Append one mutation, stamping and returning its sequence number.
    /// The record is buffered; it is durable only after
    /// [`Self::flush_committed`].
    pub fn append(&mut self, record: &LogRecord) -> Result<SeqNo> {
        let seq = self.next_seq;
        writeln!(self.writer, "{}", record.to_line(seq))?;
        self.next_seq = seq.next();
        debug!(target: "cfs::meta", event = "log_appended", seq = seq.0);
        Ok(seq)
    }

    /// Flush buffered records and data-sync the file, advancing the
    /// committed watermark to the last assigned sequence number.
    pub fn flush_committed(&mut self) -> Result<SeqNo> {
        let target = self.last_assigned();
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.committed = target;
        Ok(target)
    }

    /// Ensure the record with `seq` is durable, flushing if needed.
    pub fn ensure_committed(&mut self, seq: SeqNo) -> Result<()> {
        if seq > self.committed {
            self.flush_committed()?;
            debug_assert!(seq <= self.committed);
        }
        Ok(())
    }

    /// Close the current log and open the next one, leaving a `latest`
    /// marker naming the finished file. Returns the new log number.
    pub fn finish_log(&mut self) -> Result<LogFileNumber> {
        self.flush_committed()?;
        writeln!(self.writer, "time/{}", unix_seconds())?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        let finished = log_path(&self.logdir, self.number);
        std::fs::write(
            self.logdir.join(LATEST_LINK),
            format!("{}\n", finished.display()),
        )?;

        let next_number = self.number.next();
        let replacement = Self::start_log(&self.logdir, next_number, self.next_seq)?;
        let old = std::mem::replace(self, replacement);
        drop(old);
        info!(
            target: "cfs::meta",
            event = "log_rotated",
            finished = %finished.display(),
            next = next_number.0
        );
        Ok(next_number)
    }
}

/// Path of the log file with the given number.
#[must_use]
pub fn log_path(logdir: &Path, number: LogFileNumber) -> PathBuf {
    logdir.join(format!("{LOG_PREFIX}.{number}"))
}

/// Collect `log.<n>` files in `logdir`, sorted by number.
pub fn collect_log_files(logdir: &Path) -> Result<Vec<(LogFileNumber, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(logdir)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(number) = log_file_number(&path) {
            found.push((number, path));
        }
    }
    found.sort_by_key(|(number, _)| *number);
    Ok(found)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Buffered records must reach the file before the writer closes.
impl Drop for OpLogger {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
