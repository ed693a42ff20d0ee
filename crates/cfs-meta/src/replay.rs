//! Apply an operation log, record by record, on top of restored state.

use crate::record::LogRecord;
use crate::tree::MetaTree;
use cfs_error::{CfsError, Result};
use cfs_types::{LOG_PREFIX, LogFileNumber};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One log file selected for replay.
pub struct Replay {
    path: PathBuf,
    number: LogFileNumber,
}

impl Replay {
    /// Select a log file, extracting its number from the `log.<n>` suffix.
    pub fn open_log(path: &Path) -> Result<Self> {
        let number = log_file_number(path).ok_or_else(|| {
            CfsError::Format(format!(
                "log filename must be `{LOG_PREFIX}.<n>`: {}",
                path.display()
            ))
        })?;
        Ok(Self {
            path: path.to_owned(),
            number,
        })
    }

    #[must_use]
    pub fn number(&self) -> LogFileNumber {
        self.number
    }

    /// Read and apply the log's records in order.
    ///
    /// Records at or below the tree's applied sequence are already covered
    /// by the checkpoint and are skipped; every record past that point must
    /// carry exactly the next sequence number, and any gap or reordering is
    /// fatal. Returns the number of records applied.
    pub fn play_log(&self, tree: &mut MetaTree) -> Result<u64> {
        let contents = std::fs::read_to_string(&self.path)?;
        let mut applied = 0_u64;

        for (idx, line) in contents.lines().enumerate() {
            let line_no = idx as u64 + 1;
            if line.is_empty() {
                continue;
            }
            let Some((seq, record)) = LogRecord::parse(line, line_no)? else {
                continue;
            };
            if seq <= tree.applied() {
                debug!(
                    target: "cfs::meta",
                    event = "replay_skip_covered",
                    seq = seq.0,
                    applied = tree.applied().0
                );
                continue;
            }
            let expected = tree.applied().next();
            if seq != expected {
                return Err(CfsError::SequenceGap {
                    expected: expected.0,
                    found: seq.0,
                });
            }
            tree.apply(&record)?;
            tree.set_applied(seq);
            applied += 1;
        }

        info!(
            target: "cfs::meta",
            event = "log_replayed",
            path = %self.path.display(),
            number = self.number.0,
            applied,
            seq = tree.applied().0
        );
        Ok(applied)
    }
}

/// Parse the numeric suffix of a `log.<n>` filename.
#[must_use]
pub fn log_file_number(path: &Path) -> Option<LogFileNumber> {
    let name = path.file_name()?.to_str()?;
    let suffix = name.strip_prefix(LOG_PREFIX)?.strip_prefix('.')?;
    suffix.parse::<u64>().ok().map(LogFileNumber)
}
