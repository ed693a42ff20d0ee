//! Checkpoint writing, on and off the event-loop thread.
//!
//! [`write_checkpoint`] serializes a tree to `chkpt.<seq>` with a crc32c
//! trailer, via a temp file and rename. [`CheckpointWriter`] runs that on a
//! [`WorkerThread`]: the event loop posts a request and wakes the worker;
//! the worker snapshots the tree under its lock (coarse pause), releases
//! it, and does the file I/O on its own time.

use crate::tree::MetaTree;
use cfs_buf::BufferChain;
use cfs_error::Result;
use cfs_rt::WorkerThread;
use cfs_types::{CHECKPOINT_PREFIX, LATEST_LINK, SeqNo};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Serialize `tree` into `cpdir/chkpt.<seq>` and update the `latest`
/// marker. The file appears atomically via rename.
pub fn write_checkpoint(cpdir: &Path, tree: &MetaTree) -> Result<PathBuf> {
    let seq = tree.applied();
    let body = tree.serialize_body();
    let crc = crc32c::crc32c(body.as_bytes());

    let final_path = checkpoint_path(cpdir, seq);
    let tmp_path = cpdir.join(format!("{CHECKPOINT_PREFIX}.tmp"));
    {
        // The worker thread may block here, so the flush goes through the
        // synchronous chain path rather than the disk manager.
        let mut chain = BufferChain::new();
        chain.copy_in(body.as_bytes());
        chain.copy_in(format!("cksum/{crc:08x}\n").as_bytes());
        let mut file = std::fs::File::create(&tmp_path)?;
        while chain.bytes_consumable() > 0 {
            chain.write_to(&mut file)?;
        }
        file.sync_data()?;
    }
    std::fs::rename(&tmp_path, &final_path)?;
    std::fs::write(
        cpdir.join(LATEST_LINK),
        format!("{}\n", final_path.display()),
    )?;

    info!(
        target: "cfs::meta",
        event = "checkpoint_written",
        path = %final_path.display(),
        seq = seq.0,
        bytes = body.len()
    );
    Ok(final_path)
}

/// Path of the checkpoint file for a given sequence number.
#[must_use]
pub fn checkpoint_path(cpdir: &Path, seq: SeqNo) -> PathBuf {
    cpdir.join(format!("{CHECKPOINT_PREFIX}.{seq}"))
}

/// Parse the numeric suffix of a `chkpt.<seq>` filename.
#[must_use]
pub fn checkpoint_seq(path: &Path) -> Option<SeqNo> {
    let name = path.file_name()?.to_str()?;
    let suffix = name.strip_prefix(CHECKPOINT_PREFIX)?.strip_prefix('.')?;
    suffix.parse::<u64>().ok().map(SeqNo)
}

/// Find the checkpoint with the highest sequence number in `cpdir`.
pub fn find_latest_checkpoint(cpdir: &Path) -> Result<Option<(SeqNo, PathBuf)>> {
    let mut best: Option<(SeqNo, PathBuf)> = None;
    for entry in std::fs::read_dir(cpdir)? {
        let path = entry?.path();
        if let Some(seq) = checkpoint_seq(&path) {
            if best.as_ref().is_none_or(|(s, _)| seq > *s) {
                best = Some((seq, path));
            }
        }
    }
    Ok(best)
}

#[derive(Debug, Default)]
struct CpShared {
    requested: bool,
    last_written: Option<SeqNo>,
    last_error: Option<String>,
}

/// Background checkpointer: one worker, woken on demand.
pub struct CheckpointWriter {
    worker: WorkerThread<CpShared>,
}

impl CheckpointWriter {
    /// Spawn the checkpoint worker for `tree`, writing into `cpdir`.
    pub fn start(tree: Arc<Mutex<MetaTree>>, cpdir: PathBuf) -> std::io::Result<Self> {
        let mut worker = WorkerThread::new(CpShared::default());
        worker.start("cfs-checkpointer", move |handle| {
            let mut guard = handle.lock();
            loop {
                if guard.requested {
                    guard.requested = false;
                    drop(guard);

                    // Coarse pause: the loop thread cannot mutate the tree
                    // while the snapshot serializes.
                    let result = {
                        let tree = tree.lock();
                        write_checkpoint(&cpdir, &tree)
                    };

                    guard = handle.lock();
                    match result {
                        Ok(path) => {
                            guard.last_written = checkpoint_seq(&path);
                            guard.last_error = None;
                        }
                        Err(err) => {
                            error!(
                                target: "cfs::meta",
                                event = "checkpoint_failed",
                                error = %err
                            );
                            guard.last_error = Some(err.to_string());
                        }
                    }
                    continue;
                }
                if handle.should_stop() {
                    break;
                }
                let (next, _) = handle.sleep_timeout(guard, Duration::from_millis(200));
                guard = next;
            }
        })?;
        Ok(Self { worker })
    }

    /// Ask the worker to write a checkpoint of the tree's current state.
    pub fn request_checkpoint(&self) {
        self.worker.lock().requested = true;
        self.worker.wakeup();
    }

    /// Sequence number of the most recently written checkpoint, if any.
    #[must_use]
    pub fn last_written(&self) -> Option<SeqNo> {
        self.worker.lock().last_written
    }

    /// Error message of the most recent failed attempt, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.worker.lock().last_error.clone()
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(&mut self) {
        self.worker.stop();
    }
}
