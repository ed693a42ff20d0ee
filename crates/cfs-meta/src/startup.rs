//! Metadata-server startup: restore, replay, fresh log, recovery gate.

use crate::checkpoint::find_latest_checkpoint;
use crate::logger::{OpLogger, collect_log_files};
use crate::replay::Replay;
use crate::restore::Restorer;
use crate::tree::MetaTree;
use cfs_error::{CfsError, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

#[derive(Debug, Clone)]
pub struct StartupConfig {
    pub logdir: PathBuf,
    pub cpdir: PathBuf,
    /// Chunk servers that must register before client traffic is admitted.
    pub min_chunkservers: u32,
}

/// Gate blocking client traffic until enough chunk servers have
/// re-registered after a restart.
#[derive(Debug)]
pub struct RecoveryGate {
    required: u32,
    registered: AtomicU32,
}

impl RecoveryGate {
    #[must_use]
    pub fn new(required: u32) -> Self {
        Self {
            required,
            registered: AtomicU32::new(0),
        }
    }

    /// Record one chunk-server registration; returns the new count.
    pub fn register_chunkserver(&self) -> u32 {
        let count = self.registered.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            target: "cfs::meta",
            event = "chunkserver_registered",
            registered = count,
            required = self.required
        );
        count
    }

    #[must_use]
    pub fn registered(&self) -> u32 {
        self.registered.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.registered() >= self.required
    }
}

/// Everything startup hands back before the event loop takes over.
#[derive(Debug)]
pub struct ServerState {
    pub tree: Arc<Mutex<MetaTree>>,
    pub logger: OpLogger,
    pub gate: RecoveryGate,
}

/// Bring the metadata server to a runnable state.
///
/// Restores the newest checkpoint (an empty tree if none exists), replays
/// every log file at or past the checkpoint's sequence (the files must
/// form a gap-free consecutive run), then opens a fresh log for new
/// mutations. The in-memory invariant on return:
/// `state = replay(checkpoint(L0), log[L0..])`.
pub fn startup(config: &StartupConfig) -> Result<ServerState> {
    std::fs::create_dir_all(&config.logdir)?;
    std::fs::create_dir_all(&config.cpdir)?;

    // 1. Restore the newest checkpoint.
    let mut tree = match find_latest_checkpoint(&config.cpdir)? {
        Some((seq, path)) => {
            info!(
                target: "cfs::meta",
                event = "startup_restore",
                path = %path.display(),
                seq = seq.0
            );
            Restorer::rebuild(&path)?
        }
        None => {
            info!(target: "cfs::meta", event = "startup_fresh_tree");
            MetaTree::new()
        }
    };
    let checkpoint_seq = tree.applied();

    // 2. Replay logs numbered at or past the checkpoint, oldest first.
    let logs: Vec<_> = collect_log_files(&config.logdir)?
        .into_iter()
        .filter(|(number, _)| number.0 >= checkpoint_seq.0)
        .collect();
    if let Some((first, _)) = logs.first() {
        // A first file past checkpoint+1 means mutations between the
        // checkpoint and that file are unrecoverable.
        if first.0 > checkpoint_seq.0 + 1 {
            return Err(CfsError::SequenceGap {
                expected: checkpoint_seq.0 + 1,
                found: first.0,
            });
        }
    }
    for window in logs.windows(2) {
        let (prev, next) = (window[0].0, window[1].0);
        if next.0 != prev.0 + 1 {
            return Err(CfsError::SequenceGap {
                expected: prev.0 + 1,
                found: next.0,
            });
        }
    }
    let mut replayed = 0_u64;
    for (_, path) in &logs {
        let replay = Replay::open_log(path)?;
        replayed += replay.play_log(&mut tree)?;
    }

    // 3. Open a fresh log for subsequent mutations.
    let next_seq = tree.applied().next();
    let next_number = logs
        .last()
        .map_or(cfs_types::LogFileNumber(next_seq.0), |(n, _)| n.next());
    let logger = OpLogger::start_log(&config.logdir, next_number, next_seq)?;

    info!(
        target: "cfs::meta",
        event = "startup_complete",
        checkpoint_seq = checkpoint_seq.0,
        replayed,
        applied = tree.applied().0,
        log_number = logger.number().0,
        min_chunkservers = config.min_chunkservers
    );

    // 4. Client traffic stays blocked behind the gate until enough chunk
    // servers re-register; releasing the event loop is the caller's move.
    Ok(ServerState {
        tree: Arc::new(Mutex::new(tree)),
        logger,
        gate: RecoveryGate::new(config.min_chunkservers),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_opens_at_the_required_count() {
        let gate = RecoveryGate::new(2);
        assert!(!gate.is_ready());
        gate.register_chunkserver();
        assert!(!gate.is_ready());
        gate.register_chunkserver();
        assert!(gate.is_ready());
        assert_eq!(gate.registered(), 2);
    }

    #[test]
    fn zero_required_is_immediately_ready() {
        assert!(RecoveryGate::new(0).is_ready());
    }

    #[test]
    fn startup_on_empty_dirs_yields_a_fresh_server() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StartupConfig {
            logdir: dir.path().join("log"),
            cpdir: dir.path().join("cp"),
            min_chunkservers: 1,
        };
        let state = startup(&config).expect("startup");
        assert_eq!(state.tree.lock().applied(), cfs_types::SeqNo::ZERO);
        assert_eq!(state.logger.number(), cfs_types::LogFileNumber(1));
        assert!(!state.gate.is_ready());
    }
}
