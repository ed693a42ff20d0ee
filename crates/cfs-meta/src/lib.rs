#![forbid(unsafe_code)]
//! Metadata-server recovery core.
//!
//! Durable state is a checkpoint plus an operation log: the checkpoint is
//! a serialized snapshot of the metadata tree at some sequence number, and
//! the log is an append-only stream of mutations tagged with monotonically
//! increasing sequence numbers. Startup restores the newest checkpoint,
//! replays the logs past it, opens a fresh log, and gates client traffic
//! until enough chunk servers re-register.

pub mod checkpoint;
pub mod logger;
pub mod record;
pub mod replay;
pub mod restore;
pub mod startup;
pub mod tree;

pub use checkpoint::{CheckpointWriter, find_latest_checkpoint, write_checkpoint};
pub use logger::{OpLogger, collect_log_files, log_path};
pub use record::LogRecord;
pub use replay::Replay;
pub use restore::Restorer;
pub use startup::{RecoveryGate, ServerState, StartupConfig, startup};
pub use tree::{ChunkInfo, FileAttr, MetaTree, ROOT_ID, TreeSummary};
