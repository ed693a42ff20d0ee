#![forbid(unsafe_code)]
//! Asynchronous disk I/O, reaped from the event-loop tick.
//!
//! Consumers submit reads, writes, and data-syncs to the [`DiskManager`];
//! each submission becomes an in-flight [`DiskEvent`]. A pluggable
//! [`AioBackend`] executes the operation off the loop thread and posts the
//! raw result into the event; the manager, registered as a
//! [`TimeoutHandler`], polls its in-flight list on every tick, fills
//! completed read bytes into the target block, and fires the issuing
//! connection's completion callback exactly once. Cancelled events are
//! dropped at the next tick without a callback; their buffers stay alive
//! (held by the event) until the backend is done with them.
//!
//! Reaping latency is therefore tied to tick cadence. That is the intended
//! contract: completions for one tick dispatch in submission order, while
//! nothing orders completions across ticks.

use cfs_buf::{BlockRef, counters};
use cfs_error::{CfsError, Result};
use cfs_rt::TimeoutHandler;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

// ── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskEventKind {
    Read,
    Write,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Submitted; the backend may still be working on it.
    Queued,
    /// The issuer lost interest; the next tick drops it silently.
    Cancelled,
    /// Reaped and delivered.
    Done,
}

/// One outstanding asynchronous I/O descriptor.
///
/// Created on submit, held in the manager's in-flight list, and destroyed
/// after its completion callback returns (or after an unobserved cancelled
/// reap). The result convention is the errno one: bytes transferred on
/// success, negative errno on failure.
pub struct DiskEvent {
    kind: DiskEventKind,
    status: Mutex<EventStatus>,
    /// Raw completion posted by the backend; `None` while in progress.
    completion: Mutex<Option<i64>>,
    /// Final result, fixed at reap time.
    retval: Mutex<i64>,
    conn: Arc<dyn DiskConnection>,
    block: Option<BlockRef>,
    offset: u64,
    len: usize,
}

/// Shared handle to an in-flight event.
pub type EventRef = Arc<DiskEvent>;

impl DiskEvent {
    fn new(
        kind: DiskEventKind,
        conn: Arc<dyn DiskConnection>,
        block: Option<BlockRef>,
        offset: u64,
        len: usize,
    ) -> EventRef {
        Arc::new(Self {
            kind,
            status: Mutex::new(EventStatus::Queued),
            completion: Mutex::new(None),
            retval: Mutex::new(0),
            conn,
            block,
            offset,
            len,
        })
    }

    #[must_use]
    pub fn kind(&self) -> DiskEventKind {
        self.kind
    }

    #[must_use]
    pub fn status(&self) -> EventStatus {
        *self.status.lock()
    }

    /// Bytes transferred, or negative errno. Meaningful once reaped.
    #[must_use]
    pub fn retval(&self) -> i64 {
        *self.retval.lock()
    }

    #[must_use]
    pub fn block(&self) -> Option<&BlockRef> {
        self.block.as_ref()
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Withdraw the event before it is reaped. In-flight backend work is
    /// not interrupted (the buffer stays valid until the backend finishes),
    /// but the next tick drops the event without a callback. Returns
    /// whether the cancellation took effect.
    pub fn cancel(&self) -> bool {
        let mut status = self.status.lock();
        if *status == EventStatus::Queued {
            *status = EventStatus::Cancelled;
            true
        } else {
            false
        }
    }

    /// Backend-facing: post the raw operation result (bytes transferred or
    /// negative errno). The reaper picks it up on the next tick.
    pub fn post_completion(&self, result: i64) {
        *self.completion.lock() = Some(result);
    }

    fn take_if_complete(&self) -> Option<i64> {
        *self.completion.lock()
    }
}

impl std::fmt::Debug for DiskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskEvent")
            .field("kind", &self.kind)
            .field("status", &*self.status.lock())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Completion callback contract for disk-I/O consumers.
///
/// Invoked from the reaping tick (the event-loop thread); implementations
/// must not block. `errno` is 0 on success.
pub trait DiskConnection: Send + Sync {
    fn on_disk_done(&self, event: &EventRef, errno: i32);
}

// ── Submission backend ─────────────────────────────────────────────────────

/// A unit of work handed to the submission backend.
#[derive(Debug)]
pub enum AioOp {
    Read {
        file: Arc<File>,
        event: EventRef,
    },
    Write {
        file: Arc<File>,
        event: EventRef,
    },
    Sync {
        file: Arc<File>,
        event: EventRef,
    },
}

impl AioOp {
    #[must_use]
    pub fn event(&self) -> &EventRef {
        match self {
            Self::Read { event, .. } | Self::Write { event, .. } | Self::Sync { event, .. } => {
                event
            }
        }
    }
}

/// Pluggable asynchronous-submission seam.
///
/// A refused submission surfaces synchronously; once `submit` returns `Ok`
/// the operation is in flight and the result arrives through the event.
pub trait AioBackend: Send + Sync {
    fn submit(&self, op: AioOp) -> Result<()>;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;
}

fn errno_of(err: &std::io::Error) -> i64 {
    i64::from(err.raw_os_error().unwrap_or(libc::EIO))
}

fn execute_op(op: &AioOp) {
    match op {
        AioOp::Read { file, event } => {
            let mut buf = vec![0_u8; event.len];
            let result = match file.read_at(&mut buf, event.offset) {
                Ok(n) => {
                    if let Some(block) = event.block() {
                        block.lock().stage(&buf[..n]);
                    }
                    i64::try_from(n).unwrap_or(i64::MAX)
                }
                Err(err) => -errno_of(&err),
            };
            event.post_completion(result);
        }
        AioOp::Write { file, event } => {
            let mut buf = vec![0_u8; event.len];
            let staged = event
                .block()
                .map_or(0, |block| block.lock().copy_out(&mut buf));
            let result = match file.write_at(&buf[..staged], event.offset) {
                Ok(n) => i64::try_from(n).unwrap_or(i64::MAX),
                Err(err) => -errno_of(&err),
            };
            event.post_completion(result);
        }
        AioOp::Sync { file, event } => {
            // sync_data is fdatasync where the platform has it and a full
            // fsync elsewhere.
            let result = match file.sync_data() {
                Ok(()) => 0,
                Err(err) => -errno_of(&err),
            };
            event.post_completion(result);
        }
    }
}

/// Thread-pool backend performing the syscalls off the loop thread.
///
/// Plays the kernel's role in the poll-reap contract: it executes each
/// operation and posts the raw result into the event. The manager still
/// only observes completions at tick time.
pub struct ThreadAioBackend {
    tx: Mutex<Option<mpsc::Sender<AioOp>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadAioBackend {
    /// Spawn `threads` I/O workers draining a shared submission queue.
    pub fn new(threads: usize) -> Result<Arc<Self>> {
        let threads = threads.max(1);
        let (tx, rx) = mpsc::channel::<AioOp>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let rx = Arc::clone(&rx);
            let join = thread::Builder::new()
                .name(format!("cfs-disk-io-{idx}"))
                .spawn(move || {
                    loop {
                        let op = {
                            let guard = rx.lock();
                            guard.recv()
                        };
                        let Ok(op) = op else {
                            break;
                        };
                        trace!(target: "cfs::disk", event = "backend_execute", op = ?op.event().kind());
                        execute_op(&op);
                    }
                })
                .map_err(CfsError::Io)?;
            workers.push(join);
        }
        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }))
    }

    /// Stop accepting submissions and join the workers.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let mut workers = self.workers.lock();
        for join in workers.drain(..) {
            if join.join().is_err() {
                warn!(target: "cfs::disk", event = "io_worker_panicked");
            }
        }
    }
}

impl Drop for ThreadAioBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AioBackend for ThreadAioBackend {
    fn submit(&self, op: AioOp) -> Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(CfsError::SubmissionRefused(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "backend shut down",
            )));
        };
        tx.send(op).map_err(|_| {
            CfsError::SubmissionRefused(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "I/O workers gone",
            ))
        })
    }

    fn name(&self) -> &'static str {
        "thread-pool"
    }
}

/// Backend that queues submissions for a test to complete by hand.
///
/// Stands in for the kernel in unit tests: completions happen exactly when
/// the test posts them, so tick-by-tick reaping behavior is observable.
#[derive(Default)]
pub struct ManualAioBackend {
    submitted: Mutex<Vec<AioOp>>,
    refuse: Mutex<bool>,
}

impl ManualAioBackend {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent submissions fail (the SubmissionRefused path).
    pub fn refuse_submissions(&self, refuse: bool) {
        *self.refuse.lock() = refuse;
    }

    /// Drain the recorded submissions.
    #[must_use]
    pub fn take_submitted(&self) -> Vec<AioOp> {
        std::mem::take(&mut *self.submitted.lock())
    }
}

impl AioBackend for ManualAioBackend {
    fn submit(&self, op: AioOp) -> Result<()> {
        if *self.refuse.lock() {
            return Err(CfsError::SubmissionRefused(std::io::Error::new(
                std::io::ErrorKind::Other,
                "submissions refused",
            )));
        }
        self.submitted.lock().push(op);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

// ── DiskManager ────────────────────────────────────────────────────────────

/// Owner of the in-flight event list; issues submissions and reaps
/// completions on every tick.
pub struct DiskManager {
    backend: Arc<dyn AioBackend>,
    events: Mutex<VecDeque<EventRef>>,
}

impl DiskManager {
    #[must_use]
    pub fn new(backend: Arc<dyn AioBackend>) -> Arc<Self> {
        debug!(target: "cfs::disk", event = "manager_created", backend = backend.name());
        Arc::new(Self {
            backend,
            events: Mutex::new(VecDeque::new()),
        })
    }

    /// Issue an async read of `len` bytes at `offset` into the block's
    /// writable window. On success the returned event is in flight and the
    /// connection will see exactly one completion callback.
    pub fn read(
        &self,
        conn: &Arc<dyn DiskConnection>,
        file: &Arc<File>,
        block: &BlockRef,
        offset: u64,
        len: usize,
    ) -> Result<EventRef> {
        let event = DiskEvent::new(
            DiskEventKind::Read,
            Arc::clone(conn),
            Some(Arc::clone(block)),
            offset,
            len,
        );
        self.backend.submit(AioOp::Read {
            file: Arc::clone(file),
            event: Arc::clone(&event),
        })?;
        self.enqueue(&event);
        Ok(event)
    }

    /// Issue an async write of `len` bytes from the block's readable
    /// window at `offset`. Requires `len <= block.bytes_consumable()`.
    pub fn write(
        &self,
        conn: &Arc<dyn DiskConnection>,
        file: &Arc<File>,
        block: &BlockRef,
        offset: u64,
        len: usize,
    ) -> Result<EventRef> {
        assert!(
            len <= block.lock().bytes_consumable(),
            "write submission exceeds readable bytes"
        );
        let event = DiskEvent::new(
            DiskEventKind::Write,
            Arc::clone(conn),
            Some(Arc::clone(block)),
            offset,
            len,
        );
        self.backend.submit(AioOp::Write {
            file: Arc::clone(file),
            event: Arc::clone(&event),
        })?;
        self.enqueue(&event);
        Ok(event)
    }

    /// Issue an async data-sync: persist file data, not inode metadata, to
    /// save an I/O on the critical path.
    pub fn sync_data(
        &self,
        conn: &Arc<dyn DiskConnection>,
        file: &Arc<File>,
    ) -> Result<EventRef> {
        let event = DiskEvent::new(DiskEventKind::Sync, Arc::clone(conn), None, 0, 0);
        self.backend.submit(AioOp::Sync {
            file: Arc::clone(file),
            event: Arc::clone(&event),
        })?;
        self.enqueue(&event);
        Ok(event)
    }

    fn enqueue(&self, event: &EventRef) {
        self.events.lock().push_back(Arc::clone(event));
        trace!(
            target: "cfs::disk",
            event = "submitted",
            kind = ?event.kind(),
            offset = event.offset(),
            len = event.len()
        );
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.events.lock().len()
    }

    /// One reaping pass: drop cancelled events, keep in-progress ones, and
    /// deliver completions in submission order.
    ///
    /// Callbacks run after the in-flight lock is released so a connection
    /// may submit follow-up I/O from inside `on_disk_done`.
    pub fn reap(&self) {
        let mut done = Vec::new();
        {
            let mut events = self.events.lock();
            events.retain(|event| {
                if event.status() == EventStatus::Cancelled {
                    trace!(target: "cfs::disk", event = "cancelled_reaped", kind = ?event.kind());
                    return false;
                }
                let Some(result) = event.take_if_complete() else {
                    return true;
                };
                *event.retval.lock() = result;
                *event.status.lock() = EventStatus::Done;
                done.push(Arc::clone(event));
                false
            });
        }

        for event in done {
            let result = event.retval();
            if result > 0 {
                let moved = u64::try_from(result).unwrap_or(0);
                match event.kind() {
                    DiskEventKind::Read => {
                        if let Some(block) = event.block() {
                            block.lock().fill(usize::try_from(result).unwrap_or(0));
                        }
                        counters().add_disk_read(moved);
                    }
                    DiskEventKind::Write => counters().add_disk_written(moved),
                    DiskEventKind::Sync => {}
                }
            }
            let errno = if result < 0 {
                i32::try_from(-result).unwrap_or(libc::EIO)
            } else {
                0
            };
            trace!(
                target: "cfs::disk",
                event = "completion_dispatched",
                kind = ?event.kind(),
                retval = result,
                errno
            );
            event.conn.on_disk_done(&event, errno);
        }
    }
}

impl TimeoutHandler for DiskManager {
    fn timeout(&self) {
        self.reap();
    }
}

// ── DiskFile ───────────────────────────────────────────────────────────────

/// A per-open-file handle bundling the descriptor with its manager.
///
/// Thin submission sugar for consumers that implement [`DiskConnection`]:
/// the file and the completion contract stay together for the handle's
/// lifetime, and the descriptor closes when the last reference drops.
#[derive(Clone)]
pub struct DiskFile {
    file: Arc<File>,
    manager: Arc<DiskManager>,
}

impl DiskFile {
    /// Open an existing file read-write.
    pub fn open(manager: &Arc<DiskManager>, path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(file),
            manager: Arc::clone(manager),
        })
    }

    /// Create (or truncate) a file read-write.
    pub fn create(manager: &Arc<DiskManager>, path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(file),
            manager: Arc::clone(manager),
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub fn read_into(
        &self,
        conn: &Arc<dyn DiskConnection>,
        block: &BlockRef,
        offset: u64,
        len: usize,
    ) -> Result<EventRef> {
        self.manager.read(conn, &self.file, block, offset, len)
    }

    pub fn write_from(
        &self,
        conn: &Arc<dyn DiskConnection>,
        block: &BlockRef,
        offset: u64,
        len: usize,
    ) -> Result<EventRef> {
        self.manager.write(conn, &self.file, block, offset, len)
    }

    pub fn sync(&self, conn: &Arc<dyn DiskConnection>) -> Result<EventRef> {
        self.manager.sync_data(conn, &self.file)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_buf::ByteBlock;

    #[derive(Default)]
    struct RecordingConn {
        calls: Mutex<Vec<(DiskEventKind, i64, i32)>>,
    }

    impl RecordingConn {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn calls(&self) -> Vec<(DiskEventKind, i64, i32)> {
            self.calls.lock().clone()
        }
    }

    impl DiskConnection for RecordingConn {
        fn on_disk_done(&self, event: &EventRef, errno: i32) {
            self.calls
                .lock()
                .push((event.kind(), event.retval(), errno));
        }
    }

    fn scratch_file(dir: &tempfile::TempDir) -> Arc<File> {
        let path = dir.path().join("scratch");
        std::fs::write(&path, vec![0_u8; 4096]).expect("seed scratch file");
        Arc::new(
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .expect("open scratch file"),
        )
    }

    #[test]
    fn read_completion_fills_block_and_fires_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = scratch_file(&dir);
        let backend = ManualAioBackend::new();
        let manager = DiskManager::new(backend.clone());
        let conn = RecordingConn::new();
        let conn_dyn: Arc<dyn DiskConnection> = conn.clone();

        let block = ByteBlock::new(128).into_ref();
        let event = manager
            .read(&conn_dyn, &file, &block, 0, 100)
            .expect("submit read");
        assert_eq!(manager.in_flight(), 1);
        assert_eq!(event.status(), EventStatus::Queued);

        // Nothing completed yet: a tick is a no-op.
        manager.timeout();
        assert_eq!(manager.in_flight(), 1);
        assert!(conn.calls().is_empty());

        // The "kernel" reports 64 bytes read.
        block.lock().stage(&[7_u8; 64]);
        event.post_completion(64);
        manager.timeout();

        assert_eq!(manager.in_flight(), 0);
        assert_eq!(event.status(), EventStatus::Done);
        assert_eq!(event.retval(), 64);
        assert_eq!(block.lock().producer_offset(), 64);
        assert_eq!(block.lock().bytes_consumable(), 64);
        assert_eq!(conn.calls(), vec![(DiskEventKind::Read, 64, 0)]);

        // Exactly once: further ticks change nothing.
        manager.timeout();
        assert_eq!(conn.calls().len(), 1);
    }

    #[test]
    fn cancelled_event_receives_zero_callbacks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = scratch_file(&dir);
        let backend = ManualAioBackend::new();
        let manager = DiskManager::new(backend);
        let conn = RecordingConn::new();
        let conn_dyn: Arc<dyn DiskConnection> = conn.clone();

        let block = ByteBlock::new(64).into_ref();
        block.lock().copy_in(b"to be written");
        let event = manager
            .write(&conn_dyn, &file, &block, 0, 13)
            .expect("submit write");

        assert!(event.cancel());
        manager.timeout();

        assert_eq!(manager.in_flight(), 0);
        assert!(conn.calls().is_empty());

        // Even a late backend completion is ignored.
        event.post_completion(13);
        manager.timeout();
        assert!(conn.calls().is_empty());
    }

    #[test]
    fn completions_dispatch_in_submission_order_within_a_tick() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = scratch_file(&dir);
        let backend = ManualAioBackend::new();
        let manager = DiskManager::new(backend);
        let conn = RecordingConn::new();
        let conn_dyn: Arc<dyn DiskConnection> = conn.clone();

        let first = ByteBlock::new(32).into_ref();
        let second = ByteBlock::new(32).into_ref();
        let e1 = manager
            .read(&conn_dyn, &file, &first, 0, 8)
            .expect("submit first");
        let e2 = manager
            .read(&conn_dyn, &file, &second, 8, 16)
            .expect("submit second");

        // Complete out of order; dispatch must follow submission order.
        e2.post_completion(16);
        e1.post_completion(8);
        manager.timeout();

        assert_eq!(
            conn.calls(),
            vec![(DiskEventKind::Read, 8, 0), (DiskEventKind::Read, 16, 0)]
        );
    }

    #[test]
    fn error_completion_delivers_errno_without_fill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = scratch_file(&dir);
        let backend = ManualAioBackend::new();
        let manager = DiskManager::new(backend);
        let conn = RecordingConn::new();
        let conn_dyn: Arc<dyn DiskConnection> = conn.clone();

        let block = ByteBlock::new(32).into_ref();
        let event = manager
            .read(&conn_dyn, &file, &block, 0, 32)
            .expect("submit read");
        event.post_completion(i64::from(-libc::EIO));
        manager.timeout();

        assert_eq!(block.lock().producer_offset(), 0);
        assert_eq!(conn.calls(), vec![(DiskEventKind::Read, i64::from(-libc::EIO), libc::EIO)]);
    }

    #[test]
    fn refused_submission_surfaces_synchronously() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = scratch_file(&dir);
        let backend = ManualAioBackend::new();
        backend.refuse_submissions(true);
        let manager = DiskManager::new(backend.clone());
        let conn = RecordingConn::new();
        let conn_dyn: Arc<dyn DiskConnection> = conn.clone();

        let block = ByteBlock::new(32).into_ref();
        let err = manager
            .read(&conn_dyn, &file, &block, 0, 16)
            .expect_err("submission must be refused");
        assert!(matches!(err, CfsError::SubmissionRefused(_)));
        assert_eq!(manager.in_flight(), 0);
        assert!(backend.take_submitted().is_empty());
    }

    #[test]
    fn sync_event_carries_no_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = scratch_file(&dir);
        let backend = ManualAioBackend::new();
        let manager = DiskManager::new(backend);
        let conn = RecordingConn::new();
        let conn_dyn: Arc<dyn DiskConnection> = conn.clone();

        let event = manager.sync_data(&conn_dyn, &file).expect("submit sync");
        assert!(event.block().is_none());
        event.post_completion(0);
        manager.timeout();
        assert_eq!(conn.calls(), vec![(DiskEventKind::Sync, 0, 0)]);
    }
}
