#![forbid(unsafe_code)]
//! Scatter/gather byte buffers shared by every ChunkFS component.
//!
//! A [`BufferChain`] is a logical byte stream over a list of [`ByteBlock`]s.
//! Each block is a fixed-capacity region with independent producer/consumer
//! cursors over a refcounted backing array, so several views (created by
//! [`BufferChain::move_bytes`] or [`BufferChain::clone_shared`]) can alias
//! the same bytes without copying. Views are read-only by construction:
//! their producer cursor starts at the window end, so a shared backing can
//! never gain a second writer.
//!
//! Blocks travel between chains and the disk layer as [`BlockRef`]s; a disk
//! read completion fills bytes into the very block the submitter still
//! holds, which is why cursors live behind the shared reference.

use cfs_error::{CfsError, Result};
use cfs_types::BufferUnit;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::trace;

// ── Process-wide tunables and counters ─────────────────────────────────────

static BUFFER_UNIT: OnceLock<usize> = OnceLock::new();

/// Set the process-wide allocation unit for fresh chain blocks.
///
/// Must be called before any [`BufferChain`] is constructed; the first call
/// wins and later calls return `false`.
pub fn set_buffer_unit(unit: BufferUnit) -> bool {
    BUFFER_UNIT.set(unit.get()).is_ok()
}

/// The process-wide allocation unit (default 4096 bytes).
#[must_use]
pub fn buffer_unit() -> usize {
    *BUFFER_UNIT.get_or_init(|| BufferUnit::DEFAULT.get())
}

/// Global transfer counters, bumped by buffer fd I/O and disk completions.
#[derive(Debug, Default)]
pub struct ByteCounters {
    net_bytes_read: AtomicU64,
    net_bytes_written: AtomicU64,
    disk_bytes_read: AtomicU64,
    disk_bytes_written: AtomicU64,
}

impl ByteCounters {
    pub fn add_net_read(&self, n: u64) {
        self.net_bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_net_written(&self, n: u64) {
        self.net_bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_disk_read(&self, n: u64) {
        self.disk_bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_disk_written(&self, n: u64) {
        self.disk_bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ByteCounterSnapshot {
        ByteCounterSnapshot {
            net_bytes_read: self.net_bytes_read.load(Ordering::Relaxed),
            net_bytes_written: self.net_bytes_written.load(Ordering::Relaxed),
            disk_bytes_read: self.disk_bytes_read.load(Ordering::Relaxed),
            disk_bytes_written: self.disk_bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Frozen point-in-time view of the global counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteCounterSnapshot {
    pub net_bytes_read: u64,
    pub net_bytes_written: u64,
    pub disk_bytes_read: u64,
    pub disk_bytes_written: u64,
}

static COUNTERS: OnceLock<ByteCounters> = OnceLock::new();

/// The process-wide transfer counters.
#[must_use]
pub fn counters() -> &'static ByteCounters {
    COUNTERS.get_or_init(ByteCounters::default)
}

// ── ByteBlock ──────────────────────────────────────────────────────────────

/// Refcounted backing storage jointly owned by every view over it.
#[derive(Debug)]
struct Backing {
    bytes: Mutex<Box<[u8]>>,
}

impl Backing {
    fn new(capacity: usize) -> Arc<Self> {
        trace!(target: "cfs::buf", event = "backing_alloc", capacity);
        Arc::new(Self {
            bytes: Mutex::new(vec![0_u8; capacity].into_boxed_slice()),
        })
    }
}

/// A fixed-capacity byte region with producer/consumer cursors.
///
/// Cursor invariant: `start <= consumer <= producer <= end`. All
/// length-taking operations clamp to the window bounds and return the count
/// actually transferred; the caller loops if it needs more.
#[derive(Debug)]
pub struct ByteBlock {
    backing: Arc<Backing>,
    start: usize,
    end: usize,
    producer: usize,
    consumer: usize,
}

/// Shared handle to a block; chains and in-flight disk events hold these.
pub type BlockRef = Arc<Mutex<ByteBlock>>;

impl ByteBlock {
    /// Allocate a fresh block of the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            backing: Backing::new(capacity),
            start: 0,
            end: capacity,
            producer: 0,
            consumer: 0,
        }
    }

    /// Wrap this block in a shared reference.
    #[must_use]
    pub fn into_ref(self) -> BlockRef {
        Arc::new(Mutex::new(self))
    }

    /// Create a read-only view over the first `len` consumable bytes.
    ///
    /// The view shares the backing array; its window is
    /// `[consumer, consumer + min(len, consumable))` with the producer
    /// pinned at the window end, so the view can never write.
    #[must_use]
    pub fn view_consumable(&self, len: usize) -> ByteBlock {
        let take = len.min(self.bytes_consumable());
        let start = self.consumer;
        let end = self.consumer + take;
        ByteBlock {
            backing: Arc::clone(&self.backing),
            start,
            end,
            producer: end,
            consumer: start,
        }
    }

    /// True when this block shares its backing array with `other`.
    #[must_use]
    pub fn shares_backing(&self, other: &ByteBlock) -> bool {
        Arc::ptr_eq(&self.backing, &other.backing)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Bytes written but not yet retired.
    #[must_use]
    pub fn bytes_consumable(&self) -> usize {
        self.producer - self.consumer
    }

    /// Room left for the producer.
    #[must_use]
    pub fn space_available(&self) -> usize {
        self.end - self.producer
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.producer == self.end
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producer == self.consumer
    }

    /// Producer cursor position relative to the window start.
    #[must_use]
    pub fn producer_offset(&self) -> usize {
        self.producer - self.start
    }

    /// Declare that `n` bytes were written into the block by an external
    /// agent (e.g. a disk-read completion). Advances the producer by
    /// `min(n, space_available)` and returns the count.
    pub fn fill(&mut self, n: usize) -> usize {
        let filled = n.min(self.space_available());
        self.producer += filled;
        debug_assert!(self.producer <= self.end);
        filled
    }

    /// Write `min(n, space_available)` zero bytes at the producer and fill.
    pub fn zero_fill(&mut self, n: usize) -> usize {
        let count = n.min(self.space_available());
        {
            let mut bytes = self.backing.bytes.lock();
            bytes[self.producer..self.producer + count].fill(0);
        }
        self.fill(count)
    }

    /// Retire `min(n, consumable)` bytes from the readable window.
    pub fn consume(&mut self, n: usize) -> usize {
        let consumed = n.min(self.bytes_consumable());
        self.consumer += consumed;
        debug_assert!(self.consumer <= self.producer);
        consumed
    }

    /// Shrink the consumable region to exactly `n` bytes by pulling the
    /// producer back. Never grows: if `n` exceeds the consumable count the
    /// block is untouched and the current count is returned.
    pub fn trim(&mut self, n: usize) -> usize {
        let avail = self.bytes_consumable();
        if avail < n {
            return avail;
        }
        self.producer = self.consumer + n;
        n
    }

    /// Write bytes into the unfilled region at the producer without
    /// advancing it. A later [`Self::fill`] publishes them: this is the
    /// disk-backend half of a read completion, where the reaper owns the
    /// cursor advance.
    pub fn stage(&self, src: &[u8]) -> usize {
        let count = src.len().min(self.space_available());
        let mut bytes = self.backing.bytes.lock();
        bytes[self.producer..self.producer + count].copy_from_slice(&src[..count]);
        count
    }

    /// Copy bytes in at the producer, then fill. Short write if space runs
    /// out; returns the copied count.
    pub fn copy_in(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.space_available());
        {
            let mut bytes = self.backing.bytes.lock();
            bytes[self.producer..self.producer + count].copy_from_slice(&src[..count]);
        }
        self.fill(count)
    }

    /// Copy up to `n` bytes from `other`'s readable window into this block.
    /// `other`'s consumer is not advanced.
    ///
    /// The two blocks must not share a backing array.
    pub fn copy_in_from_block(&mut self, other: &ByteBlock, n: usize) -> usize {
        debug_assert!(!self.shares_backing(other));
        let count = n
            .min(other.bytes_consumable())
            .min(self.space_available());
        {
            let src = other.backing.bytes.lock();
            let mut dst = self.backing.bytes.lock();
            dst[self.producer..self.producer + count]
                .copy_from_slice(&src[other.consumer..other.consumer + count]);
        }
        self.fill(count)
    }

    /// Copy up to `dst.len()` bytes out of the readable window without
    /// advancing the consumer. Returns the copied count.
    pub fn copy_out(&self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.bytes_consumable());
        let bytes = self.backing.bytes.lock();
        dst[..count].copy_from_slice(&bytes[self.consumer..self.consumer + count]);
        count
    }

    /// One blocking read into the writable window. On a positive count the
    /// producer advances and the global counters are updated.
    pub fn read_from(&mut self, reader: &mut impl Read) -> std::io::Result<usize> {
        let n = {
            let mut bytes = self.backing.bytes.lock();
            reader.read(&mut bytes[self.producer..self.end])?
        };
        if n > 0 {
            self.fill(n);
            counters().add_net_read(n as u64);
        }
        Ok(n)
    }

    /// One blocking write from the readable window. On a positive count the
    /// consumer advances and the global counters are updated.
    pub fn write_to(&mut self, writer: &mut impl Write) -> std::io::Result<usize> {
        let n = {
            let bytes = self.backing.bytes.lock();
            writer.write(&bytes[self.consumer..self.producer])?
        };
        if n > 0 {
            self.consume(n);
            counters().add_net_written(n as u64);
        }
        Ok(n)
    }
}

// ── BufferChain ────────────────────────────────────────────────────────────

/// Ordered sequence of shared block references forming one logical byte
/// stream.
///
/// Chains are single-owner and not thread-safe as a whole; the blocks they
/// reference may be shared with other chains (after [`Self::move_bytes`] or
/// [`Self::clone_shared`]) and with in-flight disk events.
#[derive(Debug)]
pub struct BufferChain {
    blocks: VecDeque<BlockRef>,
    unit: usize,
}

impl Default for BufferChain {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferChain {
    /// An empty chain using the process-wide allocation unit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_unit(buffer_unit())
    }

    /// An empty chain with an explicit allocation unit (tests shrink this
    /// to force multi-block layouts).
    #[must_use]
    pub fn with_unit(unit: usize) -> Self {
        assert!(unit > 0, "buffer unit must be nonzero");
        Self {
            blocks: VecDeque::new(),
            unit,
        }
    }

    #[must_use]
    pub fn unit(&self) -> usize {
        self.unit
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes_consumable() == 0
    }

    /// Total readable bytes across all blocks.
    #[must_use]
    pub fn bytes_consumable(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.lock().bytes_consumable())
            .sum()
    }

    /// Push a shared block at the tail.
    pub fn append_block(&mut self, block: BlockRef) {
        self.blocks.push_back(block);
    }

    /// Move every block from `other` to this chain's tail; `other` ends
    /// empty.
    pub fn append(&mut self, other: &mut BufferChain) {
        self.blocks.append(&mut other.blocks);
    }

    /// Peel up to `n` bytes off the head, discarding emptied blocks.
    /// Returns the count actually consumed.
    pub fn consume(&mut self, n: usize) -> usize {
        let mut remaining = n;
        while remaining > 0 {
            let Some(head) = self.blocks.front() else {
                break;
            };
            let consumed = head.lock().consume(remaining);
            remaining -= consumed;
            if self.blocks.front().is_some_and(|b| b.lock().is_empty()) {
                self.blocks.pop_front();
            } else if consumed == 0 {
                break;
            }
        }
        n - remaining
    }

    /// Truncate the logical length to `n` bytes. Blocks past the cut are
    /// emptied and dropped from the tail. Never grows.
    pub fn trim(&mut self, n: usize) {
        let mut seen = 0_usize;
        for block in &self.blocks {
            let mut guard = block.lock();
            let avail = guard.bytes_consumable();
            if seen >= n {
                guard.consume(avail);
            } else if seen + avail > n {
                guard.trim(n - seen);
                seen = n;
            } else {
                seen += avail;
            }
        }
        while self.blocks.back().is_some_and(|b| b.lock().is_empty()) {
            self.blocks.pop_back();
        }
        debug_assert!(self.bytes_consumable() <= n);
    }

    /// Append `n` zero bytes, allocating unit-sized blocks as needed.
    pub fn zero_fill(&mut self, n: usize) {
        let mut remaining = n;
        while remaining > 0 {
            let zeroed = remaining.min(self.unit);
            let mut block = ByteBlock::new(self.unit);
            block.zero_fill(zeroed);
            self.blocks.push_back(block.into_ref());
            remaining -= zeroed;
        }
    }

    /// Append the bytes of `src`, extending the tail block and allocating
    /// unit-sized blocks as needed. Returns `src.len()`.
    pub fn copy_in(&mut self, src: &[u8]) -> usize {
        let mut copied = 0_usize;
        if self.blocks.is_empty() {
            self.blocks.push_back(ByteBlock::new(self.unit).into_ref());
        }
        while copied < src.len() {
            let tail = self
                .blocks
                .back()
                .expect("chain has at least one block")
                .clone();
            let n = tail.lock().copy_in(&src[copied..]);
            copied += n;
            if copied < src.len() {
                self.blocks.push_back(ByteBlock::new(self.unit).into_ref());
            }
        }
        copied
    }

    /// Non-destructive copy of up to `dst.len()` bytes from the head.
    /// Returns the copied count.
    pub fn copy_out(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0_usize;
        for block in &self.blocks {
            if copied == dst.len() {
                break;
            }
            copied += block.lock().copy_out(&mut dst[copied..]);
        }
        copied
    }

    /// Read the chain's full consumable contents into a fresh vector
    /// without consuming them.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0_u8; self.bytes_consumable()];
        let n = self.copy_out(&mut out);
        out.truncate(n);
        out
    }

    /// Take exactly `n` bytes from the head of `other`, appending to this
    /// chain. Whole blocks move by reference; the final partial block moves
    /// as a zero-copy view over the shared backing, and `other` consumes
    /// that prefix.
    ///
    /// Requires `other.bytes_consumable() >= n`.
    pub fn move_bytes(&mut self, other: &mut BufferChain, n: usize) {
        assert!(
            other.bytes_consumable() >= n,
            "move_bytes source holds too few bytes"
        );
        let mut moved = 0_usize;
        while moved < n {
            let head = other
                .blocks
                .front()
                .expect("source cannot run dry before n bytes move")
                .clone();
            let avail = head.lock().bytes_consumable();
            if moved + avail <= n {
                other.blocks.pop_front();
                if avail > 0 {
                    self.blocks.push_back(head);
                }
                moved += avail;
                if avail == 0 {
                    continue;
                }
            } else {
                let want = n - moved;
                let view = head.lock().view_consumable(want);
                self.blocks.push_back(view.into_ref());
                other.consume(want);
                moved += want;
            }
        }
    }

    /// Replace the byte range `[offset, offset + n)` with the entirety of
    /// `other`, transferring its blocks; `other` ends empty. If `offset`
    /// exceeds the current length the gap is zero-filled first. The block
    /// containing `offset` is split by copy; the overlap past the insertion
    /// point is consumed.
    pub fn splice(&mut self, other: &mut BufferChain, offset: usize, n: usize) {
        let len = self.bytes_consumable();
        if offset > len {
            self.zero_fill(offset - len);
        }

        // Locate the insertion index, splitting a straddling block by copy.
        let mut insert_at = 0_usize;
        let mut pos = 0_usize;
        while insert_at < self.blocks.len() && pos < offset {
            let avail = self.blocks[insert_at].lock().bytes_consumable();
            if pos + avail > offset {
                let want = offset - pos;
                let prefix = {
                    let source = self.blocks[insert_at].lock();
                    let mut copy = ByteBlock::new(want);
                    copy.copy_in_from_block(&source, want);
                    copy
                };
                self.blocks[insert_at].lock().consume(want);
                self.blocks.insert(insert_at, prefix.into_ref());
                insert_at += 1;
                pos = offset;
            } else {
                pos += avail;
                insert_at += 1;
            }
        }

        // Retire the bytes being replaced.
        let mut overlap = n;
        let mut idx = insert_at;
        while idx < self.blocks.len() && overlap > 0 {
            let consumed = self.blocks[idx].lock().consume(overlap);
            overlap -= consumed;
            idx += 1;
        }

        // Transfer the replacement blocks in order.
        for block in other.blocks.drain(..).rev() {
            self.blocks.insert(insert_at, block);
        }
    }

    /// Read from `reader` into the tail until it stops producing,
    /// allocating a fresh unit block whenever the tail fills.
    ///
    /// Returns the byte count read (possibly zero at end of stream). With
    /// no progress, a would-block condition surfaces as the transient
    /// [`CfsError::would_block`]; after partial progress the count is
    /// returned and the error is left for the next pass.
    pub fn read_from(&mut self, reader: &mut impl Read) -> Result<usize> {
        let mut total = 0_usize;
        if self.blocks.is_empty() {
            self.blocks.push_back(ByteBlock::new(self.unit).into_ref());
        }
        loop {
            let tail = self
                .blocks
                .back()
                .expect("chain has at least one block")
                .clone();
            if tail.lock().is_full() {
                self.blocks.push_back(ByteBlock::new(self.unit).into_ref());
                continue;
            }
            match tail.lock().read_from(reader) {
                Ok(0) => break,
                Ok(read) => total += read,
                Err(err) if total == 0 => {
                    return Err(CfsError::Io(err));
                }
                Err(_) => break,
            };
        }
        Ok(total)
    }

    /// Write from the head to `writer` until it stops accepting, discarding
    /// emptied head blocks.
    ///
    /// An empty chain reports the transient [`CfsError::would_block`];
    /// partial progress returns the count written so far.
    pub fn write_to(&mut self, writer: &mut impl Write) -> Result<usize> {
        let mut total = 0_usize;
        let mut sent_any = false;
        loop {
            let Some(head) = self.blocks.front().cloned() else {
                break;
            };
            if head.lock().is_empty() {
                self.blocks.pop_front();
                continue;
            }
            sent_any = true;
            match head.lock().write_to(writer) {
                Ok(0) => break,
                Ok(wrote) => total += wrote,
                Err(err) if total == 0 => {
                    return Err(CfsError::Io(err));
                }
                Err(_) => break,
            };
        }
        if !sent_any {
            return Err(CfsError::would_block());
        }
        Ok(total)
    }

    /// Zero-copy snapshot: a new chain of read-only views over this chain's
    /// readable windows at call time.
    #[must_use]
    pub fn clone_shared(&self) -> BufferChain {
        let mut clone = BufferChain::with_unit(self.unit);
        for block in &self.blocks {
            let guard = block.lock();
            let view = guard.view_consumable(guard.bytes_consumable());
            clone.blocks.push_back(view.into_ref());
        }
        clone
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
