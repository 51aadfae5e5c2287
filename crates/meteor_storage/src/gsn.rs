//! Batched sequence allocation for GSNs and transaction ids.
//!
//! An atomic counter hands out values; when the current batch is exhausted
//! a mutex-guarded refill reserves the next batch from the WAL header.
//! After a crash the persisted watermark is ≥ every issued value, so
//! recovery resumes safely at the cost of skipping up to one batch.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use meteor_common::error::StorageError;
use meteor_common::types::{Gsn, TxnId};

use crate::wal::WalManager;

/// Which durable watermark the allocator draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Gsn,
    TxnId,
}

/// Monotonic 32-bit sequence backed by WAL header batches.
pub struct SequenceAllocator {
    kind: SequenceKind,
    counter: AtomicU32,
    batch_end: AtomicU32,
    refill: Mutex<()>,
    wal: Arc<WalManager>,
}

impl SequenceAllocator {
    pub fn new(kind: SequenceKind, wal: Arc<WalManager>) -> Result<Self, StorageError> {
        let (start, end) = Self::allocate_batch(kind, &wal)?;
        Ok(Self {
            kind,
            counter: AtomicU32::new(start),
            batch_end: AtomicU32::new(end),
            refill: Mutex::new(()),
            wal,
        })
    }

    fn allocate_batch(kind: SequenceKind, wal: &WalManager) -> Result<(u32, u32), StorageError> {
        match kind {
            SequenceKind::Gsn => wal.allocate_gsn_batch(),
            SequenceKind::TxnId => wal.allocate_txn_id_batch(),
        }
    }

    /// Next value in the sequence. Lock-free on the fast path; takes the
    /// refill mutex only when the batch is exhausted.
    pub fn next(&self) -> Result<u32, StorageError> {
        loop {
            let v = self.counter.fetch_add(1, Ordering::SeqCst);
            if v < self.batch_end.load(Ordering::SeqCst) {
                return Ok(v);
            }

            let _guard = self.refill.lock();
            // Another thread may have refilled while we waited.
            if self.counter.load(Ordering::SeqCst) >= self.batch_end.load(Ordering::SeqCst) {
                let (start, end) = Self::allocate_batch(self.kind, &self.wal)?;
                self.counter.store(start, Ordering::SeqCst);
                self.batch_end.store(end, Ordering::SeqCst);
                tracing::debug!(kind = ?self.kind, start, end, "sequence batch refilled");
            }
        }
    }

    pub fn next_gsn(&self) -> Result<Gsn, StorageError> {
        debug_assert_eq!(self.kind, SequenceKind::Gsn);
        Ok(Gsn(self.next()?))
    }

    pub fn next_txn_id(&self) -> Result<TxnId, StorageError> {
        debug_assert_eq!(self.kind, SequenceKind::TxnId);
        Ok(TxnId(self.next()?))
    }

    /// True if `value` has already been handed out by this allocator.
    /// Values at or above the live counter were never issued.
    pub fn was_issued(&self, value: u32) -> bool {
        value < self.counter.load(Ordering::SeqCst)
    }
}
