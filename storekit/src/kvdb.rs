//! The KVDB contract: an ordered, byte-keyed store usable concurrently from
//! any number of threads, implemented by every backend in this crate.
//!
//! Unlike a single-threaded log engine, every method here takes `&self` —
//! backends own their interior mutability (a lock, a mutex pool, a network
//! client) so that callers on different threads can read and write the same
//! `Kvdb` without external synchronization.

use crate::error::CResult;

/// One item yielded by `Kvdb::scan`. The value is fetched lazily: a scan
/// consumer that only needs keys (e.g. counting, or deciding what to
/// delete) never pays for a value read.
pub struct ScanItem {
    pub key: Vec<u8>,
    value_fn: Box<dyn FnOnce() -> CResult<Vec<u8>> + Send>,
}

impl ScanItem {
    pub fn new(key: Vec<u8>, value_fn: impl FnOnce() -> CResult<Vec<u8>> + Send + 'static) -> Self {
        Self { key, value_fn: Box::new(value_fn) }
    }

    /// Consumes the item, fetching its value. Must be called at most once;
    /// backends rely on this to avoid re-reading from the log/network.
    pub fn value(self) -> CResult<Vec<u8>> {
        (self.value_fn)()
    }
}

pub type ScanIter<'a> = Box<dyn Iterator<Item = CResult<ScanItem>> + 'a>;

/// An ordered key-value store. See the module docs for the concurrency
/// model.
pub trait Kvdb: Send + Sync {
    /// Looks up a key. Absence is not an error.
    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    /// Sets a key to a value, replacing any prior value. An empty key is a
    /// programmer error and aborts the process (see `error::fatal!`).
    fn set(&self, key: &[u8], value: Vec<u8>) -> CResult<()>;

    /// Deletes a key. Deleting an absent key is a no-op.
    fn delete(&self, key: &[u8]) -> CResult<()>;

    /// Deletes every key in `[start, end]` (inclusive on both ends).
    fn delete_range(&self, start: &[u8], end: &[u8]) -> CResult<()>;

    /// Iterates every pair with `start <= key <= end` in strictly increasing
    /// key order. Not required to observe a single consistent snapshot: a
    /// key written concurrently with the scan may or may not be observed.
    fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> ScanIter<'a>;

    /// Starts a new, empty batch bound to this database.
    fn batch(&self) -> Box<dyn Batch + '_>;

    /// Acquires a named advisory lock, blocking the calling thread until it
    /// is available. Non-reentrant: a second `lock` call for a name this
    /// same process already holds blocks (it does not deadlock against
    /// itself at the table level, but it will never return until some
    /// other path unlocks first) — callers must not double-acquire.
    fn lock(&self, name: &[u8]) -> CResult<()>;

    /// Releases a named lock previously acquired by this process. Unlocking
    /// a name this process does not hold is a fatal programmer error.
    fn unlock(&self, name: &[u8]) -> CResult<()>;

    /// Durably persists any buffered writes. Allowed to be a no-op.
    fn flush(&self) -> CResult<()>;

    /// Releases whatever resources this backend holds (file handles,
    /// background tasks, network connections) after flushing. Callers must
    /// not use the database again afterward. The default just flushes;
    /// backends with something to release (the remote backend's client)
    /// override this.
    fn close(&self) -> CResult<()> {
        self.flush()
    }
}

impl<T: Kvdb + ?Sized> Kvdb for &T {
    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &[u8]) -> CResult<()> {
        (**self).delete(key)
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> CResult<()> {
        (**self).delete_range(start, end)
    }

    fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> ScanIter<'a> {
        (**self).scan(start, end)
    }

    fn batch(&self) -> Box<dyn Batch + '_> {
        (**self).batch()
    }

    fn lock(&self, name: &[u8]) -> CResult<()> {
        (**self).lock(name)
    }

    fn unlock(&self, name: &[u8]) -> CResult<()> {
        (**self).unlock(name)
    }

    fn flush(&self) -> CResult<()> {
        (**self).flush()
    }

    fn close(&self) -> CResult<()> {
        (**self).close()
    }
}

/// A buffered sequence of `Set`/`Delete`/`DeleteRange` operations, applied
/// atomically as a unit.
pub trait Batch {
    fn set(&mut self, key: &[u8], value: Vec<u8>);
    fn delete(&mut self, key: &[u8]);
    fn delete_range(&mut self, start: &[u8], end: &[u8]);

    /// A permission point: the backend may flush now and must report
    /// whether it did. Implementations return `true` whenever the batch's
    /// estimated size exceeds the backend's per-transaction limit, or
    /// whenever any buffered operation is a `DeleteRange` (its true cost is
    /// unknown until the range is read).
    fn maybe_apply(&mut self) -> CResult<bool>;

    /// Atomically commits every buffered operation, in issue order, and
    /// resets the batch to empty. An empty `Apply` is a no-op.
    fn apply(&mut self) -> CResult<()>;
}

/// A single buffered operation, shared by every backend's batch
/// implementation so size estimation and ordering logic isn't duplicated
/// per backend.
#[derive(Clone, Debug)]
pub enum BatchOp {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    DeleteRange(Vec<u8>, Vec<u8>),
}

impl BatchOp {
    pub fn is_delete_range(&self) -> bool {
        matches!(self, BatchOp::DeleteRange(_, _))
    }
}

/// Accumulates buffered operations in issue order. Shared by the in-memory,
/// overlay, and embedded-engine batches, which differ only in how `ops` are
/// replayed on `apply`.
#[derive(Default)]
pub struct BatchOps {
    pub ops: Vec<BatchOp>,
}

impl BatchOps {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn push_set(&mut self, key: &[u8], value: Vec<u8>) {
        self.ops.push(BatchOp::Set(key.to_vec(), value));
    }

    pub fn push_delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete(key.to_vec()));
    }

    pub fn push_delete_range(&mut self, start: &[u8], end: &[u8]) {
        self.ops.push(BatchOp::DeleteRange(start.to_vec(), end.to_vec()));
    }

    pub fn has_delete_range(&self) -> bool {
        self.ops.iter().any(BatchOp::is_delete_range)
    }

    pub fn take(&mut self) -> Vec<BatchOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
