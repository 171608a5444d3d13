//! The embedded, single-process LSM-style KVDB (§4.2a): an append-only log
//! plus an in-memory keydir, compacted on demand. Backs the `pebble` spec
//! kind.

use std::collections::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::embedded::log::{KeyDir, Log};
use crate::error::{fatal, CResult};
use crate::kvdb::{Batch, BatchOp, BatchOps, Kvdb, ScanItem};
use crate::lock::LockTable;

/// On-disk size accounting, used by compaction and exposed for
/// observability.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub keys: u64,
    pub size: u64,
    pub total_disk_size: u64,
    pub live_disk_size: u64,
    pub garbage_disk_size: u64,
}

struct Inner {
    log: Log,
    keydir: KeyDir,
}

pub struct EmbeddedKvdb {
    inner: Mutex<Inner>,
    locks: LockTable,
}

impl EmbeddedKvdb {
    pub fn new(path: impl Into<PathBuf>) -> CResult<Self> {
        Self::new_with_lock(path.into(), true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        let mut log = Log::new_with_lock(path, try_lock)?;
        let keydir = log.build_keydir()?;
        Ok(Self { inner: Mutex::new(Inner { log, keydir }), locks: LockTable::new() })
    }

    /// Opens the directory and compacts it immediately if the garbage ratio
    /// observed at open time meets or exceeds `garbage_ratio_threshold`.
    pub fn new_compact(path: impl Into<PathBuf>, garbage_ratio_threshold: f64) -> CResult<Self> {
        let s = Self::new(path)?;
        let status = s.status()?;
        if status.total_disk_size > 0 {
            let garbage_ratio = status.garbage_disk_size as f64 / status.total_disk_size as f64;
            if status.garbage_disk_size > 0 && garbage_ratio >= garbage_ratio_threshold {
                let path_display = s.inner.lock().unwrap().log.path.display().to_string();
                log::info!(
                    "compacting {} to remove {} bytes garbage ({:.0}% of {} bytes)",
                    path_display,
                    status.garbage_disk_size,
                    garbage_ratio * 100.0,
                    status.total_disk_size
                );
                s.compact()?;
                log::info!("compacted {} to {} bytes", path_display, status.live_disk_size);
            }
        }
        Ok(s)
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap().log.path.clone()
    }

    pub fn status(&self) -> CResult<Status> {
        let inner = self.inner.lock().unwrap();
        let keys = inner.keydir.len() as u64;
        let size = inner
            .keydir
            .iter()
            .fold(0u64, |size, (key, (_, value_len))| size + key.len() as u64 + *value_len as u64);
        let total_disk_size = inner.log.file.metadata()?.len();
        let live_disk_size = size + 8 * keys;
        let garbage_disk_size = total_disk_size.saturating_sub(live_disk_size);
        Ok(Status { keys, size, total_disk_size, live_disk_size, garbage_disk_size })
    }

    /// Rewrites a new log file containing only the current live entries, in
    /// key order, then atomically replaces the current file with it.
    pub fn compact(&self) -> CResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut tmp_path = inner.log.path.clone();
        tmp_path.set_extension("compact.new");

        let mut new_log = Log::new_with_lock(tmp_path, false)?;
        new_log.file.set_len(0)?;
        let mut new_keydir = KeyDir::new();
        for (key, (value_pos, value_len)) in inner.keydir.iter() {
            let value = inner.log.read_value(*value_pos, *value_len)?;
            let (pos, len) = new_log.write_entry(key, Some(&value))?;
            new_keydir.insert(key.clone(), (pos + len as u64 - *value_len as u64, *value_len));
        }

        std::fs::rename(&new_log.path, &inner.log.path)?;
        new_log.path = inner.log.path.clone();
        inner.log = new_log;
        inner.keydir = new_keydir;
        Ok(())
    }
}

impl Drop for EmbeddedKvdb {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::error!("failed to flush embedded engine on close: {}", err);
        }
    }
}

impl Kvdb for EmbeddedKvdb {
    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.keydir.get(key).copied() {
            Some((pos, len)) => Ok(Some(inner.log.read_value(pos, len)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        if key.is_empty() {
            fatal!("set on empty key");
        }
        let mut inner = self.inner.lock().unwrap();
        let (pos, len) = inner.log.write_entry(key, Some(&value))?;
        let value_len = value.len() as u32;
        inner.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> CResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.keydir.contains_key(key) {
            inner.log.write_entry(key, None)?;
            inner.keydir.remove(key);
        }
        Ok(())
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> CResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<Vec<u8>> = inner
            .keydir
            .range((Bound::Included(start.to_vec()), Bound::Included(end.to_vec())))
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            inner.log.write_entry(&k, None)?;
            inner.keydir.remove(&k);
        }
        Ok(())
    }

    fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> Box<dyn Iterator<Item = CResult<ScanItem>> + 'a> {
        let start = start.to_vec();
        let end = end.to_vec();
        let mut last: Option<Vec<u8>> = None;
        Box::new(std::iter::from_fn(move || {
            let mut inner = self.inner.lock().unwrap();
            let lower = match &last {
                None => Bound::Included(start.clone()),
                Some(k) => Bound::Excluded(k.clone()),
            };
            let next = inner
                .keydir
                .range((lower, Bound::Included(end.clone())))
                .next()
                .map(|(k, v)| (k.clone(), *v));
            match next {
                Some((key, (pos, len))) => {
                    last = Some(key.clone());
                    let value = inner.log.read_value(pos, len);
                    Some(value.map(|v| ScanItem::new(key, move || Ok(v))))
                }
                None => None,
            }
        }))
    }

    fn batch(&self) -> Box<dyn Batch + '_> {
        Box::new(EmbeddedBatch { db: self, ops: BatchOps::new() })
    }

    fn lock(&self, name: &[u8]) -> CResult<()> {
        self.locks.lock(name);
        Ok(())
    }

    fn unlock(&self, name: &[u8]) -> CResult<()> {
        self.locks.unlock(name);
        Ok(())
    }

    fn flush(&self) -> CResult<()> {
        Ok(self.inner.lock().unwrap().log.file.sync_all()?)
    }
}

struct EmbeddedBatch<'a> {
    db: &'a EmbeddedKvdb,
    ops: BatchOps,
}

impl<'a> Batch for EmbeddedBatch<'a> {
    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.ops.push_set(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.ops.push_delete(key);
    }

    fn delete_range(&mut self, start: &[u8], end: &[u8]) {
        self.ops.push_delete_range(start, end);
    }

    fn maybe_apply(&mut self) -> CResult<bool> {
        if self.ops.has_delete_range() {
            self.apply()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn apply(&mut self) -> CResult<()> {
        let ops = self.ops.take();
        if ops.is_empty() {
            return Ok(());
        }
        // A single critical section over the whole batch: every other
        // thread observes the batch as one atomic step.
        let mut inner = self.db.inner.lock().unwrap();
        for op in ops {
            match op {
                BatchOp::Set(k, v) => {
                    if k.is_empty() {
                        fatal!("set on empty key in batch");
                    }
                    let (pos, len) = inner.log.write_entry(&k, Some(&v))?;
                    let value_len = v.len() as u32;
                    inner.keydir.insert(k, (pos + len as u64 - value_len as u64, value_len));
                }
                BatchOp::Delete(k) => {
                    if inner.keydir.contains_key(&k) {
                        inner.log.write_entry(&k, None)?;
                        inner.keydir.remove(&k);
                    }
                }
                BatchOp::DeleteRange(start, end) => {
                    let keys: Vec<Vec<u8>> = inner
                        .keydir
                        .range((Bound::Included(start), Bound::Included(end)))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in keys {
                        inner.log.write_entry(&k, None)?;
                        inner.keydir.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn canonicalize_dir(path: &str) -> String {
    // Collapses "." segments and redundant separators while leaving
    // backslashes and drive letters untouched, so Windows paths given on a
    // non-Windows build still round-trip through the spec string.
    let is_windows_style = path.contains('\\') || path.get(1..2) == Some(":");
    let sep = if is_windows_style { '\\' } else { '/' };
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            _ => parts.push(segment),
        }
    }
    let leading = if path.starts_with('/') || path.starts_with('\\') { sep.to_string() } else { String::new() };
    format!("{}{}", leading, parts.join(&sep.to_string()))
}

pub fn path_from_spec(loc: &str) -> PathBuf {
    Path::new(loc).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        let db = EmbeddedKvdb::new(path.clone()).unwrap();
        db.set(b"a", vec![1]).unwrap();
        db.set(b"b", vec![2]).unwrap();
        db.delete(b"a").unwrap();
        db.flush().unwrap();
        let expect: Vec<_> = db.scan(b"", &[0xff]).collect::<CResult<Vec<_>>>().unwrap();
        drop(db);

        let db = EmbeddedKvdb::new(path).unwrap();
        let got: Vec<_> = db.scan(b"", &[0xff]).collect::<CResult<Vec<_>>>().unwrap();
        assert_eq!(got.len(), expect.len());
        assert_eq!(db.get(b"a").unwrap(), None);
        assert_eq!(db.get(b"b").unwrap(), Some(vec![2]));
    }

    #[test]
    fn second_open_fails_while_first_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let first = EmbeddedKvdb::new(path.clone()).unwrap();
        assert!(EmbeddedKvdb::new(path.clone()).is_err());
        drop(first);
        assert!(EmbeddedKvdb::new(path).is_ok());
    }

    #[test]
    fn compact_removes_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let db = EmbeddedKvdb::new(path).unwrap();
        for _ in 0..5 {
            db.set(b"k", vec![0u8; 64]).unwrap();
        }
        let before = db.status().unwrap();
        assert!(before.garbage_disk_size > 0);
        db.compact().unwrap();
        let after = db.status().unwrap();
        assert_eq!(after.garbage_disk_size, 0);
        assert_eq!(after.total_disk_size, before.live_disk_size);
        assert_eq!(db.get(b"k").unwrap(), Some(vec![0u8; 64]));
    }

    #[test]
    fn new_compact_triggers_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let db = EmbeddedKvdb::new(path.clone()).unwrap();
            for _ in 0..5 {
                db.set(b"k", vec![0u8; 64]).unwrap();
            }
        }
        let db = EmbeddedKvdb::new_compact(path, 0.2).unwrap();
        let status = db.status().unwrap();
        assert_eq!(status.garbage_disk_size, 0);
    }

    #[test]
    fn delete_range_is_inclusive_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let db = EmbeddedKvdb::new(path).unwrap();
        db.set(&[0x01], vec![1]).unwrap();
        db.set(&[0x02], vec![2]).unwrap();
        db.set(&[0x03], vec![3]).unwrap();
        db.delete_range(&[0x01], &[0x02]).unwrap();
        let got: Vec<_> = db
            .scan(b"", &[0xff])
            .map(|i| i.unwrap().key)
            .collect();
        assert_eq!(got, vec![vec![0x03]]);
    }

    #[test]
    fn canonicalize_strips_dot_segments() {
        assert_eq!(canonicalize_dir("/var/./lib//oscar"), "/var/lib/oscar");
        assert_eq!(canonicalize_dir(r"C:\data\.\x"), r"C:\data\x");
    }
}
