//! The in-memory KVDB: an ordered map guarded by a reader-writer lock, with
//! a per-name lock table for advisory locking (§4.2).

use std::collections::BTreeMap;
use std::collections::Bound;
use std::sync::RwLock;

use crate::error::{fatal, CResult};
use crate::kvdb::{Batch, BatchOps, Kvdb, ScanItem};
use crate::lock::LockTable;

pub struct MemoryKvdb {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    locks: LockTable,
}

impl MemoryKvdb {
    pub fn new() -> Self {
        Self { data: RwLock::new(BTreeMap::new()), locks: LockTable::new() }
    }
}

impl Default for MemoryKvdb {
    fn default() -> Self {
        Self::new()
    }
}

impl Kvdb for MemoryKvdb {
    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        if key.is_empty() {
            fatal!("set on empty key");
        }
        self.data.write().unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> CResult<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> CResult<()> {
        let mut data = self.data.write().unwrap();
        let keys: Vec<Vec<u8>> = data
            .range((Bound::Included(start.to_vec()), Bound::Included(end.to_vec())))
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            data.remove(&k);
        }
        Ok(())
    }

    fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> Box<dyn Iterator<Item = CResult<ScanItem>> + 'a> {
        // Each step takes the read lock, clones the one pair it needs, and
        // releases the lock before yielding to the caller -- this keeps a
        // slow consumer from starving writers for the whole scan.
        let start = start.to_vec();
        let end = end.to_vec();
        let mut last: Option<Vec<u8>> = None;
        Box::new(std::iter::from_fn(move || {
            let data = self.data.read().unwrap();
            let lower = match &last {
                None => Bound::Included(start.clone()),
                Some(k) => Bound::Excluded(k.clone()),
            };
            let mut range = data.range((lower, Bound::Included(end.clone())));
            match range.next() {
                Some((k, v)) => {
                    last = Some(k.clone());
                    let key = k.clone();
                    let value = v.clone();
                    Some(Ok(ScanItem::new(key, move || Ok(value))))
                }
                None => None,
            }
        }))
    }

    fn batch(&self) -> Box<dyn Batch + '_> {
        Box::new(MemoryBatch { db: self, ops: BatchOps::new() })
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
        Ok(())
    }
}

struct MemoryBatch<'a> {
    db: &'a MemoryKvdb,
    ops: BatchOps,
}

impl<'a> Batch for MemoryBatch<'a> {
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
        let mut data = self.db.data.write().unwrap();
        for op in ops {
            match op {
                crate::kvdb::BatchOp::Set(k, v) => {
                    if k.is_empty() {
                        fatal!("set on empty key in batch");
                    }
                    data.insert(k, v);
                }
                crate::kvdb::BatchOp::Delete(k) => {
                    data.remove(&k);
                }
                crate::kvdb::BatchOp::DeleteRange(start, end) => {
                    let keys: Vec<Vec<u8>> = data
                        .range((Bound::Included(start), Bound::Included(end)))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in keys {
                        data.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops() {
        let db = MemoryKvdb::new();
        assert_eq!(db.get(b"a").unwrap(), None);
        db.set(b"a", vec![1]).unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(vec![1]));
        db.delete(b"a").unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);
    }

    #[test]
    #[should_panic]
    fn set_empty_key_is_fatal() {
        let db = MemoryKvdb::new();
        db.set(b"", vec![1]).unwrap();
    }

    #[test]
    fn scan_is_ordered() {
        let db = MemoryKvdb::new();
        db.set(b"b", vec![2]).unwrap();
        db.set(b"a", vec![1]).unwrap();
        db.set(b"c", vec![3]).unwrap();

        let got: Vec<(Vec<u8>, Vec<u8>)> = db
            .scan(b"", &[0xff])
            .map(|item| {
                let item = item.unwrap();
                let key = item.key.clone();
                (key, item.value().unwrap())
            })
            .collect();
        assert_eq!(got, vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2]), (b"c".to_vec(), vec![3])]);
    }

    #[test]
    fn delete_range_is_inclusive() {
        let db = MemoryKvdb::new();
        db.set(&[0x01], vec![b'a']).unwrap();
        db.set(&[0x02], vec![b'b']).unwrap();
        db.delete_range(&[0x01], &[0x02]).unwrap();
        let got: Vec<_> = db.scan(b"", &[0xff]).collect::<CResult<Vec<_>>>().unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn batch_applies_in_order_atomically() {
        let db = MemoryKvdb::new();
        {
            let mut batch = db.batch();
            batch.set(b"k", vec![1]);
            batch.delete(b"k");
            batch.set(b"k", vec![2]);
            batch.apply().unwrap();
        }
        assert_eq!(db.get(b"k").unwrap(), Some(vec![2]));
    }

    #[test]
    fn empty_apply_is_noop() {
        let db = MemoryKvdb::new();
        db.set(b"k", vec![0]).unwrap();
        {
            let mut batch = db.batch();
            batch.apply().unwrap();
        }
        db.delete(b"k").unwrap();
        {
            let mut batch = db.batch();
            batch.apply().unwrap();
        }
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn maybe_apply_true_on_delete_range() {
        let db = MemoryKvdb::new();
        let mut batch = db.batch();
        batch.delete_range(&[0x00], &[0xff]);
        assert!(batch.maybe_apply().unwrap());
    }
}
