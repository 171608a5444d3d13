//! The overlay KVDB (§4.3): a writable overlay composed over a read-only
//! base, with point and range tombstones recorded in a reserved
//! `__overlay` key sub-space so a later write to the base can't
//! resurrect something the overlay has hidden.

use crate::error::{fatal, CResult};
use crate::key::{self, Component};
use crate::kvdb::{Batch, BatchOp, BatchOps, Kvdb, ScanItem};
use crate::lock::LockTable;

const TOMBSTONE_NS: &str = "__overlay";
const RANGE_NS: &str = "ranges";

fn point_tombstone_key(key: &[u8]) -> Vec<u8> {
    key::encode(&[Component::Str(TOMBSTONE_NS), Component::Bytes(key)])
}

fn range_tombstone_key(start: &[u8]) -> Vec<u8> {
    key::encode(&[Component::Str(TOMBSTONE_NS), Component::Str(RANGE_NS), Component::Bytes(start)])
}

fn tombstone_prefix() -> Vec<u8> {
    key::encode(&[Component::Str(TOMBSTONE_NS)])
}

/// Composes a writable `overlay` KVDB over a read-only `base`. Both may be
/// any `Kvdb` implementation, including another `OverlayKvdb`.
pub struct OverlayKvdb<O: Kvdb, B: Kvdb> {
    overlay: O,
    base: B,
    locks: LockTable,
}

impl<O: Kvdb, B: Kvdb> OverlayKvdb<O, B> {
    pub fn new(overlay: O, base: B) -> Self {
        Self { overlay, base, locks: LockTable::new() }
    }

    fn point_tombstone_present(&self, key: &[u8]) -> CResult<bool> {
        Ok(self.overlay.get(&point_tombstone_key(key))?.is_some())
    }

    /// True if some range tombstone's `[start, end]` brackets `key`. Range
    /// tombstones are indexed by start, so this scans every tombstone whose
    /// start is `<= key` and checks its stored end.
    fn range_tombstone_covers(&self, key: &[u8]) -> CResult<bool> {
        let prefix = key::encode(&[Component::Str(TOMBSTONE_NS), Component::Str(RANGE_NS)]);
        let upper = range_tombstone_key(key);
        for item in self.overlay.scan(&prefix, &upper) {
            let item = item?;
            let end = item.value()?;
            if key <= end.as_slice() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn is_hidden(&self, key: &[u8]) -> CResult<bool> {
        Ok(self.point_tombstone_present(key)? || self.range_tombstone_covers(key)?)
    }
}

impl<O: Kvdb, B: Kvdb> Kvdb for OverlayKvdb<O, B> {
    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some(v) = self.overlay.get(key)? {
            return Ok(Some(v));
        }
        if self.is_hidden(key)? {
            return Ok(None);
        }
        self.base.get(key)
    }

    fn set(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        if key.is_empty() {
            fatal!("set on empty key");
        }
        self.overlay.set(key, value)?;
        self.overlay.delete(&point_tombstone_key(key))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> CResult<()> {
        self.overlay.delete(key)?;
        self.overlay.set(&point_tombstone_key(key), Vec::new())?;
        Ok(())
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> CResult<()> {
        self.overlay.delete_range(start, end)?;
        self.overlay.set(&range_tombstone_key(start), end.to_vec())?;
        Ok(())
    }

    fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> Box<dyn Iterator<Item = CResult<ScanItem>> + 'a> {
        let prefix = tombstone_prefix();
        let overlay_items: std::vec::IntoIter<CResult<(Vec<u8>, Vec<u8>)>> = {
            let mut v = Vec::new();
            for item in self.overlay.scan(start, end) {
                match item {
                    Ok(item) => {
                        if item.key.starts_with(&prefix) {
                            continue;
                        }
                        let key = item.key.clone();
                        match item.value() {
                            Ok(value) => v.push(Ok((key, value))),
                            Err(e) => v.push(Err(e)),
                        }
                    }
                    Err(e) => v.push(Err(e)),
                }
            }
            v.into_iter()
        };
        let mut overlay_items = overlay_items.peekable();

        let base_start = start.to_vec();
        let base_end = end.to_vec();
        let mut base_items = self.base.scan(&base_start, &base_end).peekable();

        Box::new(std::iter::from_fn(move || loop {
            let overlay_peek = overlay_items.peek();
            let ord = match (overlay_peek, base_items.peek()) {
                (None, None) => return None,
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(Err(_)), _) => std::cmp::Ordering::Less,
                (_, Some(Err(_))) => std::cmp::Ordering::Greater,
                (Some(Ok((ok, _))), Some(Ok(bi))) => ok.cmp(&bi.key),
            };
            match ord {
                std::cmp::Ordering::Less => {
                    return match overlay_items.next().unwrap() {
                        Ok((key, value)) => Some(Ok(ScanItem::new(key, move || Ok(value)))),
                        Err(e) => Some(Err(e)),
                    };
                }
                std::cmp::Ordering::Equal => {
                    // Overlay wins on ties; drop the shadowed base entry.
                    let _ = base_items.next();
                    return match overlay_items.next().unwrap() {
                        Ok((key, value)) => Some(Ok(ScanItem::new(key, move || Ok(value)))),
                        Err(e) => Some(Err(e)),
                    };
                }
                std::cmp::Ordering::Greater => {
                    let item = match base_items.next().unwrap() {
                        Ok(item) => item,
                        Err(e) => return Some(Err(e)),
                    };
                    match self.is_hidden(&item.key) {
                        Ok(true) => continue,
                        Ok(false) => return Some(Ok(item)),
                        Err(e) => return Some(Err(e)),
                    }
                }
            }
        }))
    }

    fn batch(&self) -> Box<dyn Batch + '_> {
        Box::new(OverlayBatch { db: self, ops: BatchOps::new() })
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
        self.overlay.flush()
    }
}

struct OverlayBatch<'a, O: Kvdb, B: Kvdb> {
    db: &'a OverlayKvdb<O, B>,
    ops: BatchOps,
}

impl<'a, O: Kvdb, B: Kvdb> Batch for OverlayBatch<'a, O, B> {
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
        for op in ops {
            match op {
                BatchOp::Set(k, v) => self.db.set(&k, v)?,
                BatchOp::Delete(k) => self.db.delete(&k)?,
                BatchOp::DeleteRange(s, e) => self.db.delete_range(&s, &e)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvdb;

    fn keys(db: &impl Kvdb, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
        db.scan(start, end).map(|i| i.unwrap().key).collect()
    }

    #[test]
    fn reads_fall_through_to_base() {
        let base = MemoryKvdb::new();
        base.set(b"a", vec![1]).unwrap();
        let ov = OverlayKvdb::new(MemoryKvdb::new(), base);
        assert_eq!(ov.get(b"a").unwrap(), Some(vec![1]));
    }

    #[test]
    fn overlay_shadows_base() {
        let base = MemoryKvdb::new();
        base.set(b"a", vec![1]).unwrap();
        let ov = OverlayKvdb::new(MemoryKvdb::new(), base);
        ov.set(b"a", vec![2]).unwrap();
        assert_eq!(ov.get(b"a").unwrap(), Some(vec![2]));
    }

    #[test]
    fn delete_hides_base_value() {
        let base = MemoryKvdb::new();
        base.set(b"a", vec![1]).unwrap();
        let ov = OverlayKvdb::new(MemoryKvdb::new(), base);
        ov.delete(b"a").unwrap();
        assert_eq!(ov.get(b"a").unwrap(), None);
    }

    #[test]
    fn set_after_delete_clears_point_tombstone() {
        let base = MemoryKvdb::new();
        let ov = OverlayKvdb::new(MemoryKvdb::new(), base);
        ov.set(b"a", vec![1]).unwrap();
        ov.delete(b"a").unwrap();
        ov.set(b"a", vec![2]).unwrap();
        assert_eq!(ov.get(b"a").unwrap(), Some(vec![2]));
    }

    #[test]
    fn delete_range_hides_future_base_writes() {
        let base = MemoryKvdb::new();
        let ov = OverlayKvdb::new(MemoryKvdb::new(), base);
        ov.delete_range(&[0x01], &[0x05]).unwrap();
        // A key inserted into the base *after* the range tombstone was
        // recorded must still be hidden from the overlay's view.
        ov.base.set(&[0x03], vec![9]).unwrap();
        assert_eq!(ov.get(&[0x03]).unwrap(), None);
        assert!(keys(&ov, &[0x00], &[0xff]).is_empty());
    }

    #[test]
    fn scan_merges_overlay_and_base_in_order() {
        let base = MemoryKvdb::new();
        base.set(&[0x01], vec![1]).unwrap();
        base.set(&[0x03], vec![3]).unwrap();
        let ov = OverlayKvdb::new(MemoryKvdb::new(), base);
        ov.set(&[0x02], vec![2]).unwrap();
        ov.set(&[0x03], vec![30]).unwrap();

        let got: Vec<(Vec<u8>, Vec<u8>)> =
            ov.scan(&[0x00], &[0xff]).map(|i| { let i = i.unwrap(); let k = i.key.clone(); (k, i.value().unwrap()) }).collect();
        assert_eq!(got, vec![(vec![0x01], vec![1]), (vec![0x02], vec![2]), (vec![0x03], vec![30])]);
    }

    #[test]
    fn scan_never_yields_tombstone_keys() {
        let base = MemoryKvdb::new();
        let ov = OverlayKvdb::new(MemoryKvdb::new(), base);
        ov.set(b"a", vec![1]).unwrap();
        ov.delete(b"a").unwrap();
        assert!(keys(&ov, b"", &[0xff]).is_empty());
    }

    #[test]
    fn batch_applies_mixed_ops() {
        let base = MemoryKvdb::new();
        base.set(b"a", vec![1]).unwrap();
        let ov = OverlayKvdb::new(MemoryKvdb::new(), base);
        {
            let mut batch = ov.batch();
            batch.set(b"b", vec![2]);
            batch.delete(b"a");
            batch.apply().unwrap();
        }
        assert_eq!(ov.get(b"a").unwrap(), None);
        assert_eq!(ov.get(b"b").unwrap(), Some(vec![2]));
    }
}
