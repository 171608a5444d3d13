//! The in-memory VDB (§4.7): write-through to a backing `Kvdb`, with an
//! in-memory ordered cache for `Get`/`All`/`Search`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{fatal, CResult, Error};
use crate::key::{self, Component};
use crate::kvdb::Kvdb;
use crate::vdb::{TopK, Vdb, VdbBatch, VectorItem, VectorIter};

fn storage_key(namespace: &str, id: &str) -> Vec<u8> {
    key::encode(&[Component::Str("llm.Vector"), Component::Str(namespace), Component::Str(id)])
}

fn namespace_prefix(namespace: &str) -> Vec<u8> {
    key::encode(&[Component::Str("llm.Vector"), Component::Str(namespace)])
}

fn id_from_storage_key(namespace: &str, full_key: &[u8]) -> CResult<String> {
    let prefix = namespace_prefix(namespace);
    let rest = full_key
        .strip_prefix(prefix.as_slice())
        .ok_or_else(|| Error::Corrupt("vector key missing namespace prefix".into()))?;
    let mut cursor = std::io::Cursor::new(rest);
    let id_bytes = key::decode_bytes_segment(&mut cursor)?;
    String::from_utf8(id_bytes).map_err(|_| Error::Corrupt("vector id is not valid utf-8".into()))
}

pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    let mut out = vec![0u8; v.len() * 4];
    LittleEndian::write_f32_into(v, &mut out);
    out
}

pub fn decode_vector(bytes: &[u8]) -> CResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Corrupt(format!("vector byte length {} not divisible by 4", bytes.len())));
    }
    let mut out = vec![0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(bytes, &mut out);
    Ok(out)
}

/// A VDB backed by any `Kvdb`, with every vector also held in an in-memory
/// cache for fast `Search`. The cache is loaded once, at construction, by
/// scanning the namespace's key range.
pub struct CachedVdb<K: Kvdb> {
    kvdb: K,
    namespace: String,
    cache: RwLock<BTreeMap<String, Vec<f32>>>,
}

impl<K: Kvdb> CachedVdb<K> {
    pub fn new(kvdb: K, namespace: impl Into<String>) -> CResult<Self> {
        let namespace = namespace.into();
        let prefix = namespace_prefix(&namespace);
        let mut end = prefix.clone();
        end.push(key::INFINITY_MARKER);

        let mut cache = BTreeMap::new();
        for item in kvdb.scan(&prefix, &end) {
            let item = item?;
            let id = id_from_storage_key(&namespace, &item.key)?;
            let vector = decode_vector(&item.value()?)?;
            cache.insert(id, vector);
        }

        Ok(Self { kvdb, namespace, cache: RwLock::new(cache) })
    }
}

impl<K: Kvdb> Vdb for CachedVdb<K> {
    fn set(&self, id: &str, vector: Vec<f32>) -> CResult<()> {
        if id.is_empty() {
            fatal!("set on empty vector id");
        }
        self.kvdb.set(&storage_key(&self.namespace, id), encode_vector(&vector))?;
        self.cache.write().unwrap().insert(id.to_string(), vector);
        Ok(())
    }

    fn get(&self, id: &str) -> CResult<Option<Vec<f32>>> {
        Ok(self.cache.read().unwrap().get(id).cloned())
    }

    fn delete(&self, id: &str) -> CResult<()> {
        self.kvdb.delete(&storage_key(&self.namespace, id))?;
        self.cache.write().unwrap().remove(id);
        Ok(())
    }

    fn all(&self) -> VectorIter<'_> {
        // Snapshot id and vector together under one read-lock acquisition;
        // `VectorItem`'s value closure must be `'static`, so there's no way
        // to hand back a borrow of the cache itself.
        let pairs: Vec<(String, Vec<f32>)> =
            self.cache.read().unwrap().iter().map(|(id, v)| (id.clone(), v.clone())).collect();
        Box::new(pairs.into_iter().map(|(id, vector)| Ok(VectorItem::new(id, move || Ok(vector)))))
    }

    fn search(&self, target: &[f32], n: usize) -> CResult<Vec<crate::vdb::SearchResult>> {
        let cache = self.cache.read().unwrap();
        let mut top = TopK::new(n);
        for (id, vector) in cache.iter() {
            if vector.len() != target.len() {
                continue;
            }
            top.offer(id.clone(), crate::vdb::dot(target, vector));
        }
        Ok(top.into_vec())
    }

    fn batch(&self) -> Box<dyn VdbBatch + '_> {
        Box::new(CachedVdbBatch { vdb: self, ops: Vec::new() })
    }

    fn flush(&self) -> CResult<()> {
        self.kvdb.flush()
    }
}

enum VdbOp {
    Set(String, Vec<f32>),
    Delete(String),
}

struct CachedVdbBatch<'a, K: Kvdb> {
    vdb: &'a CachedVdb<K>,
    ops: Vec<VdbOp>,
}

impl<'a, K: Kvdb> VdbBatch for CachedVdbBatch<'a, K> {
    fn set(&mut self, id: &str, vector: Vec<f32>) {
        self.ops.push(VdbOp::Set(id.to_string(), vector));
    }

    fn delete(&mut self, id: &str) {
        self.ops.push(VdbOp::Delete(id.to_string()));
    }

    fn maybe_apply(&mut self) -> CResult<bool> {
        Ok(false)
    }

    fn apply(&mut self) -> CResult<()> {
        let ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            return Ok(());
        }
        {
            let mut batch = self.vdb.kvdb.batch();
            for op in &ops {
                match op {
                    VdbOp::Set(id, v) => batch.set(&storage_key(&self.vdb.namespace, id), encode_vector(v)),
                    VdbOp::Delete(id) => batch.delete(&storage_key(&self.vdb.namespace, id)),
                }
            }
            batch.apply()?;
        }
        let mut cache = self.vdb.cache.write().unwrap();
        for op in ops {
            match op {
                VdbOp::Set(id, v) => {
                    cache.insert(id, v);
                }
                VdbOp::Delete(id) => {
                    cache.remove(&id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvdb;

    #[test]
    fn set_get_delete() {
        let vdb = CachedVdb::new(MemoryKvdb::new(), "ns").unwrap();
        vdb.set("a", vec![1.0, 2.0]).unwrap();
        assert_eq!(vdb.get("a").unwrap(), Some(vec![1.0, 2.0]));
        vdb.delete("a").unwrap();
        assert_eq!(vdb.get("a").unwrap(), None);
    }

    #[test]
    #[should_panic]
    fn set_empty_id_is_fatal() {
        let vdb = CachedVdb::new(MemoryKvdb::new(), "ns").unwrap();
        vdb.set("", vec![1.0]).unwrap();
    }

    #[test]
    fn reload_recovers_cache_from_kvdb() {
        let kvdb = MemoryKvdb::new();
        {
            let vdb = CachedVdb::new(&kvdb, "ns").unwrap();
            vdb.set("a", vec![1.0, 2.0]).unwrap();
            vdb.set("b", vec![3.0, 4.0]).unwrap();
        }
        let vdb = CachedVdb::new(&kvdb, "ns").unwrap();
        assert_eq!(vdb.get("a").unwrap(), Some(vec![1.0, 2.0]));
        assert_eq!(vdb.get("b").unwrap(), Some(vec![3.0, 4.0]));
    }

    #[test]
    fn namespaces_do_not_collide() {
        let kvdb = MemoryKvdb::new();
        let a = CachedVdb::new(&kvdb, "a").unwrap();
        let b = CachedVdb::new(&kvdb, "b").unwrap();
        a.set("x", vec![1.0]).unwrap();
        assert_eq!(b.get("x").unwrap(), None);
    }

    #[test]
    fn search_skips_mismatched_lengths_and_orders_by_score() {
        let vdb = CachedVdb::new(MemoryKvdb::new(), "ns").unwrap();
        vdb.set("a", vec![1.0, 0.0]).unwrap();
        vdb.set("b", vec![0.0, 1.0]).unwrap();
        vdb.set("c", vec![1.0, 1.0, 1.0]).unwrap();
        let results = vdb.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
    }

    #[test]
    fn all_iterates_in_id_order() {
        let vdb = CachedVdb::new(MemoryKvdb::new(), "ns").unwrap();
        vdb.set("b", vec![1.0]).unwrap();
        vdb.set("a", vec![1.0]).unwrap();
        let ids: Vec<String> = vdb.all().map(|i| i.unwrap().id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn batch_commits_kvdb_then_cache() {
        let kvdb = MemoryKvdb::new();
        let vdb = CachedVdb::new(&kvdb, "ns").unwrap();
        {
            let mut batch = vdb.batch();
            batch.set("a", vec![1.0]);
            batch.set("b", vec![2.0]);
            batch.apply().unwrap();
        }
        assert_eq!(vdb.get("a").unwrap(), Some(vec![1.0]));
        assert_eq!(kvdb.get(&storage_key("ns", "b")).unwrap().is_some(), true);
    }
}
