//! The remote backend's transactional batch (§4.5): every buffered
//! operation commits inside one document-store transaction. Transactions
//! there require all reads to precede all writes, so range deletes are
//! resolved to concrete ids before any write is issued.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Runtime;

use crate::error::CResult;
use crate::kvdb::{Batch, BatchOp, BatchOps};
use crate::remote::client::{DocumentClient, FieldValue};
use crate::remote::kv::hex_encode;

/// Observed ceiling on a single commit's encoded size. `MaybeApply` must
/// report `true` once a buffered batch's estimate reaches this.
pub const MAX_TXN_BYTES: usize = 4 * 1024 * 1024;
const PER_BATCH_OVERHEAD: usize = 64;
const PER_OP_OVERHEAD: usize = 32;

fn estimate_op_size(op: &BatchOp) -> usize {
    match op {
        BatchOp::Set(k, v) => PER_OP_OVERHEAD + k.len() + v.len(),
        BatchOp::Delete(k) => PER_OP_OVERHEAD + k.len(),
        BatchOp::DeleteRange(s, e) => PER_OP_OVERHEAD + s.len() + e.len(),
    }
}

pub struct RemoteBatch<'a, C: DocumentClient + 'static> {
    client: &'a Arc<C>,
    rt: &'a Arc<Runtime>,
    collection: &'a str,
    value_field: &'static str,
    ops: BatchOps,
    estimated_bytes: usize,
}

impl<'a, C: DocumentClient + 'static> RemoteBatch<'a, C> {
    pub fn new(client: &'a Arc<C>, rt: &'a Arc<Runtime>, collection: &'a str, value_field: &'static str) -> Self {
        Self { client, rt, collection, value_field, ops: BatchOps::new(), estimated_bytes: PER_BATCH_OVERHEAD }
    }
}

impl<'a, C: DocumentClient + 'static> Batch for RemoteBatch<'a, C> {
    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.estimated_bytes += PER_OP_OVERHEAD + key.len() + value.len();
        self.ops.push_set(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.estimated_bytes += PER_OP_OVERHEAD + key.len();
        self.ops.push_delete(key);
    }

    fn delete_range(&mut self, start: &[u8], end: &[u8]) {
        self.estimated_bytes += PER_OP_OVERHEAD + start.len() + end.len();
        self.ops.push_delete_range(start, end);
    }

    fn maybe_apply(&mut self) -> CResult<bool> {
        if self.ops.has_delete_range() || self.estimated_bytes >= MAX_TXN_BYTES {
            self.apply()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn apply(&mut self) -> CResult<()> {
        let ops = self.ops.take();
        self.estimated_bytes = PER_BATCH_OVERHEAD;
        if ops.is_empty() {
            return Ok(());
        }
        let client = self.client.clone();
        let collection = self.collection;
        let value_field = self.value_field;
        self.rt.block_on(async move {
            let txn = client.begin_transaction().await?;
            // Reads: resolve every DeleteRange to concrete ids before any
            // write touches the transaction.
            let mut resolved: Vec<ResolvedOp> = Vec::with_capacity(ops.len());
            for op in ops {
                match op {
                    BatchOp::Set(k, v) => resolved.push(ResolvedOp::Set(k, v)),
                    BatchOp::Delete(k) => resolved.push(ResolvedOp::Delete(k)),
                    BatchOp::DeleteRange(start, end) => {
                        let ids = client
                            .txn_query_range(txn, collection, &hex_encode(&start), &hex_encode(&end))
                            .await?;
                        resolved.push(ResolvedOp::DeleteResolved(ids));
                    }
                }
            }

            // Writes, in original order.
            for op in resolved {
                match op {
                    ResolvedOp::Set(k, v) => {
                        let id = hex_encode(&k);
                        let mut fields = HashMap::new();
                        fields.insert(value_field.to_string(), FieldValue::Bytes(v));
                        client.txn_set(txn, collection, &id, fields).await?;
                    }
                    ResolvedOp::Delete(k) => {
                        let id = hex_encode(&k);
                        client.txn_delete(txn, collection, &id).await?;
                    }
                    ResolvedOp::DeleteResolved(ids) => {
                        for id in ids {
                            client.txn_delete(txn, collection, &id).await?;
                        }
                    }
                }
            }

            client.commit(txn).await
        })
    }
}

enum ResolvedOp {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    DeleteResolved(Vec<String>),
}

/// Encodes a vector-valued `Set` payload for the remote VDB's batch, which
/// shares this transaction machinery but writes `Embedding` fields instead
/// of `V` byte fields.
pub fn vector_fields(vector: &[f32]) -> HashMap<String, FieldValue> {
    let mut fields = HashMap::new();
    fields.insert("Embedding".to_string(), FieldValue::Bytes(crate::vector::encode_vector(vector)));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::kv::RemoteKvdb;
    use crate::remote::stub::StubDocumentClient;
    use crate::kvdb::Kvdb;

    fn db() -> RemoteKvdb<StubDocumentClient> {
        RemoteKvdb::new(Arc::new(StubDocumentClient::new())).unwrap()
    }

    #[test]
    fn batch_preserves_order() {
        let db = db();
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
    fn delete_range_resolves_before_writes() {
        let db = db();
        db.set(&[0x01], vec![1]).unwrap();
        db.set(&[0x02], vec![2]).unwrap();
        db.set(&[0x03], vec![3]).unwrap();
        {
            let mut batch = db.batch();
            batch.delete_range(&[0x01], &[0x02]);
            batch.set(&[0x04], vec![4]);
            batch.apply().unwrap();
        }
        assert_eq!(db.get(&[0x01]).unwrap(), None);
        assert_eq!(db.get(&[0x02]).unwrap(), None);
        assert_eq!(db.get(&[0x03]).unwrap(), Some(vec![3]));
        assert_eq!(db.get(&[0x04]).unwrap(), Some(vec![4]));
    }

    #[test]
    fn maybe_apply_true_on_delete_range() {
        let db = db();
        let mut batch = db.batch();
        batch.delete_range(&[0x00], &[0xff]);
        assert!(batch.maybe_apply().unwrap());
    }

    #[test]
    fn empty_apply_is_noop() {
        let db = db();
        db.set(b"k", vec![1]).unwrap();
        let mut batch = db.batch();
        batch.apply().unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(vec![1]));
    }
}
