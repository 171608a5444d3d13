//! The remote VDB (§4.8): one collection per namespace, vector ids
//! hex-encoded like KV keys, `Search` realized as a full collection scan
//! scored by dot product since the internal protocol has no native
//! vector index.

use std::sync::Arc;

use tokio::runtime::Runtime;

use crate::error::{fatal, CResult};
use crate::remote::batch::{vector_fields, RemoteBatch};
use crate::remote::client::DocumentClient;
use crate::remote::kv::{hex_decode, hex_encode, DEFAULT_PAGE_SIZE};
use crate::vdb::{dot, SearchResult, TopK, Vdb, VdbBatch, VectorItem, VectorIter};

fn vectors_collection(namespace: &str) -> String {
    format!("vectorDBs/{}/vectors", namespace)
}

pub struct RemoteVdb<C: DocumentClient + 'static> {
    client: Arc<C>,
    rt: Arc<Runtime>,
    collection: String,
}

impl<C: DocumentClient + 'static> RemoteVdb<C> {
    pub fn new(client: Arc<C>, rt: Arc<Runtime>, namespace: impl Into<String>) -> Self {
        Self { client, rt, collection: vectors_collection(&namespace.into()) }
    }

    async fn retry_query_page(
        &self,
        start: &str,
        restart_after: Option<&str>,
        end: &str,
    ) -> CResult<crate::remote::client::QueryPage> {
        match self.client.query_page(&self.collection, start, restart_after, end, DEFAULT_PAGE_SIZE).await {
            Ok(page) => Ok(page),
            Err(err) if crate::error::is_retryable(&err) => {
                log::warn!("vector query timed out, restarting after cursor {:?}: {}", restart_after, err);
                self.client.query_page(&self.collection, start, restart_after, end, DEFAULT_PAGE_SIZE).await
            }
            Err(err) => Err(err),
        }
    }
}

impl<C: DocumentClient + 'static> Vdb for RemoteVdb<C> {
    fn set(&self, id: &str, vector: Vec<f32>) -> CResult<()> {
        if id.is_empty() {
            fatal!("set on empty vector id");
        }
        let doc_id = hex_encode(id.as_bytes());
        self.rt.block_on(self.client.set(&self.collection, &doc_id, vector_fields(&vector)))
    }

    fn get(&self, id: &str) -> CResult<Option<Vec<f32>>> {
        let doc_id = hex_encode(id.as_bytes());
        let doc = self.rt.block_on(self.client.get(&self.collection, &doc_id))?;
        match doc {
            Some(doc) => Ok(Some(crate::vector::decode_vector(doc.field("Embedding")?.as_bytes()?)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, id: &str) -> CResult<()> {
        let doc_id = hex_encode(id.as_bytes());
        self.rt.block_on(self.client.delete(&self.collection, &doc_id))
    }

    fn all(&self) -> VectorIter<'_> {
        let mut buffer: std::collections::VecDeque<(String, Vec<f32>)> = std::collections::VecDeque::new();
        let mut restart_after: Option<String> = None;
        let mut exhausted = false;
        Box::new(std::iter::from_fn(move || loop {
            if let Some((id, vector)) = buffer.pop_front() {
                return Some(Ok(VectorItem::new(id, move || Ok(vector))));
            }
            if exhausted {
                return None;
            }
            let page = match self.rt.block_on(self.retry_query_page("", restart_after.as_deref(), "ff")) {
                Ok(p) => p,
                Err(e) => return Some(Err(e)),
            };
            if page.items.is_empty() {
                exhausted = true;
                continue;
            }
            restart_after = page.items.last().map(|(id, _)| id.clone());
            exhausted = page.done;
            for (doc_id, doc) in page.items {
                let id = match hex_decode(&doc_id).and_then(|bytes| {
                    String::from_utf8(bytes)
                        .map_err(|_| crate::error::Error::Corrupt("vector id not utf-8".into()))
                }) {
                    Ok(id) => id,
                    Err(e) => return Some(Err(e)),
                };
                let vector = match doc.field("Embedding").and_then(|f| f.as_bytes()).and_then(crate::vector::decode_vector) {
                    Ok(v) => v,
                    Err(e) => return Some(Err(e)),
                };
                buffer.push_back((id, vector));
            }
        }))
    }

    fn search(&self, target: &[f32], n: usize) -> CResult<Vec<SearchResult>> {
        // No native nearest-neighbor index in the internal protocol: fall
        // back to a full scan, scoring every candidate by dot product and
        // keeping the top `n` exactly as the in-memory backend would.
        let mut top = TopK::new(n);
        for item in self.all() {
            let item = item?;
            let id = item.id.clone();
            let vector = item.value()?;
            if vector.len() != target.len() {
                continue;
            }
            top.offer(id, dot(target, &vector));
        }
        Ok(top.into_vec())
    }

    fn batch(&self) -> Box<dyn VdbBatch + '_> {
        Box::new(RemoteVdbBatch { inner: RemoteBatch::new(&self.client, &self.rt, &self.collection, "Embedding") })
    }

    fn flush(&self) -> CResult<()> {
        Ok(())
    }

    fn close(&self) -> CResult<()> {
        if let Err(err) = self.rt.block_on(self.client.shutdown()) {
            fatal!("remote client reported a shutdown error: {}", err);
        }
        Ok(())
    }
}

/// Adapts the byte-oriented `RemoteBatch` to the vector batch interface by
/// encoding/decoding through the same little-endian layout the in-memory
/// VDB uses, so both backends share one wire representation.
struct RemoteVdbBatch<'a, C: DocumentClient + 'static> {
    inner: RemoteBatch<'a, C>,
}

impl<'a, C: DocumentClient + 'static> VdbBatch for RemoteVdbBatch<'a, C> {
    fn set(&mut self, id: &str, vector: Vec<f32>) {
        self.inner.set(id.as_bytes(), crate::vector::encode_vector(&vector));
    }

    fn delete(&mut self, id: &str) {
        self.inner.delete(id.as_bytes());
    }

    fn maybe_apply(&mut self) -> CResult<bool> {
        self.inner.maybe_apply()
    }

    fn apply(&mut self) -> CResult<()> {
        self.inner.apply()
    }
}
