//! The remote, document-store-backed KVDB (§4.4): the `values` collection
//! addressed by hex-encoded keys, with cursor-restarted scans and a
//! transactional batch (`batch.rs`).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Runtime;

use crate::error::{fatal, CResult, Error};
use crate::kvdb::{Batch, Kvdb, ScanItem};
use crate::remote::batch::RemoteBatch;
use crate::remote::client::{DocumentClient, FieldValue};
use crate::remote::lockmgr::LockManager;

pub const VALUES_COLLECTION: &str = "values";

/// The page size requested per `query_page` call. Chosen well under the
/// server's ~4 MiB transaction cap and small enough that a single page
/// rarely trips the 60-second query timeout on its own.
pub const DEFAULT_PAGE_SIZE: usize = 500;

pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

pub fn hex_decode(s: &str) -> CResult<Vec<u8>> {
    hex::decode(s).map_err(|e| Error::Corrupt(format!("invalid hex key {:?}: {}", s, e)))
}

pub struct RemoteKvdb<C: DocumentClient + 'static> {
    pub(crate) client: Arc<C>,
    pub(crate) rt: Arc<Runtime>,
    locks: LockManager<C>,
}

impl<C: DocumentClient + 'static> RemoteKvdb<C> {
    pub fn new(client: Arc<C>) -> CResult<Self> {
        let rt = Arc::new(
            Runtime::new().map_err(|e| Error::Transient(format!("starting async runtime: {}", e)))?,
        );
        let locks = LockManager::new(client.clone(), rt.clone());
        Ok(Self { client, rt, locks })
    }

    pub fn with_lock_durations(mut self, lock_timeout: std::time::Duration, lock_renew: std::time::Duration) -> Self {
        self.locks = self.locks.with_durations(lock_timeout, lock_renew);
        self
    }
}

impl<C: DocumentClient + 'static> Kvdb for RemoteKvdb<C> {
    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let id = hex_encode(key);
        let doc = self.rt.block_on(self.client.get(VALUES_COLLECTION, &id))?;
        match doc {
            Some(doc) => Ok(Some(doc.field("V")?.as_bytes()?.to_vec())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        if key.is_empty() {
            fatal!("set on empty key");
        }
        let id = hex_encode(key);
        let mut fields = HashMap::new();
        fields.insert("V".to_string(), FieldValue::Bytes(value));
        self.rt.block_on(self.client.set(VALUES_COLLECTION, &id, fields))
    }

    fn delete(&self, key: &[u8]) -> CResult<()> {
        let id = hex_encode(key);
        self.rt.block_on(self.client.delete(VALUES_COLLECTION, &id))
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> CResult<()> {
        let start = hex_encode(start);
        let end = hex_encode(end);
        self.rt.block_on(async {
            let mut restart_after: Option<String> = None;
            loop {
                let page =
                    self.retry_query_page(VALUES_COLLECTION, &start, restart_after.as_deref(), &end).await?;
                for (id, _) in &page.items {
                    self.client.delete(VALUES_COLLECTION, id).await?;
                }
                if page.done {
                    return Ok(());
                }
                restart_after = page.items.last().map(|(id, _)| id.clone());
            }
        })
    }

    fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> Box<dyn Iterator<Item = CResult<ScanItem>> + 'a> {
        let start = hex_encode(start);
        let end = hex_encode(end);
        let mut buffer: std::collections::VecDeque<(String, Vec<u8>)> = std::collections::VecDeque::new();
        let mut restart_after: Option<String> = None;
        let mut exhausted = false;
        Box::new(std::iter::from_fn(move || loop {
            if let Some((id, value)) = buffer.pop_front() {
                let key = match hex_decode(&id) {
                    Ok(k) => k,
                    Err(e) => return Some(Err(e)),
                };
                return Some(Ok(ScanItem::new(key, move || Ok(value))));
            }
            if exhausted {
                return None;
            }
            let page = match self.rt.block_on(self.retry_query_page(
                VALUES_COLLECTION,
                &start,
                restart_after.as_deref(),
                &end,
            )) {
                Ok(p) => p,
                Err(e) => return Some(Err(e)),
            };
            if page.items.is_empty() {
                exhausted = true;
                continue;
            }
            restart_after = page.items.last().map(|(id, _)| id.clone());
            exhausted = page.done;
            for (id, doc) in page.items {
                let value = match doc.field("V").and_then(|f| f.as_bytes()).map(|b| b.to_vec()) {
                    Ok(v) => v,
                    Err(e) => return Some(Err(e)),
                };
                buffer.push_back((id, value));
            }
        }))
    }

    fn batch(&self) -> Box<dyn Batch + '_> {
        Box::new(RemoteBatch::new(&self.client, &self.rt, VALUES_COLLECTION, "V"))
    }

    fn lock(&self, name: &[u8]) -> CResult<()> {
        self.locks.lock(name)
    }

    fn unlock(&self, name: &[u8]) -> CResult<()> {
        self.locks.unlock(name)
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

impl<C: DocumentClient + 'static> RemoteKvdb<C> {
    /// Runs `query_page`, retrying exactly once after a transient error
    /// (the simulated or real server query timeout), per the cursor-restart
    /// protocol (§4.4). A second consecutive failure propagates.
    async fn retry_query_page(
        &self,
        collection: &str,
        start: &str,
        restart_after: Option<&str>,
        end: &str,
    ) -> CResult<crate::remote::client::QueryPage> {
        match self.client.query_page(collection, start, restart_after, end, DEFAULT_PAGE_SIZE).await {
            Ok(page) => Ok(page),
            Err(err) if crate::error::is_retryable(&err) => {
                log::warn!("query timed out, restarting after cursor {:?}: {}", restart_after, err);
                self.client.query_page(collection, start, restart_after, end, DEFAULT_PAGE_SIZE).await
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::stub::StubDocumentClient;

    fn db() -> RemoteKvdb<StubDocumentClient> {
        RemoteKvdb::new(Arc::new(StubDocumentClient::new())).unwrap()
    }

    #[test]
    fn point_ops() {
        let db = db();
        assert_eq!(db.get(b"a").unwrap(), None);
        db.set(b"a", vec![1, 2]).unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(vec![1, 2]));
        db.delete(b"a").unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);
    }

    #[test]
    #[should_panic]
    fn set_empty_key_is_fatal() {
        db().set(b"", vec![1]).unwrap();
    }

    #[test]
    fn scan_is_hex_ordered() {
        let db = db();
        db.set(&[0x02], vec![2]).unwrap();
        db.set(&[0x01], vec![1]).unwrap();
        db.set(&[0x10], vec![0x10]).unwrap();
        let got: Vec<Vec<u8>> = db.scan(&[0x00], &[0xff]).map(|i| i.unwrap().key).collect();
        assert_eq!(got, vec![vec![0x01], vec![0x02], vec![0x10]]);
    }

    #[test]
    fn delete_range_is_inclusive() {
        let db = db();
        db.set(&[0x01], vec![1]).unwrap();
        db.set(&[0x02], vec![2]).unwrap();
        db.set(&[0x03], vec![3]).unwrap();
        db.delete_range(&[0x01], &[0x02]).unwrap();
        let got: Vec<Vec<u8>> = db.scan(&[0x00], &[0xff]).map(|i| i.unwrap().key).collect();
        assert_eq!(got, vec![vec![0x03]]);
    }

    #[test]
    #[should_panic]
    fn close_is_fatal_on_shutdown_error() {
        let client = Arc::new(StubDocumentClient::new().with_simulated_shutdown_failure());
        let db = RemoteKvdb::new(client).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn scan_survives_a_simulated_timeout() {
        let client = Arc::new(StubDocumentClient::new().with_simulated_query_timeout(0));
        let db = RemoteKvdb::new(client).unwrap();
        db.set(&[0x01], vec![1]).unwrap();
        db.set(&[0x02], vec![2]).unwrap();
        let got: Vec<Vec<u8>> = db.scan(&[0x00], &[0xff]).map(|i| i.unwrap().key).collect();
        assert_eq!(got, vec![vec![0x01], vec![0x02]]);
    }
}
