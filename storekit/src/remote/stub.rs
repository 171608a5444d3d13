//! An in-memory `DocumentClient`, standing in for a live server in tests.
//! Supports injecting a simulated query timeout after a configured number
//! of items, so the cursor-restart paths (§4.4) are exercisable without a
//! real 60-second wait.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{CResult, Error};
use crate::remote::client::{now_millis, BoxFuture, Document, DocumentClient, FieldValue, QueryPage, TxnHandle};

struct Transaction {
    writes: Vec<(String, String, Option<HashMap<String, FieldValue>>)>,
}

pub struct StubDocumentClient {
    docs: Mutex<HashMap<String, BTreeMap<String, Document>>>,
    txns: Mutex<HashMap<u64, Transaction>>,
    next_txn: AtomicU64,
    /// If set, `query_page` returns one `Transient` error the first time a
    /// query observes at least this many cumulative items, simulating the
    /// server's query timeout. Fires at most once for the lifetime of the
    /// client, like a real transient timeout: an immediate retry with the
    /// same cursor succeeds.
    fail_query_after_items: Option<usize>,
    query_items_seen: AtomicUsize,
    query_timeout_fired: AtomicBool,
    /// If true, `shutdown` reports a transient error, exercising `close`'s
    /// fatal-abort path.
    fail_shutdown: bool,
}

impl StubDocumentClient {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            txns: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            fail_query_after_items: None,
            query_items_seen: AtomicUsize::new(0),
            query_timeout_fired: AtomicBool::new(false),
            fail_shutdown: false,
        }
    }

    pub fn with_simulated_query_timeout(mut self, after_items: usize) -> Self {
        self.fail_query_after_items = Some(after_items);
        self
    }

    pub fn with_simulated_shutdown_failure(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    fn collection<'a>(
        docs: &'a mut HashMap<String, BTreeMap<String, Document>>,
        name: &str,
    ) -> &'a mut BTreeMap<String, Document> {
        docs.entry(name.to_string()).or_default()
    }
}

impl Default for StubDocumentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentClient for StubDocumentClient {
    fn get(&self, collection: &str, id: &str) -> BoxFuture<'_, CResult<Option<Document>>> {
        let collection = collection.to_string();
        let id = id.to_string();
        Box::pin(async move { Ok(self.docs.lock().unwrap().get(&collection).and_then(|c| c.get(&id)).cloned()) })
    }

    fn set(&self, collection: &str, id: &str, fields: HashMap<String, FieldValue>) -> BoxFuture<'_, CResult<()>> {
        let collection = collection.to_string();
        let id = id.to_string();
        Box::pin(async move {
            let mut docs = self.docs.lock().unwrap();
            let now = now_millis();
            let c = Self::collection(&mut docs, &collection);
            let create_time_millis = c.get(&id).map(|d| d.create_time_millis).unwrap_or(now);
            c.insert(id, Document { fields, create_time_millis, update_time_millis: now });
            Ok(())
        })
    }

    fn delete(&self, collection: &str, id: &str) -> BoxFuture<'_, CResult<()>> {
        let collection = collection.to_string();
        let id = id.to_string();
        Box::pin(async move {
            if let Some(c) = self.docs.lock().unwrap().get_mut(&collection) {
                c.remove(&id);
            }
            Ok(())
        })
    }

    fn query_page<'a>(
        &'a self,
        collection: &'a str,
        start: &'a str,
        restart_after: Option<&'a str>,
        end: &'a str,
        page_size: usize,
    ) -> BoxFuture<'a, CResult<QueryPage>> {
        Box::pin(async move {
            let docs = self.docs.lock().unwrap();
            let empty = BTreeMap::new();
            let c = docs.get(collection).unwrap_or(&empty);
            let lower = match restart_after {
                None => std::ops::Bound::Included(start.to_string()),
                Some(k) => std::ops::Bound::Excluded(k.to_string()),
            };
            let mut items = Vec::new();
            let mut done = true;
            for (id, doc) in c.range((lower, std::ops::Bound::Included(end.to_string()))) {
                if items.len() == page_size {
                    done = false;
                    break;
                }
                items.push((id.clone(), doc.clone()));
            }
            drop(docs);

            if let Some(threshold) = self.fail_query_after_items {
                if !self.query_timeout_fired.load(Ordering::SeqCst) {
                    let seen_before = self.query_items_seen.load(Ordering::SeqCst);
                    if seen_before + items.len() >= threshold {
                        self.query_timeout_fired.store(true, Ordering::SeqCst);
                        return Err(Error::Transient("simulated query timeout".into()));
                    }
                }
            }
            self.query_items_seen.fetch_add(items.len(), Ordering::SeqCst);
            Ok(QueryPage { items, done })
        })
    }

    fn begin_transaction(&self) -> BoxFuture<'_, CResult<TxnHandle>> {
        Box::pin(async move {
            let id = self.next_txn.fetch_add(1, Ordering::SeqCst);
            self.txns.lock().unwrap().insert(id, Transaction { writes: Vec::new() });
            Ok(TxnHandle(id))
        })
    }

    fn txn_get<'a>(
        &'a self,
        _txn: TxnHandle,
        collection: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, CResult<Option<Document>>> {
        self.get(collection, id)
    }

    fn txn_set<'a>(
        &'a self,
        txn: TxnHandle,
        collection: &'a str,
        id: &'a str,
        fields: HashMap<String, FieldValue>,
    ) -> BoxFuture<'a, CResult<()>> {
        let collection = collection.to_string();
        let id = id.to_string();
        Box::pin(async move {
            let mut txns = self.txns.lock().unwrap();
            let t = txns.get_mut(&txn.0).ok_or_else(|| Error::Corrupt("unknown transaction".into()))?;
            t.writes.push((collection, id, Some(fields)));
            Ok(())
        })
    }

    fn txn_delete<'a>(&'a self, txn: TxnHandle, collection: &'a str, id: &'a str) -> BoxFuture<'a, CResult<()>> {
        let collection = collection.to_string();
        let id = id.to_string();
        Box::pin(async move {
            let mut txns = self.txns.lock().unwrap();
            let t = txns.get_mut(&txn.0).ok_or_else(|| Error::Corrupt("unknown transaction".into()))?;
            t.writes.push((collection, id, None));
            Ok(())
        })
    }

    fn txn_query_range<'a>(
        &'a self,
        _txn: TxnHandle,
        collection: &'a str,
        start: &'a str,
        end: &'a str,
    ) -> BoxFuture<'a, CResult<Vec<String>>> {
        Box::pin(async move {
            let docs = self.docs.lock().unwrap();
            let empty = BTreeMap::new();
            let c = docs.get(collection).unwrap_or(&empty);
            Ok(c.range(start.to_string()..=end.to_string()).map(|(id, _)| id.clone()).collect())
        })
    }

    fn commit(&self, txn: TxnHandle) -> BoxFuture<'_, CResult<()>> {
        Box::pin(async move {
            let t = self
                .txns
                .lock()
                .unwrap()
                .remove(&txn.0)
                .ok_or_else(|| Error::Corrupt("unknown transaction".into()))?;
            let mut docs = self.docs.lock().unwrap();
            let now = now_millis();
            for (collection, id, fields) in t.writes {
                let c = Self::collection(&mut docs, &collection);
                match fields {
                    Some(fields) => {
                        let create_time_millis = c.get(&id).map(|d| d.create_time_millis).unwrap_or(now);
                        c.insert(id, Document { fields, create_time_millis, update_time_millis: now });
                    }
                    None => {
                        c.remove(&id);
                    }
                }
            }
            Ok(())
        })
    }

    fn rollback(&self, txn: TxnHandle) -> BoxFuture<'_, CResult<()>> {
        Box::pin(async move {
            self.txns.lock().unwrap().remove(&txn.0);
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, CResult<()>> {
        Box::pin(async move {
            if self.fail_shutdown {
                return Err(Error::Transient("simulated shutdown failure".into()));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn block<T>(f: BoxFuture<'_, T>) -> T {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
    }

    #[test]
    fn set_then_get_roundtrips() {
        let client = StubDocumentClient::new();
        let mut fields = Map::new();
        fields.insert("V".to_string(), FieldValue::Bytes(vec![1, 2, 3]));
        block(client.set("values", "a", fields.clone())).unwrap();
        let got = block(client.get("values", "a")).unwrap().unwrap();
        assert_eq!(got.fields, fields);
    }

    #[test]
    fn transaction_writes_are_invisible_until_commit() {
        let client = StubDocumentClient::new();
        let txn = block(client.begin_transaction()).unwrap();
        let mut fields = Map::new();
        fields.insert("V".to_string(), FieldValue::Bytes(vec![9]));
        block(client.txn_set(txn, "values", "a", fields)).unwrap();
        assert!(block(client.get("values", "a")).unwrap().is_none());
        block(client.commit(txn)).unwrap();
        assert!(block(client.get("values", "a")).unwrap().is_some());
    }

    #[test]
    fn rollback_discards_writes() {
        let client = StubDocumentClient::new();
        let txn = block(client.begin_transaction()).unwrap();
        let mut fields = Map::new();
        fields.insert("V".to_string(), FieldValue::Bytes(vec![9]));
        block(client.txn_set(txn, "values", "a", fields)).unwrap();
        block(client.rollback(txn)).unwrap();
        assert!(block(client.commit(txn)).is_err());
    }

    #[test]
    fn query_page_restarts_after_simulated_timeout() {
        let client = StubDocumentClient::new().with_simulated_query_timeout(0);
        for i in 0..3 {
            let mut fields = Map::new();
            fields.insert("V".to_string(), FieldValue::Bytes(vec![i]));
            block(client.set("values", &format!("{:02}", i), fields)).unwrap();
        }
        assert!(block(client.query_page("values", "00", None, "ff", 10)).is_err());
        let page = block(client.query_page("values", "00", Some("00"), "ff", 10)).unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.done);
    }
}
