//! The wire protocol spoken to the remote document store (§4.4 "Transport"
//! expansion): one project, one database, collections of `{id, fields}`
//! documents, a query cursor, and a begin/commit/rollback transaction
//! handle. `DocumentClient` isolates this protocol from the KVDB/VDB/lock
//! logic in this module so they can be exercised against the in-memory
//! `stub::StubDocumentClient` instead of a live server.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{CResult, Error};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

/// One field value as stored on a document. A vector document's
/// `Embedding` field is carried as the same little-endian byte encoding
/// the KVDB-backed VDB uses (§6.3) rather than a native array type, so
/// every collection in this codebase shares one field representation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Int(i64),
}

impl FieldValue {
    pub fn as_bytes(&self) -> CResult<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Ok(b),
            _ => Err(Error::Corrupt("expected a bytes field".into())),
        }
    }

    pub fn as_int(&self) -> CResult<i64> {
        match self {
            FieldValue::Int(i) => Ok(*i),
            _ => Err(Error::Corrupt("expected an int field".into())),
        }
    }
}

/// A document as the server hands it back: its fields plus the server's
/// own create/update timestamps, which the lock protocol treats as its
/// lease clock (§4.6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
    pub fields: HashMap<String, FieldValue>,
    pub create_time_millis: i64,
    pub update_time_millis: i64,
}

impl Document {
    pub fn field(&self, name: &str) -> CResult<&FieldValue> {
        self.fields.get(name).ok_or_else(|| Error::Corrupt(format!("document missing field {:?}", name)))
    }
}

/// A page of query results plus whether the cursor is exhausted. An `Err`
/// returned from `query_page` itself signals a transient server timeout
/// per the cursor-restart protocol (§4.4); `done` signals ordinary
/// end-of-range.
pub struct QueryPage {
    pub items: Vec<(String, Document)>,
    pub done: bool,
}

/// An opaque handle to a server-side transaction. Reads issued against a
/// handle must all precede writes issued against the same handle; callers
/// in this crate (the remote batch, the lock manager) are responsible for
/// honoring that ordering themselves (§4.4/§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxnHandle(pub u64);

/// The document-store protocol this crate's remote backend speaks.
/// Implemented by `HttpDocumentClient` against a live server and by
/// `stub::StubDocumentClient` for tests.
pub trait DocumentClient: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> BoxFuture<'_, CResult<Option<Document>>>;

    fn set(&self, collection: &str, id: &str, fields: HashMap<String, FieldValue>) -> BoxFuture<'_, CResult<()>>;

    fn delete(&self, collection: &str, id: &str) -> BoxFuture<'_, CResult<()>>;

    /// Queries `collection` for documents with id in `[start, end]`,
    /// ordered by id ascending. `restart_after`, when given, overrides
    /// `start` as an exclusive lower bound — the cursor-restart
    /// continuation point after a prior page's last id (§4.4). Returns at
    /// most `page_size` documents per call.
    fn query_page<'a>(
        &'a self,
        collection: &'a str,
        start: &'a str,
        restart_after: Option<&'a str>,
        end: &'a str,
        page_size: usize,
    ) -> BoxFuture<'a, CResult<QueryPage>>;

    fn begin_transaction(&self) -> BoxFuture<'_, CResult<TxnHandle>>;

    fn txn_get<'a>(
        &'a self,
        txn: TxnHandle,
        collection: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, CResult<Option<Document>>>;

    fn txn_set<'a>(
        &'a self,
        txn: TxnHandle,
        collection: &'a str,
        id: &'a str,
        fields: HashMap<String, FieldValue>,
    ) -> BoxFuture<'a, CResult<()>>;

    fn txn_delete<'a>(&'a self, txn: TxnHandle, collection: &'a str, id: &'a str) -> BoxFuture<'a, CResult<()>>;

    /// Resolves every id in `[start, end]` within the transaction's read
    /// phase, so a subsequent `txn_delete` per id satisfies the
    /// reads-before-writes rule (§4.4). Unlike `query_page`, this is not
    /// subject to cursor restart: transactions are short-lived and the
    /// server is expected to answer a bounded range read in one shot.
    fn txn_query_range<'a>(
        &'a self,
        txn: TxnHandle,
        collection: &'a str,
        start: &'a str,
        end: &'a str,
    ) -> BoxFuture<'a, CResult<Vec<String>>>;

    fn commit(&self, txn: TxnHandle) -> BoxFuture<'_, CResult<()>>;

    fn rollback(&self, txn: TxnHandle) -> BoxFuture<'_, CResult<()>>;

    /// Releases this client's connection to the document store. Called once
    /// per `RemoteKvdb`/`RemoteVdb` on `close` (§4's lifecycle).
    fn shutdown(&self) -> BoxFuture<'_, CResult<()>>;
}

/// Speaks the protocol above over HTTP, encoding documents as JSON. One
/// instance addresses one `(project, database)` pair, matching the spec
/// string's `firestore:project,database` location (§4.9).
pub struct HttpDocumentClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDocumentClient {
    pub fn new(base_url: impl Into<String>, project: &str, database: &str) -> CResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Transient(format!("building http client: {}", e)))?;
        Ok(Self { http, base_url: format!("{}/projects/{}/databases/{}", base_url.into(), project, database) })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn doc_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, id)
    }

    fn map_transport_err(err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Transient(format!("query timed out: {}", err))
        } else {
            Error::Transient(format!("transport error: {}", err))
        }
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    start: &'a str,
    restart_after: Option<&'a str>,
    end: &'a str,
    page_size: usize,
}

#[derive(Deserialize)]
struct QueryResponse {
    items: Vec<(String, Document)>,
    done: bool,
}

#[derive(Serialize)]
struct TxnOp<'a> {
    kind: &'static str,
    collection: &'a str,
    id: &'a str,
    fields: Option<HashMap<String, FieldValue>>,
}

impl DocumentClient for HttpDocumentClient {
    fn get(&self, collection: &str, id: &str) -> BoxFuture<'_, CResult<Option<Document>>> {
        let url = self.doc_url(collection, id);
        Box::pin(async move {
            let resp = self.http.get(&url).send().await.map_err(Self::map_transport_err)?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let doc = resp.json::<Document>().await.map_err(Self::map_transport_err)?;
            Ok(Some(doc))
        })
    }

    fn set(&self, collection: &str, id: &str, fields: HashMap<String, FieldValue>) -> BoxFuture<'_, CResult<()>> {
        let url = self.doc_url(collection, id);
        Box::pin(async move {
            self.http.put(&url).json(&fields).send().await.map_err(Self::map_transport_err)?;
            Ok(())
        })
    }

    fn delete(&self, collection: &str, id: &str) -> BoxFuture<'_, CResult<()>> {
        let url = self.doc_url(collection, id);
        Box::pin(async move {
            self.http.delete(&url).send().await.map_err(Self::map_transport_err)?;
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
        let url = format!("{}/query", self.collection_url(collection));
        Box::pin(async move {
            let req = QueryRequest { start, restart_after, end, page_size };
            let resp = self.http.post(&url).json(&req).send().await.map_err(Self::map_transport_err)?;
            let body = resp.json::<QueryResponse>().await.map_err(Self::map_transport_err)?;
            Ok(QueryPage { items: body.items, done: body.done })
        })
    }

    fn begin_transaction(&self) -> BoxFuture<'_, CResult<TxnHandle>> {
        let url = format!("{}/transactions", self.base_url);
        Box::pin(async move {
            let resp = self.http.post(&url).send().await.map_err(Self::map_transport_err)?;
            let id: u64 = resp.json().await.map_err(Self::map_transport_err)?;
            Ok(TxnHandle(id))
        })
    }

    fn txn_get<'a>(
        &'a self,
        txn: TxnHandle,
        collection: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, CResult<Option<Document>>> {
        let url = format!("{}/transactions/{}/get", self.base_url, txn.0);
        let op = TxnOp { kind: "get", collection, id, fields: None };
        Box::pin(async move {
            let resp = self.http.post(&url).json(&op).send().await.map_err(Self::map_transport_err)?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            Ok(Some(resp.json::<Document>().await.map_err(Self::map_transport_err)?))
        })
    }

    fn txn_set<'a>(
        &'a self,
        txn: TxnHandle,
        collection: &'a str,
        id: &'a str,
        fields: HashMap<String, FieldValue>,
    ) -> BoxFuture<'a, CResult<()>> {
        let url = format!("{}/transactions/{}/write", self.base_url, txn.0);
        let op = TxnOp { kind: "set", collection, id, fields: Some(fields) };
        Box::pin(async move {
            self.http.post(&url).json(&op).send().await.map_err(Self::map_transport_err)?;
            Ok(())
        })
    }

    fn txn_delete<'a>(&'a self, txn: TxnHandle, collection: &'a str, id: &'a str) -> BoxFuture<'a, CResult<()>> {
        let url = format!("{}/transactions/{}/write", self.base_url, txn.0);
        let op = TxnOp { kind: "delete", collection, id, fields: None };
        Box::pin(async move {
            self.http.post(&url).json(&op).send().await.map_err(Self::map_transport_err)?;
            Ok(())
        })
    }

    fn txn_query_range<'a>(
        &'a self,
        txn: TxnHandle,
        collection: &'a str,
        start: &'a str,
        end: &'a str,
    ) -> BoxFuture<'a, CResult<Vec<String>>> {
        let url = format!("{}/transactions/{}/query_range", self.base_url, txn.0);
        #[derive(Serialize)]
        struct Req<'a> {
            collection: &'a str,
            start: &'a str,
            end: &'a str,
        }
        Box::pin(async move {
            let resp = self
                .http
                .post(&url)
                .json(&Req { collection, start, end })
                .send()
                .await
                .map_err(Self::map_transport_err)?;
            resp.json::<Vec<String>>().await.map_err(Self::map_transport_err)
        })
    }

    fn commit(&self, txn: TxnHandle) -> BoxFuture<'_, CResult<()>> {
        let url = format!("{}/transactions/{}/commit", self.base_url, txn.0);
        Box::pin(async move {
            self.http.post(&url).send().await.map_err(Self::map_transport_err)?;
            Ok(())
        })
    }

    fn rollback(&self, txn: TxnHandle) -> BoxFuture<'_, CResult<()>> {
        let url = format!("{}/transactions/{}/rollback", self.base_url, txn.0);
        Box::pin(async move {
            self.http.post(&url).send().await.map_err(Self::map_transport_err)?;
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, CResult<()>> {
        let url = format!("{}/shutdown", self.base_url);
        Box::pin(async move {
            self.http.post(&url).send().await.map_err(Self::map_transport_err)?;
            Ok(())
        })
    }
}
