//! The remote, document-store-backed backend (§4.4/§4.6/§4.8): a
//! `DocumentClient` transport (`client`, `stub`), the KVDB and VDB built
//! on top of it (`kv`, `vdb`), their shared transactional batch
//! (`batch`), and the distributed lock manager (`lockmgr`).

pub mod batch;
pub mod client;
pub mod kv;
pub mod lockmgr;
pub mod stub;
pub mod vdb;

pub use client::{DocumentClient, HttpDocumentClient};
pub use kv::RemoteKvdb;
pub use stub::StubDocumentClient;
pub use vdb::RemoteVdb;
