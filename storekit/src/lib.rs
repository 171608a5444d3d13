//! `storekit` is a storage abstraction layer for a content-indexing and
//! LLM-assistance platform: an ordered key-value store (`Kvdb`) and a
//! namespaced vector store (`Vdb`), each with three interchangeable
//! backends selected by a single spec string (`spec`):
//!
//! - `mem` — an in-memory store (`memory`), for tests and ephemeral work.
//! - `pebble:<dir>` — a local, single-process append-only log with an
//!   in-memory keydir (`embedded`), for durable single-host use.
//! - `firestore:<project>,<database>` — a remote document-store backend
//!   (`remote`), for multi-host deployments.
//!
//! A fourth, `overlay`, composes a writable layer over any read-only base
//! without mutating it, for copy-on-write scratch work over a shared
//! snapshot. `lock` provides the process-local mutual exclusion every
//! backend uses internally, and is also exposed directly for callers that
//! need named critical sections spanning more than one store operation.
//! `key` is the ordered tuple codec the on-disk and wire key formats are
//! built from.
//!
//! ## Getting started
//!
//! ```rust
//! use storekit::error::Error;
//! use storekit::kvdb::Kvdb;
//! use storekit::memory::MemoryKvdb;
//!
//! fn main() -> Result<(), Error> {
//!     let db = MemoryKvdb::new();
//!     db.set(b"b", vec![0x01])?;
//!     db.set(b"b", vec![0x02])?;
//!
//!     db.set(b"e", vec![0x05])?;
//!     db.delete(b"e")?;
//!
//!     db.set(b"a", vec![0x01])?;
//!
//!     assert_eq!(
//!         vec![
//!             (b"a".to_vec(), vec![0x01]),
//!             (b"b".to_vec(), vec![0x02]),
//!         ],
//!         db.scan(b"a", b"\xff").collect::<Result<Vec<_>, Error>>()?,
//!     );
//!
//!     db.flush()
//! }
//! ```

pub mod embedded;
pub mod error;
pub mod key;
pub mod kvdb;
pub mod lock;
pub mod memory;
pub mod overlay;
pub mod remote;
pub mod spec;
pub mod vdb;
pub mod vector;

pub use error::{CResult, Error};
pub use kvdb::Kvdb;
pub use spec::DbSpec;
pub use vdb::Vdb;
