//! VDB backends (§4.7/§4.8): an in-memory cache over any `Kvdb` (`memory`),
//! plus the remote document-store VDB in `crate::remote`.

mod memory;

pub use memory::{decode_vector, encode_vector, CachedVdb};
