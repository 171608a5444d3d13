//! The embedded, single-process LSM-style backend (§4.2a), used by the
//! `pebble` spec kind: an append-only log (`log`) plus the keydir-backed
//! `Kvdb` implementation that wraps it (`engine`).

mod log;
mod engine;

pub use engine::{canonicalize_dir, path_from_spec, EmbeddedKvdb, Status};
