//! The in-process named advisory lock used by the in-memory, embedded, and
//! overlay backends (§4.2/§4.2a/§4.3). Cross-process coordination is only
//! provided by the remote backend's leased lock (§4.6); this table just
//! serializes access within one process.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::fatal;

type Slot = Arc<(Mutex<bool>, Condvar)>;

/// A lazily-initialized map from lock name to a binary semaphore, guarded
/// by an outer mutex ("lock table" in the spec). Each name gets its own
/// mutex/condvar pair so locking one name never blocks on another.
pub struct LockTable {
    slots: Mutex<HashMap<Vec<u8>, Slot>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    fn slot(&self, name: &[u8]) -> Slot {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(name.to_vec()).or_insert_with(|| Arc::new((Mutex::new(false), Condvar::new()))).clone()
    }

    /// Blocks the calling thread until `name` is free, then marks it held.
    pub fn lock(&self, name: &[u8]) {
        let slot = self.slot(name);
        let (held, cvar) = &*slot;
        let mut guard = held.lock().unwrap();
        while *guard {
            guard = cvar.wait(guard).unwrap();
        }
        *guard = true;
    }

    /// Releases `name`. Fatal if `name` has never been locked through this
    /// table, or is not currently held.
    pub fn unlock(&self, name: &[u8]) {
        let slot = {
            let slots = self.slots.lock().unwrap();
            match slots.get(name) {
                Some(slot) => slot.clone(),
                None => {
                    drop(slots);
                    fatal!("unlock of lock never acquired: {:?}", name);
                }
            }
        };
        let (held, cvar) = &*slot;
        let mut guard = held.lock().unwrap();
        if !*guard {
            fatal!("unlock of lock not currently held: {:?}", name);
        }
        *guard = false;
        cvar.notify_one();
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_unlock_roundtrip() {
        let table = LockTable::new();
        table.lock(b"a");
        table.unlock(b"a");
        table.lock(b"a");
        table.unlock(b"a");
    }

    #[test]
    #[should_panic(expected = "never acquired")]
    fn unlock_unknown_is_fatal() {
        let table = LockTable::new();
        table.unlock(b"missing");
    }

    #[test]
    #[should_panic(expected = "not currently held")]
    fn double_unlock_is_fatal() {
        let table = LockTable::new();
        table.lock(b"a");
        table.unlock(b"a");
        table.unlock(b"a");
    }

    #[test]
    fn concurrent_lock_serializes() {
        let table = StdArc::new(LockTable::new());
        let order = StdArc::new(Mutex::new(Vec::new()));

        table.lock(b"l");
        let t_table = table.clone();
        let t_order = order.clone();
        let handle = thread::spawn(move || {
            t_table.lock(b"l");
            t_order.lock().unwrap().push(2);
            t_table.unlock(b"l");
        });

        thread::sleep(Duration::from_millis(50));
        order.lock().unwrap().push(1);
        table.unlock(b"l");
        handle.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
