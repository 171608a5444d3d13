//! The remote backend's distributed lock (§4.6): each named lock is a
//! document in `locks`, leased rather than held, with a background
//! renewer keeping the lease alive until `Unlock`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use crate::error::{fatal, CResult, Error};
use crate::lock::LockTable;
use crate::remote::client::{now_millis, DocumentClient, FieldValue};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_LOCK_RENEW: Duration = Duration::from_secs(60);

const LOCKS_COLLECTION: &str = "locks";

struct ActiveLock {
    unlock_tx: oneshot::Sender<()>,
    unlocked_rx: oneshot::Receiver<()>,
}

pub struct LockManager<C: DocumentClient + 'static> {
    client: Arc<C>,
    rt: Arc<Runtime>,
    uid: i64,
    lock_timeout: Duration,
    lock_renew: Duration,
    /// Gates re-acquisition attempts by the same process so two local
    /// threads contending for `name` serialize here rather than both
    /// racing the remote transaction.
    local_gate: LockTable,
    active: Mutex<HashMap<Vec<u8>, ActiveLock>>,
}

impl<C: DocumentClient + 'static> LockManager<C> {
    pub fn new(client: Arc<C>, rt: Arc<Runtime>) -> Self {
        let uid = (rand::random::<u64>() >> 1) as i64;
        Self {
            client,
            rt,
            uid,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_renew: DEFAULT_LOCK_RENEW,
            local_gate: LockTable::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_durations(mut self, lock_timeout: Duration, lock_renew: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self.lock_renew = lock_renew;
        self
    }

    pub fn lock(&self, name: &[u8]) -> CResult<()> {
        // Blocks until no other local holder, mirroring the in-process
        // lock table used by the other backends; only then does this
        // process contend with remote owners.
        self.local_gate.lock(name);

        let id = crate::remote::kv::hex_encode(name);
        let (unlock_tx, unlock_rx) = oneshot::channel();
        let (unlocked_tx, unlocked_rx) = oneshot::channel();

        let client = self.client.clone();
        let uid = self.uid;
        let lock_timeout = self.lock_timeout;
        let lock_renew = self.lock_renew;

        let acquire_result: CResult<()> = self.rt.block_on(acquire(&client, &id, uid, lock_timeout));
        if let Err(err) = acquire_result {
            self.local_gate.unlock(name);
            return Err(err);
        }

        self.rt.spawn(renew_loop(client, id, uid, lock_renew, lock_timeout, unlock_rx, unlocked_tx));
        self.active.lock().unwrap().insert(name.to_vec(), ActiveLock { unlock_tx, unlocked_rx });
        Ok(())
    }

    pub fn unlock(&self, name: &[u8]) -> CResult<()> {
        let active = match self.active.lock().unwrap().remove(name) {
            Some(a) => a,
            None => fatal!("unlock of remote lock never acquired: {:?}", name),
        };
        if active.unlock_tx.send(()).is_ok() {
            let _ = self.rt.block_on(active.unlocked_rx);
        }
        self.local_gate.unlock(name);
        Ok(())
    }
}

/// Polls the lock document at a bounded interval and re-attempts a
/// transactional acquisition on every poll, standing in for the
/// server-side change stream the spec describes (§4.6 expansion): a poll
/// that sees the document change, or simply elapses, both re-deliver a
/// "change event" here. Retries indefinitely; each `lock_timeout` window
/// also gets one extra attempt at the deadline to catch an orphaned owner
/// whose document hasn't moved.
async fn acquire<C: DocumentClient>(client: &C, id: &str, uid: i64, lock_timeout: Duration) -> CResult<()> {
    let timeout_millis = lock_timeout.as_millis() as i64;
    let poll_interval = Duration::from_millis((lock_timeout.as_millis() as u64 / 8).max(250));

    loop {
        let deadline = tokio::time::Instant::now() + lock_timeout;
        loop {
            if acquire_once(client, id, uid, timeout_millis).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }
        if acquire_once(client, id, uid, timeout_millis).await? {
            return Ok(());
        }
    }
}

async fn acquire_once<C: DocumentClient>(client: &C, id: &str, uid: i64, lock_timeout_millis: i64) -> CResult<bool> {
    let txn = client.begin_transaction().await?;
    let doc = client.txn_get(txn, LOCKS_COLLECTION, id).await?;
    let now = now_millis();
    let can_take = match &doc {
        None => true,
        Some(doc) => now - doc.update_time_millis > lock_timeout_millis,
    };
    if !can_take {
        client.rollback(txn).await?;
        return Ok(false);
    }
    let mut fields = HashMap::new();
    fields.insert("UID".to_string(), FieldValue::Int(uid));
    fields.insert("Nonce".to_string(), FieldValue::Int(now));
    client.txn_set(txn, LOCKS_COLLECTION, id, fields).await?;
    client.commit(txn).await?;
    Ok(true)
}

async fn renew_loop<C: DocumentClient>(
    client: Arc<C>,
    id: String,
    uid: i64,
    lock_renew: Duration,
    lock_timeout: Duration,
    mut unlock_rx: oneshot::Receiver<()>,
    unlocked_tx: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(lock_renew) => {
                if let Err(err) = renew_once(&*client, &id, uid, lock_timeout.as_millis() as i64).await {
                    fatal!("failed to renew remote lock {:?}: {}", id, err);
                }
            }
            _ = &mut unlock_rx => {
                if let Err(err) = release_once(&*client, &id, uid).await {
                    fatal!("failed to release remote lock {:?}: {}", id, err);
                }
                let _ = unlocked_tx.send(());
                return;
            }
        }
    }
}

async fn renew_once<C: DocumentClient>(client: &C, id: &str, uid: i64, lock_timeout_millis: i64) -> CResult<()> {
    let txn = client.begin_transaction().await?;
    let doc = client.txn_get(txn, LOCKS_COLLECTION, id).await?;
    let now = now_millis();
    match &doc {
        Some(doc) if doc.field("UID").and_then(|f| f.as_int())? == uid => {
            if now - doc.update_time_millis > lock_timeout_millis {
                client.rollback(txn).await?;
                return Err(Error::Fatal(format!("lock {:?} expired before renewal", id)));
            }
        }
        Some(_) => {
            client.rollback(txn).await?;
            return Err(Error::Fatal(format!("lock {:?} owned by another process", id)));
        }
        None => {
            client.rollback(txn).await?;
            return Err(Error::Fatal(format!("lock {:?} document missing at renewal", id)));
        }
    }
    let mut fields = HashMap::new();
    fields.insert("UID".to_string(), FieldValue::Int(uid));
    fields.insert("Nonce".to_string(), FieldValue::Int(now));
    client.txn_set(txn, LOCKS_COLLECTION, id, fields).await?;
    client.commit(txn).await
}

async fn release_once<C: DocumentClient>(client: &C, id: &str, uid: i64) -> CResult<()> {
    let txn = client.begin_transaction().await?;
    let doc = client.txn_get(txn, LOCKS_COLLECTION, id).await?;
    match doc {
        Some(doc) if doc.field("UID").and_then(|f| f.as_int())? == uid => {
            client.txn_delete(txn, LOCKS_COLLECTION, id).await?;
            client.commit(txn).await
        }
        Some(_) => {
            client.rollback(txn).await?;
            Err(Error::Fatal(format!("unlock of lock {:?} owned by another process", id)))
        }
        None => {
            client.rollback(txn).await?;
            Err(Error::Fatal(format!("unlock of absent lock {:?}", id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::stub::StubDocumentClient;

    fn manager() -> LockManager<StubDocumentClient> {
        let rt = Arc::new(Runtime::new().unwrap());
        LockManager::new(Arc::new(StubDocumentClient::new()), rt)
            .with_durations(Duration::from_millis(400), Duration::from_millis(150))
    }

    #[test]
    fn lock_then_unlock_roundtrips() {
        let mgr = manager();
        mgr.lock(b"a").unwrap();
        mgr.unlock(b"a").unwrap();
        mgr.lock(b"a").unwrap();
        mgr.unlock(b"a").unwrap();
    }

    #[test]
    #[should_panic(expected = "never acquired")]
    fn unlock_unknown_is_fatal() {
        let mgr = manager();
        mgr.unlock(b"missing").unwrap();
    }

    #[test]
    fn reacquire_after_orphaned_owner_expires() {
        let client = Arc::new(StubDocumentClient::new());
        let lock_timeout = Duration::from_millis(80);
        let lock_renew = Duration::from_millis(30);

        {
            let rt = Arc::new(Runtime::new().unwrap());
            let mgr = LockManager::new(client.clone(), rt).with_durations(lock_timeout, lock_renew);
            mgr.lock(b"a").unwrap();
            // mgr (and its runtime) is dropped here without calling
            // unlock, abandoning the lease: its renewer task dies with
            // the runtime instead of deleting the document.
        }

        std::thread::sleep(lock_timeout * 2);

        let rt2 = Arc::new(Runtime::new().unwrap());
        let mgr2 = LockManager::new(client, rt2).with_durations(lock_timeout, lock_renew);
        mgr2.lock(b"a").unwrap();
        mgr2.unlock(b"a").unwrap();
    }
}
