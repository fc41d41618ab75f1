//! Correlation of pings, transactions and rooms with the bridge that owns them.
//!
//! The router sits on a pluggable [`CorrelationStore`]. Every record carries
//! an expiry; expired records are invisible to reads and are purged by a
//! background sweeper.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::model::TransactionTarget;

/// Key of a correlation record. Each kind has its own key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// `transaction_id` of a bridge-initiated ping.
    Ping(String),
    /// Homeserver transaction id (`/_matrix/app/v1/transactions/{txnId}`).
    Transaction(String),
    /// Room id seen on bridge traffic.
    Room(String),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping(id) => write!(f, "ping:{id}"),
            Self::Transaction(id) => write!(f, "txn:{id}"),
            Self::Room(id) => write!(f, "room:{id}"),
        }
    }
}

/// Keyed store of correlation records with per-record expiry.
#[async_trait]
pub trait CorrelationStore: Send + Sync + fmt::Debug {
    /// Store `target` under `key` unless a live record exists.
    ///
    /// Returns the live record that blocked the write, if any.
    async fn insert_if_absent(
        &self,
        key: CorrelationKey,
        target: TransactionTarget,
        ttl: Duration,
    ) -> ProxyResult<Option<TransactionTarget>>;

    /// Store `target` under `key`, replacing any previous record.
    async fn insert(
        &self,
        key: CorrelationKey,
        target: TransactionTarget,
        ttl: Duration,
    ) -> ProxyResult<()>;

    /// Read a live record.
    async fn get(&self, key: &CorrelationKey) -> ProxyResult<Option<TransactionTarget>>;

    /// Read and evict a live record.
    async fn take(&self, key: &CorrelationKey) -> ProxyResult<Option<TransactionTarget>>;

    /// Drop expired records, returning how many were removed.
    async fn purge_expired(&self) -> ProxyResult<usize>;

    /// Number of stored records, expired ones included until purged.
    async fn len(&self) -> ProxyResult<usize>;
}

#[derive(Debug, Clone)]
struct Entry {
    target: TransactionTarget,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Single-process store: one map behind one lock.
#[derive(Debug, Default)]
pub struct MemoryCorrelationStore {
    entries: Mutex<HashMap<CorrelationKey, Entry>>,
}

impl MemoryCorrelationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CorrelationStore for MemoryCorrelationStore {
    async fn insert_if_absent(
        &self,
        key: CorrelationKey,
        target: TransactionTarget,
        ttl: Duration,
    ) -> ProxyResult<Option<TransactionTarget>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key).filter(|e| e.live(now)) {
            return Ok(Some(existing.target.clone()));
        }
        entries.insert(
            key,
            Entry {
                target,
                expires_at: now + ttl,
            },
        );
        Ok(None)
    }

    async fn insert(
        &self,
        key: CorrelationKey,
        target: TransactionTarget,
        ttl: Duration,
    ) -> ProxyResult<()> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .insert(key, Entry { target, expires_at });
        Ok(())
    }

    async fn get(&self, key: &CorrelationKey) -> ProxyResult<Option<TransactionTarget>> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.target.clone()))
    }

    async fn take(&self, key: &CorrelationKey) -> ProxyResult<Option<TransactionTarget>> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .filter(|e| e.live(now))
            .map(|e| e.target))
    }

    async fn purge_expired(&self) -> ProxyResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.live(now));
        Ok(before - entries.len())
    }

    async fn len(&self) -> ProxyResult<usize> {
        Ok(self.entries.lock().len())
    }
}

/// Routes acknowledging legs back to the bridge that started them.
#[derive(Debug, Clone)]
pub struct TransactionRouter {
    store: Arc<dyn CorrelationStore>,
    ttl: Duration,
}

impl TransactionRouter {
    /// Create a router over `store` whose records live for `ttl`.
    pub fn new(store: Arc<dyn CorrelationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Router over a fresh in-memory store.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryCorrelationStore::new()), ttl)
    }

    /// Remember that `bridge_id` sent a ping with `transaction_id`.
    ///
    /// The first sighting wins: a live record for the same id is never
    /// reassigned to another bridge.
    pub async fn record_ping(&self, transaction_id: &str, bridge_id: &str) -> ProxyResult<()> {
        let key = CorrelationKey::Ping(transaction_id.to_string());
        let target = TransactionTarget::Bridge(bridge_id.to_string());
        if let Some(existing) = self.store.insert_if_absent(key, target, self.ttl).await? {
            if existing.bridge_id() != bridge_id {
                warn!(
                    transaction_id,
                    bridge_id,
                    owner = ?existing,
                    "ping transaction id already claimed by another bridge"
                );
            }
        }
        Ok(())
    }

    /// Resolve and consume the ping record for `transaction_id`.
    pub async fn resolve_ping(&self, transaction_id: &str) -> ProxyResult<String> {
        let key = CorrelationKey::Ping(transaction_id.to_string());
        match self.store.take(&key).await? {
            Some(TransactionTarget::Bridge(bridge_id)) => Ok(bridge_id),
            None => Err(ProxyError::unknown_transaction(transaction_id)),
        }
    }

    /// Remember which bridge took a homeserver transaction so retries land
    /// on the same bridge.
    pub async fn record_transaction(
        &self,
        transaction_id: &str,
        bridge_id: &str,
    ) -> ProxyResult<()> {
        let key = CorrelationKey::Transaction(transaction_id.to_string());
        self.store
            .insert_if_absent(key, TransactionTarget::Bridge(bridge_id.to_string()), self.ttl)
            .await?;
        Ok(())
    }

    /// Bridge recorded for a homeserver transaction, if any.
    pub async fn lookup_transaction(&self, transaction_id: &str) -> ProxyResult<Option<String>> {
        let key = CorrelationKey::Transaction(transaction_id.to_string());
        self.bridge_for(&key).await
    }

    /// Remember that `bridge_id` acts in `room_id`. The latest sighting wins.
    pub async fn record_room(&self, room_id: &str, bridge_id: &str) -> ProxyResult<()> {
        debug!(room_id, bridge_id, "room associated with bridge");
        self.store
            .insert(
                CorrelationKey::Room(room_id.to_string()),
                TransactionTarget::Bridge(bridge_id.to_string()),
                self.ttl,
            )
            .await
    }

    /// Bridge last seen acting in `room_id`, if any.
    pub async fn lookup_room(&self, room_id: &str) -> ProxyResult<Option<String>> {
        self.bridge_for(&CorrelationKey::Room(room_id.to_string()))
            .await
    }

    /// Purge expired records and return how many remain.
    pub async fn sweep(&self) -> ProxyResult<usize> {
        let purged = self.store.purge_expired().await?;
        if purged > 0 {
            debug!(purged, "expired correlation records purged");
        }
        self.store.len().await
    }

    /// Number of records currently held.
    pub async fn pending(&self) -> ProxyResult<usize> {
        self.store.len().await
    }

    /// Run [`sweep`](Self::sweep) every `every` until the handle is aborted.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                match router.sweep().await {
                    Ok(remaining) => crate::metrics::set_pending_transactions(remaining),
                    Err(e) => warn!(error = %e, "correlation sweep failed"),
                }
            }
        })
    }

    async fn bridge_for(&self, key: &CorrelationKey) -> ProxyResult<Option<String>> {
        Ok(self
            .store
            .get(key)
            .await?
            .map(|t| t.bridge_id().to_string()))
    }
}
