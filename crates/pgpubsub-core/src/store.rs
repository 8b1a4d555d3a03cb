//! Storage boundary of the engine.
//!
//! The engine never talks to a database directly. It consumes the
//! capabilities below, which a backend provides:
//!
//! - `PubSubStore` - data item upserts, registry lookups, reconciliation
//!   and administrative writes, each in its own implicit transaction
//! - `StoreTransaction` - an explicit transaction with `FOR UPDATE` and
//!   `FOR UPDATE SKIP LOCKED` reads and bulk replica writes
//! - `NotificationSource` - a live stream of raw change notifications
//!
//! Implementations: `MemoryStore` in this crate, `PgStore` in
//! `pgpubsub-postgresql`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{
    DataItem, DataKey, EntityStatus, PublishRequest, Publisher, Replica, Subscriber,
};

/// Current state of the data item behind a claimed replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSnapshot {
    pub deleted: bool,
    pub version: i64,
    pub payload: Option<Vec<u8>>,
}

impl From<&DataItem> for DataSnapshot {
    fn from(item: &DataItem) -> Self {
        Self {
            deleted: item.deleted,
            version: item.version,
            payload: item.payload.clone(),
        }
    }
}

/// A pending replica row locked by the current transaction.
#[derive(Debug, Clone)]
pub struct ClaimedReplica {
    pub replica: Replica,
    /// `None` when the data item has been removed from the data table.
    pub source: Option<DataSnapshot>,
}

/// Row counts produced by one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// New pending replicas created for data items seen for the first time.
    pub inserted: u64,
    /// Existing replicas re-armed because their data item has a newer version.
    pub rearmed: u64,
}

/// Non-transactional operations of a pubsub backend.
#[async_trait]
pub trait PubSubStore: Send + Sync + 'static {
    /// Open a transaction. Dropping it without commit rolls it back.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Upsert one data item and return its new version.
    async fn upsert_data_item(&self, request: &PublishRequest) -> Result<i64>;

    /// Upsert many data items in one statement. Keys must be distinct.
    /// Versions are returned in request order.
    async fn upsert_data_items(&self, requests: &[PublishRequest]) -> Result<Vec<i64>>;

    async fn data_item(&self, key: &DataKey) -> Result<Option<DataItem>>;

    async fn publisher_by_code(&self, code: &str) -> Result<Publisher>;

    async fn subscriber_by_code(&self, code: &str) -> Result<Subscriber>;

    /// Active publishers linked to the subscriber.
    async fn publishers_for_subscriber(&self, subscriber_id: i64) -> Result<Vec<Publisher>>;

    /// Create missing replicas and re-arm stale ones for the subscriber.
    async fn reconcile_replicas(&self, subscriber_id: i64) -> Result<ReconcileOutcome>;

    async fn replica(&self, subscriber_id: i64, key: &DataKey) -> Result<Option<Replica>>;

    async fn register_publisher(&self, code: &str, name: &str) -> Result<Publisher>;

    async fn register_subscriber(&self, code: &str, name: &str, retries: i32)
        -> Result<Subscriber>;

    async fn link(&self, publisher_id: i64, subscriber_id: i64) -> Result<()>;

    async fn set_publisher_status(&self, publisher_id: i64, status: EntityStatus) -> Result<()>;

    async fn set_subscriber_status(&self, subscriber_id: i64, status: EntityStatus)
        -> Result<()>;
}

/// An open transaction against the replica table.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Lock and return up to `limit` pending replicas of the subscriber with
    /// `id > after_id`, ascending by id. Rows locked by other transactions are
    /// skipped rather than awaited.
    async fn fetch_pending(
        &mut self,
        subscriber_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ClaimedReplica>>;

    /// Lock the replica for the key, waiting for concurrent holders.
    ///
    /// The key stays locked until the transaction ends even when no row
    /// exists yet, so reconciliation cannot create or re-arm it meanwhile.
    /// `None` means no row exists and the caller writes one with
    /// `upsert_replica`. A backend may instead create a version 0 pending row
    /// and return it.
    async fn lock_replica(&mut self, subscriber_id: i64, key: &DataKey)
        -> Result<Option<Replica>>;

    async fn data_snapshot(&mut self, key: &DataKey) -> Result<Option<DataSnapshot>>;

    /// Insert or update a replica by (subscriber, key).
    async fn upsert_replica(&mut self, replica: &Replica) -> Result<()>;

    /// Update persisted replicas by id in a single statement.
    async fn bulk_update_replicas(&mut self, replicas: &[Replica]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Live stream of raw change notification payloads.
#[async_trait]
pub trait NotificationSource: Send {
    /// Wait for the next payload. `Ok(None)` after `close`; connection
    /// failures surface as `PubSubError::Connection`.
    async fn next_payload(&mut self) -> Result<Option<String>>;

    /// Stop receiving. Safe to call more than once.
    fn close(&mut self);

    /// Token that closes the source when cancelled, usable while the source
    /// itself is borrowed by a listen loop.
    fn close_handle(&self) -> CancellationToken;
}
