//! In-memory pubsub backend.
//!
//! Keeps every table in process and emulates the row locking the engine
//! relies on: a lock table keyed by replica key, skip-locked fetches that
//! exclude keys held by other transactions, and single-row locks that wait
//! until the holder commits or rolls back. A key can be locked before its
//! replica row exists. Reconciliation waits for locks on the keys it touches.
//! Writes made inside a transaction become visible at commit.
//!
//! Every data item upsert raises a change notification, like the
//! PostgreSQL trigger does.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{PubSubError, Result};
use crate::event::Notification;
use crate::model::{
    DataItem, DataKey, EntityStatus, PublishRequest, Publisher, Replica, ReplicaStatus,
    Subscriber,
};
use crate::store::{
    ClaimedReplica, DataSnapshot, NotificationSource, PubSubStore, ReconcileOutcome,
    StoreTransaction,
};

const NOTIFICATION_CAPACITY: usize = 1024;

type ReplicaKey = (i64, DataKey);

#[derive(Default)]
struct Tables {
    publishers: BTreeMap<i64, Publisher>,
    subscribers: BTreeMap<i64, Subscriber>,
    // (publisher_id, subscriber_id)
    links: BTreeSet<(i64, i64)>,
    data: BTreeMap<DataKey, DataItem>,
    replicas: BTreeMap<i64, Replica>,
    replica_ids: HashMap<ReplicaKey, i64>,
    // replica key -> id of the transaction holding the lock
    locks: HashMap<ReplicaKey, u64>,
    next_publisher_id: i64,
    next_subscriber_id: i64,
    next_replica_id: i64,
    next_transaction_id: u64,
}

impl Tables {
    fn upsert_data(&mut self, request: &PublishRequest) -> i64 {
        let now = Utc::now();
        match self.data.get_mut(&request.key) {
            Some(item) => {
                item.version += 1;
                item.deleted = request.deleted;
                item.payload = request.payload.clone();
                item.updated_at = now;
                item.version
            }
            None => {
                self.data.insert(
                    request.key.clone(),
                    DataItem {
                        key: request.key.clone(),
                        deleted: request.deleted,
                        version: 1,
                        payload: request.payload.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                1
            }
        }
    }

    fn require_publisher(&self, publisher_id: i64) -> Result<()> {
        if self.publishers.contains_key(&publisher_id) {
            Ok(())
        } else {
            Err(PubSubError::not_found("publisher", publisher_id.to_string()))
        }
    }

    fn store_replica(&mut self, mut replica: Replica) {
        let key = (replica.subscriber_id, replica.key.clone());
        let existing = replica
            .id
            .filter(|id| self.replicas.contains_key(id))
            .or_else(|| self.replica_ids.get(&key).copied());
        match existing {
            Some(id) => {
                if let Some(current) = self.replicas.get(&id) {
                    replica.created_at = current.created_at;
                }
                replica.id = Some(id);
                self.replicas.insert(id, replica);
            }
            None => {
                self.next_replica_id += 1;
                let id = self.next_replica_id;
                replica.id = Some(id);
                self.replica_ids.insert(key, id);
                self.replicas.insert(id, replica);
            }
        }
    }

    /// Insert and re-arm the subscriber's replicas in one step.
    ///
    /// Returns `None` while another transaction holds a lock on any affected
    /// key, as a row-level UPDATE would wait for it.
    fn reconcile(&mut self, subscriber_id: i64) -> Result<Option<ReconcileOutcome>> {
        if !self.subscribers.contains_key(&subscriber_id) {
            return Err(PubSubError::not_found(
                "subscriber",
                subscriber_id.to_string(),
            ));
        }

        let linked: HashSet<i64> = self
            .links
            .iter()
            .filter(|(_, sub)| *sub == subscriber_id)
            .map(|(publisher, _)| *publisher)
            .filter(|publisher| {
                self.publishers
                    .get(publisher)
                    .is_some_and(|p| p.is_active())
            })
            .collect();

        let items: Vec<DataItem> = self
            .data
            .values()
            .filter(|item| linked.contains(&item.key.publisher_id))
            .cloned()
            .collect();

        let blocked = items
            .iter()
            .any(|item| self.locks.contains_key(&(subscriber_id, item.key.clone())));
        if blocked {
            return Ok(None);
        }

        let mut outcome = ReconcileOutcome::default();
        let now = Utc::now();
        for item in items {
            let key = (subscriber_id, item.key.clone());
            match self.replica_ids.get(&key).copied() {
                None => {
                    let mut replica = Replica::placeholder(subscriber_id, item.key.clone());
                    replica.deleted = item.deleted;
                    replica.version = item.version;
                    self.store_replica(replica);
                    outcome.inserted += 1;
                }
                Some(id) => {
                    if let Some(replica) = self.replicas.get_mut(&id) {
                        if item.version > replica.version {
                            replica.status = ReplicaStatus::Pending;
                            replica.retries = 0;
                            replica.version = item.version;
                            replica.deleted = item.deleted;
                            replica.updated_at = now;
                            outcome.rearmed += 1;
                        }
                    }
                }
            }
        }
        Ok(Some(outcome))
    }
}

struct Shared {
    tables: Mutex<Tables>,
    unlocked: Notify,
    notifications: broadcast::Sender<String>,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_locks(&self, transaction_id: u64) {
        self.tables()
            .locks
            .retain(|_, holder| *holder != transaction_id);
        self.unlocked.notify_waiters();
    }
}

/// In-process implementation of `PubSubStore`.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                unlocked: Notify::new(),
                notifications,
            }),
        }
    }

    /// Receive the change notifications raised from now on.
    pub fn notifications(&self) -> MemoryNotificationSource {
        MemoryNotificationSource {
            receiver: self.shared.notifications.subscribe(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Raise a raw notification payload, as an external writer would.
    pub fn raise_notification(&self, payload: impl Into<String>) {
        // No receivers is not an error.
        let _ = self.shared.notifications.send(payload.into());
    }

    /// Every replica row of the subscriber, ascending by id.
    pub fn replicas_for(&self, subscriber_id: i64) -> Vec<Replica> {
        self.shared
            .tables()
            .replicas
            .values()
            .filter(|r| r.subscriber_id == subscriber_id)
            .cloned()
            .collect()
    }

    fn notify_change(&self, request: &PublishRequest, version: i64) {
        let notification = Notification {
            publisher_id: request.key.publisher_id,
            data_type: request.key.data_type.clone(),
            data_id: request.key.data_id.clone(),
            deleted: request.deleted,
            version,
        };
        self.raise_notification(notification.encode());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let transaction_id = {
            let mut tables = self.shared.tables();
            tables.next_transaction_id += 1;
            tables.next_transaction_id
        };
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            transaction_id,
            writes: Vec::new(),
            finished: false,
        }))
    }

    async fn upsert_data_item(&self, request: &PublishRequest) -> Result<i64> {
        let version = {
            let mut tables = self.shared.tables();
            tables.require_publisher(request.key.publisher_id)?;
            tables.upsert_data(request)
        };
        self.notify_change(request, version);
        Ok(version)
    }

    async fn upsert_data_items(&self, requests: &[PublishRequest]) -> Result<Vec<i64>> {
        let versions = {
            let mut tables = self.shared.tables();
            let mut seen = HashSet::new();
            for request in requests {
                tables.require_publisher(request.key.publisher_id)?;
                if !seen.insert(&request.key) {
                    return Err(PubSubError::DuplicatePendingRecord(request.key.clone()));
                }
            }
            requests
                .iter()
                .map(|request| tables.upsert_data(request))
                .collect::<Vec<_>>()
        };
        for (request, version) in requests.iter().zip(&versions) {
            self.notify_change(request, *version);
        }
        Ok(versions)
    }

    async fn data_item(&self, key: &DataKey) -> Result<Option<DataItem>> {
        Ok(self.shared.tables().data.get(key).cloned())
    }

    async fn publisher_by_code(&self, code: &str) -> Result<Publisher> {
        self.shared
            .tables()
            .publishers
            .values()
            .find(|p| p.code == code)
            .cloned()
            .ok_or_else(|| PubSubError::not_found("publisher", code))
    }

    async fn subscriber_by_code(&self, code: &str) -> Result<Subscriber> {
        self.shared
            .tables()
            .subscribers
            .values()
            .find(|s| s.code == code)
            .cloned()
            .ok_or_else(|| PubSubError::not_found("subscriber", code))
    }

    async fn publishers_for_subscriber(&self, subscriber_id: i64) -> Result<Vec<Publisher>> {
        let tables = self.shared.tables();
        Ok(tables
            .links
            .iter()
            .filter(|(_, sub)| *sub == subscriber_id)
            .filter_map(|(publisher, _)| tables.publishers.get(publisher))
            .filter(|p| p.is_active())
            .cloned()
            .collect())
    }

    async fn reconcile_replicas(&self, subscriber_id: i64) -> Result<ReconcileOutcome> {
        loop {
            let unlocked = self.shared.unlocked.notified();
            {
                let mut tables = self.shared.tables();
                if let Some(outcome) = tables.reconcile(subscriber_id)? {
                    return Ok(outcome);
                }
            }
            unlocked.await;
        }
    }

    async fn replica(&self, subscriber_id: i64, key: &DataKey) -> Result<Option<Replica>> {
        let tables = self.shared.tables();
        Ok(tables
            .replica_ids
            .get(&(subscriber_id, key.clone()))
            .and_then(|id| tables.replicas.get(id))
            .cloned())
    }

    async fn register_publisher(&self, code: &str, name: &str) -> Result<Publisher> {
        let mut tables = self.shared.tables();
        if tables.publishers.values().any(|p| p.code == code) {
            return Err(PubSubError::Validation(format!(
                "Publisher code '{code}' already registered"
            )));
        }
        tables.next_publisher_id += 1;
        let publisher = Publisher {
            id: tables.next_publisher_id,
            code: code.to_string(),
            name: name.to_string(),
            status: EntityStatus::Active,
        };
        tables.publishers.insert(publisher.id, publisher.clone());
        Ok(publisher)
    }

    async fn register_subscriber(
        &self,
        code: &str,
        name: &str,
        retries: i32,
    ) -> Result<Subscriber> {
        if retries < 0 {
            return Err(PubSubError::Validation(format!(
                "Subscriber retries must not be negative, got {retries}"
            )));
        }
        let mut tables = self.shared.tables();
        if tables.subscribers.values().any(|s| s.code == code) {
            return Err(PubSubError::Validation(format!(
                "Subscriber code '{code}' already registered"
            )));
        }
        tables.next_subscriber_id += 1;
        let subscriber = Subscriber {
            id: tables.next_subscriber_id,
            code: code.to_string(),
            name: name.to_string(),
            status: EntityStatus::Active,
            retries,
        };
        tables.subscribers.insert(subscriber.id, subscriber.clone());
        Ok(subscriber)
    }

    async fn link(&self, publisher_id: i64, subscriber_id: i64) -> Result<()> {
        let mut tables = self.shared.tables();
        tables.require_publisher(publisher_id)?;
        if !tables.subscribers.contains_key(&subscriber_id) {
            return Err(PubSubError::not_found(
                "subscriber",
                subscriber_id.to_string(),
            ));
        }
        tables.links.insert((publisher_id, subscriber_id));
        Ok(())
    }

    async fn set_publisher_status(&self, publisher_id: i64, status: EntityStatus) -> Result<()> {
        let mut tables = self.shared.tables();
        let publisher = tables
            .publishers
            .get_mut(&publisher_id)
            .ok_or_else(|| PubSubError::not_found("publisher", publisher_id.to_string()))?;
        publisher.status = status;
        Ok(())
    }

    async fn set_subscriber_status(
        &self,
        subscriber_id: i64,
        status: EntityStatus,
    ) -> Result<()> {
        let mut tables = self.shared.tables();
        let subscriber = tables
            .subscribers
            .get_mut(&subscriber_id)
            .ok_or_else(|| PubSubError::not_found("subscriber", subscriber_id.to_string()))?;
        subscriber.status = status;
        Ok(())
    }
}

/// Transaction over a `MemoryStore`.
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    transaction_id: u64,
    writes: Vec<Replica>,
    finished: bool,
}

impl MemoryTransaction {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.shared.release_locks(self.transaction_id);
        }
    }

    fn buffer_write(&mut self, replica: Replica) {
        let position = self.writes.iter().position(|w| {
            w.subscriber_id == replica.subscriber_id && w.key == replica.key
        });
        match position {
            Some(position) => self.writes[position] = replica,
            None => self.writes.push(replica),
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn fetch_pending(
        &mut self,
        subscriber_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ClaimedReplica>> {
        let mut tables = self.shared.tables();
        let claimable: Vec<Replica> = tables
            .replicas
            .range(after_id.saturating_add(1)..)
            .map(|(_, replica)| replica)
            .filter(|r| r.subscriber_id == subscriber_id && r.status == ReplicaStatus::Pending)
            .filter(|r| {
                tables
                    .locks
                    .get(&(r.subscriber_id, r.key.clone()))
                    .is_none_or(|holder| *holder == self.transaction_id)
            })
            .take(limit)
            .cloned()
            .collect();

        let mut claimed = Vec::with_capacity(claimable.len());
        for replica in claimable {
            tables.locks.insert(
                (replica.subscriber_id, replica.key.clone()),
                self.transaction_id,
            );
            let source = tables.data.get(&replica.key).map(DataSnapshot::from);
            claimed.push(ClaimedReplica { replica, source });
        }
        Ok(claimed)
    }

    async fn lock_replica(
        &mut self,
        subscriber_id: i64,
        key: &DataKey,
    ) -> Result<Option<Replica>> {
        let shared = Arc::clone(&self.shared);
        let lock_key = (subscriber_id, key.clone());
        loop {
            let unlocked = shared.unlocked.notified();
            {
                let mut tables = shared.tables();
                let held_elsewhere = tables
                    .locks
                    .get(&lock_key)
                    .is_some_and(|holder| *holder != self.transaction_id);
                if !held_elsewhere {
                    tables.locks.insert(lock_key.clone(), self.transaction_id);
                    return Ok(tables
                        .replica_ids
                        .get(&lock_key)
                        .and_then(|id| tables.replicas.get(id))
                        .cloned());
                }
            }
            unlocked.await;
        }
    }

    async fn data_snapshot(&mut self, key: &DataKey) -> Result<Option<DataSnapshot>> {
        Ok(self.shared.tables().data.get(key).map(DataSnapshot::from))
    }

    async fn upsert_replica(&mut self, replica: &Replica) -> Result<()> {
        self.buffer_write(replica.clone());
        Ok(())
    }

    async fn bulk_update_replicas(&mut self, replicas: &[Replica]) -> Result<u64> {
        let existing = {
            let tables = self.shared.tables();
            replicas
                .iter()
                .filter(|r| r.id.is_some_and(|id| tables.replicas.contains_key(&id)))
                .count() as u64
        };
        for replica in replicas.iter().filter(|r| r.id.is_some()) {
            self.buffer_write(replica.clone());
        }
        Ok(existing)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        {
            let mut tables = self.shared.tables();
            for replica in self.writes.drain(..) {
                tables.store_replica(replica);
            }
        }
        self.finish();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.writes.clear();
        self.finish();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Notification stream of a `MemoryStore`.
pub struct MemoryNotificationSource {
    receiver: broadcast::Receiver<String>,
    shutdown: CancellationToken,
}

#[async_trait]
impl NotificationSource for MemoryNotificationSource {
    async fn next_payload(&mut self) -> Result<Option<String>> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(None),
                received = self.receiver.recv() => match received {
                    Ok(payload) => return Ok(Some(payload)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification receiver lagged, {} notifications dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(PubSubError::Connection(
                            "notification channel closed".to_string(),
                        ));
                    }
                },
            }
        }
    }

    fn close(&mut self) {
        self.shutdown.cancel();
    }

    fn close_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryStore, Publisher, Subscriber) {
        let store = MemoryStore::new();
        let publisher = store.register_publisher("P1", "Orders").await.unwrap();
        let subscriber = store.register_subscriber("S1", "Billing", 2).await.unwrap();
        store.link(publisher.id, subscriber.id).await.unwrap();
        (store, publisher, subscriber)
    }

    fn request(publisher_id: i64, id: &str) -> PublishRequest {
        PublishRequest::new(
            DataKey::new(publisher_id, "order", id),
            false,
            Some(id.as_bytes().to_vec()),
        )
    }

    #[tokio::test]
    async fn test_lookup_by_code() {
        let (store, publisher, subscriber) = seeded().await;
        assert_eq!(store.publisher_by_code("P1").await.unwrap(), publisher);
        assert_eq!(store.subscriber_by_code("S1").await.unwrap(), subscriber);
        assert!(matches!(
            store.subscriber_by_code("missing").await,
            Err(PubSubError::NotFound { kind: "subscriber", .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_codes_rejected() {
        let (store, _, _) = seeded().await;
        assert!(store.register_publisher("P1", "Again").await.is_err());
        assert!(store.register_subscriber("S1", "Again", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_inserts_then_rearms() {
        let (store, publisher, subscriber) = seeded().await;
        store.upsert_data_item(&request(publisher.id, "1")).await.unwrap();
        store.upsert_data_item(&request(publisher.id, "2")).await.unwrap();

        let first = store.reconcile_replicas(subscriber.id).await.unwrap();
        assert_eq!(first, ReconcileOutcome { inserted: 2, rearmed: 0 });

        let again = store.reconcile_replicas(subscriber.id).await.unwrap();
        assert_eq!(again, ReconcileOutcome::default());

        store.upsert_data_item(&request(publisher.id, "2")).await.unwrap();
        let rearmed = store.reconcile_replicas(subscriber.id).await.unwrap();
        assert_eq!(rearmed, ReconcileOutcome { inserted: 0, rearmed: 1 });

        let replica = store
            .replica(subscriber.id, &DataKey::new(publisher.id, "order", "2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replica.version, 2);
        assert_eq!(replica.status, ReplicaStatus::Pending);
        assert!(replica.payload.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_skips_inactive_and_unlinked_publishers() {
        let (store, publisher, subscriber) = seeded().await;
        let other = store.register_publisher("P2", "Other").await.unwrap();
        store.upsert_data_item(&request(publisher.id, "1")).await.unwrap();
        store.upsert_data_item(&request(other.id, "1")).await.unwrap();

        store
            .set_publisher_status(publisher.id, EntityStatus::Inactive)
            .await
            .unwrap();
        let outcome = store.reconcile_replicas(subscriber.id).await.unwrap();
        assert_eq!(outcome.inserted, 0);
        assert!(store
            .publishers_for_subscriber(subscriber.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_skip_locked_fetches_are_disjoint() {
        let (store, publisher, subscriber) = seeded().await;
        for id in 1..=6 {
            store
                .upsert_data_item(&request(publisher.id, &id.to_string()))
                .await
                .unwrap();
        }
        store.reconcile_replicas(subscriber.id).await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let a = first.fetch_pending(subscriber.id, 0, 4).await.unwrap();
        let b = second.fetch_pending(subscriber.id, 0, 4).await.unwrap();

        let a_ids: HashSet<i64> = a.iter().filter_map(|c| c.replica.id).collect();
        let b_ids: HashSet<i64> = b.iter().filter_map(|c| c.replica.id).collect();
        assert_eq!(a_ids.len(), 4);
        assert_eq!(b_ids.len(), 2);
        assert!(a_ids.is_disjoint(&b_ids));

        first.rollback().await.unwrap();
        let c = second.fetch_pending(subscriber.id, 0, 10).await.unwrap();
        assert_eq!(c.len(), 6);
    }

    #[tokio::test]
    async fn test_lock_replica_waits_for_holder() {
        let (store, publisher, subscriber) = seeded().await;
        store.upsert_data_item(&request(publisher.id, "1")).await.unwrap();
        store.reconcile_replicas(subscriber.id).await.unwrap();
        let key = DataKey::new(publisher.id, "order", "1");

        let mut holder = store.begin().await.unwrap();
        let mut locked = holder.lock_replica(subscriber.id, &key).await.unwrap().unwrap();

        let waiter_store = store.clone();
        let waiter_key = key.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = waiter_store.begin().await.unwrap();
            let replica = tx.lock_replica(subscriber.id, &waiter_key).await.unwrap();
            tx.rollback().await.unwrap();
            replica
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        locked.hash = "h1".to_string();
        holder.upsert_replica(&locked).await.unwrap();
        holder.commit().await.unwrap();

        let seen = waiter.await.unwrap().unwrap();
        assert_eq!(seen.hash, "h1");
    }

    #[tokio::test]
    async fn test_rolled_back_writes_are_discarded() {
        let (store, publisher, subscriber) = seeded().await;
        store.upsert_data_item(&request(publisher.id, "1")).await.unwrap();
        store.reconcile_replicas(subscriber.id).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut claimed = tx.fetch_pending(subscriber.id, 0, 10).await.unwrap();
        claimed[0].replica.status = ReplicaStatus::Completed;
        tx.bulk_update_replicas(&[claimed[0].replica.clone()])
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let replicas = store.replicas_for(subscriber.id);
        assert_eq!(replicas[0].status, ReplicaStatus::Pending);
    }

    #[tokio::test]
    async fn test_publish_raises_notification() {
        let (store, publisher, _) = seeded().await;
        let mut source = store.notifications();
        store.upsert_data_item(&request(publisher.id, "1")).await.unwrap();

        let payload = source.next_payload().await.unwrap().unwrap();
        let notification = Notification::decode(&payload).unwrap();
        assert_eq!(notification.key(), DataKey::new(publisher.id, "order", "1"));
        assert_eq!(notification.version, 1);

        source.close();
        source.close();
        assert_eq!(source.next_payload().await.unwrap(), None);
    }
}
