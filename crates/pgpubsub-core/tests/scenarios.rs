use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pgpubsub_core::{
    publish, DataKey, Delivered, DeliveryCallback, DeliveryListener, DeliveryStats,
    EntityStatus, Event, MemoryStore, Notification, NotificationOutcome, NotificationSource,
    PubSubError, PubSubStore, PublishRequest, Publisher, ReconcileOutcome, ReplicaStatus,
    Subscriber, SubscriberEngine,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Batch transport that records every delivered replica id.
#[derive(Default)]
struct RecordingCallback {
    hash: Option<String>,
    fail_with: Option<String>,
    delivered: Mutex<Vec<i64>>,
    retrieved: Mutex<Vec<i64>>,
    calls: AtomicUsize,
}

impl RecordingCallback {
    fn succeeding(hash: &str) -> Self {
        Self {
            hash: Some(hash.to_string()),
            ..Self::default()
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    fn delivered(&self) -> Vec<i64> {
        self.delivered.lock().unwrap().clone()
    }

    /// Replica ids handed to `push`, including failed pushes.
    fn retrieved(&self) -> Vec<i64> {
        self.retrieved.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryCallback for RecordingCallback {
    async fn push(&self, events: &mut [Event]) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.retrieved
            .lock()
            .unwrap()
            .extend(events.iter().filter_map(|e| e.replica_id));
        // Let concurrent batch passes interleave.
        tokio::task::yield_now().await;
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{message}");
        }
        let mut delivered = self.delivered.lock().unwrap();
        for event in events.iter_mut() {
            event.new_hash = match &self.hash {
                Some(hash) => hash.clone(),
                None => format!("{}@{}", event.key, event.version),
            };
            delivered.extend(event.replica_id);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingListener {
    fail: bool,
    sent: Mutex<Vec<(DataKey, i64)>>,
}

impl RecordingListener {
    fn sent(&self) -> Vec<(DataKey, i64)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryListener for RecordingListener {
    async fn send(&self, event: &Event) -> anyhow::Result<Delivered> {
        self.sent
            .lock()
            .unwrap()
            .push((event.key.clone(), event.version));
        if self.fail {
            anyhow::bail!("endpoint unavailable");
        }
        Ok(Delivered {
            hash: format!("h{}", event.version),
            payload: event.new_payload.clone(),
        })
    }
}

async fn setup(retries: i32) -> (Arc<MemoryStore>, Publisher, Subscriber) {
    let store = Arc::new(MemoryStore::new());
    let publisher = store.register_publisher("P1", "Orders").await.unwrap();
    let subscriber = store
        .register_subscriber("S1", "Billing", retries)
        .await
        .unwrap();
    store.link(publisher.id, subscriber.id).await.unwrap();
    (store, publisher, subscriber)
}

fn order(publisher_id: i64, id: &str, payload: &[u8]) -> PublishRequest {
    PublishRequest::new(
        DataKey::new(publisher_id, "order", id),
        false,
        Some(payload.to_vec()),
    )
}

#[tokio::test]
async fn test_versions_strictly_increase() {
    let (store, publisher, _) = setup(2).await;
    let mut last = 0;
    for payload in [b"same", b"same", b"diff", b"same"] {
        let version = publish(store.as_ref(), &order(publisher.id, "1", payload))
            .await
            .unwrap();
        assert!(version > last);
        last = version;
    }
    assert_eq!(last, 4);
}

#[tokio::test]
async fn test_successful_batch_completes_replica() {
    let (store, publisher, subscriber) = setup(2).await;
    let version = publish(store.as_ref(), &order(publisher.id, "1", b"v1"))
        .await
        .unwrap();
    assert_eq!(version, 1);

    let engine = SubscriberEngine::for_code(store.clone(), "S1").await.unwrap();
    let reconciled = engine.reconcile().await.unwrap();
    assert_eq!(reconciled.inserted, 1);

    let callback = RecordingCallback::succeeding("h1");
    let stats = engine.run_batch(&callback, 100, 0).await.unwrap();
    assert_eq!(
        stats,
        DeliveryStats {
            processed: 1,
            succeeded: 1,
            ..DeliveryStats::default()
        }
    );

    let replica = store
        .replica(subscriber.id, &DataKey::new(publisher.id, "order", "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replica.status, ReplicaStatus::Completed);
    assert_eq!(replica.hash, "h1");
    assert_eq!(replica.version, 1);
}

#[tokio::test]
async fn test_round_trip_matches_published_values() {
    let (store, publisher, subscriber) = setup(2).await;
    publish(store.as_ref(), &order(publisher.id, "1", b"first"))
        .await
        .unwrap();
    publish(store.as_ref(), &order(publisher.id, "1", b"second"))
        .await
        .unwrap();
    let gone = PublishRequest::new(DataKey::new(publisher.id, "order", "2"), true, None);
    publish(store.as_ref(), &gone).await.unwrap();

    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    let callback = RecordingCallback::default();
    engine.run_batch(&callback, 10, 0).await.unwrap();

    for key in [
        DataKey::new(publisher.id, "order", "1"),
        DataKey::new(publisher.id, "order", "2"),
    ] {
        let item = store.data_item(&key).await.unwrap().unwrap();
        let replica = store.replica(subscriber.id, &key).await.unwrap().unwrap();
        assert_eq!(replica.status, ReplicaStatus::Completed);
        assert_eq!(replica.version, item.version);
        assert_eq!(replica.deleted, item.deleted);
        assert_eq!(replica.payload, item.payload);
        assert_eq!(replica.hash, format!("{}@{}", key, item.version));
    }
}

#[tokio::test]
async fn test_two_failed_passes_park_the_replica() {
    let (store, publisher, subscriber) = setup(2).await;
    publish(store.as_ref(), &order(publisher.id, "1", b"v1"))
        .await
        .unwrap();
    let key = DataKey::new(publisher.id, "order", "1");
    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    let callback = RecordingCallback::failing("connection refused");

    let first = engine.run_batch(&callback, 100, 0).await.unwrap();
    assert_eq!(first.retrying, 1);
    let replica = store.replica(subscriber.id, &key).await.unwrap().unwrap();
    assert_eq!(replica.status, ReplicaStatus::Pending);
    assert_eq!(replica.retries, 1);
    assert_eq!(replica.message.as_deref(), Some("connection refused"));

    let second = engine.run_batch(&callback, 100, 0).await.unwrap();
    assert_eq!(second.failed, 1);
    let replica = store.replica(subscriber.id, &key).await.unwrap().unwrap();
    assert_eq!(replica.status, ReplicaStatus::Failed);
    assert_eq!(replica.retries, 0);

    // Parked rows are not fetched again until a newer version arrives.
    let third = engine.run_batch(&callback, 100, 0).await.unwrap();
    assert_eq!(third.processed, 0);

    publish(store.as_ref(), &order(publisher.id, "1", b"v2"))
        .await
        .unwrap();
    let ok = RecordingCallback::succeeding("h2");
    let fourth = engine.run_batch(&ok, 100, 0).await.unwrap();
    assert_eq!(fourth.succeeded, 1);
    let replica = store.replica(subscriber.id, &key).await.unwrap().unwrap();
    assert_eq!(replica.status, ReplicaStatus::Completed);
    assert_eq!(replica.version, 2);
    assert_eq!(replica.message, None);
}

#[tokio::test]
async fn test_batch_limit_bounds_a_run() {
    let (store, publisher, subscriber) = setup(2).await;
    for id in 0..25 {
        publish(store.as_ref(), &order(publisher.id, &id.to_string(), b"x"))
            .await
            .unwrap();
    }
    let engine = SubscriberEngine::new(store.clone(), subscriber);
    let callback = RecordingCallback::default();

    let first = engine.run_batch(&callback, 10, 15).await.unwrap();
    assert_eq!(first.processed, 15);
    assert_eq!(callback.calls.load(Ordering::SeqCst), 2);

    let second = engine.run_batch(&callback, 10, 15).await.unwrap();
    assert_eq!(second.processed, 10);
    assert_eq!(engine.totals().await.succeeded, 25);
}

#[tokio::test]
async fn test_inactive_subscriber_skips_runs() {
    let (store, publisher, subscriber) = setup(2).await;
    publish(store.as_ref(), &order(publisher.id, "1", b"v1"))
        .await
        .unwrap();
    store
        .set_subscriber_status(subscriber.id, EntityStatus::Inactive)
        .await
        .unwrap();

    let engine = SubscriberEngine::for_code(store.clone(), "S1").await.unwrap();
    let callback = RecordingCallback::default();
    let stats = engine.run_batch(&callback, 10, 0).await.unwrap();
    assert_eq!(stats, DeliveryStats::default());
    assert_eq!(callback.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_workers_never_share_a_row() {
    let (store, publisher, subscriber) = setup(2).await;
    for id in 0..200 {
        publish(store.as_ref(), &order(publisher.id, &id.to_string(), b"x"))
            .await
            .unwrap();
    }
    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    let callback = Arc::new(RecordingCallback::default());

    let stats = engine
        .run_batch_parallel(callback.clone(), 4, 7, 0)
        .await
        .unwrap();

    let delivered = callback.delivered();
    let unique: HashSet<i64> = delivered.iter().copied().collect();
    assert_eq!(unique.len(), delivered.len());
    assert_eq!(stats.processed as usize, delivered.len());
    assert_eq!(unique.len(), 200);
    assert!(store
        .replicas_for(subscriber.id)
        .iter()
        .all(|r| r.status == ReplicaStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_run_respects_batch_limit() {
    let (store, publisher, subscriber) = setup(2).await;
    for id in 0..50 {
        publish(store.as_ref(), &order(publisher.id, &id.to_string(), b"x"))
            .await
            .unwrap();
    }
    let engine = SubscriberEngine::new(store.clone(), subscriber);
    let callback = Arc::new(RecordingCallback::default());

    let stats = engine
        .run_batch_parallel(callback.clone(), 3, 10, 30)
        .await
        .unwrap();
    assert!(stats.processed <= 30);
    let unique: HashSet<i64> = callback.delivered().into_iter().collect();
    assert_eq!(unique.len() as u64, stats.processed);
}

#[tokio::test]
async fn test_notification_updates_replica_and_duplicate_is_ignored() {
    let (store, publisher, subscriber) = setup(2).await;
    publish(store.as_ref(), &order(publisher.id, "1", b"v1"))
        .await
        .unwrap();
    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    engine
        .run_batch(&RecordingCallback::succeeding("h1"), 10, 0)
        .await
        .unwrap();

    let version = publish(store.as_ref(), &order(publisher.id, "1", b"v2"))
        .await
        .unwrap();
    assert_eq!(version, 2);

    let key = DataKey::new(publisher.id, "order", "1");
    let notification = Notification {
        publisher_id: publisher.id,
        data_type: "order".to_string(),
        data_id: "1".to_string(),
        deleted: false,
        version: 2,
    };
    let linked = HashSet::from([publisher.id]);
    let listener = RecordingListener::default();

    let outcome = engine
        .handle_notification(&notification, &linked, &listener)
        .await
        .unwrap();
    assert!(matches!(outcome, NotificationOutcome::Delivered(_)));

    let replica = store.replica(subscriber.id, &key).await.unwrap().unwrap();
    assert_eq!(replica.version, 2);
    assert_eq!(replica.hash, "h2");
    assert_eq!(replica.status, ReplicaStatus::Completed);
    assert_eq!(replica.payload.as_deref(), Some(&b"v2"[..]));

    let duplicate = engine
        .handle_notification(&notification, &linked, &listener)
        .await
        .unwrap();
    assert_eq!(duplicate, NotificationOutcome::Stale);
    assert_eq!(listener.sent().len(), 1);
    assert_eq!(
        store.replica(subscriber.id, &key).await.unwrap().unwrap(),
        replica
    );
}

#[tokio::test]
async fn test_notification_for_unseen_key_creates_replica() {
    let (store, publisher, subscriber) = setup(3).await;
    publish(store.as_ref(), &order(publisher.id, "9", b"fresh"))
        .await
        .unwrap();
    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    let notification = Notification {
        publisher_id: publisher.id,
        data_type: "order".to_string(),
        data_id: "9".to_string(),
        deleted: false,
        version: 1,
    };
    let failing = RecordingListener {
        fail: true,
        ..RecordingListener::default()
    };

    engine
        .handle_notification(&notification, &HashSet::from([publisher.id]), &failing)
        .await
        .unwrap();

    let replica = store
        .replica(subscriber.id, &notification.key())
        .await
        .unwrap()
        .unwrap();
    assert!(replica.is_persisted());
    assert_eq!(replica.status, ReplicaStatus::Pending);
    assert_eq!(replica.retries, 1);
    assert_eq!(replica.version, 0);
    assert_eq!(replica.message.as_deref(), Some("endpoint unavailable"));

    // The failed attempt did not advance the version, so a redelivery is tried.
    let retried = engine
        .handle_notification(&notification, &HashSet::from([publisher.id]), &failing)
        .await
        .unwrap();
    assert!(matches!(retried, NotificationOutcome::Delivered(_)));
    assert_eq!(failing.sent().len(), 2);
}

#[tokio::test]
async fn test_listen_processes_live_notifications() {
    let (store, publisher, subscriber) = setup(2).await;
    let other = store.register_publisher("P2", "Unlinked").await.unwrap();
    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    let listener = Arc::new(RecordingListener::default());

    let mut source = store.notifications();
    let close = source.close_handle();
    let task = {
        let engine = engine.clone();
        let listener = listener.clone();
        tokio::spawn(async move { engine.listen(&mut source, listener.as_ref()).await })
    };

    publish(store.as_ref(), &order(publisher.id, "1", b"a"))
        .await
        .unwrap();
    publish(store.as_ref(), &order(other.id, "1", b"b"))
        .await
        .unwrap();
    store.raise_notification("not json");
    publish(store.as_ref(), &order(publisher.id, "2", b"c"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while listener.sent().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // Give the second delivery time to commit before closing.
    tokio::time::sleep(Duration::from_millis(20)).await;
    close.cancel();

    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.received, 4);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.ignored, 1);
    assert_eq!(stats.delivery.succeeded, 2);

    let replicas = store.replicas_for(subscriber.id);
    assert_eq!(replicas.len(), 2);
    assert!(replicas.iter().all(|r| r.status == ReplicaStatus::Completed));
}

#[tokio::test]
async fn test_reconcile_after_notification_does_not_regress() {
    let (store, publisher, subscriber) = setup(2).await;
    publish(store.as_ref(), &order(publisher.id, "1", b"a"))
        .await
        .unwrap();
    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    let notification = Notification {
        publisher_id: publisher.id,
        data_type: "order".to_string(),
        data_id: "1".to_string(),
        deleted: false,
        version: 1,
    };
    engine
        .handle_notification(
            &notification,
            &HashSet::from([publisher.id]),
            &RecordingListener::default(),
        )
        .await
        .unwrap();

    let outcome = engine.reconcile().await.unwrap();
    assert_eq!((outcome.inserted, outcome.rearmed), (0, 0));

    let callback = RecordingCallback::default();
    let stats = engine.run_batch(&callback, 10, 0).await.unwrap();
    assert_eq!(stats.processed, 0);
}

/// Listener that starts a reconciliation while its delivery is in flight and
/// then fails the delivery.
struct ReconcilingListener {
    store: Arc<MemoryStore>,
    subscriber_id: i64,
    reconcile: Mutex<Option<JoinHandle<pgpubsub_core::Result<ReconcileOutcome>>>>,
}

#[async_trait]
impl DeliveryListener for ReconcilingListener {
    async fn send(&self, _event: &Event) -> anyhow::Result<Delivered> {
        let store = self.store.clone();
        let subscriber_id = self.subscriber_id;
        let handle = tokio::spawn(async move { store.reconcile_replicas(subscriber_id).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(
            !handle.is_finished(),
            "reconciliation must wait for the locked key"
        );
        *self.reconcile.lock().unwrap() = Some(handle);
        anyhow::bail!("endpoint unavailable")
    }
}

#[tokio::test]
async fn test_reconcile_waits_for_listener_and_keeps_newest_version() {
    let (store, publisher, subscriber) = setup(3).await;
    publish(store.as_ref(), &order(publisher.id, "1", b"a"))
        .await
        .unwrap();
    publish(store.as_ref(), &order(publisher.id, "1", b"b"))
        .await
        .unwrap();

    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    let listener = ReconcilingListener {
        store: store.clone(),
        subscriber_id: subscriber.id,
        reconcile: Mutex::new(None),
    };
    let notification = Notification {
        publisher_id: publisher.id,
        data_type: "order".to_string(),
        data_id: "1".to_string(),
        deleted: false,
        version: 2,
    };
    let outcome = engine
        .handle_notification(&notification, &HashSet::from([publisher.id]), &listener)
        .await
        .unwrap();
    assert!(matches!(outcome, NotificationOutcome::Delivered(_)));

    let handle = listener.reconcile.lock().unwrap().take().unwrap();
    let reconciled = handle.await.unwrap().unwrap();
    assert_eq!((reconciled.inserted, reconciled.rearmed), (0, 1));

    let key = DataKey::new(publisher.id, "order", "1");
    let replica = store.replica(subscriber.id, &key).await.unwrap().unwrap();
    assert_eq!(replica.version, 2);
    assert_eq!(replica.status, ReplicaStatus::Pending);
    assert_eq!(replica.retries, 0);
}

#[tokio::test]
async fn test_cursor_moves_past_claimed_rows_before_push() {
    struct CursorCallback {
        engine: SubscriberEngine<MemoryStore>,
        observed: Mutex<Vec<(i64, i64)>>,
    }

    #[async_trait]
    impl DeliveryCallback for CursorCallback {
        async fn push(&self, events: &mut [Event]) -> anyhow::Result<()> {
            let cursor = self.engine.last_seen_id().await;
            let max_id = events.iter().filter_map(|e| e.replica_id).max().unwrap();
            self.observed.lock().unwrap().push((cursor, max_id));
            anyhow::bail!("sink offline")
        }
    }

    let (store, publisher, subscriber) = setup(5).await;
    for id in 0..12 {
        publish(store.as_ref(), &order(publisher.id, &id.to_string(), b"x"))
            .await
            .unwrap();
    }
    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    let callback = CursorCallback {
        engine: engine.clone(),
        observed: Mutex::new(Vec::new()),
    };

    let stats = engine.run_batch(&callback, 5, 0).await.unwrap();
    assert_eq!((stats.processed, stats.retrying), (12, 12));

    let observed = callback.observed.lock().unwrap().clone();
    assert_eq!(observed.len(), 3);
    assert!(observed.iter().all(|(cursor, max_id)| cursor == max_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_failing_run_retrieves_each_row_once() {
    let (store, publisher, subscriber) = setup(5).await;
    for id in 0..120 {
        publish(store.as_ref(), &order(publisher.id, &id.to_string(), b"x"))
            .await
            .unwrap();
    }
    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());
    let callback = Arc::new(RecordingCallback::failing("sink offline"));

    let stats = engine
        .run_batch_parallel(callback.clone(), 4, 7, 0)
        .await
        .unwrap();

    let retrieved = callback.retrieved();
    let unique: HashSet<i64> = retrieved.iter().copied().collect();
    assert_eq!(unique.len(), retrieved.len());
    assert_eq!(unique.len(), 120);
    assert_eq!(stats.retrying, 120);
    assert!(store
        .replicas_for(subscriber.id)
        .iter()
        .all(|r| r.retries == 1 && r.status == ReplicaStatus::Pending));
}

/// Source that hands out fixed payloads and then reports a dropped connection.
struct ScriptedSource {
    payloads: VecDeque<String>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

#[async_trait]
impl NotificationSource for ScriptedSource {
    async fn next_payload(&mut self) -> pgpubsub_core::Result<Option<String>> {
        if self.shutdown.is_cancelled() {
            return Ok(None);
        }
        match self.payloads.pop_front() {
            Some(payload) => Ok(Some(payload)),
            None => Err(PubSubError::Connection("connection reset".to_string())),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    fn close_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[tokio::test]
async fn test_listen_ends_with_connection_error_and_closes_source() {
    let (store, publisher, subscriber) = setup(2).await;
    let version = publish(store.as_ref(), &order(publisher.id, "1", b"a"))
        .await
        .unwrap();
    let engine = SubscriberEngine::new(store.clone(), subscriber.clone());

    let notification = Notification {
        publisher_id: publisher.id,
        data_type: "order".to_string(),
        data_id: "1".to_string(),
        deleted: false,
        version,
    };
    let closed = Arc::new(AtomicBool::new(false));
    let mut source = ScriptedSource {
        payloads: VecDeque::from([notification.encode()]),
        closed: closed.clone(),
        shutdown: CancellationToken::new(),
    };
    let listener = RecordingListener::default();

    let result = engine.listen(&mut source, &listener).await;
    assert!(matches!(result, Err(PubSubError::Connection(_))));
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(listener.sent().len(), 1);

    let replica = store
        .replica(subscriber.id, &DataKey::new(publisher.id, "order", "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replica.status, ReplicaStatus::Completed);
}

#[tokio::test]
async fn test_inactive_subscriber_does_not_listen() {
    let (store, publisher, subscriber) = setup(2).await;
    store
        .set_subscriber_status(subscriber.id, EntityStatus::Inactive)
        .await
        .unwrap();
    let engine = SubscriberEngine::for_code(store.clone(), "S1").await.unwrap();

    let mut source = store.notifications();
    publish(store.as_ref(), &order(publisher.id, "1", b"a"))
        .await
        .unwrap();
    let listener = RecordingListener::default();

    let stats = engine.listen(&mut source, &listener).await.unwrap();
    assert_eq!(stats.received, 0);
    assert!(listener.sent().is_empty());
    assert_eq!(source.next_payload().await.unwrap(), None);
}
