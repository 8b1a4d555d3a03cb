//! Batch delivery engine.
//!
//! A subscriber drains its pending replica rows in locked batches:
//!
//! 1. reconcile replicas with the current data items
//! 2. claim up to `batch_size` pending rows past the cursor with
//!    `FOR UPDATE SKIP LOCKED` and move the cursor past them
//! 3. hand the whole batch to the `DeliveryCallback` once
//! 4. apply the retry rule to every row and commit through the
//!    `BulkStatusCommitter`
//!
//! Steps 2-4 run in one transaction; any failure rolls the batch back.
//! The parallel variant feeds the same batch step to a pool of tokio tasks.

use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commit::{BulkStatusCommitter, DEFAULT_COMMIT_CHUNK_SIZE};
use crate::error::Result;
use crate::event::{DeliveryCallback, Event};
use crate::model::Subscriber;
use crate::retry::{apply_delivery_result, DeliveryOutcome};
use crate::store::{ClaimedReplica, PubSubStore, ReconcileOutcome, StoreTransaction};

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retrying: u64,
    pub failed: u64,
}

impl DeliveryStats {
    pub fn record(&mut self, outcome: DeliveryOutcome) {
        self.processed += 1;
        match outcome {
            DeliveryOutcome::Completed => self.succeeded += 1,
            DeliveryOutcome::Retrying => self.retrying += 1,
            DeliveryOutcome::Failed => self.failed += 1,
        }
    }
}

impl AddAssign for DeliveryStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.retrying += other.retrying;
        self.failed += other.failed;
    }
}

/// Result of one locked fetch + deliver + commit pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub retrieved: usize,
    /// Greatest replica id claimed by the pass.
    pub max_id: i64,
    pub stats: DeliveryStats,
}

#[derive(Debug, Default)]
struct SubscriberState {
    last_seen_id: i64,
    totals: DeliveryStats,
}

/// Delivery engine bound to one subscriber.
///
/// Cloning is cheap; clones share the cursor and the running totals.
pub struct SubscriberEngine<S: PubSubStore> {
    pub(crate) store: Arc<S>,
    pub(crate) subscriber: Subscriber,
    commit_chunk_size: usize,
    state: Arc<Mutex<SubscriberState>>,
}

impl<S: PubSubStore> Clone for SubscriberEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            subscriber: self.subscriber.clone(),
            commit_chunk_size: self.commit_chunk_size,
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: PubSubStore> SubscriberEngine<S> {
    pub fn new(store: Arc<S>, subscriber: Subscriber) -> Self {
        Self {
            store,
            subscriber,
            commit_chunk_size: DEFAULT_COMMIT_CHUNK_SIZE,
            state: Arc::new(Mutex::new(SubscriberState::default())),
        }
    }

    /// Look the subscriber up by code and bind an engine to it.
    pub async fn for_code(store: Arc<S>, code: &str) -> Result<Self> {
        let subscriber = store.subscriber_by_code(code).await?;
        Ok(Self::new(store, subscriber))
    }

    /// Rows per bulk UPDATE statement.
    pub fn with_commit_chunk_size(mut self, chunk_size: usize) -> Self {
        self.commit_chunk_size = chunk_size.max(1);
        self
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Counters accumulated over every run of this engine and its clones.
    pub async fn totals(&self) -> DeliveryStats {
        self.state.lock().await.totals
    }

    pub async fn last_seen_id(&self) -> i64 {
        self.state.lock().await.last_seen_id
    }

    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let outcome = self.store.reconcile_replicas(self.subscriber.id).await?;
        debug!(
            "Reconciled subscriber {}: {} new replicas, {} re-armed",
            self.subscriber.code, outcome.inserted, outcome.rearmed
        );
        Ok(outcome)
    }

    /// Drain pending replicas sequentially.
    ///
    /// Stops at the first empty fetch or once `batch_limit` rows have been
    /// processed (`0` means no limit).
    pub async fn run_batch<C>(
        &self,
        callback: &C,
        batch_size: usize,
        batch_limit: usize,
    ) -> Result<DeliveryStats>
    where
        C: DeliveryCallback + ?Sized,
    {
        if !self.subscriber.is_active() {
            warn!(
                "Subscriber {} is inactive, skipping batch run",
                self.subscriber.code
            );
            return Ok(DeliveryStats::default());
        }

        let batch_size = batch_size.max(1);
        self.reconcile().await?;
        self.reset_cursor().await;

        let mut run = DeliveryStats::default();
        loop {
            let remaining = remaining(batch_limit, run.processed as usize);
            if remaining == 0 {
                debug!("Batch limit {} reached", batch_limit);
                break;
            }

            let outcome = self
                .deliver_batch(callback, batch_size.min(remaining))
                .await?;
            if outcome.retrieved == 0 {
                break;
            }

            self.record_batch(&outcome).await;
            run += outcome.stats;
        }

        info!(
            "Subscriber {} batch run: {} processed, {} succeeded, {} retrying, {} failed",
            self.subscriber.code, run.processed, run.succeeded, run.retrying, run.failed
        );
        Ok(run)
    }

    /// Drain pending replicas with `workers` concurrent batch passes.
    ///
    /// Every worker claims from the shared cursor. The first worker
    /// that claims nothing stops further dispatch; passes already dispatched
    /// run to completion. `SKIP LOCKED` keeps concurrent passes from claiming
    /// the same row.
    pub async fn run_batch_parallel<C>(
        &self,
        callback: Arc<C>,
        workers: usize,
        batch_size: usize,
        batch_limit: usize,
    ) -> Result<DeliveryStats>
    where
        C: DeliveryCallback + 'static,
    {
        if !self.subscriber.is_active() {
            warn!(
                "Subscriber {} is inactive, skipping parallel batch run",
                self.subscriber.code
            );
            return Ok(DeliveryStats::default());
        }

        let workers = workers.max(1);
        let batch_size = batch_size.max(1);
        self.reconcile().await?;
        self.reset_cursor().await;

        let stop = CancellationToken::new();
        let (request_tx, request_rx) = mpsc::channel::<usize>(workers);
        let request_rx = Arc::new(Mutex::new(request_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<Result<BatchOutcome>>(workers);

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let engine = self.clone();
            let callback = Arc::clone(&callback);
            let requests = Arc::clone(&request_rx);
            let results = result_tx.clone();
            let stop = stop.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let request = requests.lock().await.recv().await;
                    let Some(limit) = request else {
                        break;
                    };

                    let outcome = engine.deliver_batch(callback.as_ref(), limit).await;
                    match &outcome {
                        Ok(batch) if batch.retrieved == 0 => {
                            debug!("Worker {} found no pending rows, stopping dispatch", worker);
                            stop.cancel();
                        }
                        Ok(batch) => engine.record_batch(batch).await,
                        Err(e) => {
                            warn!("Worker {} batch failed: {}", worker, e);
                            stop.cancel();
                        }
                    }

                    if results.send(outcome).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let dispatch = async move {
            let mut dispatched = 0usize;
            loop {
                let remaining = remaining(batch_limit, dispatched);
                if remaining == 0 {
                    break;
                }
                let limit = batch_size.min(remaining);
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    sent = request_tx.send(limit) => {
                        if sent.is_err() {
                            break;
                        }
                        dispatched += limit;
                    }
                }
            }
            // Dropping the sender lets idle workers exit.
            drop(request_tx);
        };

        let collect = async {
            let mut run = DeliveryStats::default();
            let mut first_error = None;
            while let Some(result) = result_rx.recv().await {
                match result {
                    Ok(batch) => run += batch.stats,
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            (run, first_error)
        };

        let ((), (run, first_error)) = tokio::join!(dispatch, collect);

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Batch worker terminated abnormally: {}", e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            "Subscriber {} parallel batch run ({} workers): {} processed, {} succeeded, {} retrying, {} failed",
            self.subscriber.code,
            workers,
            run.processed,
            run.succeeded,
            run.retrying,
            run.failed
        );
        Ok(run)
    }

    /// One locked fetch + deliver + commit pass starting after the shared
    /// cursor.
    pub async fn deliver_batch<C>(&self, callback: &C, limit: usize) -> Result<BatchOutcome>
    where
        C: DeliveryCallback + ?Sized,
    {
        let mut tx = self.store.begin().await?;
        match self
            .deliver_in_transaction(tx.as_mut(), callback, limit)
            .await
        {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Failed to roll back batch transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn deliver_in_transaction<C>(
        &self,
        tx: &mut dyn StoreTransaction,
        callback: &C,
        limit: usize,
    ) -> Result<BatchOutcome>
    where
        C: DeliveryCallback + ?Sized,
    {
        let (after_id, claimed) = self.claim(tx, limit).await?;
        if claimed.is_empty() {
            return Ok(BatchOutcome {
                max_id: after_id,
                ..BatchOutcome::default()
            });
        }

        let retrieved = claimed.len();
        let max_id = claimed
            .iter()
            .filter_map(|c| c.replica.id)
            .max()
            .unwrap_or(after_id);

        let mut events: Vec<Event> = claimed
            .iter()
            .map(|c| Event::from_claimed(&c.replica, c.source.as_ref()))
            .collect();

        debug!(
            "Pushing {} events for subscriber {} (ids {}..={})",
            retrieved, self.subscriber.code, after_id, max_id
        );
        let error = match callback.push(&mut events).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    "Delivery of {} events for subscriber {} failed: {:#}",
                    retrieved, self.subscriber.code, e
                );
                Some(format!("{e:#}"))
            }
        };

        let events_by_replica: HashMap<i64, &Event> = events
            .iter()
            .filter_map(|event| event.replica_id.map(|id| (id, event)))
            .collect();

        let mut committer = BulkStatusCommitter::new(self.commit_chunk_size);
        let mut stats = DeliveryStats::default();
        for (position, claimed) in claimed.into_iter().enumerate() {
            let mut replica = claimed.replica;
            let event = replica
                .id
                .and_then(|id| events_by_replica.get(&id).copied())
                .unwrap_or(&events[position]);
            let outcome = apply_delivery_result(
                &mut replica,
                event,
                error.as_deref().map_or(Ok(()), Err),
                self.subscriber.retries,
            );
            stats.record(outcome);
            committer.add(replica)?;
        }
        committer.flush(tx).await?;

        Ok(BatchOutcome {
            retrieved,
            max_id,
            stats,
        })
    }

    /// Fetch pending rows past the cursor and advance it to the greatest
    /// claimed id before anything is delivered.
    ///
    /// The cursor stays locked across the fetch, so every pass of a run
    /// starts past all rows claimed before it. A row is retrieved at most once
    /// per run even when an earlier pass commits it back as pending.
    async fn claim(
        &self,
        tx: &mut dyn StoreTransaction,
        limit: usize,
    ) -> Result<(i64, Vec<ClaimedReplica>)> {
        let mut state = self.state.lock().await;
        let after_id = state.last_seen_id;
        let claimed = tx
            .fetch_pending(self.subscriber.id, after_id, limit)
            .await?;
        if let Some(max_id) = claimed.iter().filter_map(|c| c.replica.id).max() {
            state.last_seen_id = state.last_seen_id.max(max_id);
        }
        Ok((after_id, claimed))
    }

    async fn reset_cursor(&self) {
        self.state.lock().await.last_seen_id = 0;
    }

    async fn record_batch(&self, outcome: &BatchOutcome) {
        self.state.lock().await.totals += outcome.stats;
    }

    pub(crate) async fn record_outcome(&self, outcome: DeliveryOutcome) {
        self.state.lock().await.totals.record(outcome);
    }
}

fn remaining(limit: usize, done: usize) -> usize {
    if limit == 0 {
        usize::MAX
    } else {
        limit.saturating_sub(done)
    }
}
