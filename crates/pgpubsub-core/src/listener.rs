//! Real-time notification listener.
//!
//! Processes change notifications one at a time, in arrival order. Each
//! notification runs in its own transaction: lock (or synthesize) the replica,
//! drop stale versions, deliver through the `DeliveryListener`, apply the
//! retry rule and upsert the row.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::engine::{DeliveryStats, SubscriberEngine};
use crate::error::Result;
use crate::event::{DeliveryListener, Event, Notification};
use crate::model::Replica;
use crate::retry::{apply_delivery_result, DeliveryOutcome};
use crate::store::{NotificationSource, PubSubStore, StoreTransaction};

/// What the listener did with one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// The publisher is not linked to this subscriber.
    Unlinked,
    /// The stored replica already has this version or a newer one.
    Stale,
    Delivered(DeliveryOutcome),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenStats {
    pub received: u64,
    pub malformed: u64,
    pub ignored: u64,
    pub delivery: DeliveryStats,
}

impl ListenStats {
    fn record(&mut self, outcome: NotificationOutcome) {
        match outcome {
            NotificationOutcome::Unlinked | NotificationOutcome::Stale => self.ignored += 1,
            NotificationOutcome::Delivered(delivery) => self.delivery.record(delivery),
        }
    }
}

impl<S: PubSubStore> SubscriberEngine<S> {
    /// Consume notifications until the source is closed.
    ///
    /// An inactive subscriber closes the source and returns empty stats.
    /// The set of linked publishers is read once when listening starts.
    /// Database and connection errors close the source and end the loop;
    /// the caller is expected to restart it.
    pub async fn listen<N, L>(&self, source: &mut N, listener: &L) -> Result<ListenStats>
    where
        N: NotificationSource + ?Sized,
        L: DeliveryListener + ?Sized,
    {
        if !self.subscriber.is_active() {
            warn!(
                "Subscriber {} is inactive, not listening for changes",
                self.subscriber.code
            );
            source.close();
            return Ok(ListenStats::default());
        }

        let linked: HashSet<i64> = match self
            .store
            .publishers_for_subscriber(self.subscriber.id)
            .await
        {
            Ok(publishers) => publishers.into_iter().map(|p| p.id).collect(),
            Err(e) => {
                source.close();
                return Err(e);
            }
        };
        info!(
            "Subscriber {} listening for changes from {} publisher(s)",
            self.subscriber.code,
            linked.len()
        );

        let mut stats = ListenStats::default();
        loop {
            let payload = match source.next_payload().await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    info!("Notification source closed for subscriber {}", self.subscriber.code);
                    break;
                }
                Err(e) => {
                    source.close();
                    return Err(e);
                }
            };
            stats.received += 1;

            let notification = match Notification::decode(&payload) {
                Ok(notification) => notification,
                Err(e) => {
                    warn!("Skipping notification: {}", e);
                    stats.malformed += 1;
                    continue;
                }
            };

            match self
                .handle_notification(&notification, &linked, listener)
                .await
            {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    source.close();
                    return Err(e);
                }
            }
        }

        Ok(stats)
    }

    /// Apply one decoded notification in its own transaction.
    pub async fn handle_notification<L>(
        &self,
        notification: &Notification,
        linked_publishers: &HashSet<i64>,
        listener: &L,
    ) -> Result<NotificationOutcome>
    where
        L: DeliveryListener + ?Sized,
    {
        if !linked_publishers.contains(&notification.publisher_id) {
            debug!(
                "Ignoring notification for unlinked publisher {}",
                notification.publisher_id
            );
            return Ok(NotificationOutcome::Unlinked);
        }

        let mut tx = self.store.begin().await?;
        match self
            .apply_notification(tx.as_mut(), notification, listener)
            .await
        {
            Ok(Some(outcome)) => {
                tx.commit().await?;
                self.record_outcome(outcome).await;
                Ok(NotificationOutcome::Delivered(outcome))
            }
            Ok(None) => {
                tx.rollback().await?;
                Ok(NotificationOutcome::Stale)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Failed to roll back notification transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn apply_notification<L>(
        &self,
        tx: &mut dyn StoreTransaction,
        notification: &Notification,
        listener: &L,
    ) -> Result<Option<DeliveryOutcome>>
    where
        L: DeliveryListener + ?Sized,
    {
        let key = notification.key();
        let mut replica = match tx.lock_replica(self.subscriber.id, &key).await? {
            Some(replica) => replica,
            None => Replica::placeholder(self.subscriber.id, key.clone()),
        };

        if notification.version <= replica.version {
            debug!(
                "Ignoring notification for {} at version {} (stored version {})",
                key, notification.version, replica.version
            );
            return Ok(None);
        }

        let mut event = Event::from_notification(notification, &replica);
        event.new_payload = tx.data_snapshot(&key).await?.and_then(|s| s.payload);

        let error = match listener.send(&event).await {
            Ok(delivered) => {
                event.new_hash = delivered.hash;
                event.new_payload = delivered.payload;
                None
            }
            Err(e) => {
                warn!("Delivery of {} version {} failed: {:#}", key, event.version, e);
                Some(format!("{e:#}"))
            }
        };

        let outcome = apply_delivery_result(
            &mut replica,
            &event,
            error.as_deref().map_or(Ok(()), Err),
            self.subscriber.retries,
        );
        tx.upsert_replica(&replica).await?;
        debug!("Notification for {} version {}: {:?}", key, event.version, outcome);
        Ok(Some(outcome))
    }
}
