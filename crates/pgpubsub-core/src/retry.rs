//! Status transition applied to a replica after a delivery attempt.
//!
//! Shared by the batch engine and the notification listener.

use chrono::Utc;

use crate::event::Event;
use crate::model::{Replica, ReplicaStatus};

/// What happened to a replica after one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    /// Failed, left pending for another attempt.
    Retrying,
    /// Failed and out of attempts; needs a newer version to be re-armed.
    Failed,
}

/// Apply a delivery result to the replica row.
///
/// On success the row takes the delivered version, deleted flag, hash and
/// payload. On failure the attempt counter grows until it reaches
/// `max_attempts`, at which point the row is parked as failed and the
/// counter resets.
pub fn apply_delivery_result(
    replica: &mut Replica,
    event: &Event,
    result: Result<(), &str>,
    max_attempts: i32,
) -> DeliveryOutcome {
    replica.updated_at = Utc::now();
    match result {
        Ok(()) => {
            replica.status = ReplicaStatus::Completed;
            replica.hash = event.new_hash.clone();
            replica.payload = event.new_payload.clone();
            replica.version = event.version;
            replica.deleted = event.deleted;
            replica.retries = 0;
            replica.message = None;
            DeliveryOutcome::Completed
        }
        Err(message) => {
            replica.message = Some(message.to_string());
            let attempts = replica.retries.saturating_add(1);
            if attempts < max_attempts {
                replica.status = ReplicaStatus::Pending;
                replica.retries = attempts;
                DeliveryOutcome::Retrying
            } else {
                replica.status = ReplicaStatus::Failed;
                replica.retries = 0;
                DeliveryOutcome::Failed
            }
        }
    }
}
