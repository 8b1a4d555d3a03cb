//! Delivery events and the injected transport traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PubSubError, Result};
use crate::model::{DataKey, Replica};
use crate::store::DataSnapshot;

/// One delivery attempt for one replica row.
///
/// Built from a claimed replica (batch path) or from a notification (listener
/// path). `replica_id` and the event's position in the batch tie the outcome
/// back to the row that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub key: DataKey,
    pub deleted: bool,
    pub version: i64,
    /// Hash of the last successful delivery of this key to this subscriber.
    pub previous_hash: String,
    /// Set by the transport on successful delivery.
    pub new_hash: String,
    pub new_payload: Option<Vec<u8>>,
    pub replica_id: Option<i64>,
    /// Last delivery error recorded on the replica, if any.
    pub error: Option<String>,
}

impl Event {
    /// Event for a claimed replica row. The current data item, when present,
    /// supplies the version and payload to deliver.
    pub fn from_claimed(replica: &Replica, source: Option<&DataSnapshot>) -> Self {
        let (deleted, version, payload) = match source {
            Some(snapshot) => (
                snapshot.deleted,
                snapshot.version.max(replica.version),
                snapshot.payload.clone(),
            ),
            None => (replica.deleted, replica.version, None),
        };
        Self {
            key: replica.key.clone(),
            deleted,
            version,
            previous_hash: replica.hash.clone(),
            new_hash: String::new(),
            new_payload: payload,
            replica_id: replica.id,
            error: replica.message.clone(),
        }
    }

    pub fn from_notification(notification: &Notification, replica: &Replica) -> Self {
        Self {
            key: notification.key(),
            deleted: notification.deleted,
            version: notification.version,
            previous_hash: replica.hash.clone(),
            new_hash: String::new(),
            new_payload: None,
            replica_id: replica.id,
            error: replica.message.clone(),
        }
    }
}

/// Result of a successful single-event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivered {
    pub hash: String,
    pub payload: Option<Vec<u8>>,
}

/// Batch transport used by the batch delivery engine.
///
/// The returned error applies to every event in the batch: a transport
/// failure is not attributed to individual records. On success the
/// implementation sets `new_hash` (and may replace `new_payload`) on each event.
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    async fn push(&self, events: &mut [Event]) -> anyhow::Result<()>;
}

/// Single-event transport used by the notification listener.
#[async_trait]
pub trait DeliveryListener: Send + Sync {
    async fn send(&self, event: &Event) -> anyhow::Result<Delivered>;
}

/// Payload of a data change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "pubId")]
    pub publisher_id: i64,
    #[serde(rename = "dataType")]
    pub data_type: String,
    #[serde(rename = "dataId")]
    pub data_id: String,
    pub deleted: bool,
    pub version: i64,
}

impl Notification {
    pub fn decode(payload: &str) -> Result<Self> {
        let notification: Notification = serde_json::from_str(payload).map_err(|e| {
            PubSubError::Validation(format!("Malformed notification payload '{payload}': {e}"))
        })?;
        if notification.data_type.is_empty() || notification.data_id.is_empty() {
            return Err(PubSubError::Validation(format!(
                "Notification without data type or id: '{payload}'"
            )));
        }
        Ok(notification)
    }

    pub fn encode(&self) -> String {
        // Plain struct of strings, integers and bools.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn key(&self) -> DataKey {
        DataKey::new(self.publisher_id, &self.data_type, &self.data_id)
    }
}
