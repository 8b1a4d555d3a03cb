//! Publisher, subscriber, data item and replica records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PubSubError;

/// Administrative status shared by publishers and subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Active,
    Inactive,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityStatus {
    type Err = PubSubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EntityStatus::Active),
            "inactive" => Ok(EntityStatus::Inactive),
            other => Err(PubSubError::Validation(format!(
                "Unknown status '{other}', expected 'active' or 'inactive'"
            ))),
        }
    }
}

/// Delivery state of a subscriber replica row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Pending,
    Failed,
    Completed,
}

impl ReplicaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaStatus::Pending => "pending",
            ReplicaStatus::Failed => "failed",
            ReplicaStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaStatus {
    type Err = PubSubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReplicaStatus::Pending),
            "failed" => Ok(ReplicaStatus::Failed),
            "completed" => Ok(ReplicaStatus::Completed),
            other => Err(PubSubError::Validation(format!(
                "Unknown replica status '{other}'"
            ))),
        }
    }
}

/// Source of versioned data items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub status: EntityStatus,
}

impl Publisher {
    pub fn is_active(&self) -> bool {
        self.status == EntityStatus::Active
    }
}

/// Consumer of data items with a per-item delivery attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub status: EntityStatus,
    /// Maximum delivery attempts per item before it is parked as failed.
    pub retries: i32,
}

impl Subscriber {
    pub fn is_active(&self) -> bool {
        self.status == EntityStatus::Active
    }
}

/// Primary key of a data item: (publisher, type, id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataKey {
    pub publisher_id: i64,
    pub data_type: String,
    pub data_id: String,
}

impl DataKey {
    pub fn new(publisher_id: i64, data_type: impl Into<String>, data_id: impl Into<String>) -> Self {
        Self {
            publisher_id,
            data_type: data_type.into(),
            data_id: data_id.into(),
        }
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.publisher_id, self.data_type, self.data_id)
    }
}

/// A publisher's versioned record of one logical object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    pub key: DataKey,
    pub deleted: bool,
    pub version: i64,
    pub payload: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub key: DataKey,
    pub deleted: bool,
    pub payload: Option<Vec<u8>>,
}

impl PublishRequest {
    pub fn new(key: DataKey, deleted: bool, payload: Option<Vec<u8>>) -> Self {
        Self {
            key,
            deleted,
            payload,
        }
    }

    /// Rejects requests with an empty type or id.
    pub fn validate(&self) -> Result<(), PubSubError> {
        if self.key.data_type.is_empty() {
            return Err(PubSubError::Validation(
                "data type must not be empty".to_string(),
            ));
        }
        if self.key.data_id.is_empty() {
            return Err(PubSubError::Validation(
                "data id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-subscriber delivery tracking row for one data item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Surrogate ascending id used as the delivery cursor. `None` until persisted.
    pub id: Option<i64>,
    pub subscriber_id: i64,
    pub key: DataKey,
    pub deleted: bool,
    pub version: i64,
    pub status: ReplicaStatus,
    /// Content hash of the last successful delivery.
    pub hash: String,
    pub payload: Option<Vec<u8>>,
    /// Failed attempts since the row was last armed.
    pub retries: i32,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Replica {
    /// Unsaved row for a key the subscriber has never seen. Version 0 sorts
    /// below every published version.
    pub fn placeholder(subscriber_id: i64, key: DataKey) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            subscriber_id,
            key,
            deleted: false,
            version: 0,
            status: ReplicaStatus::Pending,
            hash: String::new(),
            payload: None,
            retries: 0,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}
