//! Database-backed publish/subscribe delivery engine.
//!
//! Publishers upsert versioned data items; every subscriber linked to a
//! publisher gets a replica row per item and receives each change at least
//! once, either through locked polling batches (`SubscriberEngine::run_batch`
//! and `run_batch_parallel`) or through change notifications
//! (`SubscriberEngine::listen`).
//!
//! Storage is reached through the `PubSubStore` trait. This crate ships the
//! in-memory backend; the PostgreSQL backend lives in `pgpubsub-postgresql`.

pub mod commit;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod listener;
pub mod memory;
pub mod model;
pub mod publish;
pub mod retry;
pub mod store;

pub use commit::BulkStatusCommitter;
pub use config::EngineConfig;
pub use engine::{BatchOutcome, DeliveryStats, SubscriberEngine};
pub use error::{PubSubError, Result};
pub use event::{Delivered, DeliveryCallback, DeliveryListener, Event, Notification};
pub use listener::{ListenStats, NotificationOutcome};
pub use memory::{MemoryNotificationSource, MemoryStore};
pub use model::{
    DataItem, DataKey, EntityStatus, PublishRequest, Publisher, Replica, ReplicaStatus,
    Subscriber,
};
pub use publish::{publish, BatchPublisher};
pub use retry::{apply_delivery_result, DeliveryOutcome};
pub use store::{
    ClaimedReplica, DataSnapshot, NotificationSource, PubSubStore, ReconcileOutcome,
    StoreTransaction,
};
