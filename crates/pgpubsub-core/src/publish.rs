//! Publishing data items.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{PubSubError, Result};
use crate::model::{DataKey, PublishRequest};
use crate::store::PubSubStore;

/// Default number of records per multi-row upsert.
pub const DEFAULT_PUBLISH_BATCH_SIZE: usize = 100;

/// Upsert one data item and return its new version.
///
/// The version is bumped on every call, including when the payload is
/// byte-identical to the stored one.
pub async fn publish<S: PubSubStore + ?Sized>(store: &S, request: &PublishRequest) -> Result<i64> {
    request.validate()?;
    let version = store.upsert_data_item(request).await?;
    debug!("Published {} at version {}", request.key, version);
    Ok(version)
}

/// Accumulates publish requests and writes them as one multi-row upsert.
///
/// The batch is flushed once it reaches `batch_size` records or when
/// `flush` is called.
pub struct BatchPublisher<S: PubSubStore + ?Sized> {
    store: Arc<S>,
    batch_size: usize,
    pending: Vec<PublishRequest>,
    pending_keys: HashSet<DataKey>,
    published: u64,
}

impl<S: PubSubStore + ?Sized> BatchPublisher<S> {
    pub fn new(store: Arc<S>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            pending_keys: HashSet::new(),
            published: 0,
        }
    }

    /// Queue a record. Returns the versions written when this call triggered
    /// a flush, an empty vector otherwise.
    pub async fn add(&mut self, request: PublishRequest) -> Result<Vec<i64>> {
        request.validate()?;
        if self.pending_keys.contains(&request.key) {
            return Err(PubSubError::DuplicatePendingRecord(request.key));
        }

        self.pending_keys.insert(request.key.clone());
        self.pending.push(request);

        if self.pending.len() >= self.batch_size {
            return self.flush().await;
        }
        Ok(Vec::new())
    }

    /// Write all pending records. On error the pending batch is kept so the
    /// caller may retry the flush.
    pub async fn flush(&mut self) -> Result<Vec<i64>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let versions = self.store.upsert_data_items(&self.pending).await?;
        info!("Flushed {} published records", self.pending.len());

        self.published += self.pending.len() as u64;
        self.pending.clear();
        self.pending_keys.clear();
        Ok(versions)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Records written by this publisher so far.
    pub fn published(&self) -> u64 {
        self.published
    }
}
