//! Bulk status committer.
//!
//! Collects updated replica rows and writes them with as few multi-row
//! UPDATE statements as the chunk size allows.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{PubSubError, Result};
use crate::model::Replica;
use crate::store::StoreTransaction;

/// Default number of rows per UPDATE statement.
pub const DEFAULT_COMMIT_CHUNK_SIZE: usize = 500;

pub struct BulkStatusCommitter {
    chunk_size: usize,
    rows: Vec<Replica>,
    // replica id -> position in `rows`
    positions: HashMap<i64, usize>,
}

impl BulkStatusCommitter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            rows: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Queue a persisted row. A later update of the same row replaces the
    /// earlier one.
    pub fn add(&mut self, replica: Replica) -> Result<()> {
        let id = replica.id.ok_or_else(|| {
            PubSubError::Validation(format!(
                "Replica for {} has not been persisted and cannot be bulk updated",
                replica.key
            ))
        })?;
        match self.positions.get(&id) {
            Some(&position) => self.rows[position] = replica,
            None => {
                self.positions.insert(id, self.rows.len());
                self.rows.push(replica);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write every queued row inside the caller's transaction.
    pub async fn flush(&mut self, tx: &mut dyn StoreTransaction) -> Result<u64> {
        if self.rows.is_empty() {
            return Ok(0);
        }

        let mut updated = 0;
        for chunk in self.rows.chunks(self.chunk_size) {
            updated += tx.bulk_update_replicas(chunk).await?;
        }
        debug!(
            "Committed {} replica status updates in {} statement(s)",
            self.rows.len(),
            self.rows.len().div_ceil(self.chunk_size)
        );

        self.rows.clear();
        self.positions.clear();
        Ok(updated)
    }
}

impl Default for BulkStatusCommitter {
    fn default() -> Self {
        Self::new(DEFAULT_COMMIT_CHUNK_SIZE)
    }
}
