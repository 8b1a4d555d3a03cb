//! Bulk import of JSON-lines records into the data table.
//!
//! Each line is one record:
//!
//! ```json
//! {"type": "order", "id": "1", "deleted": false, "payload": {"total": 10}}
//! ```
//!
//! A string payload is stored as its UTF-8 bytes, any other JSON value as its
//! serialized form. Records are written through a `BatchPublisher`; a key seen
//! twice within one batch flushes the batch first so the later record wins.

use std::sync::Arc;

use anyhow::Context;
use pgpubsub_core::{BatchPublisher, DataKey, PubSubError, PubSubStore, PublishRequest};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct ImportRecord {
    #[serde(rename = "type")]
    pub data_type: String,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl ImportRecord {
    pub fn into_request(self, publisher_id: i64) -> anyhow::Result<PublishRequest> {
        let payload = match self.payload {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(text)) => Some(text.into_bytes()),
            Some(value) => Some(serde_json::to_vec(&value)?),
        };
        Ok(PublishRequest::new(
            DataKey::new(publisher_id, self.data_type, self.id),
            self.deleted,
            payload,
        ))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub lines: u64,
    pub published: u64,
}

/// Publish every record read from `reader` for the given publisher.
pub async fn import_jsonl<S, R>(
    store: Arc<S>,
    publisher_id: i64,
    reader: R,
    batch_size: usize,
) -> anyhow::Result<ImportSummary>
where
    S: PubSubStore,
    R: AsyncBufRead + Unpin,
{
    let mut publisher = BatchPublisher::new(store, batch_size);
    let mut lines = reader.lines();
    let mut summary = ImportSummary::default();

    while let Some(line) = lines.next_line().await? {
        summary.lines += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: ImportRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid record on line {}", summary.lines))?;
        let request = record
            .into_request(publisher_id)
            .with_context(|| format!("Invalid payload on line {}", summary.lines))?;

        match publisher.add(request.clone()).await {
            Ok(_) => {}
            Err(PubSubError::DuplicatePendingRecord(key)) => {
                debug!("Key {} repeated within a batch, flushing early", key);
                publisher.flush().await?;
                publisher.add(request).await?;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to publish line {}", summary.lines))
            }
        }
    }

    publisher.flush().await?;
    summary.published = publisher.published();
    info!(
        "Imported {} records from {} lines",
        summary.published, summary.lines
    );
    Ok(summary)
}
