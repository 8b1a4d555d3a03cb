//! JSON-lines delivery sink.
//!
//! Writes one line per delivered event to any async writer (stdout or a
//! file) and reports a SHA-256 content hash back to the engine. Payloads are
//! base64 encoded since they are opaque bytes.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use pgpubsub_core::{Delivered, DeliveryCallback, DeliveryListener, Event};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Hex SHA-256 of the payload; a missing payload hashes as empty input.
pub fn content_hash(payload: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.unwrap_or_default());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryRecord<'a> {
    subscriber: &'a str,
    pub_id: i64,
    data_type: &'a str,
    data_id: &'a str,
    version: i64,
    deleted: bool,
    hash: &'a str,
    previous_hash: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    delivered_at: String,
}

pub struct JsonlSink<W> {
    subscriber: String,
    writer: Mutex<W>,
}

impl<W> JsonlSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(subscriber: impl Into<String>, writer: W) -> Self {
        Self {
            subscriber: subscriber.into(),
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn line(&self, event: &Event, hash: &str) -> anyhow::Result<Vec<u8>> {
        let record = DeliveryRecord {
            subscriber: &self.subscriber,
            pub_id: event.key.publisher_id,
            data_type: &event.key.data_type,
            data_id: &event.key.data_id,
            version: event.version,
            deleted: event.deleted,
            hash,
            previous_hash: &event.previous_hash,
            payload: event
                .new_payload
                .as_ref()
                .map(|p| base64::engine::general_purpose::STANDARD.encode(p)),
            delivered_at: Utc::now().to_rfc3339(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        Ok(line)
    }

    async fn write(&self, buffer: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buffer).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> DeliveryCallback for JsonlSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn push(&self, events: &mut [Event]) -> anyhow::Result<()> {
        let mut buffer = Vec::new();
        let mut hashes = Vec::with_capacity(events.len());
        for event in events.iter() {
            let hash = content_hash(event.new_payload.as_deref());
            buffer.extend(self.line(event, &hash)?);
            hashes.push(hash);
        }
        // Hashes are only reported once the whole batch is written.
        self.write(&buffer).await?;
        for (event, hash) in events.iter_mut().zip(hashes) {
            event.new_hash = hash;
        }
        Ok(())
    }
}

#[async_trait]
impl<W> DeliveryListener for JsonlSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, event: &Event) -> anyhow::Result<Delivered> {
        let hash = content_hash(event.new_payload.as_deref());
        let line = self.line(event, &hash)?;
        self.write(&line).await?;
        Ok(Delivered {
            hash,
            payload: event.new_payload.clone(),
        })
    }
}
