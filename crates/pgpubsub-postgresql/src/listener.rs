//! LISTEN-based notification source.
//!
//! Uses a dedicated connection. A driver task polls the connection and
//! forwards notifications for the channel; a keep-alive task runs
//! `SELECT 1` on a fixed interval so dead connections are noticed even when
//! no changes are published. Either task reports failures on a separate
//! channel, which ends the stream with `PubSubError::Connection`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use pgpubsub_core::error::{PubSubError, Result};
use pgpubsub_core::store::NotificationSource;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PgResultExt;
use crate::schema::validate_channel;

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(1);

pub struct PgNotificationSource {
    channel: String,
    notifications: mpsc::UnboundedReceiver<String>,
    failures: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PgNotificationSource {
    /// Connect, start the background tasks and `LISTEN` on `channel`.
    pub async fn connect(
        database_url: &str,
        channel: &str,
        keep_alive: Duration,
    ) -> Result<Self> {
        validate_channel(channel)?;

        let (client, mut connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| {
                PubSubError::Connection(format!("Failed to open listening connection: {e}"))
            })?;
        let client = Arc::new(client);

        let shutdown = CancellationToken::new();
        let (notification_tx, notifications) = mpsc::unbounded_channel();
        let (failure_tx, failures) = mpsc::unbounded_channel();

        let driver = {
            let shutdown = shutdown.clone();
            let failure_tx = failure_tx.clone();
            let channel = channel.to_string();
            tokio::spawn(async move {
                let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        message = messages.next() => match message {
                            Some(Ok(AsyncMessage::Notification(notification))) => {
                                if notification.channel() != channel {
                                    continue;
                                }
                                if notification_tx.send(notification.payload().to_string()).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(AsyncMessage::Notice(notice))) => {
                                debug!("PostgreSQL notice: {}", notice.message());
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("Listening connection error: {e}");
                                let _ = failure_tx.send(format!("listening connection failed: {e}"));
                                break;
                            }
                            None => {
                                let _ = failure_tx.send("listening connection closed".to_string());
                                break;
                            }
                        },
                    }
                }
            })
        };

        let keep_alive_task = {
            let shutdown = shutdown.clone();
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(keep_alive.max(MIN_KEEP_ALIVE));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately.
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = client.simple_query("SELECT 1").await {
                                warn!("Keep-alive query failed: {e}");
                                let _ = failure_tx.send(format!("keep-alive failed: {e}"));
                                break;
                            }
                        }
                    }
                }
            })
        };

        let mut source = Self {
            channel: channel.to_string(),
            notifications,
            failures,
            shutdown,
            tasks: vec![driver, keep_alive_task],
        };

        if let Err(e) = client.batch_execute(&format!("LISTEN {channel}")).await.db() {
            source.close();
            return Err(e);
        }
        info!("Listening on channel '{}'", channel);
        Ok(source)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn failure(&mut self) -> PubSubError {
        let reason = self
            .failures
            .try_recv()
            .unwrap_or_else(|_| "notification stream ended".to_string());
        PubSubError::Connection(reason)
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn next_payload(&mut self) -> Result<Option<String>> {
        if self.shutdown.is_cancelled() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Ok(None),
            payload = self.notifications.recv() => match payload {
                Some(payload) => Ok(Some(payload)),
                None => Err(self.failure()),
            },
            Some(reason) = self.failures.recv() => Err(PubSubError::Connection(reason)),
        }
    }

    fn close(&mut self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing listener on channel '{}'", self.channel);
        }
        self.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }

    fn close_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Drop for PgNotificationSource {
    fn drop(&mut self) {
        self.close();
    }
}
