//! Notification listening with reconnects.
//!
//! A listening session ends when its connection drops. Connection and
//! database failures are retried after a capped exponential backoff; any
//! other error (an unknown subscriber, an invalid channel) is returned.

use std::future::Future;
use std::time::Duration;

use pgpubsub_core::{
    DeliveryListener, ListenStats, NotificationSource, PubSubError, PubSubStore, SubscriberEngine,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt. Doubles on every call up to `max`.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn is_retryable(err: &PubSubError) -> bool {
    matches!(err, PubSubError::Connection(_) | PubSubError::Database(_))
}

fn accumulate(total: &mut ListenStats, session: ListenStats) {
    total.received += session.received;
    total.malformed += session.malformed;
    total.ignored += session.ignored;
    total.delivery += session.delivery;
}

/// Returns true when shutdown was requested before the delay elapsed.
async fn wait(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Listen for `engine`'s subscriber until `shutdown` is cancelled.
///
/// `connect` opens a fresh notification source for every session. Statistics
/// are summed over the sessions that ended cleanly.
pub async fn listen_with_reconnect<S, L, N, F, Fut>(
    engine: &SubscriberEngine<S>,
    listener: &L,
    mut connect: F,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) -> anyhow::Result<ListenStats>
where
    S: PubSubStore,
    L: DeliveryListener + ?Sized,
    N: NotificationSource,
    F: FnMut() -> Fut,
    Fut: Future<Output = pgpubsub_core::Result<N>>,
{
    let code = engine.subscriber().code.clone();
    let mut total = ListenStats::default();
    if !engine.subscriber().is_active() {
        warn!("Subscriber {} is inactive, not listening", code);
        return Ok(total);
    }

    while !shutdown.is_cancelled() {
        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            connected = connect() => connected,
        };

        let mut source = match connected {
            Ok(source) => {
                backoff.reset();
                source
            }
            Err(e) if is_retryable(&e) => {
                let delay = backoff.next();
                warn!("Subscriber {} failed to connect: {}. Retrying in {:?}", code, e, delay);
                if wait(delay, &shutdown).await {
                    break;
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let close = source.close_handle();
        let result = {
            let session = engine.listen(&mut source, listener);
            tokio::pin!(session);
            tokio::select! {
                result = &mut session => result,
                _ = shutdown.cancelled() => {
                    close.cancel();
                    session.await
                }
            }
        };

        match result {
            Ok(stats) => {
                accumulate(&mut total, stats);
                if !shutdown.is_cancelled() {
                    info!("Notification source for subscriber {} closed, reconnecting", code);
                }
            }
            Err(e) if is_retryable(&e) => {
                let delay = backoff.next();
                warn!("Subscriber {} lost its listener: {}. Reconnecting in {:?}", code, e, delay);
                if wait(delay, &shutdown).await {
                    break;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        "Subscriber {} stopped listening: {} notification(s), {} delivered, {} ignored",
        code, total.received, total.delivery.succeeded, total.ignored
    );
    Ok(total)
}
