//! Fixed-size set of connections handed out one transaction at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pgpubsub_core::error::{PubSubError, Result};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use crate::error::{PgConfigError, PgResultExt};

pub struct PgPool {
    clients: Vec<Arc<Mutex<Client>>>,
    next: AtomicUsize,
}

impl PgPool {
    /// Open `size` connections to `database_url`.
    pub async fn connect(database_url: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PgConfigError::EmptyPool.into());
        }

        let mut clients = Vec::with_capacity(size);
        for _ in 0..size {
            clients.push(connect_client(database_url).await?);
        }
        info!("Opened {} PostgreSQL connection(s)", size);
        Self::from_clients(clients)
    }

    pub fn from_clients(clients: Vec<Client>) -> Result<Self> {
        if clients.is_empty() {
            return Err(PgConfigError::EmptyPool.into());
        }
        Ok(Self {
            clients: clients
                .into_iter()
                .map(|client| Arc::new(Mutex::new(client)))
                .collect(),
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    /// Take exclusive use of a connection. An idle one is preferred; when all
    /// are busy the caller queues on the next one in turn.
    pub async fn acquire(&self) -> OwnedMutexGuard<Client> {
        for client in &self.clients {
            if let Ok(guard) = Arc::clone(client).try_lock_owned() {
                return guard;
            }
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Arc::clone(&self.clients[index]).lock_owned().await
    }
}

/// Connect and spawn the task driving the connection.
pub async fn connect_client(database_url: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(|e| PubSubError::Connection(format!("Failed to connect to PostgreSQL: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });

    Ok(client)
}

/// Run `sql` on a fresh statement and ignore its rows.
pub(crate) async fn execute_batch(client: &Client, sql: &str) -> Result<()> {
    client.batch_execute(sql).await.db()
}
