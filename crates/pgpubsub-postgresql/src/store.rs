//! `PubSubStore` backed by PostgreSQL.
//!
//! Transactions own one pooled connection for their whole lifetime and are
//! driven with explicit `BEGIN` / `COMMIT` / `ROLLBACK`. A transaction dropped
//! without being finished is rolled back on a background task.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgpubsub_core::error::{PubSubError, Result};
use pgpubsub_core::model::{
    DataItem, DataKey, EntityStatus, PublishRequest, Publisher, Replica, ReplicaStatus,
    Subscriber,
};
use pgpubsub_core::store::{
    ClaimedReplica, DataSnapshot, PubSubStore, ReconcileOutcome, StoreTransaction,
};
use tokio::sync::OwnedMutexGuard;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};
use tracing::{debug, info, warn};

use crate::error::{is_foreign_key_violation, is_unique_violation, PgResultExt};
use crate::pool::PgPool;
use crate::schema::{self, PUBLISHER_TABLE, SUBSCRIBER_TABLE};
use crate::sql;

type Param = Box<dyn ToSql + Sync + Send>;

fn param_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn publisher_from_row(row: &Row) -> Result<Publisher> {
    let status: String = row.try_get("status").db()?;
    Ok(Publisher {
        id: row.try_get("id").db()?,
        code: row.try_get("code").db()?,
        name: row.try_get("name").db()?,
        status: status.parse()?,
    })
}

fn subscriber_from_row(row: &Row) -> Result<Subscriber> {
    let status: String = row.try_get("status").db()?;
    Ok(Subscriber {
        id: row.try_get("id").db()?,
        code: row.try_get("code").db()?,
        name: row.try_get("name").db()?,
        status: status.parse()?,
        retries: row.try_get("retries").db()?,
    })
}

fn replica_from_row(row: &Row) -> Result<Replica> {
    let status: String = row.try_get("status").db()?;
    let created_at: DateTime<Utc> = row.try_get("created_at").db()?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").db()?;
    Ok(Replica {
        id: Some(row.try_get("id").db()?),
        subscriber_id: row.try_get("sub_id").db()?,
        key: DataKey::new(
            row.try_get::<_, i64>("pub_id").db()?,
            row.try_get::<_, String>("data_type").db()?,
            row.try_get::<_, String>("data_id").db()?,
        ),
        deleted: row.try_get("deleted").db()?,
        version: row.try_get("version").db()?,
        status: status.parse::<ReplicaStatus>()?,
        hash: row.try_get("hash").db()?,
        payload: row.try_get("payload").db()?,
        retries: row.try_get("retries").db()?,
        message: row.try_get("message").db()?,
        created_at,
        updated_at,
    })
}

fn data_item_from_row(row: &Row) -> Result<DataItem> {
    Ok(DataItem {
        key: DataKey::new(
            row.try_get::<_, i64>("pub_id").db()?,
            row.try_get::<_, String>("data_type").db()?,
            row.try_get::<_, String>("data_id").db()?,
        ),
        deleted: row.try_get("deleted").db()?,
        version: row.try_get("version").db()?,
        payload: row.try_get("payload").db()?,
        created_at: row.try_get("created_at").db()?,
        updated_at: row.try_get("updated_at").db()?,
    })
}

fn claimed_from_row(row: &Row) -> Result<ClaimedReplica> {
    let replica = replica_from_row(row)?;
    let source = match row.try_get::<_, Option<i64>>("data_version").db()? {
        Some(version) => Some(DataSnapshot {
            deleted: row.try_get("data_deleted").db()?,
            version,
            payload: row.try_get("data_payload").db()?,
        }),
        None => None,
    };
    Ok(ClaimedReplica { replica, source })
}

fn publish_failure(err: tokio_postgres::Error, publisher_id: i64) -> PubSubError {
    if is_foreign_key_violation(&err) {
        PubSubError::not_found("publisher", publisher_id.to_string())
    } else {
        PubSubError::database(err)
    }
}

fn registration_failure(err: tokio_postgres::Error, kind: &str, code: &str) -> PubSubError {
    if is_unique_violation(&err) {
        PubSubError::Validation(format!("{kind} code '{code}' already registered"))
    } else {
        PubSubError::database(err)
    }
}

/// PostgreSQL implementation of `PubSubStore`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open `pool_size` connections. Parallel batch runs need one connection
    /// per concurrent worker.
    pub async fn connect(database_url: &str, pool_size: usize) -> Result<Self> {
        Ok(Self::new(PgPool::connect(database_url, pool_size).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn install_schema(&self, channel: &str) -> Result<()> {
        let client = self.pool.acquire().await;
        schema::install(&client, channel).await
    }

    pub async fn uninstall_schema(&self) -> Result<()> {
        let client = self.pool.acquire().await;
        schema::uninstall(&client).await
    }

    async fn set_status(
        &self,
        table: &str,
        kind: &'static str,
        id: i64,
        status: EntityStatus,
    ) -> Result<()> {
        let client = self.pool.acquire().await;
        let updated = client
            .execute(&sql::update_status(table), &[&id, &status.as_str()])
            .await
            .db()?;
        if updated == 0 {
            return Err(PubSubError::not_found(kind, id.to_string()));
        }
        info!("Set {} {} status to {}", kind, id, status);
        Ok(())
    }
}

async fn upsert_chunk(
    client: &Client,
    requests: &[PublishRequest],
) -> Result<HashMap<DataKey, i64>> {
    let mut params: Vec<Param> = Vec::with_capacity(requests.len() * sql::DATA_UPSERT_COLUMNS);
    for request in requests {
        params.push(Box::new(request.key.publisher_id));
        params.push(Box::new(request.key.data_type.clone()));
        params.push(Box::new(request.key.data_id.clone()));
        params.push(Box::new(request.deleted));
        params.push(Box::new(request.payload.clone()));
    }

    let rows = client
        .query(&sql::upsert_data(requests.len()), &param_refs(&params))
        .await
        .map_err(|e| publish_failure(e, requests[0].key.publisher_id))?;

    rows.iter()
        .map(|row| -> Result<(DataKey, i64)> {
            let key = DataKey::new(
                row.try_get::<_, i64>("pub_id").db()?,
                row.try_get::<_, String>("data_type").db()?,
                row.try_get::<_, String>("data_id").db()?,
            );
            Ok((key, row.try_get::<_, i64>("version").db()?))
        })
        .collect()
}

#[async_trait]
impl PubSubStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let client = self.pool.acquire().await;
        client.batch_execute("BEGIN").await.db()?;
        Ok(Box::new(PgTransaction {
            client: Some(client),
        }))
    }

    async fn upsert_data_item(&self, request: &PublishRequest) -> Result<i64> {
        let versions = self.upsert_data_items(std::slice::from_ref(request)).await?;
        versions
            .into_iter()
            .next()
            .ok_or_else(|| PubSubError::Database("upsert returned no version".into()))
    }

    async fn upsert_data_items(&self, requests: &[PublishRequest]) -> Result<Vec<i64>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let mut seen = HashSet::with_capacity(requests.len());
        for request in requests {
            if !seen.insert(&request.key) {
                return Err(PubSubError::DuplicatePendingRecord(request.key.clone()));
            }
        }

        let client = self.pool.acquire().await;
        let mut versions = HashMap::with_capacity(requests.len());
        for chunk in requests.chunks(sql::max_rows(sql::DATA_UPSERT_COLUMNS)) {
            versions.extend(upsert_chunk(&client, chunk).await?);
        }
        debug!("Upserted {} data items", requests.len());

        requests
            .iter()
            .map(|request| {
                versions.get(&request.key).copied().ok_or_else(|| {
                    PubSubError::Database(format!("no version returned for {}", request.key).into())
                })
            })
            .collect()
    }

    async fn data_item(&self, key: &DataKey) -> Result<Option<DataItem>> {
        let client = self.pool.acquire().await;
        let row = client
            .query_opt(
                &sql::select_data_item(),
                &[&key.publisher_id, &key.data_type, &key.data_id],
            )
            .await
            .db()?;
        row.as_ref().map(data_item_from_row).transpose()
    }

    async fn publisher_by_code(&self, code: &str) -> Result<Publisher> {
        let client = self.pool.acquire().await;
        let row = client
            .query_opt(&sql::select_publisher_by_code(), &[&code])
            .await
            .db()?
            .ok_or_else(|| PubSubError::not_found("publisher", code))?;
        publisher_from_row(&row)
    }

    async fn subscriber_by_code(&self, code: &str) -> Result<Subscriber> {
        let client = self.pool.acquire().await;
        let row = client
            .query_opt(&sql::select_subscriber_by_code(), &[&code])
            .await
            .db()?
            .ok_or_else(|| PubSubError::not_found("subscriber", code))?;
        subscriber_from_row(&row)
    }

    async fn publishers_for_subscriber(&self, subscriber_id: i64) -> Result<Vec<Publisher>> {
        let client = self.pool.acquire().await;
        let rows = client
            .query(&sql::select_linked_publishers(), &[&subscriber_id])
            .await
            .db()?;
        rows.iter().map(publisher_from_row).collect()
    }

    async fn reconcile_replicas(&self, subscriber_id: i64) -> Result<ReconcileOutcome> {
        let mut client = self.pool.acquire().await;
        // Dropping the transaction unfinished rolls it back.
        let tx = client.transaction().await.db()?;
        let inserted = tx
            .execute(&sql::reconcile_insert(), &[&subscriber_id])
            .await
            .db()?;
        let rearmed = tx
            .execute(&sql::reconcile_rearm(), &[&subscriber_id])
            .await
            .db()?;
        tx.commit().await.db()?;
        Ok(ReconcileOutcome { inserted, rearmed })
    }

    async fn replica(&self, subscriber_id: i64, key: &DataKey) -> Result<Option<Replica>> {
        let client = self.pool.acquire().await;
        let row = client
            .query_opt(
                &sql::select_replica(),
                &[&subscriber_id, &key.publisher_id, &key.data_type, &key.data_id],
            )
            .await
            .db()?;
        row.as_ref().map(replica_from_row).transpose()
    }

    async fn register_publisher(&self, code: &str, name: &str) -> Result<Publisher> {
        let client = self.pool.acquire().await;
        let row = client
            .query_one(&sql::insert_publisher(), &[&code, &name])
            .await
            .map_err(|e| registration_failure(e, "Publisher", code))?;
        let publisher = publisher_from_row(&row)?;
        info!("Registered publisher {} ({})", publisher.code, publisher.id);
        Ok(publisher)
    }

    async fn register_subscriber(
        &self,
        code: &str,
        name: &str,
        retries: i32,
    ) -> Result<Subscriber> {
        if retries < 0 {
            return Err(PubSubError::Validation(format!(
                "Subscriber retries must not be negative, got {retries}"
            )));
        }
        let client = self.pool.acquire().await;
        let row = client
            .query_one(&sql::insert_subscriber(), &[&code, &name, &retries])
            .await
            .map_err(|e| registration_failure(e, "Subscriber", code))?;
        let subscriber = subscriber_from_row(&row)?;
        info!("Registered subscriber {} ({})", subscriber.code, subscriber.id);
        Ok(subscriber)
    }

    async fn link(&self, publisher_id: i64, subscriber_id: i64) -> Result<()> {
        let client = self.pool.acquire().await;
        client
            .execute(&sql::insert_link(), &[&publisher_id, &subscriber_id])
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    PubSubError::not_found(
                        "publisher or subscriber",
                        format!("{publisher_id}/{subscriber_id}"),
                    )
                } else {
                    PubSubError::database(e)
                }
            })?;
        info!("Linked publisher {} to subscriber {}", publisher_id, subscriber_id);
        Ok(())
    }

    async fn set_publisher_status(&self, publisher_id: i64, status: EntityStatus) -> Result<()> {
        self.set_status(PUBLISHER_TABLE, "publisher", publisher_id, status)
            .await
    }

    async fn set_subscriber_status(
        &self,
        subscriber_id: i64,
        status: EntityStatus,
    ) -> Result<()> {
        self.set_status(SUBSCRIBER_TABLE, "subscriber", subscriber_id, status)
            .await
    }
}

/// An open transaction on one pooled connection.
pub struct PgTransaction {
    client: Option<OwnedMutexGuard<Client>>,
}

impl PgTransaction {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_deref()
            .ok_or_else(|| PubSubError::Database("transaction already finished".into()))
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        match self.client.take() {
            Some(client) => client.batch_execute(statement).await.db(),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn fetch_pending(
        &mut self,
        subscriber_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ClaimedReplica>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client()?
            .query(&sql::fetch_pending(), &[&subscriber_id, &after_id, &limit])
            .await
            .db()?;
        rows.iter().map(claimed_from_row).collect()
    }

    async fn lock_replica(
        &mut self,
        subscriber_id: i64,
        key: &DataKey,
    ) -> Result<Option<Replica>> {
        let client = self.client()?;
        let params: [&(dyn ToSql + Sync); 4] =
            [&subscriber_id, &key.publisher_id, &key.data_type, &key.data_id];
        // Lock or create: a missing row is inserted first so the key is held
        // by a real row lock until this transaction ends.
        client
            .execute(&sql::insert_placeholder_replica(), &params)
            .await
            .db()?;
        let row = client
            .query_opt(&sql::lock_replica(), &params)
            .await
            .db()?;
        row.as_ref().map(replica_from_row).transpose()
    }

    async fn data_snapshot(&mut self, key: &DataKey) -> Result<Option<DataSnapshot>> {
        let row = self
            .client()?
            .query_opt(
                &sql::select_data_item(),
                &[&key.publisher_id, &key.data_type, &key.data_id],
            )
            .await
            .db()?;
        Ok(row
            .as_ref()
            .map(data_item_from_row)
            .transpose()?
            .as_ref()
            .map(DataSnapshot::from))
    }

    async fn upsert_replica(&mut self, replica: &Replica) -> Result<()> {
        let status = replica.status.as_str();
        self.client()?
            .execute(
                &sql::upsert_replica(),
                &[
                    &replica.subscriber_id,
                    &replica.key.publisher_id,
                    &replica.key.data_type,
                    &replica.key.data_id,
                    &replica.deleted,
                    &replica.version,
                    &status,
                    &replica.hash,
                    &replica.payload,
                    &replica.retries,
                    &replica.message,
                ],
            )
            .await
            .db()?;
        Ok(())
    }

    async fn bulk_update_replicas(&mut self, replicas: &[Replica]) -> Result<u64> {
        let persisted: Vec<&Replica> = replicas.iter().filter(|r| r.id.is_some()).collect();
        if persisted.is_empty() {
            return Ok(0);
        }

        let client = self.client()?;
        let mut updated = 0;
        for chunk in persisted.chunks(sql::max_rows(sql::REPLICA_UPDATE_COLUMNS)) {
            let mut params: Vec<Param> =
                Vec::with_capacity(chunk.len() * sql::REPLICA_UPDATE_COLUMNS);
            for replica in chunk {
                params.push(Box::new(replica.id));
                params.push(Box::new(replica.deleted));
                params.push(Box::new(replica.version));
                params.push(Box::new(replica.status.as_str()));
                params.push(Box::new(replica.hash.clone()));
                params.push(Box::new(replica.payload.clone()));
                params.push(Box::new(replica.retries));
                params.push(Box::new(replica.message.clone()));
            }
            updated += client
                .execute(&sql::bulk_update_replicas(chunk.len()), &param_refs(&params))
                .await
                .db()?;
        }
        Ok(updated)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        warn!("Failed to roll back abandoned transaction: {}", e);
                    }
                });
            }
            Err(_) => warn!("Transaction dropped outside a runtime, connection left in transaction"),
        }
    }
}
