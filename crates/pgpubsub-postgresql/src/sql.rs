//! Statement text for the PostgreSQL backend.
//!
//! Multi-row statements are built for a given row count with numbered
//! placeholders; parameters are bound row by row in column order.

use crate::schema::{DATA_TABLE, LINK_TABLE, PUBLISHER_TABLE, REPLICA_TABLE, SUBSCRIBER_TABLE};

/// Bind parameters allowed in a single statement.
pub const MAX_PARAMETERS: usize = u16::MAX as usize;

pub const DATA_UPSERT_COLUMNS: usize = 5;
pub const REPLICA_UPDATE_COLUMNS: usize = 8;

const REPLICA_COLUMNS: &str = "s.id, s.sub_id, s.pub_id, s.data_type, s.data_id, s.deleted, \
    s.version, s.status, s.hash, s.payload, s.retries, s.message, s.created_at, s.updated_at";

/// Rows that fit in one statement with `columns` parameters each.
pub fn max_rows(columns: usize) -> usize {
    MAX_PARAMETERS / columns.max(1)
}

fn placeholder_rows(rows: usize, casts: &[&str]) -> String {
    let mut param = 0;
    (0..rows)
        .map(|_| {
            let values: Vec<String> = casts
                .iter()
                .map(|cast| {
                    param += 1;
                    if cast.is_empty() {
                        format!("${param}")
                    } else {
                        format!("${param}::{cast}")
                    }
                })
                .collect();
            format!("({})", values.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Multi-row data upsert. Parameters per row: pub_id, data_type, data_id,
/// deleted, payload.
pub fn upsert_data(rows: usize) -> String {
    format!(
        "INSERT INTO {DATA_TABLE} (pub_id, data_type, data_id, deleted, payload) VALUES {} \
         ON CONFLICT (pub_id, data_type, data_id) DO UPDATE SET \
         version = {DATA_TABLE}.version + 1, \
         deleted = EXCLUDED.deleted, \
         payload = EXCLUDED.payload, \
         updated_at = NOW() \
         RETURNING pub_id, data_type, data_id, version",
        placeholder_rows(rows, &["", "", "", "", ""])
    )
}

/// Bulk replica update joined on id. Parameters per row: id, deleted,
/// version, status, hash, payload, retries, message.
pub fn bulk_update_replicas(rows: usize) -> String {
    format!(
        "UPDATE {REPLICA_TABLE} AS t SET \
         deleted = v.deleted, \
         version = v.version, \
         status = v.status, \
         hash = v.hash, \
         payload = v.payload, \
         retries = v.retries, \
         message = v.message, \
         updated_at = NOW() \
         FROM (VALUES {}) AS v (id, deleted, version, status, hash, payload, retries, message) \
         WHERE t.id = v.id",
        placeholder_rows(
            rows,
            &["bigint", "boolean", "bigint", "text", "text", "bytea", "integer", "text"]
        )
    )
}

/// Claim pending replicas past a cursor, skipping rows locked elsewhere.
/// Parameters: sub_id, after_id, limit.
pub fn fetch_pending() -> String {
    format!(
        "SELECT {REPLICA_COLUMNS}, \
         d.deleted AS data_deleted, d.version AS data_version, d.payload AS data_payload \
         FROM {REPLICA_TABLE} s \
         LEFT JOIN {DATA_TABLE} d \
         ON d.pub_id = s.pub_id AND d.data_type = s.data_type AND d.data_id = s.data_id \
         WHERE s.sub_id = $1 AND s.status = 'pending' AND s.id > $2 \
         ORDER BY s.id \
         LIMIT $3 \
         FOR UPDATE OF s SKIP LOCKED"
    )
}

/// Create a version 0 pending replica unless the key already has one, so the
/// following `lock_replica` always finds a row to lock. An uncommitted row
/// for the same key makes this wait for its transaction.
/// Parameters: sub_id, pub_id, data_type, data_id.
pub fn insert_placeholder_replica() -> String {
    format!(
        "INSERT INTO {REPLICA_TABLE} \
         (sub_id, pub_id, data_type, data_id, deleted, version, status, hash, retries) \
         VALUES ($1, $2, $3, $4, FALSE, 0, 'pending', '', 0) \
         ON CONFLICT (sub_id, pub_id, data_type, data_id) DO NOTHING"
    )
}

/// Parameters: sub_id, pub_id, data_type, data_id.
pub fn lock_replica() -> String {
    format!(
        "SELECT {REPLICA_COLUMNS} FROM {REPLICA_TABLE} s \
         WHERE s.sub_id = $1 AND s.pub_id = $2 AND s.data_type = $3 AND s.data_id = $4 \
         FOR UPDATE"
    )
}

/// Parameters: sub_id, pub_id, data_type, data_id.
pub fn select_replica() -> String {
    format!(
        "SELECT {REPLICA_COLUMNS} FROM {REPLICA_TABLE} s \
         WHERE s.sub_id = $1 AND s.pub_id = $2 AND s.data_type = $3 AND s.data_id = $4"
    )
}

/// Parameters: sub_id, pub_id, data_type, data_id, deleted, version, status,
/// hash, payload, retries, message.
pub fn upsert_replica() -> String {
    format!(
        "INSERT INTO {REPLICA_TABLE} \
         (sub_id, pub_id, data_type, data_id, deleted, version, status, hash, payload, retries, message) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (sub_id, pub_id, data_type, data_id) DO UPDATE SET \
         deleted = EXCLUDED.deleted, \
         version = EXCLUDED.version, \
         status = EXCLUDED.status, \
         hash = EXCLUDED.hash, \
         payload = EXCLUDED.payload, \
         retries = EXCLUDED.retries, \
         message = EXCLUDED.message, \
         updated_at = NOW()"
    )
}

/// Parameters: pub_id, data_type, data_id.
pub fn select_data_item() -> String {
    format!(
        "SELECT pub_id, data_type, data_id, deleted, version, payload, created_at, updated_at \
         FROM {DATA_TABLE} WHERE pub_id = $1 AND data_type = $2 AND data_id = $3"
    )
}

/// Create pending replicas for linked data items that have none.
/// Parameter: sub_id.
pub fn reconcile_insert() -> String {
    format!(
        "INSERT INTO {REPLICA_TABLE} \
         (sub_id, pub_id, data_type, data_id, deleted, version, status, hash, retries) \
         SELECT $1::bigint, d.pub_id, d.data_type, d.data_id, d.deleted, d.version, 'pending', '', 0 \
         FROM {DATA_TABLE} d \
         JOIN {LINK_TABLE} ps ON ps.pub_id = d.pub_id AND ps.sub_id = $1::bigint \
         JOIN {PUBLISHER_TABLE} p ON p.id = d.pub_id AND p.status = 'active' \
         ORDER BY d.pub_id, d.data_type, d.data_id \
         ON CONFLICT (sub_id, pub_id, data_type, data_id) DO NOTHING"
    )
}

/// Re-arm replicas whose data item has a newer version. Parameter: sub_id.
pub fn reconcile_rearm() -> String {
    format!(
        "UPDATE {REPLICA_TABLE} s SET \
         status = 'pending', retries = 0, version = d.version, deleted = d.deleted, updated_at = NOW() \
         FROM {DATA_TABLE} d \
         JOIN {LINK_TABLE} ps ON ps.pub_id = d.pub_id AND ps.sub_id = $1::bigint \
         JOIN {PUBLISHER_TABLE} p ON p.id = d.pub_id AND p.status = 'active' \
         WHERE s.sub_id = $1::bigint \
         AND s.pub_id = d.pub_id AND s.data_type = d.data_type AND s.data_id = d.data_id \
         AND d.version > s.version"
    )
}

pub fn select_publisher_by_code() -> String {
    format!("SELECT id, code, name, status FROM {PUBLISHER_TABLE} WHERE code = $1")
}

pub fn select_subscriber_by_code() -> String {
    format!("SELECT id, code, name, status, retries FROM {SUBSCRIBER_TABLE} WHERE code = $1")
}

/// Active publishers linked to a subscriber. Parameter: sub_id.
pub fn select_linked_publishers() -> String {
    format!(
        "SELECT p.id, p.code, p.name, p.status FROM {PUBLISHER_TABLE} p \
         JOIN {LINK_TABLE} ps ON ps.pub_id = p.id \
         WHERE ps.sub_id = $1 AND p.status = 'active' \
         ORDER BY p.id"
    )
}

pub fn insert_publisher() -> String {
    format!(
        "INSERT INTO {PUBLISHER_TABLE} (code, name) VALUES ($1, $2) \
         RETURNING id, code, name, status"
    )
}

pub fn insert_subscriber() -> String {
    format!(
        "INSERT INTO {SUBSCRIBER_TABLE} (code, name, retries) VALUES ($1, $2, $3) \
         RETURNING id, code, name, status, retries"
    )
}

pub fn insert_link() -> String {
    format!(
        "INSERT INTO {LINK_TABLE} (pub_id, sub_id) VALUES ($1, $2) \
         ON CONFLICT (pub_id, sub_id) DO NOTHING"
    )
}

pub fn update_status(table: &str) -> String {
    format!("UPDATE {table} SET status = $2 WHERE id = $1")
}
