//! Tables, index and change trigger used by the PostgreSQL backend.
//!
//! Every statement is idempotent, so `install` can run on each start.

use pgpubsub_core::error::Result;
use tokio_postgres::Client;
use tracing::info;

use crate::error::PgConfigError;
use crate::pool::execute_batch;

pub const PUBLISHER_TABLE: &str = "pubsub_publisher";
pub const SUBSCRIBER_TABLE: &str = "pubsub_subscriber";
pub const LINK_TABLE: &str = "pubsub_publisher_subscriber";
pub const DATA_TABLE: &str = "pubsub_data";
pub const REPLICA_TABLE: &str = "pubsub_subscriber_data";

const TRIGGER_FUNCTION: &str = "pubsub_notify_data_changed";
const TRIGGER: &str = "pubsub_data_changed_trigger";

const MAX_IDENTIFIER_LEN: usize = 63;

/// Accept unquoted lowercase identifiers only, since the channel name is
/// spliced into `LISTEN` and `pg_notify` text.
pub fn validate_channel(channel: &str) -> std::result::Result<(), PgConfigError> {
    let mut chars = channel.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && channel.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(PgConfigError::InvalidChannel(channel.to_string()))
    }
}

fn tables_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {PUBLISHER_TABLE} (
            id BIGSERIAL PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive'))
        );
        CREATE TABLE IF NOT EXISTS {SUBSCRIBER_TABLE} (
            id BIGSERIAL PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
            retries INTEGER NOT NULL DEFAULT 3 CHECK (retries >= 0)
        );
        CREATE TABLE IF NOT EXISTS {LINK_TABLE} (
            pub_id BIGINT NOT NULL REFERENCES {PUBLISHER_TABLE} (id),
            sub_id BIGINT NOT NULL REFERENCES {SUBSCRIBER_TABLE} (id),
            PRIMARY KEY (pub_id, sub_id)
        );
        CREATE TABLE IF NOT EXISTS {DATA_TABLE} (
            pub_id BIGINT NOT NULL REFERENCES {PUBLISHER_TABLE} (id),
            data_type TEXT NOT NULL,
            data_id TEXT NOT NULL,
            deleted BOOLEAN NOT NULL DEFAULT FALSE,
            version BIGINT NOT NULL DEFAULT 1,
            payload BYTEA,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (pub_id, data_type, data_id)
        );
        CREATE TABLE IF NOT EXISTS {REPLICA_TABLE} (
            id BIGSERIAL PRIMARY KEY,
            sub_id BIGINT NOT NULL REFERENCES {SUBSCRIBER_TABLE} (id),
            pub_id BIGINT NOT NULL,
            data_type TEXT NOT NULL,
            data_id TEXT NOT NULL,
            deleted BOOLEAN NOT NULL DEFAULT FALSE,
            version BIGINT NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'failed', 'completed')),
            hash TEXT NOT NULL DEFAULT '',
            payload BYTEA,
            retries INTEGER NOT NULL DEFAULT 0,
            message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (sub_id, pub_id, data_type, data_id)
        );
        CREATE INDEX IF NOT EXISTS {REPLICA_TABLE}_pending_idx
            ON {REPLICA_TABLE} (sub_id, status, id);"
    )
}

fn trigger_sql(channel: &str) -> String {
    format!(
        "CREATE OR REPLACE FUNCTION {TRIGGER_FUNCTION}() RETURNS TRIGGER AS $$
        BEGIN
            PERFORM pg_notify(
                '{channel}',
                json_build_object(
                    'pubId', NEW.pub_id,
                    'dataType', NEW.data_type,
                    'dataId', NEW.data_id,
                    'deleted', NEW.deleted,
                    'version', NEW.version
                )::text
            );
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql;
        DROP TRIGGER IF EXISTS {TRIGGER} ON {DATA_TABLE};
        CREATE TRIGGER {TRIGGER}
            AFTER INSERT OR UPDATE ON {DATA_TABLE}
            FOR EACH ROW EXECUTE FUNCTION {TRIGGER_FUNCTION}();"
    )
}

/// Full DDL for the given notification channel.
pub fn schema_sql(channel: &str) -> std::result::Result<String, PgConfigError> {
    validate_channel(channel)?;
    Ok(format!("{}\n{}", tables_sql(), trigger_sql(channel)))
}

/// Create the tables and (re)create the change trigger.
pub async fn install(client: &Client, channel: &str) -> Result<()> {
    let sql = schema_sql(channel)?;
    execute_batch(client, &sql).await?;
    info!("Installed pubsub schema, notifications on channel '{}'", channel);
    Ok(())
}

/// Drop every pubsub table and the trigger function.
pub async fn uninstall(client: &Client) -> Result<()> {
    let sql = format!(
        "DROP TABLE IF EXISTS {REPLICA_TABLE}, {DATA_TABLE}, {LINK_TABLE}, {SUBSCRIBER_TABLE}, {PUBLISHER_TABLE} CASCADE;
        DROP FUNCTION IF EXISTS {TRIGGER_FUNCTION}() CASCADE;"
    );
    execute_batch(client, &sql).await?;
    info!("Dropped pubsub schema");
    Ok(())
}
