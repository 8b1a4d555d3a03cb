//! PostgreSQL backend for pgpubsub.
//!
//! - [`PgStore`] implements `PubSubStore` on the `pubsub_*` tables, claiming
//!   batches with `FOR UPDATE SKIP LOCKED`
//! - [`PgNotificationSource`] streams change notifications raised by the
//!   trigger on `pubsub_data` through `LISTEN`
//! - [`schema`] installs the tables and the trigger

pub mod error;
pub mod listener;
pub mod pool;
pub mod schema;
pub mod sql;
pub mod store;

pub use error::PgConfigError;
pub use listener::PgNotificationSource;
pub use pool::{connect_client, PgPool};
pub use store::{PgStore, PgTransaction};
