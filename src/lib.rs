//! pgpubsub command-line library.
//!
//! Wires the delivery engine from `pgpubsub-core` to the PostgreSQL backend
//! in `pgpubsub-postgresql` and provides the pieces the `pgpubsub` binary is
//! made of:
//!
//! - [`config`] - clap option groups and duration parsing
//! - [`import`] - JSON-lines bulk import through a batch publisher
//! - [`sink`] - JSON-lines delivery sink used as callback and listener
//! - [`listen`] - notification listening with reconnect backoff
//!
//! # CLI Usage
//!
//! ```bash
//! # Install tables and trigger
//! pgpubsub setup --database-url postgresql://...
//!
//! # Register a publisher and a subscriber, then link them
//! pgpubsub admin register-publisher --code P1 --name Orders
//! pgpubsub admin register-subscriber --code S1 --name Billing --retries 3
//! pgpubsub admin link --publisher P1 --subscriber S1
//!
//! # Publish one record, or import many
//! pgpubsub publish --publisher P1 --type order --id 1 --payload '{"total":10}'
//! pgpubsub import --publisher P1 --file orders.jsonl
//!
//! # Deliver pending replicas every 30 seconds with 4 workers
//! pgpubsub batch --subscriber S1 --workers 4 --interval 30s
//!
//! # Deliver changes as they are published
//! pgpubsub listen --subscriber S1
//! ```

pub mod config;
pub mod import;
pub mod listen;
pub mod sink;

pub use config::{BatchOpts, ChannelOpts, DatabaseOpts, ListenOpts};
pub use import::{import_jsonl, ImportSummary};
pub use sink::JsonlSink;
