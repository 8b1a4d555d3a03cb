//! Command-line configuration shared by the subcommands.

pub mod duration;

use std::time::Duration;

use clap::Parser;
use pgpubsub_core::config::{
    DEFAULT_BATCH_LIMIT, DEFAULT_BATCH_SIZE, DEFAULT_CHANNEL, DEFAULT_WORKERS,
};
use pgpubsub_core::EngineConfig;

pub use duration::parse_duration;

#[derive(Parser, Clone, Debug)]
pub struct DatabaseOpts {
    /// PostgreSQL connection string
    #[arg(long, env = "PUBSUB_DATABASE_URL")]
    pub database_url: String,

    /// Connections kept open for batch passes (at least the worker count
    /// for parallel runs)
    #[arg(long, env = "PUBSUB_POOL_SIZE", default_value_t = DEFAULT_WORKERS)]
    pub pool_size: usize,
}

#[derive(Parser, Clone, Debug)]
pub struct ChannelOpts {
    /// Notification channel raised by the data trigger
    #[arg(long, env = "PUBSUB_CHANNEL", default_value = DEFAULT_CHANNEL)]
    pub channel: String,
}

#[derive(Parser, Clone, Debug)]
pub struct BatchOpts {
    /// Rows claimed per batch pass
    #[arg(long, env = "PUBSUB_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Rows processed per run (0 for no limit)
    #[arg(long, env = "PUBSUB_BATCH_LIMIT", default_value_t = DEFAULT_BATCH_LIMIT)]
    pub batch_limit: usize,

    /// Concurrent batch passes; 1 runs sequentially
    #[arg(long, env = "PUBSUB_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Rows per bulk status UPDATE
    #[arg(long, default_value_t = pgpubsub_core::commit::DEFAULT_COMMIT_CHUNK_SIZE)]
    pub commit_chunk_size: usize,

    /// Repeat the run on this interval (e.g. "30s", "5m") instead of running once
    #[arg(long, value_parser = parse_duration)]
    pub interval: Option<Duration>,
}

#[derive(Parser, Clone, Debug)]
pub struct ListenOpts {
    /// Interval of the keep-alive query on the listening connection
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub keep_alive: Duration,

    /// Upper bound of the delay between reconnect attempts
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub max_backoff: Duration,
}

impl BatchOpts {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.batch_size,
            batch_limit: self.batch_limit,
            workers: self.workers,
            commit_chunk_size: self.commit_chunk_size,
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        batch: BatchOpts,
        #[command(flatten)]
        channel: ChannelOpts,
        #[command(flatten)]
        listen: ListenOpts,
    }

    #[test]
    fn test_defaults_match_engine_config() {
        let cli = TestCli::parse_from(["test"]);
        let config = cli.batch.engine_config();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.batch_limit, 10_000);
        assert_eq!(cli.channel.channel, config.channel);
        assert_eq!(cli.batch.interval, None);
        assert_eq!(cli.listen.keep_alive, Duration::from_secs(30));
        assert_eq!(cli.listen.max_backoff, Duration::from_secs(60));
    }

    #[test]
    fn test_interval_flag() {
        let cli = TestCli::parse_from(["test", "--interval", "5m", "--workers", "4"]);
        assert_eq!(cli.batch.interval, Some(Duration::from_secs(300)));
        assert_eq!(cli.batch.workers, 4);
    }
}
