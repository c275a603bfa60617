//! CLI config for the batching client.

use std::time::Duration;

use tabletdb_client::{BatcherConfig, config::DEFAULT_MAX_BUFFER_SIZE};

/// CLI config for batchers.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct BatcherCliConfig {
    /// Timeout for tablet lookups and tablet server requests of a batch.
    ///
    /// Defaults to 60 seconds, with a warning, when not set.
    #[clap(
        long = "batch-timeout",
        env = "TABLETDB_BATCH_TIMEOUT",
        value_parser = humantime::parse_duration,
    )]
    pub timeout: Option<Duration>,

    /// Maximum number of payload bytes buffered in one batch.
    #[clap(
        long = "max-batch-buffer-size",
        env = "TABLETDB_MAX_BATCH_BUFFER_SIZE",
        default_value_t = DEFAULT_MAX_BUFFER_SIZE,
        action
    )]
    pub max_buffer_size: usize,

    /// Always request consistent reads from the tablet servers.
    #[clap(
        long = "force-consistent-read",
        env = "TABLETDB_FORCE_CONSISTENT_READ",
        default_value_t = false,
        action
    )]
    pub force_consistent_read: bool,

    /// Report the combined per-operation errors as the batch status instead of a generic error.
    ///
    /// Intended for testing.
    #[clap(
        long = "combine-batch-errors",
        env = "TABLETDB_COMBINE_BATCH_ERRORS",
        default_value_t = false,
        action
    )]
    pub combine_errors: bool,

    /// Allow Redis reads to be served by follower replicas.
    #[clap(
        long = "allow-follower-reads",
        env = "TABLETDB_ALLOW_FOLLOWER_READS",
        default_value_t = false,
        action
    )]
    pub allow_follower_reads: bool,

    /// Never execute requests on a local tablet server in the calling thread.
    #[clap(
        long = "disable-local-calls",
        env = "TABLETDB_DISABLE_LOCAL_CALLS",
        default_value_t = false,
        action
    )]
    pub disable_local_calls: bool,
}

impl BatcherCliConfig {
    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            timeout: self.timeout,
            max_buffer_size: self.max_buffer_size,
            force_consistent_read: self.force_consistent_read,
            combine_errors: self.combine_errors,
            allow_follower_reads: self.allow_follower_reads,
            allow_local_calls_in_curr_thread: !self.disable_local_calls,
        }
    }
}
