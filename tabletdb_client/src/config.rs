//! Tunables of a [`Batcher`](crate::Batcher).

use std::time::Duration;

/// Timeout applied when none was configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default byte budget of the operations buffered in one batcher.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 7 * 1024 * 1024;

/// Configuration handed to a [`Batcher`](crate::Batcher) at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    /// Timeout for lookups and requests. [`DEFAULT_TIMEOUT`] is used, with a warning, if unset.
    pub timeout: Option<Duration>,
    /// Byte budget of buffered operation payloads.
    pub max_buffer_size: usize,
    /// Always ask tablet servers for a consistent read.
    pub force_consistent_read: bool,
    /// Combine per-operation errors into the batch status instead of reporting a generic error.
    ///
    /// Meant for tests that do not want to inspect the error collector.
    pub combine_errors: bool,
    /// Redis reads may be served by the closest replica, which can be a follower.
    pub allow_follower_reads: bool,
    /// The last request of a flush may be executed by a local tablet server on the current
    /// thread.
    pub allow_local_calls_in_curr_thread: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            force_consistent_read: false,
            combine_errors: false,
            allow_follower_reads: false,
            allow_local_calls_in_curr_thread: true,
        }
    }
}
