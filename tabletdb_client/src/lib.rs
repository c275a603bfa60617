//! Client-side batching and dispatch of row operations to the tablets that own them.
//!
//! Applications hand individual row reads and writes to a [`Batcher`]. Each operation is resolved
//! to the tablet owning its partition key as soon as it is admitted, and once the batch is
//! flushed the resolved operations are grouped per destination tablet and per consistency class
//! and sent as one request per group. Failures are recorded per operation in an
//! [`ErrorCollector`] and summarised into a single batch status delivered to the flush callback
//! exactly once.
//!
//! The tablet location service, the tablet server RPC client, the owning session and the
//! distributed transaction are collaborators expressed as traits, see [`TabletLookup`],
//! [`TabletServerClient`], [`Session`] and [`Transaction`].
//!
//! # Lock ordering
//!
//! A [`Batcher`] owns two lock domains: its own state lock and a small lock per in-flight
//! operation. The batcher lock is always taken first; the per-operation lock can only be reached
//! through a reference to the state guarded by the batcher lock. Neither lock is held while user
//! callbacks run or while another asynchronous component is called into.

pub mod batcher;
pub mod clock;
pub mod config;
pub mod error_collector;
pub mod mock;
pub mod operation;
pub mod session;
pub mod tablet;
pub mod transaction;

pub use batcher::{
    Batcher, BatcherArgs, BatcherPhase, FlushCallback,
    callbacks::CallbackPool,
    grouping::OpGroup,
    metrics::BatcherMetrics,
    rpc::{AsyncRpc, RowError, TabletRequest, TabletResponse, TabletServerClient},
};
pub use clock::{
    ConsistentReadPoint, HybridClock, HybridTime, LatestObservedHybridTime, ReadHybridTime,
};
pub use config::BatcherConfig;
pub use error_collector::{ErrorCollector, OperationError};
pub use operation::{
    ConsistencyLevel, Operation, OperationKind, OperationType, PartitionSchema, RowKey, Table,
};
pub use session::Session;
pub use tablet::{RemoteTablet, TabletId, TabletLookup};
pub use transaction::{IsolationLevel, Prepared, Transaction, TransactionMetadata};

use thiserror::Error;

/// Batch status reported when per-operation errors were recorded but not combined.
pub const TABLET_SERVERS_ERROR_MSG: &str =
    "Errors occurred while reaching out to the tablet servers";

/// Errors produced while batching and dispatching operations.
///
/// The same error is frequently recorded against several operations (an abort, or a failed
/// request fanned out to every member of its group), so it is cheap to clone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "not enough space remaining in buffer for op (required {required} bytes, \
        {used} of {limit} bytes used)"
    )]
    BufferFull {
        required: usize,
        used: usize,
        limit: usize,
    },

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("tablet lookup failed: {0}")]
    LookupFailed(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote error: {0}")]
    Remote(String),

    /// Multi-cause marker produced when errors of different kinds are combined.
    #[error("multiple failures")]
    Combined,

    #[error("{}", TABLET_SERVERS_ERROR_MSG)]
    TabletServers,
}

impl Error {
    /// Returns true for the multi-cause marker.
    pub fn is_combined(&self) -> bool {
        matches!(self, Self::Combined)
    }

    /// Returns true if `self` and `other` are the same kind of error, ignoring their messages.
    pub fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
