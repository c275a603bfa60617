//! The distributed transaction a batch may run under.

use std::sync::Arc;

use uuid::Uuid;

use crate::{Result, clock::ReadHybridTime, operation::Operation, tablet::TabletId};

/// Isolation level of a distributed transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    Snapshot,
    Serializable,
}

/// Transaction metadata attached to every request of a flush executed under a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMetadata {
    pub transaction_id: Uuid,
    pub isolation: IsolationLevel,
    pub status_tablet: TabletId,
    pub priority: u64,
}

/// Invoked by a [`Transaction`] that answered [`Prepared::Pending`] once it is ready (or has
/// failed).
pub type TransactionReadyCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Outcome of [`Transaction::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// Requests may be sent now, carrying `metadata`.
    Ready {
        metadata: TransactionMetadata,
        /// The tablets touched may already hold metadata for this transaction.
        may_have_metadata: bool,
    },
    /// The transaction is not ready yet and will invoke the ready callback later.
    Pending,
}

/// A distributed transaction coordinating one or more batches.
pub trait Transaction: std::fmt::Debug + Send + Sync {
    /// Prepare to send `ops`.
    ///
    /// When [`Prepared::Pending`] is returned, `ready` is invoked exactly once later; otherwise
    /// it is dropped without being called. `ready` may be invoked from any thread, but never
    /// synchronously from within `prepare`.
    fn prepare(
        &self,
        ops: &[Arc<Operation>],
        force_consistent_read: bool,
        ready: TransactionReadyCallback,
    ) -> Prepared;

    /// `ops` were sent as one request which completed with `status`.
    fn flushed(
        &self,
        ops: &[Arc<Operation>],
        used_read_time: Option<ReadHybridTime>,
        status: &Result<()>,
    );
}
