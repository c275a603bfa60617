//! Requests carrying one dispatch group to a tablet server.

use std::sync::Arc;

use async_trait::async_trait;
use iox_time::Time;
use observability_deps::tracing::trace;

use super::{
    Batcher,
    grouping::{DispatchGroup, OpGroup},
    in_flight_op::InFlightOp,
};
use crate::{
    Error, Result,
    clock::{HybridTime, ReadHybridTime},
    operation::Operation,
    tablet::RemoteTablet,
    transaction::TransactionMetadata,
};

/// One request to a tablet server.
#[derive(Debug, Clone)]
pub struct TabletRequest {
    pub group: OpGroup,
    pub tablet: Arc<RemoteTablet>,
    /// In admission order.
    pub operations: Vec<Arc<Operation>>,
    pub need_consistent_read: bool,
    /// The request may be executed by a local tablet server on the calling thread.
    pub allow_local_calls_in_curr_thread: bool,
    pub transaction: Option<TransactionMetadata>,
    pub may_have_metadata: bool,
    pub deadline: Time,
}

/// An error the tablet server reported for a single operation of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Index into [`TabletRequest::operations`].
    pub row_index: usize,
    pub error: Error,
}

/// The response to a [`TabletRequest`] that reached the tablet server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabletResponse {
    pub per_row_errors: Vec<RowError>,
    pub propagated_hybrid_time: Option<HybridTime>,
    /// The read time picked by the server for a read that did not specify one.
    pub used_read_time: Option<ReadHybridTime>,
}

/// Transport to the tablet servers.
///
/// An `Err` means the request as a whole failed and none of its operations took effect.
#[async_trait]
pub trait TabletServerClient: std::fmt::Debug + Send + Sync {
    async fn send(&self, request: TabletRequest) -> Result<TabletResponse>;
}

/// A dispatch group on its way to a tablet server.
///
/// Holds the owning [`Batcher`] alive until the completion of the request has been reported.
pub struct AsyncRpc {
    batcher: Arc<Batcher>,
    group: OpGroup,
    tablet: Arc<RemoteTablet>,
    ops: Vec<Arc<InFlightOp>>,
    need_consistent_read: bool,
    allow_local_calls_in_curr_thread: bool,
    transaction: Option<TransactionMetadata>,
    may_have_metadata: bool,
    deadline: Time,
    response: Option<TabletResponse>,
}

impl std::fmt::Debug for AsyncRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRpc")
            .field("group", &self.group)
            .field("tablet", self.tablet.tablet_id())
            .field("ops", &self.ops.len())
            .field("need_consistent_read", &self.need_consistent_read)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl AsyncRpc {
    pub(super) fn new(
        batcher: Arc<Batcher>,
        group: DispatchGroup,
        transaction: Option<TransactionMetadata>,
        may_have_metadata: bool,
        deadline: Time,
    ) -> Self {
        let DispatchGroup {
            tablet,
            group,
            ops,
            need_consistent_read,
            allow_local_calls_in_curr_thread,
        } = group;

        Self {
            batcher,
            group,
            tablet,
            ops,
            need_consistent_read,
            allow_local_calls_in_curr_thread,
            transaction,
            may_have_metadata,
            deadline,
            response: None,
        }
    }

    /// Send the request in the background. Completion is reported to the owning batcher.
    pub fn send(mut self) {
        let request = self.request();
        let client = Arc::clone(&self.batcher.tablet_client);
        let runtime = self.batcher.runtime.clone();

        trace!(
            tablet_id = %self.tablet.tablet_id(),
            group = %self.group,
            n_ops = self.ops.len(),
            "sending request"
        );
        self.batcher.metrics.record_sent();
        runtime.spawn(async move {
            let status = match client.send(request).await {
                Ok(response) => {
                    self.response = Some(response);
                    Ok(())
                }
                Err(e) => Err(e),
            };
            let batcher = Arc::clone(&self.batcher);
            batcher.process_rpc_response(&self, status);
        });
    }

    fn request(&self) -> TabletRequest {
        TabletRequest {
            group: self.group,
            tablet: Arc::clone(&self.tablet),
            operations: self.ops().map(Arc::clone).collect(),
            need_consistent_read: self.need_consistent_read,
            allow_local_calls_in_curr_thread: self.allow_local_calls_in_curr_thread,
            transaction: self.transaction.clone(),
            may_have_metadata: self.may_have_metadata,
            deadline: self.deadline,
        }
    }

    pub fn group(&self) -> OpGroup {
        self.group
    }

    pub fn tablet(&self) -> &Arc<RemoteTablet> {
        &self.tablet
    }

    /// The operations of this request, in admission order.
    pub fn ops(&self) -> impl Iterator<Item = &Arc<Operation>> {
        self.ops.iter().map(|op| op.operation())
    }

    /// The response, once a successful one has arrived.
    pub fn response(&self) -> Option<&TabletResponse> {
        self.response.as_ref()
    }

    pub(super) fn in_flight_ops(&self) -> &[Arc<InFlightOp>] {
        &self.ops
    }
}
