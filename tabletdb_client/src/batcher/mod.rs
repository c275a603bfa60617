//! The batch coordinator.
//!
//! A [`Batcher`] moves through the phases
//!
//! ```text
//! GatheringOps -> Flushing -> Flushed
//!       \             \
//!        `-------------`-> Aborted
//! ```
//!
//! Operations are admitted while gathering. Each one is resolved to its tablet asynchronously; a
//! flush waits for every outstanding lookup, then groups the resolved operations (see
//! [`grouping`]) and sends one request per group (see [`rpc`]). The flush callback runs once the
//! active set drains, or once the batcher is aborted.

use std::{
    fmt::Display,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use hashbrown::HashMap;
use iox_time::{Time, TimeProvider};
use observability_deps::tracing::{debug, error, trace, warn};
use tokio::{runtime::Handle, sync::oneshot};

use crate::{
    Error, Result,
    clock::{ConsistentReadPoint, HybridClock, HybridTime, ReadHybridTime},
    config::{BatcherConfig, DEFAULT_TIMEOUT},
    error_collector::ErrorCollector,
    operation::{Operation, PartitionSchema},
    session::Session,
    tablet::{RemoteTablet, TabletLookup},
    transaction::{Prepared, Transaction},
};

use self::{
    callbacks::CallbackPool,
    grouping::{GroupingOptions, ResolvedOp, build_dispatch_groups},
    in_flight_op::{InFlightOp, OpPhase},
    metrics::BatcherMetrics,
    rpc::{AsyncRpc, TabletServerClient},
};

pub mod callbacks;
pub mod grouping;
mod in_flight_op;
pub mod metrics;
pub mod rpc;

/// Number of flushes without a configured timeout between two warnings about it.
const MISSING_TIMEOUT_WARN_INTERVAL: u64 = 100_000;

static MISSING_TIMEOUT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Receives the final status of a flush.
pub type FlushCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

enum FlushStart {
    Started,
    AlreadyAborted(Error),
    Invalid(Error),
}

/// Lifecycle phase of a [`Batcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherPhase {
    /// Accepting operations.
    GatheringOps,
    /// A flush was requested and operations are being resolved or sent.
    Flushing,
    /// Every operation reached an outcome and the flush callback has been run.
    Flushed,
    /// The batch was aborted.
    Aborted,
}

impl Display for BatcherPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GatheringOps => f.write_str("gathering ops"),
            Self::Flushing => f.write_str("flushing"),
            Self::Flushed => f.write_str("flushed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Everything a [`Batcher`] needs to operate.
#[derive(Debug)]
pub struct BatcherArgs {
    pub tablet_lookup: Arc<dyn TabletLookup>,
    pub tablet_client: Arc<dyn TabletServerClient>,
    pub error_collector: Arc<ErrorCollector>,
    /// Notified once the batch finishes. Held weakly, the session owns its batchers.
    pub session: Option<Weak<dyn Session>>,
    pub transaction: Option<Arc<dyn Transaction>>,
    /// Advanced after every successful request if set.
    pub read_point: Option<Arc<dyn ConsistentReadPoint>>,
    pub clock: Arc<dyn HybridClock>,
    pub time_provider: Arc<dyn TimeProvider>,
    /// Runtime driving tablet lookups and requests.
    pub runtime: Handle,
    /// Where flush callbacks run. They run on the thread observing completion if unset.
    pub callback_pool: Option<CallbackPool>,
    pub metrics: BatcherMetrics,
    pub config: BatcherConfig,
}

/// State guarded by the batcher lock.
struct BatcherState {
    phase: BatcherPhase,
    /// The active set, keyed by sequence number.
    ops: HashMap<u64, Arc<InFlightOp>>,
    /// Resolved operations waiting to be grouped.
    ops_queue: Vec<Arc<InFlightOp>>,
    next_op_sequence_number: u64,
    outstanding_lookups: usize,
    flush_callback: Option<FlushCallback>,
    flush_requested: bool,
    deadline: Option<Time>,
    timeout: Option<Duration>,
    /// Only maintained when errors are combined.
    combined_error: Option<Error>,
    abort_status: Option<Error>,
    buffer_bytes_used: usize,
}

impl BatcherState {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            phase: BatcherPhase::GatheringOps,
            ops: HashMap::new(),
            ops_queue: vec![],
            next_op_sequence_number: 0,
            outstanding_lookups: 0,
            flush_callback: None,
            flush_requested: false,
            deadline: None,
            timeout,
            combined_error: None,
            abort_status: None,
            buffer_bytes_used: 0,
        }
    }
}

/// Accumulates row operations, resolves them to tablets and sends them in per-tablet requests.
///
/// A batcher is single use: operations are added, the batch is flushed (or aborted) once, and
/// the flush callback reports the outcome exactly once. Per-operation failures are recorded in
/// the [`ErrorCollector`] handed over at construction.
///
/// Dropping a batcher that still has active operations, or that never reached
/// [`BatcherPhase::Flushed`] or [`BatcherPhase::Aborted`], is a bug.
pub struct Batcher {
    state: parking_lot::Mutex<BatcherState>,
    /// Set by any recorded error, readable without the lock.
    had_errors: AtomicBool,
    error_collector: Arc<ErrorCollector>,
    session: Option<Weak<dyn Session>>,
    transaction: Option<Arc<dyn Transaction>>,
    read_point: Option<Arc<dyn ConsistentReadPoint>>,
    clock: Arc<dyn HybridClock>,
    tablet_lookup: Arc<dyn TabletLookup>,
    tablet_client: Arc<dyn TabletServerClient>,
    time_provider: Arc<dyn TimeProvider>,
    runtime: Handle,
    callback_pool: Option<CallbackPool>,
    metrics: BatcherMetrics,
    config: BatcherConfig,
}

impl std::fmt::Debug for Batcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Batcher");
        // Formatting must not block on (or deadlock with) a caller holding the lock.
        if let Some(state) = self.state.try_lock() {
            s.field("phase", &state.phase)
                .field("ops", &state.ops.len())
                .field("outstanding_lookups", &state.outstanding_lookups);
        }
        s.field("had_errors", &self.had_errors.load(Ordering::Acquire))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Batcher {
    pub fn new(args: BatcherArgs) -> Arc<Self> {
        let BatcherArgs {
            tablet_lookup,
            tablet_client,
            error_collector,
            session,
            transaction,
            read_point,
            clock,
            time_provider,
            runtime,
            callback_pool,
            metrics,
            config,
        } = args;

        Arc::new(Self {
            state: parking_lot::Mutex::new(BatcherState::new(config.timeout)),
            had_errors: AtomicBool::new(false),
            error_collector,
            session,
            transaction,
            read_point,
            clock,
            tablet_lookup,
            tablet_client,
            time_provider,
            runtime,
            callback_pool,
            metrics,
            config,
        })
    }

    /// Admit `op` to the batch.
    ///
    /// The tablet owning `op` is looked up in the background, or immediately if the operation
    /// carries a known tablet. Never waits on the network.
    pub fn add(self: &Arc<Self>, op: Arc<Operation>) -> Result<()> {
        let partition_key = op.partition_key()?;
        let needs_hash_code = op.table().partition_schema().is_hash_partitioning()
            && op.requires_hash_code(&partition_key);
        let hash_code = needs_hash_code
            .then(|| PartitionSchema::decode_multi_column_hash_value(&partition_key));

        let (in_flight_op, timeout) = {
            let mut state = self.state.lock();
            if state.phase != BatcherPhase::GatheringOps {
                return Err(Error::InvalidState(format!(
                    "cannot add {op} to a batcher that is {}",
                    state.phase
                )));
            }

            let required = op.size_bytes();
            let used = state.buffer_bytes_used;
            let limit = self.config.max_buffer_size;
            if used.saturating_add(required) > limit {
                return Err(Error::BufferFull {
                    required,
                    used,
                    limit,
                });
            }

            // Rejected operations are left untouched.
            if let Some(hash_code) = hash_code {
                op.set_hash_code(hash_code);
            }

            let sequence_number = state.next_op_sequence_number;
            state.next_op_sequence_number += 1;
            let in_flight_op = Arc::new(InFlightOp::new(
                Arc::clone(&op),
                partition_key,
                sequence_number,
            ));
            state.ops.insert(sequence_number, Arc::clone(&in_flight_op));
            state.outstanding_lookups += 1;
            state.buffer_bytes_used += in_flight_op.size_bytes();

            (in_flight_op, state.timeout)
        };
        trace!(op = %in_flight_op, "admitted operation");

        if let Some(tablet) = op.tablet() {
            self.tablet_lookup_finished(in_flight_op, Ok(Arc::clone(tablet)));
            return Ok(());
        }

        let deadline = self.compute_deadline(timeout);
        let batcher = Arc::clone(self);
        let tablet_lookup = Arc::clone(&self.tablet_lookup);
        self.runtime.spawn(async move {
            let result = tablet_lookup
                .lookup_tablet_by_key(
                    in_flight_op.operation().table(),
                    in_flight_op.partition_key(),
                    deadline,
                )
                .await;
            batcher.tablet_lookup_finished(in_flight_op, result);
        });

        Ok(())
    }

    /// Start flushing. `callback` receives the batch status exactly once.
    ///
    /// Calling this more than once is a bug.
    pub fn flush_async(self: &Arc<Self>, callback: FlushCallback) {
        let mut callback = Some(callback);
        let outcome = {
            let mut state = self.state.lock();
            if state.flush_requested {
                FlushStart::Invalid(Error::InvalidState(
                    "flush requested more than once".to_string(),
                ))
            } else {
                state.flush_requested = true;
                match state.phase {
                    BatcherPhase::GatheringOps => {
                        state.phase = BatcherPhase::Flushing;
                        state.flush_callback = callback.take();
                        state.deadline = Some(self.compute_deadline(state.timeout));
                        FlushStart::Started
                    }
                    BatcherPhase::Aborted => FlushStart::AlreadyAborted(
                        state
                            .abort_status
                            .clone()
                            .unwrap_or_else(|| Error::Aborted("Batch aborted".to_string())),
                    ),
                    phase @ (BatcherPhase::Flushing | BatcherPhase::Flushed) => {
                        FlushStart::Invalid(Error::InvalidState(format!(
                            "cannot flush a batcher that is {phase}"
                        )))
                    }
                }
            }
        };

        match (outcome, callback) {
            (FlushStart::Started, _) => {
                self.check_for_finished_flush();
                self.flush_buffers_if_ready();
            }
            (FlushStart::AlreadyAborted(status), Some(callback)) => {
                debug!(%status, "flush of aborted batch");
                self.notify_session();
                self.run_callback(callback, Err(status));
            }
            (FlushStart::Invalid(e), Some(callback)) => {
                error!(error = %e, "invalid flush");
                if cfg!(debug_assertions) {
                    panic!("{e}");
                }
                self.run_callback(callback, Err(e));
            }
            (FlushStart::AlreadyAborted(_) | FlushStart::Invalid(_), None) => {}
        }
    }

    /// Flush and wait for the batch status.
    pub fn flush(self: &Arc<Self>) -> impl Future<Output = Result<()>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.flush_async(Box::new(move |status| {
            let _ = tx.send(status);
        }));
        async move {
            rx.await.unwrap_or_else(|_| {
                Err(Error::InvalidState(
                    "flush callback dropped without running".to_string(),
                ))
            })
        }
    }

    /// Abort the batch.
    ///
    /// Operations not yet part of a request fail with `status` right away. Operations still being
    /// looked up fail with an aborted error once their lookup returns; operations already sent
    /// are reconciled when their request completes. The flush callback, if registered, receives
    /// `status`. Aborting a finished batch does nothing.
    pub fn abort(&self, status: Error) {
        let callback = {
            let mut state = self.state.lock();
            match state.phase {
                BatcherPhase::Flushed | BatcherPhase::Aborted => {
                    debug!(phase = %state.phase, %status, "ignoring abort of finished batch");
                    return;
                }
                BatcherPhase::GatheringOps | BatcherPhase::Flushing => {}
            }
            state.phase = BatcherPhase::Aborted;
            state.abort_status = Some(status.clone());
            state.ops_queue.clear();

            let mut to_abort = state
                .ops
                .values()
                .filter(|op| op.lock_state(&state).phase == OpPhase::BufferedToTabletServer)
                .map(Arc::clone)
                .collect::<Vec<_>>();
            to_abort.sort_by_key(|op| op.sequence_number());
            debug!(
                %status,
                n_ops = state.ops.len(),
                n_aborted = to_abort.len(),
                "aborting batch"
            );
            for op in &to_abort {
                self.mark_in_flight_op_failed_locked(&mut state, op, status.clone());
            }

            state.flush_callback.take()
        };

        if let Some(callback) = callback {
            self.notify_session();
            self.run_callback(callback, Err(status));
        }
    }

    /// Override the timeout for lookups admitted and flushes started from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.state.lock().timeout = Some(timeout);
    }

    /// True while any admitted operation has not reached an outcome.
    pub fn has_pending_operations(&self) -> bool {
        !self.state.lock().ops.is_empty()
    }

    /// Number of admitted operations while gathering, zero once a flush started.
    pub fn count_buffered_operations(&self) -> usize {
        let state = self.state.lock();
        match state.phase {
            BatcherPhase::GatheringOps => state.ops.len(),
            _ => 0,
        }
    }

    /// Payload bytes of the active operations.
    pub fn buffer_bytes_used(&self) -> usize {
        self.state.lock().buffer_bytes_used
    }

    pub fn phase(&self) -> BatcherPhase {
        self.state.lock().phase
    }

    pub fn outstanding_lookups(&self) -> usize {
        self.state.lock().outstanding_lookups
    }

    pub fn error_collector(&self) -> &Arc<ErrorCollector> {
        &self.error_collector
    }

    fn tablet_lookup_finished(
        self: &Arc<Self>,
        op: Arc<InFlightOp>,
        result: Result<Arc<RemoteTablet>>,
    ) {
        let lookup_failed = {
            let mut state = self.state.lock();
            state.outstanding_lookups -= 1;

            if state.phase == BatcherPhase::Aborted {
                debug!(%op, lookup_ok = result.is_ok(), "lookup finished for aborted batch");
                self.mark_in_flight_op_failed_locked(
                    &mut state,
                    &op,
                    Error::Aborted("Batch aborted".to_string()),
                );
                return;
            }

            match result {
                Ok(tablet) => {
                    trace!(%op, tablet_id = %tablet.tablet_id(), "lookup finished");
                    {
                        let mut op_state = op.lock_state(&state);
                        op_state.phase = OpPhase::BufferedToTabletServer;
                        op_state.tablet = Some(tablet);
                    }
                    state.ops_queue.push(op);
                    false
                }
                Err(e) => {
                    debug!(%op, error = %e, "lookup failed");
                    self.mark_in_flight_op_failed_locked(&mut state, &op, e);
                    true
                }
            }
        };

        if lookup_failed {
            self.check_for_finished_flush();
        }
        self.flush_buffers_if_ready();
    }

    fn transaction_ready(self: &Arc<Self>, status: Result<()>) {
        match status {
            Ok(()) => self.flush_buffers_if_ready(),
            Err(e) => self.abort(e),
        }
    }

    /// Group and send the resolved operations once every lookup has finished.
    fn flush_buffers_if_ready(self: &Arc<Self>) {
        let pending = {
            let state = self.state.lock();
            if state.phase != BatcherPhase::Flushing || state.outstanding_lookups != 0 {
                return;
            }
            state
                .ops_queue
                .iter()
                .map(|op| Arc::clone(op.operation()))
                .collect::<Vec<_>>()
        };
        if pending.is_empty() {
            return;
        }

        let mut metadata = None;
        let mut may_have_metadata = false;
        if let Some(transaction) = &self.transaction {
            let batcher = Arc::clone(self);
            let prepared = transaction.prepare(
                &pending,
                self.config.force_consistent_read,
                Box::new(move |status| batcher.transaction_ready(status)),
            );
            match prepared {
                Prepared::Ready {
                    metadata: m,
                    may_have_metadata: may_have,
                } => {
                    metadata = Some(m);
                    may_have_metadata = may_have;
                }
                Prepared::Pending => {
                    debug!(n_ops = pending.len(), "waiting for transaction");
                    return;
                }
            }
        }

        let (resolved, deadline) = {
            let mut state = self.state.lock();
            // Aborted while the transaction was preparing.
            if state.phase != BatcherPhase::Flushing {
                return;
            }
            let queue = std::mem::take(&mut state.ops_queue);
            let mut resolved = Vec::with_capacity(queue.len());
            for op in queue {
                let mut op_state = op.lock_state(&state);
                op_state.phase = OpPhase::RequestSent;
                let tablet = op_state.tablet.clone();
                drop(op_state);
                match tablet {
                    Some(tablet) => resolved.push(ResolvedOp { tablet, op }),
                    None => {
                        error!(%op, "buffered operation without a tablet");
                        debug_assert!(false, "buffered operation {op} without a tablet");
                        self.mark_in_flight_op_failed_locked(
                            &mut state,
                            &op,
                            Error::InvalidState(format!("{op} has no tablet")),
                        );
                    }
                }
            }
            let deadline = state
                .deadline
                .unwrap_or_else(|| self.compute_deadline(state.timeout));
            (resolved, deadline)
        };
        if resolved.is_empty() {
            self.check_for_finished_flush();
            return;
        }

        let groups = build_dispatch_groups(
            resolved,
            GroupingOptions {
                force_consistent_read: self.config.force_consistent_read
                    || self.transaction.is_some(),
                allow_follower_reads: self.config.allow_follower_reads,
                allow_local_calls_in_curr_thread: self.config.allow_local_calls_in_curr_thread,
            },
        );
        debug!(n_groups = groups.len(), "dispatching batch");

        for group in groups {
            AsyncRpc::new(
                Arc::clone(self),
                group,
                metadata.clone(),
                may_have_metadata,
                deadline,
            )
            .send();
        }
    }

    /// Complete the flush if the active set is empty.
    fn check_for_finished_flush(&self) {
        let (callback, combined_error) = {
            let mut state = self.state.lock();
            if state.phase != BatcherPhase::Flushing || !state.ops.is_empty() {
                return;
            }
            state.phase = BatcherPhase::Flushed;
            (state.flush_callback.take(), state.combined_error.clone())
        };

        self.notify_session();

        let status = match combined_error {
            Some(e) => Err(e),
            None if self.had_errors.load(Ordering::Acquire) => Err(Error::TabletServers),
            None => Ok(()),
        };
        debug!(ok = status.is_ok(), "batch flushed");

        if let Some(callback) = callback {
            self.run_callback(callback, status);
        }
    }

    fn notify_session(&self) {
        if let Some(session) = self.session.as_ref().and_then(Weak::upgrade) {
            session.flush_finished(self);
        }
    }

    fn run_callback(&self, callback: FlushCallback, status: Result<()>) {
        let task = Box::new(move || callback(status));
        match &self.callback_pool {
            Some(pool) => {
                if let Err(task) = pool.submit(task) {
                    debug!("callback pool unavailable, running flush callback inline");
                    task();
                }
            }
            None => task(),
        }
    }

    fn compute_deadline(&self, timeout: Option<Duration>) -> Time {
        let timeout = timeout.unwrap_or_else(|| {
            let n = MISSING_TIMEOUT_COUNT.fetch_add(1, Ordering::Relaxed);
            if n % MISSING_TIMEOUT_WARN_INTERVAL == 0 {
                warn!(
                    default_timeout = ?DEFAULT_TIMEOUT,
                    "batcher has no timeout configured, using the default"
                );
            }
            DEFAULT_TIMEOUT
        });
        self.time_provider.now() + timeout
    }

    /// Record `error` against `op` and fold it into the batch status.
    fn combine_error_locked(&self, state: &mut BatcherState, op: &InFlightOp, error: Error) {
        self.error_collector
            .add_error(Arc::clone(op.operation()), error.clone());

        if self.config.combine_errors {
            state.combined_error = Some(match state.combined_error.take() {
                None => error,
                Some(Error::Combined) => Error::Combined,
                Some(first) if first.same_kind(&error) => first,
                Some(_) => Error::Combined,
            });
        }

        self.had_errors.store(true, Ordering::Release);
    }

    fn mark_in_flight_op_failed_locked(
        &self,
        state: &mut BatcherState,
        op: &InFlightOp,
        error: Error,
    ) {
        Self::remove_in_flight_op_locked(state, op);
        self.combine_error_locked(state, op, error);
    }

    fn remove_in_flight_op_locked(state: &mut BatcherState, op: &InFlightOp) {
        match state.ops.remove(&op.sequence_number()) {
            Some(removed) => {
                state.buffer_bytes_used =
                    state.buffer_bytes_used.saturating_sub(removed.size_bytes());
            }
            None => {
                error!(%op, "operation removed from the active set twice");
                debug_assert!(false, "operation {op} removed from the active set twice");
            }
        }
    }

    /// Reconcile the operations of a completed request.
    fn process_rpc_response(&self, rpc: &AsyncRpc, status: Result<()>) {
        let ops = rpc.in_flight_ops();
        let response = rpc.response();

        if let Some(propagated) = response.and_then(|r| r.propagated_hybrid_time) {
            self.clock.update_latest_observed(propagated);
        }

        {
            let mut state = self.state.lock();
            match &status {
                Err(e) => {
                    debug!(
                        tablet_id = %rpc.tablet().tablet_id(),
                        group = %rpc.group(),
                        error = %e,
                        n_ops = ops.len(),
                        "request failed"
                    );
                    self.metrics.record_failed();
                    for op in ops {
                        self.combine_error_locked(&mut state, op, e.clone());
                    }
                }
                Ok(()) => {
                    let mut rows_errored = 0;
                    for row_error in response.map(|r| &r.per_row_errors[..]).unwrap_or_default() {
                        match ops.get(row_error.row_index) {
                            Some(op) => {
                                rows_errored += 1;
                                self.combine_error_locked(&mut state, op, row_error.error.clone())
                            }
                            None => error!(
                                row_index = row_error.row_index,
                                n_ops = ops.len(),
                                tablet_id = %rpc.tablet().tablet_id(),
                                error = %row_error.error,
                                "per row error index out of range"
                            ),
                        }
                    }
                    self.metrics.record_row_errors(rows_errored);
                }
            }
        }

        self.remove_in_flight_ops_after_flushing(
            ops,
            &status,
            response.and_then(|r| r.used_read_time),
            response.and_then(|r| r.propagated_hybrid_time),
        );
        self.check_for_finished_flush();
    }

    fn remove_in_flight_ops_after_flushing(
        &self,
        ops: &[Arc<InFlightOp>],
        status: &Result<()>,
        used_read_time: Option<ReadHybridTime>,
        propagated_hybrid_time: Option<HybridTime>,
    ) {
        {
            let mut state = self.state.lock();
            for op in ops {
                Self::remove_in_flight_op_locked(&mut state, op);
            }
        }

        if let Some(transaction) = &self.transaction {
            let operations = ops
                .iter()
                .map(|op| Arc::clone(op.operation()))
                .collect::<Vec<_>>();
            transaction.flushed(&operations, used_read_time, status);
        }

        if status.is_ok() {
            if let (Some(read_point), Some(propagated)) = (&self.read_point, propagated_hybrid_time)
            {
                read_point.update_clock(propagated);
            }
        }
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        let state = self.state.get_mut();
        let terminal = matches!(
            state.phase,
            BatcherPhase::Flushed | BatcherPhase::Aborted
        );
        if terminal && state.ops.is_empty() {
            return;
        }

        for op in state.ops.values() {
            error!(%op, "batcher dropped with an active operation");
        }
        error!(
            phase = %state.phase,
            n_ops = state.ops.len(),
            "batcher dropped before finishing"
        );
        debug_assert!(
            false,
            "batcher dropped while {} with {} active operations",
            state.phase,
            state.ops.len()
        );
    }
}
