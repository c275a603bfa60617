//! In-memory collaborators for tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use hashbrown::HashMap;
use iox_time::Time;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    Error, Result,
    batcher::{
        Batcher, BatcherPhase,
        rpc::{TabletRequest, TabletResponse, TabletServerClient},
    },
    clock::{ConsistentReadPoint, HybridTime, ReadHybridTime},
    operation::{Operation, Table},
    session::Session,
    tablet::{RemoteTablet, TabletId, TabletLookup},
    transaction::{
        IsolationLevel, Prepared, Transaction, TransactionMetadata, TransactionReadyCallback,
    },
};

/// Holds callers back until opened.
#[derive(Debug)]
struct Gate {
    open: AtomicBool,
    notify: Notify,
}

impl Gate {
    fn new(open: bool) -> Self {
        Self {
            open: AtomicBool::new(open),
            notify: Notify::new(),
        }
    }

    fn open(&self) {
        self.open.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            // Registered before the check so an `open` in between is not missed.
            let notified = self.notify.notified();
            if self.open.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTabletLookupCall {
    pub table: String,
    pub partition_key: Vec<u8>,
    pub deadline: Time,
}

#[derive(Debug, Default)]
struct LookupInner {
    calls: Vec<MockTabletLookupCall>,
    tablets: Vec<Arc<RemoteTablet>>,
    errors: HashMap<Vec<u8>, Error>,
}

/// A [`TabletLookup`] over a fixed set of tablets.
///
/// Partition keys resolve to the tablet whose key range contains them, or fail with
/// [`Error::LookupFailed`] when there is none. Lookups can be held back with
/// [`MockTabletLookup::gated`] until [`MockTabletLookup::open`] is called.
#[derive(Debug)]
pub struct MockTabletLookup {
    inner: Mutex<LookupInner>,
    gate: Gate,
}

impl Default for MockTabletLookup {
    fn default() -> Self {
        Self {
            inner: Default::default(),
            gate: Gate::new(true),
        }
    }
}

impl MockTabletLookup {
    pub fn with_tablets(self, tablets: impl IntoIterator<Item = Arc<RemoteTablet>>) -> Self {
        self.inner.lock().tablets = tablets.into_iter().collect();
        self
    }

    /// Fail lookups of `partition_key` with `error`.
    pub fn with_error(self, partition_key: impl Into<Vec<u8>>, error: Error) -> Self {
        self.inner.lock().errors.insert(partition_key.into(), error);
        self
    }

    /// Hold every lookup back until [`Self::open`] is called.
    pub fn gated(self) -> Self {
        Self {
            gate: Gate::new(false),
            ..self
        }
    }

    /// Let held back and future lookups complete.
    pub fn open(&self) {
        self.gate.open();
    }

    pub fn calls(&self) -> Vec<MockTabletLookupCall> {
        self.inner.lock().calls.clone()
    }
}

#[async_trait]
impl TabletLookup for MockTabletLookup {
    async fn lookup_tablet_by_key(
        &self,
        table: &Table,
        partition_key: &[u8],
        deadline: Time,
    ) -> Result<Arc<RemoteTablet>> {
        self.inner.lock().calls.push(MockTabletLookupCall {
            table: table.name().to_string(),
            partition_key: partition_key.to_vec(),
            deadline,
        });

        self.gate.wait().await;

        let inner = self.inner.lock();
        if let Some(e) = inner.errors.get(partition_key) {
            return Err(e.clone());
        }
        inner
            .tablets
            .iter()
            .find(|t| t.contains_key(partition_key))
            .map(Arc::clone)
            .ok_or_else(|| {
                Error::LookupFailed(format!(
                    "no tablet of {} covers partition key {}",
                    table.name(),
                    hex::encode(partition_key)
                ))
            })
    }
}

#[derive(Debug, Default)]
struct ClientInner {
    calls: Vec<TabletRequest>,
    responses: VecDeque<Result<TabletResponse>>,
}

/// A [`TabletServerClient`] recording every request.
///
/// Responds with the scripted results in order, and with an empty successful response once they
/// run out.
#[derive(Debug)]
pub struct MockTabletServerClient {
    inner: Mutex<ClientInner>,
    gate: Gate,
}

impl Default for MockTabletServerClient {
    fn default() -> Self {
        Self {
            inner: Default::default(),
            gate: Gate::new(true),
        }
    }
}

impl MockTabletServerClient {
    pub fn with_return(self, ret: impl Into<VecDeque<Result<TabletResponse>>>) -> Self {
        self.inner.lock().responses = ret.into();
        self
    }

    /// Hold every request back until [`Self::open`] is called.
    pub fn gated(self) -> Self {
        Self {
            gate: Gate::new(false),
            ..self
        }
    }

    pub fn open(&self) {
        self.gate.open();
    }

    pub fn calls(&self) -> Vec<TabletRequest> {
        self.inner.lock().calls.clone()
    }
}

#[async_trait]
impl TabletServerClient for MockTabletServerClient {
    async fn send(&self, request: TabletRequest) -> Result<TabletResponse> {
        let response = {
            let mut inner = self.inner.lock();
            inner.calls.push(request);
            inner.responses.pop_front()
        };
        self.gate.wait().await;
        response.unwrap_or_else(|| Ok(TabletResponse::default()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockPrepareCall {
    pub n_ops: usize,
    pub force_consistent_read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFlushedCall {
    pub n_ops: usize,
    pub used_read_time: Option<ReadHybridTime>,
    pub status: Result<()>,
}

#[derive(Default)]
struct TransactionInner {
    prepare_calls: Vec<MockPrepareCall>,
    flushed_calls: Vec<MockFlushedCall>,
    prepare_return: VecDeque<Prepared>,
    waiting: VecDeque<TransactionReadyCallback>,
}

impl std::fmt::Debug for TransactionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionInner")
            .field("prepare_calls", &self.prepare_calls)
            .field("flushed_calls", &self.flushed_calls)
            .field("prepare_return", &self.prepare_return)
            .field("waiting", &self.waiting.len())
            .finish()
    }
}

/// A [`Transaction`] answering `prepare` with scripted values.
///
/// Once the script runs out every `prepare` is [`Prepared::Ready`] with
/// [`MockTransaction::metadata`]. Ready callbacks of pending prepares are kept until
/// [`MockTransaction::make_ready`] runs them.
#[derive(Debug, Default)]
pub struct MockTransaction(Mutex<TransactionInner>);

impl MockTransaction {
    pub fn with_prepare_return(self, ret: impl Into<VecDeque<Prepared>>) -> Self {
        self.0.lock().prepare_return = ret.into();
        self
    }

    /// The metadata handed out by default.
    pub fn metadata() -> TransactionMetadata {
        TransactionMetadata {
            transaction_id: Uuid::from_u128(0x6d6f_636b),
            isolation: IsolationLevel::Snapshot,
            status_tablet: TabletId::new("status-tablet"),
            priority: 42,
        }
    }

    /// Run the oldest waiting ready callback with `status`.
    ///
    /// Returns false if no prepare is waiting.
    pub fn make_ready(&self, status: Result<()>) -> bool {
        let callback = self.0.lock().waiting.pop_front();
        match callback {
            Some(callback) => {
                callback(status);
                true
            }
            None => false,
        }
    }

    pub fn waiting(&self) -> usize {
        self.0.lock().waiting.len()
    }

    pub fn prepare_calls(&self) -> Vec<MockPrepareCall> {
        self.0.lock().prepare_calls.clone()
    }

    pub fn flushed_calls(&self) -> Vec<MockFlushedCall> {
        self.0.lock().flushed_calls.clone()
    }
}

impl Transaction for MockTransaction {
    fn prepare(
        &self,
        ops: &[Arc<Operation>],
        force_consistent_read: bool,
        ready: TransactionReadyCallback,
    ) -> Prepared {
        let mut inner = self.0.lock();
        inner.prepare_calls.push(MockPrepareCall {
            n_ops: ops.len(),
            force_consistent_read,
        });
        let prepared = inner
            .prepare_return
            .pop_front()
            .unwrap_or_else(|| Prepared::Ready {
                metadata: Self::metadata(),
                may_have_metadata: false,
            });
        if prepared == Prepared::Pending {
            inner.waiting.push_back(ready);
        }
        prepared
    }

    fn flushed(
        &self,
        ops: &[Arc<Operation>],
        used_read_time: Option<ReadHybridTime>,
        status: &Result<()>,
    ) {
        self.0.lock().flushed_calls.push(MockFlushedCall {
            n_ops: ops.len(),
            used_read_time,
            status: status.clone(),
        });
    }
}

/// A [`Session`] recording the phase of every batcher reported as finished.
#[derive(Debug, Default)]
pub struct MockSession(Mutex<Vec<BatcherPhase>>);

impl MockSession {
    pub fn calls(&self) -> Vec<BatcherPhase> {
        self.0.lock().clone()
    }
}

impl Session for MockSession {
    fn flush_finished(&self, batcher: &Batcher) {
        let phase = batcher.phase();
        self.0.lock().push(phase);
    }
}

/// A [`ConsistentReadPoint`] recording clock updates.
#[derive(Debug, Default)]
pub struct MockReadPoint(Mutex<Vec<HybridTime>>);

impl MockReadPoint {
    pub fn calls(&self) -> Vec<HybridTime> {
        self.0.lock().clone()
    }
}

impl ConsistentReadPoint for MockReadPoint {
    fn update_clock(&self, propagated: HybridTime) {
        self.0.lock().push(propagated);
    }
}
