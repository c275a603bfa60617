use std::{fmt::Display, sync::Arc};

use parking_lot::{Mutex, MutexGuard};

use super::BatcherState;
use crate::{operation::Operation, tablet::RemoteTablet};

/// Where an admitted operation is in its journey to a tablet server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpPhase {
    /// Waiting for the tablet lookup to complete.
    LookingUpTablet,
    /// Destination known, waiting to be grouped into a request.
    BufferedToTabletServer,
    /// Part of a request that has been handed to the tablet server client.
    RequestSent,
}

#[derive(Debug)]
pub(crate) struct OpState {
    pub(crate) phase: OpPhase,
    /// Set exactly once, when the lookup succeeds.
    pub(crate) tablet: Option<Arc<RemoteTablet>>,
}

/// An [`Operation`] admitted to a batcher.
///
/// The mutable state lives behind a second lock domain that is only reachable while the
/// batcher lock is held, see [`InFlightOp::lock_state`].
#[derive(Debug)]
pub(crate) struct InFlightOp {
    operation: Arc<Operation>,
    partition_key: Vec<u8>,
    sequence_number: u64,
    size_bytes: usize,
    state: Mutex<OpState>,
}

impl InFlightOp {
    pub(super) fn new(
        operation: Arc<Operation>,
        partition_key: Vec<u8>,
        sequence_number: u64,
    ) -> Self {
        let size_bytes = operation.size_bytes();
        Self {
            operation,
            partition_key,
            sequence_number,
            size_bytes,
            state: Mutex::new(OpState {
                phase: OpPhase::LookingUpTablet,
                tablet: None,
            }),
        }
    }

    pub(crate) fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    pub(crate) fn partition_key(&self) -> &[u8] {
        &self.partition_key
    }

    /// Admission order within the owning batcher.
    pub(crate) fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub(crate) fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Lock the per-operation state.
    ///
    /// Requiring the batcher state as an argument means the caller already holds the batcher
    /// lock, so the two locks can only ever nest batcher first.
    pub(super) fn lock_state<'a>(&'a self, _batcher: &'a BatcherState) -> MutexGuard<'a, OpState> {
        self.state.lock()
    }
}

impl Display for InFlightOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (seq {}, partition key {})",
            self.operation,
            self.sequence_number,
            hex::encode(&self.partition_key)
        )
    }
}
