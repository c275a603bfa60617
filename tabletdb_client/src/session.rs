//! The session owning a sequence of batches.

use crate::batcher::Batcher;

/// Learns when the batches it owns finish.
pub trait Session: std::fmt::Debug + Send + Sync {
    /// `batcher` has finished flushing.
    ///
    /// Called once per batcher, before the batcher's flush callback runs and with no batcher
    /// lock held.
    fn flush_finished(&self, batcher: &Batcher);
}
