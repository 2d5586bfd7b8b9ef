//! Error taxonomy for the load coordinator.

use crate::batcher::ClassId;

/// Everything that can go wrong while queueing, satisfying, or draining
/// futures.
///
/// The first three variants are contract violations at a single call site.
/// The drain-time variants abort the current drain; futures that were still
/// pending when the drain failed remain in the queue.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// `satisfy` was called on a future whose result slot is already set.
    /// The slot is write-once.
    #[error("future was already satisfied")]
    AlreadySatisfied,

    /// `result` was called on a future that is still pending.
    #[error("future has not been satisfied yet")]
    NotYetSatisfied,

    /// A future with no batch route was handed to the queue. Fan-in and
    /// chain futures are resolved by their children, not by a handler, and
    /// cannot be queued.
    #[error("future has no batch route and cannot be queued")]
    NotBatchable,

    /// A handler's `load_batch` returned while members of its group were
    /// still pending.
    #[error(
        "batch {class}/{batch_key} satisfied {actual} of {expected} queued futures"
    )]
    BatchIncomplete {
        class: ClassId,
        batch_key: String,
        expected: usize,
        actual: usize,
    },

    /// A full sweep over every handler class registered zero satisfactions
    /// while the queue was non-empty. No handler can make progress on what
    /// remains.
    #[error("queue stalled with {pending} futures no handler can satisfy")]
    Stalled { pending: usize },

    /// A handler's `load_batch` (or an installed profiler) failed outright.
    #[error("batch handler for {class}/{batch_key} failed")]
    HandlerFailed {
        class: ClassId,
        batch_key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
