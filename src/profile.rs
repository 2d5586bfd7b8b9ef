//! The instrumentation seam: a profiler wraps every batch invocation.

use std::time::Instant;

use tracing::debug;

use crate::batcher::ClassId;

/// The batch invocation handed to a profiler. Calling it runs the handler's
/// `load_batch` for the whole group; being `FnOnce`, it cannot be run twice.
pub type BatchThunk<'a> = Box<dyn FnOnce() -> anyhow::Result<()> + 'a>;

/// Brackets each batch dispatch with instrumentation.
///
/// Implementations must invoke `batch` exactly once and return its result
/// (swallowing the error would hide a failed handler from the drain). The
/// queue checks that the thunk actually ran and fails the batch if a
/// profiler dropped it.
pub trait Profiler: Send + Sync {
    fn around(
        &self,
        class: ClassId,
        batch_key: &str,
        size: usize,
        batch: BatchThunk<'_>,
    ) -> anyhow::Result<()>;
}

/// A ready-made profiler that logs each batch's group size and wall-clock
/// time at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingProfiler;

impl Profiler for TimingProfiler {
    fn around(
        &self,
        class: ClassId,
        batch_key: &str,
        size: usize,
        batch: BatchThunk<'_>,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let outcome = batch();
        debug!(
            %class,
            batch_key,
            size,
            elapsed = ?started.elapsed(),
            ok = outcome.is_ok(),
            "batch resolved"
        );
        outcome
    }
}
