//! The queue coordinator: owns the pending index, deduplicates loads by
//! identity, and drains them in grouped batches.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::batcher::{BatchGroup, Batcher, ClassId};
use crate::error::LoadError;
use crate::future::{BatchRoute, LoadFuture};
use crate::profile::{BatchThunk, Profiler};

/// The three-level index: handler class, then batching key, then instance
/// key. One pending future per triple, ever.
type TripleIndex = HashMap<ClassId, HashMap<String, HashMap<String, LoadFuture>>>;

#[derive(Default)]
struct QueueState {
    pending: TripleIndex,
    // Cardinality of `pending` across all three levels, kept denormalized
    // so emptiness checks don't walk the index.
    pending_size: usize,
    // Futures satisfied during the current drain. Lets a handler (or a
    // completion callback) re-inject an equivalent load and get the
    // already-resolved future back instantly. Cleared when the drain ends.
    satisfied: TripleIndex,
    class_weights: HashMap<ClassId, i64>,
    // Notification counters. `satisfied_total` is how the drain loop
    // observes progress made by handlers re-entering the queue.
    injected: u64,
    satisfied_total: u64,
}

impl QueueState {
    fn pending_entry(&self, route: &BatchRoute) -> Option<&LoadFuture> {
        self.pending
            .get(&route.class)?
            .get(&route.batch_key)?
            .get(&route.instance_key)
    }

    fn satisfied_entry(&self, route: &BatchRoute) -> Option<&LoadFuture> {
        self.satisfied
            .get(&route.class)?
            .get(&route.batch_key)?
            .get(&route.instance_key)
    }

    fn install(&mut self, route: &BatchRoute, future: LoadFuture) {
        self.pending
            .entry(route.class)
            .or_default()
            .entry(route.batch_key.clone())
            .or_default()
            .insert(route.instance_key.clone(), future);
        self.pending_size += 1;
        self.injected += 1;
    }

    /// Remove the future from `pending`, but only if the entry under its
    /// triple is this exact instance. Empty index levels are pruned so the
    /// class keys always reflect live work. Returns whether anything was
    /// removed.
    fn remove_pending(&mut self, route: &BatchRoute, future: &LoadFuture) -> bool {
        let Some(by_batch) = self.pending.get_mut(&route.class) else {
            return false;
        };
        let prune_batch = match by_batch.get_mut(&route.batch_key) {
            Some(by_instance) => {
                match by_instance.get(&route.instance_key) {
                    Some(existing) if existing.is_same(future) => {}
                    // Absent (benign double report) or a different instance
                    // under the same triple (a future that was never the
                    // queued one). Leave the index alone either way.
                    _ => return false,
                }
                by_instance.remove(&route.instance_key);
                by_instance.is_empty()
            }
            None => return false,
        };
        if prune_batch {
            by_batch.remove(&route.batch_key);
        }
        if by_batch.is_empty() {
            self.pending.remove(&route.class);
        }
        true
    }

    fn weight_of(&self, class: ClassId) -> i64 {
        self.class_weights.get(&class).copied().unwrap_or(0)
    }
}

pub(crate) struct QueueShared {
    state: Mutex<QueueState>,
    // Lives outside `QueueState` on purpose: the scoped primitive swaps the
    // queue, its size, and the weight table, but instrumentation stays put.
    profiler: Mutex<Option<Arc<dyn Profiler>>>,
}

impl QueueShared {
    /// Called from `LoadFuture::satisfy` on queued futures: move the entry
    /// from pending to the drain's satisfied cache and record progress.
    pub(crate) fn register_satisfaction(&self, route: &BatchRoute, future: &LoadFuture) {
        let mut state = self.state.lock().unwrap();
        if !state.remove_pending(route, future) {
            return;
        }
        state.pending_size -= 1;
        state.satisfied_total += 1;
        state
            .satisfied
            .entry(route.class)
            .or_default()
            .entry(route.batch_key.clone())
            .or_default()
            .insert(route.instance_key.clone(), future.clone());
        trace!(
            class = %route.class,
            batch_key = %route.batch_key,
            instance_key = %route.instance_key,
            "load satisfied"
        );
    }
}

/// The coordinator for a set of deferred loads.
///
/// Application code injects load requests (which may coalesce with
/// equivalent pending ones), then calls [`drain`] to resolve everything in
/// grouped batches: one [`Batcher::load_batch`] call per
/// `(class, batching key)` group, classes visited in ascending weight
/// order. Handlers may inject more work while a drain runs; the drain keeps
/// sweeping until the queue is empty.
///
/// Clones share the same queue.
///
/// [`drain`]: LoadQueue::drain
#[derive(Clone)]
pub struct LoadQueue {
    shared: Arc<QueueShared>,
}

impl LoadQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                profiler: Mutex::new(None),
            }),
        }
    }

    /// Build a future for `request` and inject it.
    ///
    /// The returned handle may be a *different, pre-existing* future when an
    /// equivalent load is already pending (or already satisfied during the
    /// current drain). Always adopt the returned handle; registering
    /// callbacks on a discarded duplicate does nothing useful.
    pub fn load(&self, request: impl Batcher) -> LoadFuture {
        self.ensure_queued(LoadFuture::batched(request))
    }

    /// Inject an already-built routed future. Fails with
    /// [`LoadError::NotBatchable`] for fan-in/chain futures, which have no
    /// handler to resolve them.
    pub fn enqueue(&self, future: &LoadFuture) -> Result<LoadFuture, LoadError> {
        if future.route().is_none() {
            return Err(LoadError::NotBatchable);
        }
        Ok(self.ensure_queued(future.clone()))
    }

    fn ensure_queued(&self, future: LoadFuture) -> LoadFuture {
        let route = future
            .route()
            .expect("ensure_queued requires a routed future");

        {
            let mut state = self.shared.state.lock().unwrap();

            // Piggyback on a load that already completed this drain.
            if let Some(hit) = state.satisfied_entry(route) {
                return hit.clone();
            }

            // Coalesce with an equivalent pending load.
            if let Some(hit) = state.pending_entry(route) {
                trace!(
                    class = %route.class,
                    batch_key = %route.batch_key,
                    instance_key = %route.instance_key,
                    "coalesced with pending load"
                );
                return hit.clone();
            }

            state.install(route, future.clone());
        }

        future.link_queue(&self.shared);
        future
    }

    /// How many futures are pending across every class and batching key.
    pub fn pending_size(&self) -> usize {
        self.shared.state.lock().unwrap().pending_size
    }

    /// Declare that `first`'s batches should be dispatched before
    /// `second`'s within a drain sweep.
    ///
    /// Weights only ever go up, so a later declaration cannot invert a
    /// previously established preference between unrelated classes.
    /// Contradictory declarations are not detected here; an unsatisfiable
    /// ordering shows up at drain time as [`LoadError::Stalled`].
    pub fn prefer_load_order(&self, first: ClassId, second: ClassId) {
        let mut state = self.shared.state.lock().unwrap();
        let first_weight = *state.class_weights.entry(first).or_insert(0);
        let second_weight = state
            .class_weights
            .entry(second)
            .or_insert(first_weight + 1);
        if *second_weight <= first_weight {
            *second_weight = first_weight + 1;
        }
    }

    /// Install a profiler that brackets every batch invocation.
    pub fn set_profiler(&self, profiler: impl Profiler + 'static) {
        *self.shared.profiler.lock().unwrap() = Some(Arc::new(profiler));
    }

    /// Run `body` against a freshly empty queue, restoring the previous
    /// queue, size, and weight table on exit (including on panic).
    ///
    /// Injections inside the scope land in the fresh queue and a `drain`
    /// inside the scope drains only that queue. Whatever the body leaves
    /// pending is discarded with the scope; drain before returning if you
    /// care about it.
    pub fn scoped<R>(&self, body: impl FnOnce(&LoadQueue) -> R) -> R {
        struct Restore<'a> {
            shared: &'a QueueShared,
            saved: Option<QueueState>,
        }

        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                if let Ok(mut state) = self.shared.state.lock() {
                    if let Some(saved) = self.saved.take() {
                        let scope_state = mem::replace(&mut *state, saved);
                        if scope_state.pending_size > 0 {
                            debug!(
                                discarded = scope_state.pending_size,
                                "scoped queue dropped with loads still pending"
                            );
                        }
                    }
                }
            }
        }

        let saved = {
            let mut state = self.shared.state.lock().unwrap();
            mem::take(&mut *state)
        };
        let _restore = Restore {
            shared: &self.shared,
            saved: Some(saved),
        };

        body(self)
    }

    /// Resolve every pending future.
    ///
    /// Repeatedly sweeps the handler classes in ascending weight order
    /// (ties broken by class name), dispatching one batch per
    /// `(class, batching key)` group. Work injected mid-sweep is picked up
    /// within the same sweep when its class hasn't been visited yet, and in
    /// the next sweep otherwise. Returns once nothing is pending.
    ///
    /// A no-op on an empty queue. On error the drain stops where it is;
    /// unresolved futures stay pending.
    pub fn drain(&self) -> Result<(), LoadError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.pending_size == 0 {
                return Ok(());
            }
            debug!(pending = state.pending_size, "draining load queue");
            state.satisfied.clear();
        }

        let outcome = self.drain_all();

        // The satisfied cache only answers re-injections within the drain
        // that produced it, so it goes away with the drain, error or not.
        self.shared.state.lock().unwrap().satisfied.clear();

        outcome
    }

    fn drain_all(&self) -> Result<(), LoadError> {
        let mut sweeps = 0usize;
        loop {
            let progress_before = self.shared.state.lock().unwrap().satisfied_total;

            let mut visited: HashSet<ClassId> = HashSet::new();
            while let Some(class) = self.next_class(&visited) {
                visited.insert(class);
                self.drain_class(class)?;
            }
            sweeps += 1;

            let state = self.shared.state.lock().unwrap();
            if state.pending_size == 0 {
                debug!(sweeps, "load queue drained");
                return Ok(());
            }
            if state.satisfied_total == progress_before {
                return Err(LoadError::Stalled {
                    pending: state.pending_size,
                });
            }
        }
    }

    /// The lowest-weight class with pending work that this sweep hasn't
    /// visited yet. Equal weights fall back to name order so the schedule
    /// is deterministic.
    fn next_class(&self, visited: &HashSet<ClassId>) -> Option<ClassId> {
        let state = self.shared.state.lock().unwrap();
        state
            .pending
            .keys()
            .copied()
            .filter(|class| !visited.contains(class))
            .min_by_key(|class| (state.weight_of(*class), *class))
    }

    fn drain_class(&self, class: ClassId) -> Result<(), LoadError> {
        let batch_keys: Vec<String> = {
            let state = self.shared.state.lock().unwrap();
            match state.pending.get(&class) {
                Some(by_batch) => {
                    let mut keys: Vec<String> = by_batch.keys().cloned().collect();
                    keys.sort();
                    keys
                }
                None => return Ok(()),
            }
        };

        for batch_key in batch_keys {
            self.drain_batch(class, &batch_key)?;
        }
        Ok(())
    }

    fn drain_batch(&self, class: ClassId, batch_key: &str) -> Result<(), LoadError> {
        // Snapshot the group. Futures injected while the handler runs are
        // *not* added to the in-flight group; they surface as new pending
        // work for a later dispatch.
        let (group, batcher): (BatchGroup, Arc<dyn Batcher>) = {
            let state = self.shared.state.lock().unwrap();
            let members = state
                .pending
                .get(&class)
                .and_then(|by_batch| by_batch.get(batch_key))
                .cloned()
                .unwrap_or_default();
            if members.is_empty() {
                // Satisfied out from under us since the key snapshot.
                return Ok(());
            }
            let group = BatchGroup::new(batch_key.to_owned(), members);
            let batcher = group
                .any_member()
                .and_then(|member| member.route())
                .map(|route| route.batcher.clone())
                .expect("queued future lost its batch route");
            (group, batcher)
        };

        let expected = group.len();
        trace!(%class, batch_key, size = expected, "dispatching batch");

        let profiler = self.shared.profiler.lock().unwrap().clone();
        let ran = Cell::new(false);
        let outcome = {
            let batch: BatchThunk<'_> = Box::new(|| {
                ran.set(true);
                batcher.load_batch(self, &group)
            });
            match profiler {
                Some(profiler) => profiler.around(class, batch_key, expected, batch),
                None => batch(),
            }
        };

        if let Err(source) = outcome {
            return Err(LoadError::HandlerFailed {
                class,
                batch_key: batch_key.to_owned(),
                source: source.into(),
            });
        }
        if !ran.get() {
            return Err(LoadError::HandlerFailed {
                class,
                batch_key: batch_key.to_owned(),
                source: anyhow::anyhow!("profiler dropped the batch without invoking it").into(),
            });
        }

        // The handler's end of the contract: every member of the snapshot
        // satisfied before load_batch returned.
        let actual = group.satisfied_members();
        if actual != expected {
            return Err(LoadError::BatchIncomplete {
                class,
                batch_key: batch_key.to_owned(),
                expected,
                actual,
            });
        }

        Ok(())
    }
}

impl Default for LoadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for LoadQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("LoadQueue")
            .field("pending_size", &state.pending_size)
            .field("injected", &state.injected)
            .field("satisfied_total", &state.satisfied_total)
            .finish()
    }
}
