//! The deferred-load handle: a result slot, a callback list, and (for
//! queueable loads) the route describing which handler resolves it.

use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::batcher::{Batcher, ClassId};
use crate::error::LoadError;
use crate::queue::QueueShared;

type Callback = Box<dyn FnOnce(&Value) + Send>;

/// Generate a fresh identity token for a request that declined to provide a
/// semantic instance key. Tokens are an ever-increasing integer; the `~`
/// prefix keeps them apart from user-supplied keys.
fn next_identity_token() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("~{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Where a queued future goes to be resolved: the grouping triple plus the
/// batcher that resolves its group. Snapshotted once at construction so the
/// queue indexes never shift under a live future.
pub(crate) struct BatchRoute {
    pub(crate) class: ClassId,
    pub(crate) batch_key: String,
    pub(crate) instance_key: String,
    pub(crate) batcher: Arc<dyn Batcher>,
}

impl Debug for BatchRoute {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRoute")
            .field("class", &self.class)
            .field("batch_key", &self.batch_key)
            .field("instance_key", &self.instance_key)
            .field("batcher", &"<batcher>")
            .finish()
    }
}

struct FutureCore {
    // The write-once result slot. `None` is what "pending" means; a
    // satisfied-with-nothing load holds `Some(Value::Null)`.
    result: Option<Value>,
    callbacks: Vec<Callback>,
    // The queue this future was installed into, if any. Used to report
    // satisfaction back so the pending index stays truthful. Weak: a queue
    // that has been dropped simply stops hearing about satisfactions.
    queue: Weak<QueueShared>,
}

struct FutureInner {
    core: Mutex<FutureCore>,
    route: Option<BatchRoute>,
}

/// A handle to one deferred load.
///
/// Handles are cheap to clone and all clones observe the same satisfaction;
/// this is what lets the queue hand the *same* future back to every caller
/// that asks for an equivalent load.
///
/// A future built from a [`Batcher`] carries a batch route and is resolved
/// by draining the queue it was injected into. Futures built by the
/// combinators in [`crate::combine`] have no route: they resolve themselves
/// when their children do, and the queue refuses them.
#[derive(Clone)]
pub struct LoadFuture {
    inner: Arc<FutureInner>,
}

impl LoadFuture {
    /// Build a routed future from a load request. This does *not* queue it;
    /// use [`LoadQueue::load`](crate::queue::LoadQueue::load) for the
    /// build-and-inject path.
    pub fn batched(request: impl Batcher) -> Self {
        let route = BatchRoute {
            class: request.class(),
            batch_key: request.batch_key(),
            instance_key: request
                .instance_key()
                .unwrap_or_else(next_identity_token),
            batcher: Arc::new(request),
        };

        Self::with_route(Some(route))
    }

    /// A future with no route, pending until something satisfies it
    /// directly. The combinators build on this.
    pub(crate) fn detached() -> Self {
        Self::with_route(None)
    }

    /// An already-satisfied detached future. Handy as the seed of a chain
    /// or a fixed step value.
    pub fn ready(value: Value) -> Self {
        let future = Self::detached();
        let mut core = future.inner.core.lock().unwrap();
        core.result = Some(value);
        drop(core);
        future
    }

    fn with_route(route: Option<BatchRoute>) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                core: Mutex::new(FutureCore {
                    result: None,
                    callbacks: Vec::new(),
                    queue: Weak::new(),
                }),
                route,
            }),
        }
    }

    /// Whether this future has a batch route (i.e. is resolved by a handler
    /// rather than by other futures).
    pub fn is_batched(&self) -> bool {
        self.inner.route.is_some()
    }

    /// Whether the result slot is filled.
    pub fn satisfied(&self) -> bool {
        self.inner.core.lock().unwrap().result.is_some()
    }

    /// The resolved value. Fails with [`LoadError::NotYetSatisfied`] while
    /// pending; drain the queue first.
    pub fn result(&self) -> Result<Value, LoadError> {
        self.inner
            .core
            .lock()
            .unwrap()
            .result
            .clone()
            .ok_or(LoadError::NotYetSatisfied)
    }

    /// Transition this future to satisfied.
    ///
    /// Writes the result slot, reports the satisfaction to the owning queue
    /// (so the pending index and drain bookkeeping stay correct), then
    /// fires every registered callback in registration order. Reserved for
    /// handlers inside [`Batcher::load_batch`] and for the combinators;
    /// anything else satisfying a queued future out from under its handler
    /// will surface as a failed drain.
    pub fn satisfy(&self, value: Value) -> Result<(), LoadError> {
        let (callbacks, queue, fire) = {
            let mut core = self.inner.core.lock().unwrap();
            if core.result.is_some() {
                return Err(LoadError::AlreadySatisfied);
            }

            let callbacks = mem::take(&mut core.callbacks);
            let fire = if callbacks.is_empty() {
                None
            } else {
                Some(value.clone())
            };
            core.result = Some(value);

            (callbacks, core.queue.clone(), fire)
        };

        // Report before firing callbacks: a callback may immediately inject
        // an equivalent load, and the queue must already know this triple is
        // satisfied to answer it from the cache.
        if let Some(route) = self.inner.route.as_ref() {
            if let Some(shared) = queue.upgrade() {
                shared.register_satisfaction(route, self);
            }
        }

        if let Some(value) = fire {
            for callback in callbacks {
                callback(&value);
            }
        }

        Ok(())
    }

    /// Register a completion callback taking the resolved value.
    ///
    /// On an already-satisfied future the callback runs synchronously, right
    /// now; otherwise it runs at satisfaction time, after every callback
    /// registered before it.
    pub fn on_satisfied(&self, callback: impl FnOnce(&Value) + Send + 'static) {
        let mut core = self.inner.core.lock().unwrap();
        if let Some(value) = core.result.clone() {
            drop(core);
            callback(&value);
        } else {
            core.callbacks.push(Box::new(callback));
        }
    }

    /// Do these two handles refer to the same underlying future? Coalescing
    /// means the queue may hand you a handle injected by someone else; this
    /// is how you tell.
    pub fn is_same(&self, other: &LoadFuture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn route(&self) -> Option<&BatchRoute> {
        self.inner.route.as_ref()
    }

    /// Remember which queue this future was installed into.
    pub(crate) fn link_queue(&self, shared: &Arc<QueueShared>) {
        self.inner.core.lock().unwrap().queue = Arc::downgrade(shared);
    }
}

impl Debug for LoadFuture {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock().unwrap();
        f.debug_struct("LoadFuture")
            .field("satisfied", &core.result.is_some())
            .field("callbacks", &core.callbacks.len())
            .field("route", &self.inner.route)
            .finish()
    }
}
