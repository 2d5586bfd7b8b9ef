//! A batched deferred-load coordinator.
//!
//! Application code describes pending fetches as [`LoadFuture`] handles.
//! The [`LoadQueue`] coalesces equivalent requests by identity, groups the
//! rest by handler class and batching key, and resolves each group with a
//! single [`Batcher::load_batch`] call when drained, so related fetches
//! share one round trip to whatever backend the handler talks to.
//!
//! ```
//! use deferload::{BatchGroup, Batcher, LoadQueue};
//! use serde_json::json;
//!
//! struct LoadUser { id: u64 }
//!
//! impl Batcher for LoadUser {
//!     fn instance_key(&self) -> Option<String> {
//!         Some(self.id.to_string())
//!     }
//!
//!     fn load_batch(&self, _queue: &LoadQueue, group: &BatchGroup) -> anyhow::Result<()> {
//!         // One backend request for every id in the group.
//!         group.satisfy_each(|id| json!({ "id": id }))?;
//!         Ok(())
//!     }
//! }
//!
//! let queue = LoadQueue::new();
//! let alice = queue.load(LoadUser { id: 7 });
//! let bob = queue.load(LoadUser { id: 8 });
//! queue.drain()?;
//! assert!(alice.result()?.is_object() && bob.result()?.is_object());
//! # Ok::<(), deferload::LoadError>(())
//! ```

mod batcher;
mod combine;
mod error;
mod future;
mod profile;
mod queue;


pub use batcher::{BatchGroup, Batcher, ClassId, DEFAULT_BATCH_KEY};
pub use combine::{chain, join_all, join_named, Step, StepResult};
pub use error::LoadError;
pub use future::LoadFuture;
pub use profile::{BatchThunk, Profiler, TimingProfiler};
pub use queue::LoadQueue;
