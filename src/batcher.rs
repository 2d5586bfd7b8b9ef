//! The handler side of the coordinator: how a group of queued futures gets
//! resolved in one shot.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};

use serde_json::Value;

use crate::error::LoadError;
use crate::future::LoadFuture;
use crate::queue::LoadQueue;

/// The batching key used when a [`Batcher`] doesn't override
/// [`Batcher::batch_key`]: every instance of the class lands in one group.
pub const DEFAULT_BATCH_KEY: &str = "all";

/// Opaque identity tag for a handler class. Two requests with the same
/// `ClassId` are resolved by the same `load_batch` implementation.
///
/// The tag is `Ord` so that classes with equal drain weights sort
/// deterministically by name.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(&'static str);

impl ClassId {
    /// The default identity for a batcher type: its type name.
    pub fn of<T: ?Sized>() -> Self {
        ClassId(std::any::type_name::<T>())
    }

    /// An explicitly named identity, for when the type name is too
    /// unwieldy or several types should share a handler class.
    pub const fn named(name: &'static str) -> Self {
        ClassId(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl Display for ClassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Debug for ClassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId({})", self.0)
    }
}

/// A batchable load request.
///
/// A value implementing `Batcher` describes *what* is being loaded (via its
/// keys) and *how* a whole group of equivalent requests is resolved at once
/// (via [`load_batch`]). The queue groups pending futures by
/// `(class, batch_key)` and hands each group to the batcher of one of its
/// members, so `load_batch` must not depend on per-instance state beyond
/// what every member of the class shares.
///
/// [`load_batch`]: Batcher::load_batch
pub trait Batcher: Send + Sync + 'static {
    /// Which handler class resolves this request. Defaults to the
    /// implementing type's identity.
    fn class(&self) -> ClassId
    where
        Self: Sized,
    {
        ClassId::of::<Self>()
    }

    /// Partitions requests of one class into groups that are resolved in a
    /// single `load_batch` call each.
    fn batch_key(&self) -> String {
        DEFAULT_BATCH_KEY.to_owned()
    }

    /// Identifies *what* is being loaded within a `(class, batch_key)`
    /// group. Two pending requests with the same triple are coalesced into
    /// one future.
    ///
    /// `None` (the default) assigns a fresh identity token, making the
    /// request unique and never coalesced. Override this with a semantic
    /// key whenever one exists.
    fn instance_key(&self) -> Option<String> {
        None
    }

    /// Resolve an entire group in one shot.
    ///
    /// Contract: call [`LoadFuture::satisfy`] exactly once on every member
    /// of `group` before returning (use [`Value::Null`] when there is no
    /// useful result), and do not satisfy futures outside the group. The
    /// queue verifies the group afterwards and fails the drain if members
    /// were left pending.
    ///
    /// Injecting *new* futures through `queue` is fine; they are picked up
    /// later in the same drain.
    fn load_batch(&self, queue: &LoadQueue, group: &BatchGroup) -> anyhow::Result<()>;
}

/// A snapshot of one batch group, keyed by instance key, handed to
/// [`Batcher::load_batch`].
///
/// Futures injected while the handler runs are *not* added to the in-flight
/// group; they show up as fresh pending work.
pub struct BatchGroup {
    batch_key: String,
    members: HashMap<String, LoadFuture>,
}

impl BatchGroup {
    pub(crate) fn new(batch_key: String, members: HashMap<String, LoadFuture>) -> Self {
        Self { batch_key, members }
    }

    /// The batching key this group was gathered under.
    pub fn batch_key(&self) -> &str {
        &self.batch_key
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The instance keys in this group. Unique, in arbitrary order.
    pub fn keys(&self) -> impl Iterator<Item = &str> + Clone {
        self.members.keys().map(String::as_str)
    }

    pub fn get(&self, instance_key: &str) -> Option<&LoadFuture> {
        self.members.get(instance_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LoadFuture)> {
        self.members.iter().map(|(key, fut)| (key.as_str(), fut))
    }

    /// Satisfy every member of the group by mapping its instance key to a
    /// value. This is the common tail of a handler: execute the backend
    /// request up front, then distribute the results.
    pub fn satisfy_each(
        &self,
        mut value_for: impl FnMut(&str) -> Value,
    ) -> Result<(), LoadError> {
        for (key, future) in &self.members {
            future.satisfy(value_for(key))?;
        }
        Ok(())
    }

    /// Fallible version of [`satisfy_each`]. Stops at the first error;
    /// members already visited stay satisfied.
    ///
    /// [`satisfy_each`]: BatchGroup::satisfy_each
    pub fn try_satisfy_each<E>(
        &self,
        mut value_for: impl FnMut(&str) -> Result<Value, E>,
    ) -> anyhow::Result<()>
    where
        E: Into<anyhow::Error>,
    {
        for (key, future) in &self.members {
            let value = value_for(key).map_err(Into::into)?;
            future.satisfy(value)?;
        }
        Ok(())
    }

    /// How many members have been satisfied so far. The queue uses this
    /// after `load_batch` returns to verify the handler held up its end.
    pub(crate) fn satisfied_members(&self) -> usize {
        self.members.values().filter(|f| f.satisfied()).count()
    }

    /// An arbitrary member, used to reach the shared batcher for the group.
    pub(crate) fn any_member(&self) -> Option<&LoadFuture> {
        self.members.values().next()
    }
}

impl Debug for BatchGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchGroup")
            .field("batch_key", &self.batch_key)
            .field("size", &self.members.len())
            .finish()
    }
}
