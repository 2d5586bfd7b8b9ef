//! Fan-in and chain behavior: shape preservation, wiring against already-
//! satisfied children, and value threading through multi-batch pipelines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use deferload::{
    chain, join_all, join_named, BatchGroup, Batcher, ClassId, LoadFuture, LoadQueue, Step,
    StepResult,
};
use serde_json::{json, Value};

/// Batched user lookup; resolves `id` to `"user<id>"`.
struct LoadUser {
    id: u64,
    calls: Arc<AtomicUsize>,
}

impl Batcher for LoadUser {
    fn class(&self) -> ClassId {
        ClassId::named("users")
    }

    fn instance_key(&self) -> Option<String> {
        Some(self.id.to_string())
    }

    fn load_batch(&self, _queue: &LoadQueue, group: &BatchGroup) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        group.satisfy_each(|id| json!(format!("user{id}")))?;
        Ok(())
    }
}

/// Name-to-id lookup, a second handler class for pipeline tests.
struct UserIdByName {
    name: &'static str,
    calls: Arc<AtomicUsize>,
}

impl Batcher for UserIdByName {
    fn class(&self) -> ClassId {
        ClassId::named("user-ids")
    }

    fn instance_key(&self) -> Option<String> {
        Some(self.name.to_owned())
    }

    fn load_batch(&self, _queue: &LoadQueue, group: &BatchGroup) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        group.satisfy_each(|name| json!(name.len() as u64))?;
        Ok(())
    }
}

#[test]
fn named_fan_in_preserves_the_key_set() {
    let calls = Arc::new(AtomicUsize::new(0));
    let queue = LoadQueue::new();

    let combined = join_named(vec![
        (
            "a".to_owned(),
            queue.load(LoadUser {
                id: 1,
                calls: calls.clone(),
            }),
        ),
        (
            "b".to_owned(),
            queue.load(LoadUser {
                id: 2,
                calls: calls.clone(),
            }),
        ),
    ]);

    assert!(!combined.satisfied());
    queue.drain().unwrap();

    assert_eq!(
        combined.result().unwrap(),
        json!({ "a": "user1", "b": "user2" })
    );
    // Both children were resolved by a single batch.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn indexed_fan_in_is_position_stable() {
    let calls = Arc::new(AtomicUsize::new(0));
    let queue = LoadQueue::new();

    let children: Vec<LoadFuture> = [3, 1, 2]
        .into_iter()
        .map(|id| {
            queue.load(LoadUser {
                id,
                calls: calls.clone(),
            })
        })
        .collect();
    let combined = join_all(children);

    queue.drain().unwrap();

    // Results sit at the positions the children were handed in, whatever
    // order the handler satisfied them in.
    assert_eq!(
        combined.result().unwrap(),
        json!(["user3", "user1", "user2"])
    );
}

#[test]
fn empty_fan_in_resolves_immediately() {
    assert_eq!(join_all(vec![]).result().unwrap(), json!([]));
    assert_eq!(join_named(vec![]).result().unwrap(), json!({}));
}

#[test]
fn fan_in_folds_in_already_satisfied_children() {
    let calls = Arc::new(AtomicUsize::new(0));
    let queue = LoadQueue::new();

    let combined = join_all(vec![
        LoadFuture::ready(json!("fixed")),
        queue.load(LoadUser {
            id: 5,
            calls: calls.clone(),
        }),
    ]);

    // One child is done already; the fan-in still waits for the other.
    assert!(!combined.satisfied());
    queue.drain().unwrap();
    assert_eq!(combined.result().unwrap(), json!(["fixed", "user5"]));
}

#[test]
fn fan_in_of_only_ready_children_resolves_during_wiring() {
    let combined = join_named(vec![
        ("x".to_owned(), LoadFuture::ready(json!(1))),
        ("y".to_owned(), LoadFuture::ready(json!(2))),
    ]);
    assert_eq!(combined.result().unwrap(), json!({ "x": 1, "y": 2 }));
}

#[test]
fn chain_threads_the_value_through_every_step() {
    let steps: Vec<Step> = vec![
        Box::new(|value: Value| StepResult::Value(json!(value.as_i64().unwrap() * 2))),
    ];
    let doubled = chain(LoadFuture::ready(json!(21)), steps);
    assert_eq!(doubled.result().unwrap(), json!(42));

    let steps: Vec<Step> = vec![
        Box::new(|value: Value| {
            StepResult::Future(LoadFuture::ready(json!(value.as_i64().unwrap() + 1)))
        }),
        Box::new(|value: Value| StepResult::Value(json!(value.as_i64().unwrap() * 10))),
    ];
    let piped = chain(LoadFuture::ready(json!(3)), steps);
    assert_eq!(piped.result().unwrap(), json!(40));
}

#[test]
fn chain_consumes_a_nested_load_across_batches() {
    let id_calls = Arc::new(AtomicUsize::new(0));
    let user_calls = Arc::new(AtomicUsize::new(0));
    let queue = LoadQueue::new();

    // Look up frank's id, then load frank by that id, then pass the loaded
    // record through unchanged.
    let seed = queue.load(UserIdByName {
        name: "frank",
        calls: id_calls.clone(),
    });

    let step_queue = queue.clone();
    let step_calls = user_calls.clone();
    let steps: Vec<Step> = vec![
        Box::new(move |id: Value| {
            StepResult::Future(step_queue.load(LoadUser {
                id: id.as_u64().unwrap(),
                calls: step_calls,
            }))
        }),
        Box::new(|record: Value| StepResult::Value(record)),
    ];
    let pipeline = chain(seed, steps);

    assert!(!pipeline.satisfied());
    queue.drain().unwrap();

    // "frank".len() == 5, so the nested load was for user 5.
    assert_eq!(pipeline.result().unwrap(), json!("user5"));
    assert_eq!(queue.pending_size(), 0);

    // Exactly one backend round trip per handler class.
    assert_eq!(id_calls.load(Ordering::SeqCst), 1);
    assert_eq!(user_calls.load(Ordering::SeqCst), 1);
}

#[test]
#[should_panic(expected = "ran out of steps")]
fn chain_panics_when_a_future_outlives_the_steps() {
    // The only step hands back another future, and nothing is left to
    // consume its value.
    let steps: Vec<Step> = vec![
        Box::new(|_: Value| StepResult::Future(LoadFuture::ready(json!("dangling")))),
    ];
    let _ = chain(LoadFuture::ready(json!(0)), steps);
}
