//! Futures built out of other futures: fan-in over a collection, and a
//! stepwise chain that threads a value through a pipeline.
//!
//! Combinator futures never enter the queue. They wire completion callbacks
//! onto their children and satisfy themselves once the children have; the
//! queue only ever sees the children.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::future::LoadFuture;

/// What a chain step produced: another future to wait on, or the chain's
/// final value.
pub enum StepResult {
    Future(LoadFuture),
    Value(Value),
}

/// One step of a [`chain`]: takes the previous step's resolved value.
pub type Step = Box<dyn FnOnce(Value) -> StepResult + Send>;

/// Fan-in over a keyed collection of futures.
///
/// Resolves to a `Value::Object` with the same key set, each key mapped to
/// its child's result. An empty input resolves immediately with an empty
/// object. Children that are already satisfied are folded in during wiring.
pub fn join_named(children: Vec<(String, LoadFuture)>) -> LoadFuture {
    struct NamedFanIn {
        results: Map<String, Value>,
        remaining: usize,
    }

    let target = LoadFuture::detached();
    if children.is_empty() {
        target
            .satisfy(Value::Object(Map::new()))
            .expect("fresh fan-in future was already satisfied");
        return target;
    }

    let state = Arc::new(Mutex::new(NamedFanIn {
        results: Map::new(),
        remaining: children.len(),
    }));

    for (key, child) in children {
        let state = state.clone();
        let target = target.clone();
        child.on_satisfied(move |value| {
            let finished = {
                let mut state = state.lock().unwrap();
                state.results.insert(key, value.clone());
                state.remaining -= 1;
                if state.remaining == 0 {
                    Some(mem::take(&mut state.results))
                } else {
                    None
                }
            };
            if let Some(results) = finished {
                target
                    .satisfy(Value::Object(results))
                    .expect("fan-in future satisfied twice");
            }
        });
    }

    target
}

/// Fan-in over an ordered sequence of futures.
///
/// Resolves to a `Value::Array` of equal length with each child's result at
/// its original position, regardless of satisfaction order. An empty input
/// resolves immediately with an empty array.
pub fn join_all(children: Vec<LoadFuture>) -> LoadFuture {
    struct IndexedFanIn {
        // Pre-sized so each callback writes its own slot and position is
        // independent of completion order.
        slots: Vec<Option<Value>>,
        remaining: usize,
    }

    let target = LoadFuture::detached();
    if children.is_empty() {
        target
            .satisfy(Value::Array(Vec::new()))
            .expect("fresh fan-in future was already satisfied");
        return target;
    }

    let state = Arc::new(Mutex::new(IndexedFanIn {
        slots: vec![None; children.len()],
        remaining: children.len(),
    }));

    for (index, child) in children.into_iter().enumerate() {
        let state = state.clone();
        let target = target.clone();
        child.on_satisfied(move |value| {
            let finished = {
                let mut state = state.lock().unwrap();
                state.slots[index] = Some(value.clone());
                state.remaining -= 1;
                if state.remaining == 0 {
                    Some(mem::take(&mut state.slots))
                } else {
                    None
                }
            };
            if let Some(slots) = finished {
                let values = slots
                    .into_iter()
                    .map(|slot| slot.expect("fan-in slot left unfilled"))
                    .collect();
                target
                    .satisfy(Value::Array(values))
                    .expect("fan-in future satisfied twice");
            }
        });
    }

    target
}

/// Thread a seed future's result through a pipeline of steps.
///
/// When the current future resolves, the next step runs with its value. A
/// step returning [`StepResult::Future`] re-arms the walker on that future
/// (which may well be a freshly injected load, resolved by a later batch);
/// [`StepResult::Value`] ends the chain and satisfies the returned future
/// with it.
///
/// # Panics
///
/// Panics if a future resolves after the last step has been consumed: the
/// pipeline produced more intermediate futures than there were steps to
/// receive them. With `n` steps, the `n`-th must return a final value.
pub fn chain(seed: LoadFuture, steps: Vec<Step>) -> LoadFuture {
    let target = LoadFuture::detached();
    advance(&seed, Arc::new(Mutex::new(VecDeque::from(steps))), target.clone());
    target
}

fn advance(current: &LoadFuture, remaining: Arc<Mutex<VecDeque<Step>>>, target: LoadFuture) {
    current.on_satisfied(move |value| {
        let step = remaining
            .lock()
            .unwrap()
            .pop_front()
            .expect("chain ran out of steps: a future resolved with no step left to consume it");
        match step(value.clone()) {
            StepResult::Future(next) => advance(&next, remaining, target),
            StepResult::Value(value) => {
                target
                    .satisfy(value)
                    .expect("chain future satisfied twice");
            }
        }
    });
}
