// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-unit execution context.
//!
//! The original design stored the context in a coroutine-local slot behind
//! a static accessor; here the context is passed explicitly down the
//! controller/sampler call chain, and the engine-wide properties are a
//! frozen shared map rather than a process global.

use crate::{
    controls::NextSampler,
    runner::{EngineHandle, WorkerHandle},
    sample::SampleResult,
    tree::NodeId,
};
use indexmap::IndexMap;
use serde_json::Value;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};

/// Engine-wide properties, frozen when the run starts.
pub type EngineProperties = Arc<IndexMap<SmolStr, String>>;

/// A string-keyed variable map with an iteration counter.
///
/// The iteration counter advances once per worker iteration and drives
/// per-iteration re-evaluation of dynamic function properties.
#[derive(Clone, Debug, Default)]
pub struct Variables {
    values: IndexMap<SmolStr, Value>,
    iteration: u64,
}

impl Variables {
    /// Creates an empty variable map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current worker iteration (zero before the first iteration).
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Advances the worker iteration counter.
    pub fn inc_iteration(&mut self) {
        self.iteration += 1;
    }

    /// Stores a value.
    pub fn put(&mut self, name: impl Into<SmolStr>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Looks up a value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Looks up a value rendered as a string (strings render without
    /// quotes).
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Looks up a boolean value; false when absent or not a boolean.
    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(Value::Bool(true)))
    }

    /// Whether `name` is set.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Removes a value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.shift_remove(name)
    }

    /// Copies every entry of `other` in.
    pub fn update(&mut self, other: &Variables) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), value.clone());
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no entries are set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-execution-unit scoped context: variables, handles, and the sampler
/// and result bookkeeping the processors and assertions read.
#[derive(Clone, Debug)]
pub struct ThreadContext {
    /// The unit's variable scope.
    pub variables: Variables,
    properties: EngineProperties,
    engine: Option<EngineHandle>,
    worker: Option<WorkerHandle>,
    thread_number: u32,
    thread_name: SmolStr,
    current_sampler: Option<NextSampler>,
    previous_sampler: Option<NextSampler>,
    previous_result: Option<SampleResult>,
    test_iteration_listeners: Vec<NodeId>,
    pending_delay: Duration,
}

impl ThreadContext {
    /// Creates a context over the frozen engine properties.
    pub fn new(properties: EngineProperties) -> Self {
        Self {
            variables: Variables::new(),
            properties,
            engine: None,
            worker: None,
            thread_number: 0,
            thread_name: SmolStr::default(),
            current_sampler: None,
            previous_sampler: None,
            previous_result: None,
            test_iteration_listeners: Vec::new(),
            pending_delay: Duration::ZERO,
        }
    }

    /// A context with no properties, for tests and standalone evaluation.
    pub fn detached() -> Self {
        Self::new(Arc::new(IndexMap::new()))
    }

    /// The engine-wide properties.
    pub fn properties(&self) -> &IndexMap<SmolStr, String> {
        &self.properties
    }

    /// The engine handle, when attached to a run.
    pub fn engine(&self) -> Option<&EngineHandle> {
        self.engine.as_ref()
    }

    pub(crate) fn set_engine(&mut self, engine: EngineHandle) {
        self.engine = Some(engine);
    }

    /// The worker handle, when attached to a worker.
    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    pub(crate) fn set_worker(&mut self, worker: WorkerHandle) {
        self.worker = Some(worker);
    }

    /// The unit's number within its worker.
    pub fn thread_number(&self) -> u32 {
        self.thread_number
    }

    pub(crate) fn set_thread_number(&mut self, number: u32) {
        self.thread_number = number;
    }

    /// The unit's display name.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub(crate) fn set_thread_name(&mut self, name: impl Into<SmolStr>) {
        self.thread_name = name.into();
    }

    /// The sampler currently being processed.
    pub fn current_sampler(&self) -> Option<&NextSampler> {
        self.current_sampler.as_ref()
    }

    /// The sampler processed before the current one.
    pub fn previous_sampler(&self) -> Option<&NextSampler> {
        self.previous_sampler.as_ref()
    }

    /// Shifts the current sampler into the previous slot and records the
    /// new one.
    pub fn set_current_sampler(&mut self, sampler: NextSampler) {
        self.previous_sampler = self.current_sampler.take();
        self.current_sampler = Some(sampler);
    }

    /// The most recent sample result.
    pub fn previous_result(&self) -> Option<&SampleResult> {
        self.previous_result.as_ref()
    }

    /// Records the most recent sample result.
    pub fn set_previous_result(&mut self, result: SampleResult) {
        self.previous_result = Some(result);
    }

    pub(crate) fn test_iteration_listeners(&self) -> &[NodeId] {
        &self.test_iteration_listeners
    }

    pub(crate) fn set_test_iteration_listeners(&mut self, listeners: Vec<NodeId>) {
        self.test_iteration_listeners = listeners;
    }

    /// Queues a delay for the executor to sleep before the next sample
    /// (foreach inter-iteration delays).
    pub fn add_pending_delay(&mut self, delay: Duration) {
        self.pending_delay += delay;
    }

    /// Takes the queued delay.
    pub fn take_pending_delay(&mut self) -> Duration {
        std::mem::take(&mut self.pending_delay)
    }

    /// Drops per-run state when the unit's main loop exits.
    pub fn clear(&mut self) {
        self.variables = Variables::new();
        self.worker = None;
        self.current_sampler = None;
        self.previous_sampler = None;
        self.previous_result = None;
        self.test_iteration_listeners.clear();
        self.pending_delay = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn variables_render_strings_without_quotes() {
        let mut variables = Variables::new();
        variables.put("s", "text");
        variables.put("n", json!(7));
        variables.put("l", json!([1, 2]));
        assert_eq!(variables.get_str("s").unwrap(), "text");
        assert_eq!(variables.get_str("n").unwrap(), "7");
        assert_eq!(variables.get_str("l").unwrap(), "[1,2]");
        assert!(variables.get_str("missing").is_none());
    }

    #[test]
    fn update_copies_entries_and_keeps_the_iteration() {
        let mut base = Variables::new();
        base.put("a", "1");
        let mut unit = Variables::new();
        unit.inc_iteration();
        unit.update(&base);
        assert_eq!(unit.get_str("a").unwrap(), "1");
        assert_eq!(unit.iteration(), 1);
    }

    #[test]
    fn current_sampler_shifts_to_previous() {
        let mut ctx = ThreadContext::detached();
        assert!(ctx.current_sampler().is_none());
        ctx.set_current_sampler(crate::controls::NextSampler::Node(crate::tree::NodeId::test(1)));
        ctx.set_current_sampler(crate::controls::NextSampler::Node(crate::tree::NodeId::test(2)));
        assert!(matches!(
            ctx.previous_sampler(),
            Some(crate::controls::NextSampler::Node(_))
        ));
    }
}
