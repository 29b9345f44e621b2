// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The foreach controller.

use crate::{
    controls::{generic_initialize, ControlResult, Controller, GenericController},
    elements::{interface::LoopIterationListener, Caps, ElementCore, TestElement},
    impl_test_element,
    tree::TestTree,
    worker::ThreadContext,
};
use serde_json::Value;
use smol_str::SmolStr;
use std::time::Duration;
use tracing::{debug, error};

/// Iterates a list, assigning each item to target variables before each
/// inner pass.
///
/// The iterable comes either from a variable (`VARIABLE` source) or from a
/// literal expression (`CUSTOM` source, evaluated and parsed as JSON). An
/// object iterates as `[key, value]` pairs. Multiple comma-separated
/// target names destructure array items positionally.
#[derive(Clone, Debug)]
pub struct ForeachController {
    core: ElementCore,
    generic: GenericController,
    loop_count: u64,
    break_flag: bool,
    items: Vec<Value>,
    iter_index: usize,
    last_index: usize,
    targets: Vec<SmolStr>,
}

impl ForeachController {
    /// Property key for the comma-separated target variable names.
    pub const TARGET: &'static str = "ForeachController__target";
    /// Property key for the iterable (variable name or literal).
    pub const ITERABLE: &'static str = "ForeachController__iterable";
    /// Property key for the iterable source (`VARIABLE` or `CUSTOM`).
    pub const SOURCE: &'static str = "ForeachController__source";
    /// Property key for the inter-iteration delay in milliseconds.
    pub const DELAY: &'static str = "ForeachController__delay";

    /// Creates a foreach controller over the variable `iterable`,
    /// assigning items to `target`.
    pub fn new(name: &str, target: &str, iterable: &str) -> Self {
        let mut controller = Self {
            core: ElementCore::named(name),
            generic: GenericController::default(),
            loop_count: 0,
            break_flag: false,
            items: Vec::new(),
            iter_index: 0,
            last_index: 0,
            targets: Vec::new(),
        };
        controller.core.put_basic(Self::TARGET, target);
        controller.core.put_basic(Self::ITERABLE, iterable);
        controller.core.put_basic(Self::SOURCE, "VARIABLE");
        controller
    }

    /// Prepares the iteration data. Returns false when the iterable is
    /// missing, empty, or not iterable.
    fn init_foreach(&mut self, ctx: &ThreadContext) -> bool {
        let target = self.core.prop_str(Self::TARGET, ctx);
        self.targets = target
            .split(',')
            .map(|t| SmolStr::new(t.trim()))
            .filter(|t| !t.is_empty())
            .collect();
        if self.targets.is_empty() {
            error!(controller = %self.name(), "no target variable names; cannot iterate");
            return false;
        }

        let source = self.core.prop_str(Self::SOURCE, ctx);
        let iterable = self.core.prop_str(Self::ITERABLE, ctx);
        let value = match source.trim() {
            "VARIABLE" => ctx
                .variables
                .get(&iterable)
                .cloned()
                .or_else(|| ctx.properties().get(iterable.as_str()).map(|p| Value::String(p.clone()))),
            "CUSTOM" => Some(Value::String(iterable.clone())),
            other => {
                error!(
                    controller = %self.name(),
                    source = other,
                    "unsupported iterable source; cannot iterate"
                );
                return false;
            }
        };
        let Some(value) = value else {
            error!(controller = %self.name(), %iterable, "iterable not found; cannot iterate");
            return false;
        };

        // A string value is itself parsed as JSON, so variables holding
        // serialized lists iterate too.
        let value = match value {
            Value::String(text) => match serde_json::from_str(&text) {
                Ok(parsed) => parsed,
                Err(_) => {
                    error!(
                        controller = %self.name(),
                        text = %text,
                        "iterable is not a JSON array or object; cannot iterate"
                    );
                    return false;
                }
            },
            other => other,
        };

        self.items = match value {
            Value::Array(items) => items,
            Value::Object(entries) => entries
                .into_iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k), v]))
                .collect(),
            other => {
                error!(controller = %self.name(), value = %other, "value is not iterable");
                return false;
            }
        };
        if self.items.is_empty() {
            error!(controller = %self.name(), "iterable is empty; cannot iterate");
            return false;
        }
        self.last_index = self.items.len();
        debug!(controller = %self.name(), items = self.last_index, "foreach initialized");
        true
    }

    /// Assigns the current item to the target variables.
    fn iterate_data(&mut self, ctx: &mut ThreadContext) {
        let item = self.items[self.iter_index].clone();
        debug!(
            controller = %self.name(),
            index = self.iter_index,
            "foreach assigns next item"
        );
        match (&item, self.targets.len()) {
            (Value::Array(parts), n) if n > 1 => {
                for (target, part) in self.targets.iter().zip(parts.iter()) {
                    ctx.variables.put(target.clone(), part.clone());
                }
            }
            _ => {
                ctx.variables.put(self.targets[0].clone(), item);
            }
        }
        self.iter_index += 1;
    }

    fn end_of_loop(&self) -> bool {
        self.break_flag || self.loop_count >= self.last_index as u64
    }

    fn reset_break(&mut self) {
        self.break_flag = false;
    }

    fn reset_loop_count(&mut self) {
        self.loop_count = 0;
        self.iter_index = 0;
    }

    fn update_iteration_index(&self, ctx: &mut ThreadContext) {
        let key = format!("__{}__idx", self.name());
        ctx.variables.put(key, Value::from(self.loop_count));
    }
}

impl Default for ForeachController {
    fn default() -> Self {
        Self::new("Foreach Controller", "item", "items")
    }
}

impl Controller for ForeachController {
    fn generic(&self) -> &GenericController {
        &self.generic
    }

    fn generic_mut(&mut self) -> &mut GenericController {
        &mut self.generic
    }

    fn done(&self) -> bool {
        if self.last_index > 0 && self.loop_count >= self.last_index as u64 {
            return true;
        }
        self.generic.done
    }

    fn next(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) -> ControlResult {
        self.update_iteration_index(ctx);
        let error = self.generic.first && !self.init_foreach(ctx);

        if error || self.end_of_loop() {
            self.re_initialize();
            self.reset_break();
            self.update_iteration_index(ctx);
            return Ok(None);
        }

        if self.loop_count + 1 > self.iter_index as u64 {
            self.iterate_data(ctx);
        }

        let sampler = self.generic_next(tree, ctx)?;
        if sampler.is_some() {
            let delay = self.core.prop_int(Self::DELAY, ctx);
            if delay > 0 {
                ctx.add_pending_delay(Duration::from_millis(delay as u64));
            }
        }
        self.update_iteration_index(ctx);
        Ok(sampler)
    }

    fn next_is_null(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) -> ControlResult {
        self.re_initialize();
        if self.end_of_loop() {
            self.reset_break();
            self.reset_loop_count();
            return Ok(None);
        }
        self.next(tree, ctx)
    }

    fn initialize(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) {
        self.reset_loop_count();
        self.break_flag = false;
        self.last_index = 0;
        self.items.clear();
        generic_initialize(self, tree, ctx);
    }

    fn re_initialize(&mut self) {
        let state = self.generic_mut();
        state.first = true;
        state.current = 0;
        self.loop_count += 1;
        self.core.recover_running_version();
    }

    fn trigger_end_of_loop(&mut self) {
        self.re_initialize();
        self.reset_loop_count();
    }

    fn start_next_loop(&mut self) {
        self.re_initialize();
    }

    fn break_loop(&mut self) {
        self.break_flag = true;
        let state = self.generic_mut();
        state.first = true;
        state.current = 0;
        self.reset_loop_count();
        self.core.recover_running_version();
    }
}

impl LoopIterationListener for ForeachController {
    fn iteration_start(&mut self, _source: &str, _iteration: u64) {
        self.re_initialize();
        self.reset_loop_count();
    }
}

impl_test_element!(ForeachController {
    caps: Caps::CONTROLLER
        .union(Caps::ITERATING)
        .union(Caps::LOOP_ITERATION_LISTENER),
    accessors: [controller, loop_iteration_listener],
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{controls::NextSampler, elements::builtin::DebugSampler, tree::{NodeId, TestTree}};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn harness(target: &str, source: &str, iterable: &str) -> (TestTree, NodeId, ThreadContext) {
        let mut tree = TestTree::new();
        let mut controller = ForeachController::new("each", target, iterable);
        controller.core.put_basic(ForeachController::SOURCE, source);
        let id = tree.insert(&[], Box::new(controller));
        let sampler = tree.insert(&[id], Box::new(DebugSampler::new("s")));
        tree.with_node_mut(id, |el| {
            el.as_controller_mut().unwrap().add_child(sampler);
        });
        (tree, id, ThreadContext::detached())
    }

    fn next(tree: &mut TestTree, id: NodeId, ctx: &mut ThreadContext) -> Option<NextSampler> {
        tree.with_taken(id, |el, tree| {
            el.as_controller_mut().unwrap().next(tree, ctx)
        })
        .unwrap()
    }

    #[test]
    fn missing_iterable_yields_nothing() {
        let (mut tree, id, mut ctx) = harness("item", "VARIABLE", "nope");
        assert!(next(&mut tree, id, &mut ctx).is_none());
    }

    #[test]
    fn empty_iterable_yields_nothing() {
        let (mut tree, id, mut ctx) = harness("item", "CUSTOM", "[]");
        assert!(next(&mut tree, id, &mut ctx).is_none());
    }

    #[test]
    fn custom_source_iterates_and_assigns_the_target() {
        let (mut tree, id, mut ctx) = harness("item", "CUSTOM", r#"["alpha","beta"]"#);

        assert!(next(&mut tree, id, &mut ctx).is_some());
        assert_eq!(ctx.variables.get_str("item").unwrap(), "alpha");

        assert!(next(&mut tree, id, &mut ctx).is_some());
        assert_eq!(ctx.variables.get_str("item").unwrap(), "beta");

        assert!(next(&mut tree, id, &mut ctx).is_none());
    }

    #[test]
    fn variable_source_reads_the_context() {
        let (mut tree, id, mut ctx) = harness("n", "VARIABLE", "numbers");
        ctx.variables.put("numbers", json!([1, 2, 3]));

        let mut seen = Vec::new();
        while next(&mut tree, id, &mut ctx).is_some() {
            seen.push(ctx.variables.get_str("n").unwrap());
        }
        assert_eq!(seen, vec!["1", "2", "3"]);
    }

    #[test]
    fn multiple_targets_destructure_array_items() {
        let (mut tree, id, mut ctx) = harness("x, y", "CUSTOM", "[[1,2],[3,4]]");

        assert!(next(&mut tree, id, &mut ctx).is_some());
        assert_eq!(ctx.variables.get_str("x").unwrap(), "1");
        assert_eq!(ctx.variables.get_str("y").unwrap(), "2");

        assert!(next(&mut tree, id, &mut ctx).is_some());
        assert_eq!(ctx.variables.get_str("x").unwrap(), "3");
        assert_eq!(ctx.variables.get_str("y").unwrap(), "4");
    }

    #[test]
    fn objects_iterate_as_key_value_pairs() {
        let (mut tree, id, mut ctx) = harness("k, v", "CUSTOM", r#"{"a":1,"b":2}"#);

        assert!(next(&mut tree, id, &mut ctx).is_some());
        assert_eq!(ctx.variables.get_str("k").unwrap(), "a");
        assert_eq!(ctx.variables.get_str("v").unwrap(), "1");
    }

    #[test]
    fn delay_is_queued_on_the_context() {
        let (mut tree, id, mut ctx) = harness("item", "CUSTOM", r#"["only"]"#);
        tree.with_node_mut(id, |el| {
            el.core_mut().put_basic(ForeachController::DELAY, "25");
        });
        assert!(next(&mut tree, id, &mut ctx).is_some());
        assert_eq!(ctx.take_pending_delay(), Duration::from_millis(25));
    }
}
