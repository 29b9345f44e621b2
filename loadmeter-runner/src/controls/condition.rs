// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The if controller.

use crate::{
    controls::{ControlResult, Controller, GenericController},
    elements::{interface::LoopIterationListener, Caps, ElementCore, TestElement},
    impl_test_element,
    tree::TestTree,
    worker::ThreadContext,
};
use tracing::debug;

/// Runs its children only while a condition expression evaluates to the
/// literal `true`.
///
/// The condition is usually a `${…}` expression and is re-evaluated at the
/// start of every pass; while inside the subtree the stored outcome is
/// kept, so the subtree cannot be cut off halfway through an iteration.
#[derive(Clone, Debug)]
pub struct IfController {
    core: ElementCore,
    generic: GenericController,
    condition_result: bool,
}

impl IfController {
    /// Property key for the condition expression.
    pub const CONDITION: &'static str = "IfController__condition";

    /// Creates an if controller over `condition`.
    pub fn new(name: &str, condition: &str) -> Self {
        let mut controller = Self {
            core: ElementCore::named(name),
            generic: GenericController::default(),
            condition_result: false,
        };
        controller.core.put_basic(Self::CONDITION, condition);
        controller
    }

    fn evaluate_condition(&mut self, ctx: &ThreadContext) -> bool {
        let value = self.core.prop_str(Self::CONDITION, ctx);
        let result = value.trim().eq_ignore_ascii_case("true");
        debug!(controller = %self.name(), condition = %value, result, "condition evaluated");
        result
    }
}

impl Default for IfController {
    fn default() -> Self {
        Self::new("If Controller", "true")
    }
}

impl Controller for IfController {
    fn generic(&self) -> &GenericController {
        &self.generic
    }

    fn generic_mut(&mut self) -> &mut GenericController {
        &mut self.generic
    }

    fn next(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) -> ControlResult {
        if self.generic.first {
            self.condition_result = self.evaluate_condition(ctx);
        }
        if self.condition_result {
            return self.generic_next(tree, ctx);
        }
        // Condition is false: skip to the parent's next child. The next
        // pass re-evaluates.
        self.re_initialize();
        Ok(None)
    }
}

impl LoopIterationListener for IfController {
    fn iteration_start(&mut self, _source: &str, _iteration: u64) {
        self.re_initialize();
    }
}

impl_test_element!(IfController {
    caps: Caps::CONTROLLER.union(Caps::LOOP_ITERATION_LISTENER),
    accessors: [controller, loop_iteration_listener],
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controls::NextSampler,
        elements::builtin::DebugSampler,
        functions::{compile_property, FunctionRegistry},
        tree::{NodeId, TestTree},
    };

    fn harness(condition: &str) -> (TestTree, NodeId, ThreadContext) {
        let mut tree = TestTree::new();
        let id = tree.insert(&[], Box::new(IfController::new("if", condition)));
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
    fn true_condition_runs_the_children() {
        let (mut tree, id, mut ctx) = harness("true");
        assert!(next(&mut tree, id, &mut ctx).is_some());
    }

    #[test]
    fn false_condition_skips_to_the_parent() {
        let (mut tree, id, mut ctx) = harness("false");
        assert!(next(&mut tree, id, &mut ctx).is_none());
        // Never done: the next iteration re-evaluates.
        assert!(!tree.with_node(id, |el| el.as_controller().unwrap().done()));
    }

    #[test]
    fn condition_is_reevaluated_each_iteration() {
        let (mut tree, id, mut ctx) = harness("true");
        let registry = FunctionRegistry::default();
        tree.with_node_mut(id, |el| {
            el.core_mut()
                .add_property(
                    IfController::CONDITION,
                    compile_property("${go}", &registry).unwrap(),
                )
                .unwrap();
            el.set_running_version(true);
        });

        ctx.variables.inc_iteration();
        ctx.variables.put("go", "true");
        assert!(next(&mut tree, id, &mut ctx).is_some());
        // Finish the pass so the next call re-evaluates.
        assert!(next(&mut tree, id, &mut ctx).is_none());

        // The condition is a dynamic function property: it re-evaluates
        // once the worker iteration advances.
        ctx.variables.inc_iteration();
        ctx.variables.put("go", "false");
        assert!(next(&mut tree, id, &mut ctx).is_none());
    }
}
