// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The loop controller.

use crate::{
    controls::{ControlResult, Controller, GenericController},
    elements::{interface::LoopIterationListener, Caps, ElementCore, TestElement},
    impl_test_element,
    tree::TestTree,
    worker::ThreadContext,
};
use tracing::debug;

/// Repeats its children a fixed number of times (`-1` for infinite).
///
/// A nested loop controller always continues forever from its parent's
/// point of view, so the parent can run it again on the next pass; only a
/// test worker's main controller consults the `continue_forever` property
/// to decide when the whole unit is done.
#[derive(Clone, Debug)]
pub struct LoopController {
    core: ElementCore,
    generic: GenericController,
    loop_count: u64,
    break_flag: bool,
    main_of_worker: bool,
}

impl LoopController {
    /// Property key for the iteration count.
    pub const LOOPS: &'static str = "LoopController__loops";
    /// Property key for the continue-forever flag.
    pub const CONTINUE_FOREVER: &'static str = "LoopController__continue_forever";
    /// The loops value meaning "no bound".
    pub const INFINITE: i64 = -1;

    /// Creates a loop controller running `loops` times.
    pub fn new(name: &str, loops: i64) -> Self {
        let mut controller = Self {
            core: ElementCore::named(name),
            generic: GenericController::default(),
            loop_count: 0,
            break_flag: false,
            main_of_worker: false,
        };
        controller.core.put_basic(Self::LOOPS, loops.to_string());
        controller
    }

    /// Marks this controller as a worker's main controller.
    pub fn set_main_of_worker(&mut self, main: bool) {
        self.main_of_worker = main;
    }

    /// The configured number of loops.
    pub fn loops(&mut self, ctx: &ThreadContext) -> i64 {
        self.core.prop_int(Self::LOOPS, ctx)
    }

    /// Completed iterations of the current run.
    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    fn continue_forever(&mut self, ctx: &ThreadContext) -> bool {
        if self.main_of_worker {
            self.core.prop_bool(Self::CONTINUE_FOREVER, ctx)
        } else {
            true
        }
    }

    fn end_of_loop(&mut self, ctx: &ThreadContext) -> bool {
        if self.break_flag {
            return true;
        }
        let loops = self.loops(ctx);
        loops > Self::INFINITE && self.loop_count >= loops as u64
    }

    fn reset_break(&mut self) {
        self.break_flag = false;
    }

    fn reset_loop_count(&mut self) {
        self.loop_count = 0;
    }
}

impl Default for LoopController {
    fn default() -> Self {
        Self::new("Loop Controller", 1)
    }
}

impl Controller for LoopController {
    fn generic(&self) -> &GenericController {
        &self.generic
    }

    fn generic_mut(&mut self) -> &mut GenericController {
        &mut self.generic
    }

    fn next(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) -> ControlResult {
        if self.end_of_loop(ctx) {
            if !self.continue_forever(ctx) {
                self.set_done(true);
            }
            self.reset_break();
            return Ok(None);
        }
        self.generic_next(tree, ctx)
    }

    fn next_is_null(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) -> ControlResult {
        self.re_initialize();
        if self.end_of_loop(ctx) {
            if !self.continue_forever(ctx) {
                self.set_done(true);
            } else {
                self.reset_loop_count();
            }
            return Ok(None);
        }
        self.next(tree, ctx)
    }

    fn set_done(&mut self, done: bool) {
        debug!(controller = %self.name(), done, "loop controller done");
        self.reset_break();
        self.generic_mut().done = done;
    }

    fn initialize(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) {
        self.loop_count = 0;
        self.break_flag = false;
        generic_initialize(self, tree, ctx);
    }

    fn re_initialize(&mut self) {
        let state = self.generic_mut();
        state.first = true;
        state.current = 0;
        self.loop_count += 1;
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
    }
}

/// Runs the provided `Controller::initialize` default for a controller
/// that overrides it.
pub(crate) fn generic_initialize<C: Controller + ?Sized>(
    controller: &mut C,
    tree: &mut TestTree,
    ctx: &mut ThreadContext,
) {
    {
        let state = controller.generic_mut();
        state.done = false;
        state.first = true;
        state.current = 0;
        state.iter_count = 0;
    }
    for child in controller.generic().children().to_vec() {
        if tree.caps(child).contains(Caps::CONTROLLER) {
            tree.with_taken(child, |el, tree| {
                if let Some(child_controller) = el.as_controller_mut() {
                    child_controller.initialize(tree, ctx);
                }
            });
        }
    }
}

impl LoopIterationListener for LoopController {
    fn iteration_start(&mut self, _source: &str, _iteration: u64) {
        self.re_initialize();
        self.reset_loop_count();
    }
}

impl_test_element!(LoopController {
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

    fn harness(loops: i64) -> (TestTree, NodeId, ThreadContext) {
        let mut tree = TestTree::new();
        let mut controller = LoopController::new("loop", loops);
        controller.set_main_of_worker(true);
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

    fn is_done(tree: &TestTree, id: NodeId) -> bool {
        tree.with_node(id, |el| el.as_controller().unwrap().done())
    }

    #[test]
    fn zero_loops_is_immediately_done() {
        let (mut tree, id, mut ctx) = harness(0);
        assert!(next(&mut tree, id, &mut ctx).is_none());
        assert!(is_done(&tree, id));
    }

    #[test]
    fn bounded_loop_yields_once_per_iteration() {
        let (mut tree, id, mut ctx) = harness(3);
        let mut yielded = 0;
        while let Some(sampler) = next(&mut tree, id, &mut ctx) {
            assert!(matches!(sampler, NextSampler::Node(_)));
            yielded += 1;
            assert!(yielded <= 3, "loop did not terminate");
        }
        assert_eq!(yielded, 3);
        assert!(is_done(&tree, id));
    }

    #[test]
    fn infinite_loop_with_continue_forever_never_finishes() {
        let (mut tree, id, mut ctx) = harness(-1);
        tree.with_node_mut(id, |el| {
            el.core_mut()
                .put_basic(LoopController::CONTINUE_FOREVER, "true");
        });
        for _ in 0..50 {
            assert!(next(&mut tree, id, &mut ctx).is_some());
        }
        assert!(!is_done(&tree, id));
    }

    #[test]
    fn break_loop_finishes_the_main_controller() {
        let (mut tree, id, mut ctx) = harness(3);
        assert!(next(&mut tree, id, &mut ctx).is_some());
        tree.with_node_mut(id, |el| el.as_controller_mut().unwrap().break_loop());
        assert!(next(&mut tree, id, &mut ctx).is_none());
        assert!(is_done(&tree, id));
    }

    #[test]
    fn iteration_start_resets_the_loop_for_the_next_outer_pass() {
        let (mut tree, id, mut ctx) = harness(2);
        let mut yielded = 0;
        while next(&mut tree, id, &mut ctx).is_some() {
            yielded += 1;
        }
        assert_eq!(yielded, 2);

        tree.with_node_mut(id, |el| {
            let controller = el.as_any_mut().downcast_mut::<LoopController>().unwrap();
            controller.set_done(false);
            controller.iteration_start("outer", 2);
        });
        let mut again = 0;
        while next(&mut tree, id, &mut ctx).is_some() {
            again += 1;
        }
        assert_eq!(again, 2);
    }
}
