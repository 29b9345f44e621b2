// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test-worker element.

use crate::{
    controls::{
        ControlResult, Controller, GenericController, IterationListenerRef, LoopController,
    },
    elements::{Caps, ElementCore, Property, TestElement},
    impl_test_element,
    tree::{NodeId, TestTree},
    worker::{compiler::strategy_from_core, RunningStrategy, ThreadContext},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What to do when a sampler in this worker fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnSampleError {
    /// Proceed to the next sampler.
    #[default]
    Continue,
    /// Start the next iteration of the whole worker.
    StartNextIterationOfThread,
    /// Start the next iteration of the innermost iterating controller.
    StartNextIterationOfCurrentLoop,
    /// Break out of the innermost iterating controller.
    BreakCurrentLoop,
    /// Stop every execution unit of this worker.
    StopWorker,
    /// Ask the engine to stop all workers gracefully.
    StopTest,
    /// Ask the engine to kill all workers.
    StopNow,
}

impl OnSampleError {
    /// Parses the policy from its serialized name; unknown values warn
    /// and fall back to `Continue`.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "CONTINUE" => OnSampleError::Continue,
            "START_NEXT_ITERATION_OF_THREAD" => OnSampleError::StartNextIterationOfThread,
            "START_NEXT_ITERATION_OF_CURRENT_LOOP" => {
                OnSampleError::StartNextIterationOfCurrentLoop
            }
            "BREAK_CURRENT_LOOP" => OnSampleError::BreakCurrentLoop,
            "STOP_WORKER" => OnSampleError::StopWorker,
            "STOP_TEST" => OnSampleError::StopTest,
            "STOP_NOW" => OnSampleError::StopNow,
            other => {
                warn!(policy = other, "unknown on-sample-error policy, using CONTINUE");
                OnSampleError::Continue
            }
        }
    }
}

/// A top-level controller representing a cohort of concurrent execution
/// units.
///
/// Holds a [`LoopController`] as its main controller and delegates the
/// whole controller API to it; the worker element itself contributes the
/// cohort parameters (thread count, startup ramp, error policy).
#[derive(Clone, Debug)]
pub struct TestWorker {
    core: ElementCore,
    teardown: bool,
}

impl TestWorker {
    /// Property key for the per-worker running strategy.
    pub const RUNNING_STRATEGY: &'static str = "TestWorker__running_strategy";
    /// Property key for the on-sample-error policy.
    pub const ON_SAMPLE_ERROR: &'static str = "TestWorker__on_sample_error";
    /// Property key for the number of concurrent execution units.
    pub const NUMBER_OF_THREADS: &'static str = "TestWorker__number_of_threads";
    /// Property key for the startup ramp (units started per second).
    pub const STARTUPS_PER_SECOND: &'static str = "TestWorker__startups_per_second";
    /// Property key for the element-valued main controller.
    pub const MAIN_CONTROLLER: &'static str = "TestWorker__main_controller";

    /// Creates a worker with `threads` units, each looping `loops` times.
    pub fn new(name: &str, threads: u32, loops: i64) -> Self {
        let mut worker = Self {
            core: ElementCore::named(name),
            teardown: false,
        };
        worker
            .core
            .put_basic(Self::NUMBER_OF_THREADS, threads.to_string());
        let mut main = LoopController::new(&format!("{name} loop"), loops);
        main.set_main_of_worker(true);
        let _ = worker
            .core
            .add_property(Self::MAIN_CONTROLLER, Property::element(Box::new(main)));
        worker
    }

    /// Creates a teardown worker, run after the regular workers
    /// complete.
    pub fn new_teardown(name: &str, threads: u32, loops: i64) -> Self {
        let mut worker = Self::new(name, threads, loops);
        worker.teardown = true;
        worker
    }

    /// Whether this worker runs in the teardown phase.
    pub fn is_teardown(&self) -> bool {
        self.teardown
    }

    /// The configured number of execution units (defaults to one).
    pub fn number_of_threads(&mut self, ctx: &ThreadContext) -> u32 {
        if self.core.get_property(Self::NUMBER_OF_THREADS).is_none() {
            return 1;
        }
        self.core.prop_int(Self::NUMBER_OF_THREADS, ctx).max(0) as u32
    }

    /// The startup ramp in units per second (zero for all at once).
    pub fn startups_per_second(&mut self, ctx: &ThreadContext) -> f64 {
        self.core.prop_float(Self::STARTUPS_PER_SECOND, ctx).max(0.0)
    }

    /// The error policy for samplers in this worker.
    pub fn on_sample_error(&mut self, ctx: &ThreadContext) -> OnSampleError {
        OnSampleError::parse(&self.core.prop_str(Self::ON_SAMPLE_ERROR, ctx))
    }

    /// The worker's own compile strategy (may be empty).
    pub fn running_strategy(&self) -> RunningStrategy {
        strategy_from_core(&self.core, Self::RUNNING_STRATEGY)
    }

    /// Sets the main loop's continue-forever flag.
    pub fn set_continue_forever(&mut self, forever: bool) {
        self.main_controller_mut();
        if let Some(el) = self
            .core
            .get_property_mut(Self::MAIN_CONTROLLER)
            .and_then(Property::as_element_mut)
        {
            el.core_mut()
                .put_basic(LoopController::CONTINUE_FOREVER, forever.to_string());
        }
    }

    fn main_controller(&self) -> &dyn Controller {
        self.core
            .get_property(Self::MAIN_CONTROLLER)
            .and_then(|p| p.as_element())
            .and_then(|el| el.as_controller())
            .expect("worker has a main controller")
    }

    fn main_controller_mut(&mut self) -> &mut dyn Controller {
        let element = self
            .core
            .get_property_mut(Self::MAIN_CONTROLLER)
            .and_then(Property::as_element_mut)
            .expect("worker has a main controller");
        // Script-loaded controllers arrive without the flag; set it on
        // every access so the continue-forever property is honored.
        if let Some(main) = element.as_any_mut().downcast_mut::<LoopController>() {
            main.set_main_of_worker(true);
        }
        element
            .as_controller_mut()
            .expect("main controller is a controller")
    }
}

impl Default for TestWorker {
    fn default() -> Self {
        Self::new("Test Worker", 1, 1)
    }
}

impl Controller for TestWorker {
    fn generic(&self) -> &GenericController {
        self.main_controller().generic()
    }

    fn generic_mut(&mut self) -> &mut GenericController {
        self.main_controller_mut().generic_mut()
    }

    fn done(&self) -> bool {
        self.main_controller().done()
    }

    fn set_done(&mut self, done: bool) {
        self.main_controller_mut().set_done(done);
    }

    fn initialize(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) {
        self.main_controller_mut().initialize(tree, ctx);
    }

    fn next(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) -> ControlResult {
        self.main_controller_mut().next(tree, ctx)
    }

    fn trigger_end_of_loop(&mut self) {
        self.main_controller_mut().trigger_end_of_loop();
    }

    fn start_next_loop(&mut self) {
        self.main_controller_mut().start_next_loop();
    }

    fn break_loop(&mut self) {
        self.main_controller_mut().break_loop();
    }

    fn add_iteration_listener(&mut self, listener: IterationListenerRef) {
        self.main_controller_mut().add_iteration_listener(listener);
    }

    fn remove_iteration_listener(&mut self, listener: IterationListenerRef) {
        self.main_controller_mut().remove_iteration_listener(listener);
    }

    fn add_child(&mut self, child: NodeId) {
        self.main_controller_mut().add_child(child);
    }
}

impl_test_element!(TestWorker {
    caps: Caps::WORKER
        .union(Caps::CONTROLLER)
        .union(Caps::COMPILER_HELPER),
    accessors: [controller],
});

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("CONTINUE", OnSampleError::Continue; "continue value")]
    #[test_case("", OnSampleError::Continue; "empty defaults to continue")]
    #[test_case(" STOP_TEST ", OnSampleError::StopTest; "surrounding whitespace is trimmed")]
    #[test_case(
        "START_NEXT_ITERATION_OF_THREAD",
        OnSampleError::StartNextIterationOfThread;
        "start next iteration of thread"
    )]
    #[test_case(
        "START_NEXT_ITERATION_OF_CURRENT_LOOP",
        OnSampleError::StartNextIterationOfCurrentLoop;
        "start next iteration of current loop"
    )]
    #[test_case("BREAK_CURRENT_LOOP", OnSampleError::BreakCurrentLoop; "break current loop")]
    #[test_case("STOP_WORKER", OnSampleError::StopWorker; "stop worker")]
    #[test_case("STOP_NOW", OnSampleError::StopNow; "stop now")]
    #[test_case("NO_SUCH_POLICY", OnSampleError::Continue; "unknown falls back to continue")]
    fn on_sample_error_parses_policy_names(value: &str, expected: OnSampleError) {
        assert_eq!(OnSampleError::parse(value), expected);
    }

    #[test]
    fn workers_default_to_one_unit() {
        let mut worker = TestWorker::new("w", 3, 1);
        let ctx = ThreadContext::detached();
        assert_eq!(worker.number_of_threads(&ctx), 3);

        worker.core.remove_property(TestWorker::NUMBER_OF_THREADS);
        assert_eq!(worker.number_of_threads(&ctx), 1);
    }
}
