// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The retry controller.

use crate::{
    controls::{generic_initialize, Controller, GenericController},
    elements::{interface::LoopIterationListener, Caps, ElementCore, TestElement},
    impl_test_element,
    tree::TestTree,
    worker::ThreadContext,
};
use tracing::debug;

/// Repeats its child subtree while the last sampler in it fails, up to a
/// retry bound.
///
/// The controller itself is a plain pass-through; the executor's error
/// dispatch drives the repetition by calling [`start_next_loop`] when a
/// descendant sampler fails and retries remain. Samplers executed while
/// the attempt counter is non-zero are marked `retrying` on their
/// results.
///
/// [`start_next_loop`]: Controller::start_next_loop
#[derive(Clone, Debug)]
pub struct RetryController {
    core: ElementCore,
    generic: GenericController,
    attempts: u32,
}

impl RetryController {
    /// Property key for the maximum number of retries (beyond the first
    /// attempt).
    pub const RETRIES: &'static str = "RetryController__retries";

    /// Creates a retry controller with the given retry bound.
    pub fn new(name: &str, retries: u32) -> Self {
        let mut controller = Self {
            core: ElementCore::named(name),
            generic: GenericController::default(),
            attempts: 0,
        };
        controller.core.put_basic(Self::RETRIES, retries.to_string());
        controller
    }

    /// The configured retry bound.
    pub fn retries(&mut self, ctx: &ThreadContext) -> u32 {
        self.core.prop_int(Self::RETRIES, ctx).max(0) as u32
    }

    /// Retry attempts made in the current iteration; zero during the
    /// first attempt.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the controller is currently in a retry attempt.
    pub fn retrying(&self) -> bool {
        self.attempts > 0
    }

    /// Whether a failed descendant may still be retried.
    pub fn has_retries_left(&mut self, ctx: &ThreadContext) -> bool {
        self.attempts < self.retries(ctx)
    }

    fn reset_attempts(&mut self) {
        self.attempts = 0;
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new("Retry Controller", 1)
    }
}

impl Controller for RetryController {
    fn generic(&self) -> &GenericController {
        &self.generic
    }

    fn generic_mut(&mut self) -> &mut GenericController {
        &mut self.generic
    }

    fn initialize(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) {
        self.reset_attempts();
        generic_initialize(self, tree, ctx);
    }

    fn start_next_loop(&mut self) {
        self.attempts += 1;
        debug!(controller = %self.name(), attempt = self.attempts, "starting retry attempt");
        self.re_initialize();
    }

    fn break_loop(&mut self) {
        self.reset_attempts();
        let state = self.generic_mut();
        state.first = true;
        state.current = 0;
    }
}

impl LoopIterationListener for RetryController {
    fn iteration_start(&mut self, _source: &str, _iteration: u64) {
        self.re_initialize();
        self.reset_attempts();
    }
}

impl_test_element!(RetryController {
    caps: Caps::CONTROLLER
        .union(Caps::ITERATING)
        .union(Caps::RETRY)
        .union(Caps::LOOP_ITERATION_LISTENER),
    accessors: [controller, loop_iteration_listener],
});

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn attempts_track_start_next_loop_up_to_the_bound() {
        let mut controller = RetryController::new("retry", 2);
        let ctx = ThreadContext::detached();
        assert!(!controller.retrying());
        assert!(controller.has_retries_left(&ctx));

        controller.start_next_loop();
        assert!(controller.retrying());
        assert_eq!(controller.attempts(), 1);
        assert!(controller.has_retries_left(&ctx));

        controller.start_next_loop();
        assert_eq!(controller.attempts(), 2);
        assert!(!controller.has_retries_left(&ctx));
    }

    #[test]
    fn outer_iterations_reset_the_attempt_counter() {
        let mut controller = RetryController::new("retry", 1);
        controller.start_next_loop();
        assert_eq!(controller.attempts(), 1);
        controller.iteration_start("outer", 2);
        assert_eq!(controller.attempts(), 0);
    }
}
