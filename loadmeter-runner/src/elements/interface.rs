// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability interfaces satisfied by test elements.
//!
//! The original design composed these as mixins; here every capability is
//! its own trait, and elements expose the ones they satisfy through the
//! `as_*` accessors on [`TestElement`](crate::elements::TestElement)
//! together with the matching [`Caps`](crate::elements::Caps) flag. Marker
//! capabilities without behavior (`NO_THREAD_CLONE`, `NO_CONFIG_MERGE`,
//! `TRANSACTION_CONFIG`) exist as flags only.

use crate::{
    elements::TestElement,
    errors::{AssertionError, ProcessorError},
    sample::{AssertionOutcome, SampleResult},
    worker::ThreadContext,
};
use std::time::Duration;

/// An element that delays the sampler it applies to.
pub trait Timer: TestElement {
    /// The delay to add before the next sample.
    fn delay(&mut self, ctx: &ThreadContext) -> Duration;
}

/// An element that judges a sample result.
pub trait Assertion: TestElement {
    /// Evaluates the assertion against `result`.
    ///
    /// A false predicate is reported through
    /// [`AssertionOutcome::failure`]; `Err` is reserved for errors while
    /// executing the assertion itself.
    fn assert_result(
        &mut self,
        result: &SampleResult,
        ctx: &mut ThreadContext,
    ) -> Result<AssertionOutcome, AssertionError>;
}

/// An element that runs before its sampler samples.
pub trait PreProcessor: TestElement {
    /// Runs the processor.
    fn process(&mut self, ctx: &mut ThreadContext) -> Result<(), ProcessorError>;
}

/// An element that runs after its sampler sampled.
pub trait PostProcessor: TestElement {
    /// Runs the processor; the sample result is available as
    /// `ctx.previous_result()`.
    fn process(&mut self, ctx: &mut ThreadContext) -> Result<(), ProcessorError>;
}

/// An element notified around each sample of the samplers in its scope.
pub trait SampleListener: TestElement {
    /// The sampler is about to sample.
    fn sample_started(&mut self, sampler_name: &str);

    /// The sampler finished sampling (before post-processing).
    fn sample_ended(&mut self, result: &SampleResult);

    /// The finished result, after post-processors and assertions.
    fn sample_occurred(&mut self, result: &SampleResult);
}

/// An element notified when an enclosing transaction opens and closes.
pub trait TransactionListener: TestElement {
    /// The transaction produced its first sample.
    fn transaction_started(&mut self);

    /// The transaction completed.
    fn transaction_ended(&mut self);
}

/// An element notified at the start of every test-worker iteration.
pub trait TestIterationListener: TestElement {
    /// A new worker iteration begins.
    fn test_iteration_start(&mut self, source: &str, iteration: u64);
}

/// An element notified at the start of every iteration of the controllers
/// above it.
pub trait LoopIterationListener: TestElement {
    /// A new controller iteration begins.
    fn iteration_start(&mut self, source: &str, iteration: u64);
}

/// An element notified when execution units of its worker start and
/// finish.
pub trait WorkerListener: TestElement {
    /// An execution unit started.
    fn worker_started(&mut self);

    /// An execution unit finished.
    fn worker_finished(&mut self);
}

/// An element notified when the collection run starts and ends.
pub trait CollectionListener: TestElement {
    /// The collection run started.
    fn collection_started(&mut self);

    /// The collection run ended (all workers joined).
    fn collection_ended(&mut self);
}
