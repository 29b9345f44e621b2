// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test-collection element.

use crate::{
    elements::{Caps, ElementCore},
    impl_test_element,
    worker::{compiler::strategy_from_core, RunningStrategy, ThreadContext},
};
use std::time::Duration;

/// The root element of a test tree: an ordered set of workers plus
/// collection-wide settings.
#[derive(Clone, Debug)]
pub struct TestCollection {
    core: ElementCore,
}

impl TestCollection {
    /// Property key for the collection-level running strategy.
    pub const RUNNING_STRATEGY: &'static str = "TestCollection__running_strategy";
    /// Property key for sequential worker execution.
    pub const SEQUENTIAL: &'static str = "TestCollection__sequential";
    /// Property key for the delay between worker startups, in
    /// milliseconds.
    pub const DELAY: &'static str = "TestCollection__delay";

    /// Creates a collection.
    pub fn new(name: &str) -> Self {
        Self {
            core: ElementCore::named(name),
        }
    }

    /// Whether workers run one after another instead of concurrently.
    pub fn sequential(&mut self, ctx: &ThreadContext) -> bool {
        self.core.prop_bool(Self::SEQUENTIAL, ctx)
    }

    /// The delay between worker startups.
    pub fn delay(&mut self, ctx: &ThreadContext) -> Duration {
        Duration::from_millis(self.core.prop_int(Self::DELAY, ctx).max(0) as u64)
    }

    /// The collection-level compile strategy (the default for workers
    /// without their own).
    pub fn running_strategy(&self) -> RunningStrategy {
        strategy_from_core(&self.core, Self::RUNNING_STRATEGY)
    }
}

impl Default for TestCollection {
    fn default() -> Self {
        Self::new("Test Collection")
    }
}

impl_test_element!(TestCollection {
    caps: Caps::COLLECTION,
    accessors: [],
});
