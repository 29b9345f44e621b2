// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test elements: the property model, the element trait, capability
//! interfaces, and the built-in element set.

mod element;
pub mod interface;
mod property;

pub mod builtin;

pub use element::{DESC_KEY, ElementCore, NAME_KEY, TestElement};
pub use property::{FunctionProperty, PropValue, Property};

use bitflags::bitflags;

bitflags! {
    /// Capabilities a test element can declare.
    ///
    /// The compiler classifies scope members and the worker runtime
    /// dispatches events based on these flags; the `as_*` accessors on
    /// [`TestElement`] expose the matching behavior.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Caps: u32 {
        /// Top-level collection element.
        const COLLECTION = 1 << 0;
        /// Test worker (cohort of execution units).
        const WORKER = 1 << 1;
        /// Orchestrates the order its descendant samplers run in.
        const CONTROLLER = 1 << 2;
        /// Performs an atomic action producing a sample result.
        const SAMPLER = 1 << 3;
        /// Configuration merged into samplers in scope.
        const CONFIG = 1 << 4;
        /// Delays samplers in scope.
        const TIMER = 1 << 5;
        /// Judges sample results in scope.
        const ASSERTION = 1 << 6;
        /// Runs before each sample in scope.
        const PRE_PROCESSOR = 1 << 7;
        /// Runs after each sample in scope.
        const POST_PROCESSOR = 1 << 8;
        /// Observes samples in scope.
        const SAMPLE_LISTENER = 1 << 9;
        /// Observes enclosing transactions.
        const TRANSACTION_LISTENER = 1 << 10;
        /// Observes worker iterations.
        const TEST_ITERATION_LISTENER = 1 << 11;
        /// Observes iterations of enclosing controllers.
        const LOOP_ITERATION_LISTENER = 1 << 12;
        /// Observes execution-unit lifecycle.
        const WORKER_LISTENER = 1 << 13;
        /// Observes collection lifecycle.
        const COLLECTION_LISTENER = 1 << 14;
        /// Controller supporting break/start-next-loop.
        const ITERATING = 1 << 15;
        /// Retry controller.
        const RETRY = 1 << 16;
        /// Transaction controller.
        const TRANSACTION = 1 << 17;
        /// Shared across execution units instead of cloned per unit.
        const NO_THREAD_CLONE = 1 << 18;
        /// Config element that is never merged into samplers.
        const NO_CONFIG_MERGE = 1 << 19;
        /// Config element scoped to transactions only.
        const TRANSACTION_CONFIG = 1 << 20;
        /// Controller that deduplicates attached children itself.
        const COMPILER_HELPER = 1 << 21;
    }
}

/// Emits one capability accessor override. Used by
/// [`impl_test_element!`](crate::impl_test_element).
#[doc(hidden)]
#[macro_export]
macro_rules! element_accessor {
    (controller) => {
        fn as_controller(&self) -> Option<&dyn $crate::controls::Controller> {
            Some(self)
        }
        fn as_controller_mut(&mut self) -> Option<&mut dyn $crate::controls::Controller> {
            Some(self)
        }
    };
    (sampler) => {
        fn as_sampler_mut(&mut self) -> Option<&mut dyn $crate::sample::Sampler> {
            Some(self)
        }
    };
    (timer) => {
        fn as_timer_mut(&mut self) -> Option<&mut dyn $crate::elements::interface::Timer> {
            Some(self)
        }
    };
    (assertion) => {
        fn as_assertion_mut(&mut self) -> Option<&mut dyn $crate::elements::interface::Assertion> {
            Some(self)
        }
    };
    (pre_processor) => {
        fn as_pre_processor_mut(
            &mut self,
        ) -> Option<&mut dyn $crate::elements::interface::PreProcessor> {
            Some(self)
        }
    };
    (post_processor) => {
        fn as_post_processor_mut(
            &mut self,
        ) -> Option<&mut dyn $crate::elements::interface::PostProcessor> {
            Some(self)
        }
    };
    (sample_listener) => {
        fn as_sample_listener_mut(
            &mut self,
        ) -> Option<&mut dyn $crate::elements::interface::SampleListener> {
            Some(self)
        }
    };
    (transaction_listener) => {
        fn as_transaction_listener_mut(
            &mut self,
        ) -> Option<&mut dyn $crate::elements::interface::TransactionListener> {
            Some(self)
        }
    };
    (test_iteration_listener) => {
        fn as_test_iteration_listener_mut(
            &mut self,
        ) -> Option<&mut dyn $crate::elements::interface::TestIterationListener> {
            Some(self)
        }
    };
    (loop_iteration_listener) => {
        fn as_loop_iteration_listener_mut(
            &mut self,
        ) -> Option<&mut dyn $crate::elements::interface::LoopIterationListener> {
            Some(self)
        }
    };
    (worker_listener) => {
        fn as_worker_listener_mut(
            &mut self,
        ) -> Option<&mut dyn $crate::elements::interface::WorkerListener> {
            Some(self)
        }
    };
    (collection_listener) => {
        fn as_collection_listener_mut(
            &mut self,
        ) -> Option<&mut dyn $crate::elements::interface::CollectionListener> {
            Some(self)
        }
    };
}

/// Implements the mechanical part of [`TestElement`] for a concrete
/// element: core accessors, capability set, cloning, `Any` upcasts, and
/// the listed capability accessors.
///
/// ```ignore
/// impl_test_element!(DebugSampler {
///     caps: Caps::SAMPLER,
///     accessors: [sampler],
/// });
/// ```
#[macro_export]
macro_rules! impl_test_element {
    ($ty:ident { caps: $caps:expr, accessors: [$($acc:ident),* $(,)?] $(,)? }) => {
        impl $crate::elements::TestElement for $ty {
            fn core(&self) -> &$crate::elements::ElementCore {
                &self.core
            }

            fn core_mut(&mut self) -> &mut $crate::elements::ElementCore {
                &mut self.core
            }

            fn caps(&self) -> $crate::elements::Caps {
                $caps
            }

            fn boxed_clone(&self) -> Box<dyn $crate::elements::TestElement> {
                Box::new(self.clone())
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }

            $($crate::element_accessor!($acc);)*
        }
    };
}
