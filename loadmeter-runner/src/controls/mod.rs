// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Controllers: the hierarchical state machines that decide which sampler
//! runs next.
//!
//! [`Controller`] carries the generic iteration machinery as provided
//! methods over an embedded [`GenericController`] state; concrete
//! controllers override the hooks (`next`, `next_is_null`,
//! `current_returned_none`, …) the way the loop, condition, foreach,
//! retry, and transaction semantics require.

mod condition;
mod foreach;
mod loops;
mod retry;
mod transaction;

pub use condition::IfController;
pub use foreach::ForeachController;
pub(crate) use loops::generic_initialize;
pub use loops::LoopController;
pub use retry::RetryController;
pub use transaction::{TransactionController, TransactionHandle, TransactionSampler};

use crate::{
    elements::{Caps, TestElement},
    errors::ControllerError,
    tree::{NodeId, TestTree},
    worker::ThreadContext,
};
use tracing::debug;

/// Result of asking a controller for the next sampler.
pub type ControlResult = Result<Option<NextSampler>, ControllerError>;

/// What a controller schedules next: a concrete sampler node, or a virtual
/// transaction sampler wrapping one.
#[derive(Clone, Debug)]
pub enum NextSampler {
    /// A sampler element in the tree.
    Node(NodeId),
    /// A virtual sampler aggregating a transaction.
    Transaction(TransactionHandle),
}

impl NextSampler {
    /// The concrete sampler node at the bottom of any transaction
    /// nesting.
    pub fn real_sampler(&self) -> Option<NodeId> {
        match self {
            NextSampler::Node(id) => Some(*id),
            NextSampler::Transaction(handle) => {
                handle.sub_sampler().as_ref().and_then(NextSampler::real_sampler)
            }
        }
    }
}

/// A registered iteration listener: either an element node, or the
/// execution unit's own hook that advances the worker iteration counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationListenerRef {
    /// A `LOOP_ITERATION_LISTENER` element.
    Node(NodeId),
    /// The execution unit's worker-iteration hook.
    WorkerHook,
}

/// Index-based iteration state shared by all controllers.
#[derive(Clone, Debug)]
pub struct GenericController {
    children: Vec<NodeId>,
    current: usize,
    iter_count: u64,
    first: bool,
    done: bool,
    listeners: Vec<IterationListenerRef>,
}

impl Default for GenericController {
    fn default() -> Self {
        Self {
            children: Vec::new(),
            current: 0,
            iter_count: 0,
            first: true,
            done: false,
            listeners: Vec::new(),
        }
    }
}

impl GenericController {
    /// The ordered children attached by the compiler.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Number of completed iterations.
    pub fn iter_count(&self) -> u64 {
        self.iter_count
    }

    fn current_child(&self) -> Option<NodeId> {
        self.children.get(self.current).copied()
    }

    fn increment_current(&mut self) {
        self.current += 1;
    }
}

/// The controller capability.
pub trait Controller: TestElement {
    /// The embedded generic state.
    fn generic(&self) -> &GenericController;

    /// The embedded generic state, mutably.
    fn generic_mut(&mut self) -> &mut GenericController;

    /// Whether this controller will never return another sampler.
    fn done(&self) -> bool {
        self.generic().done
    }

    /// Marks the controller done (or live again).
    fn set_done(&mut self, done: bool) {
        self.generic_mut().done = done;
    }

    /// Resets the controller (and its child controllers) for a fresh run.
    fn initialize(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) {
        generic_initialize(self, tree, ctx);
    }

    /// Returns the next sampler, or `None` when the current pass over the
    /// children is exhausted.
    fn next(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) -> ControlResult {
        self.generic_next(tree, ctx)
    }

    /// The shared next-sampler algorithm: walk the child list in order,
    /// descending into child controllers and advancing past exhausted
    /// ones.
    fn generic_next(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) -> ControlResult {
        self.fire_iteration_events(tree, ctx);
        if self.done() {
            return Ok(None);
        }
        if self.generic().children.is_empty() {
            self.set_done(true);
            return Ok(None);
        }
        match self.generic().current_child() {
            None => self.next_is_null(tree, ctx),
            Some(child) => {
                let caps = tree.caps(child);
                if caps.contains(Caps::SAMPLER) {
                    self.generic_mut().increment_current();
                    Ok(Some(NextSampler::Node(child)))
                } else if caps.contains(Caps::CONTROLLER) {
                    self.next_is_controller(child, tree, ctx)
                } else {
                    // Non-executable child (should not have been attached);
                    // skip it.
                    self.generic_mut().increment_current();
                    self.next(tree, ctx)
                }
            }
        }
    }

    /// Descends into a child controller; when the child is exhausted,
    /// advances and retries.
    fn next_is_controller(
        &mut self,
        child: NodeId,
        tree: &mut TestTree,
        ctx: &mut ThreadContext,
    ) -> ControlResult {
        let sampler = tree.with_taken(child, |el, tree| {
            el.as_controller_mut()
                .expect("child has controller capability")
                .next(tree, ctx)
        })?;
        match sampler {
            Some(sampler) => Ok(Some(sampler)),
            None => {
                self.current_returned_none(child, tree, ctx);
                self.next(tree, ctx)
            }
        }
    }

    /// A child returned no sampler; advance to the next one.
    fn current_returned_none(
        &mut self,
        _child: NodeId,
        _tree: &mut TestTree,
        _ctx: &mut ThreadContext,
    ) {
        self.generic_mut().increment_current();
    }

    /// The index passed the end of the child list. The default starts a
    /// fresh pass and reports exhaustion to the parent.
    fn next_is_null(&mut self, _tree: &mut TestTree, _ctx: &mut ThreadContext) -> ControlResult {
        self.re_initialize();
        Ok(None)
    }

    /// Resets for the next pass over the children.
    fn re_initialize(&mut self) {
        let state = self.generic_mut();
        state.first = true;
        state.current = 0;
    }

    /// Ends the current loop pass from the outside (error-policy
    /// dispatch).
    fn trigger_end_of_loop(&mut self) {
        self.re_initialize();
    }

    /// Starts the next iteration (iterating controllers only).
    fn start_next_loop(&mut self) {}

    /// Breaks out of the loop entirely (iterating controllers only).
    fn break_loop(&mut self) {}

    /// Fires `iteration_start` on registered listeners when a fresh pass
    /// begins.
    fn fire_iteration_events(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) {
        if !self.generic().first {
            return;
        }
        let iteration = {
            let state = self.generic_mut();
            state.iter_count += 1;
            state.iter_count
        };
        let source = self.name();
        debug!(controller = %source, iteration, "iteration start");
        let listeners = self.generic().listeners.clone();
        fire_iteration_start(&listeners, &source, iteration, tree, ctx);
        self.generic_mut().first = false;
    }

    /// Registers an iteration listener.
    fn add_iteration_listener(&mut self, listener: IterationListenerRef) {
        let listeners = &mut self.generic_mut().listeners;
        if !listeners.contains(&listener) {
            listeners.push(listener);
        }
    }

    /// Removes an iteration listener.
    fn remove_iteration_listener(&mut self, listener: IterationListenerRef) {
        self.generic_mut().listeners.retain(|l| *l != listener);
    }

    /// Attaches a child node (done by the compiler).
    fn add_child(&mut self, child: NodeId) {
        self.generic_mut().children.push(child);
    }
}

pub(crate) fn fire_iteration_start(
    listeners: &[IterationListenerRef],
    source: &str,
    iteration: u64,
    tree: &mut TestTree,
    ctx: &mut ThreadContext,
) {
    for listener in listeners {
        match listener {
            IterationListenerRef::Node(id) => {
                tree.with_taken(*id, |el, _tree| {
                    if let Some(listener) = el.as_loop_iteration_listener_mut() {
                        listener.iteration_start(source, iteration);
                    }
                });
            }
            IterationListenerRef::WorkerHook => worker_iteration_start(source, tree, ctx),
        }
    }
}

/// The execution unit's iteration hook: advances the worker iteration
/// counter (which drives per-iteration function re-evaluation) and
/// notifies `TEST_ITERATION_LISTENER` elements.
fn worker_iteration_start(source: &str, tree: &mut TestTree, ctx: &mut ThreadContext) {
    ctx.variables.inc_iteration();
    let iteration = ctx.variables.iteration();
    debug!(%source, iteration, "worker iteration start");
    for id in ctx.test_iteration_listeners().to_vec() {
        tree.with_taken(id, |el, _tree| {
            if let Some(listener) = el.as_test_iteration_listener_mut() {
                listener.test_iteration_start(source, iteration);
            }
            el.recover_running_version();
        });
    }
}
