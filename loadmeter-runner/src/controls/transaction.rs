// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transaction controller and its virtual sampler.

use crate::{
    controls::{ControlResult, Controller, GenericController, NextSampler},
    elements::{Caps, ElementCore, TestElement},
    impl_test_element,
    sample::SampleResult,
    tree::{lock, NodeId, TestTree},
    worker::ThreadContext,
};
use smol_str::SmolStr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Wraps its children in a virtual [`TransactionSampler`].
///
/// Every `next()` while children remain yields the transaction sampler
/// with the next real child in its `sub_sampler` slot. When the child
/// subtree is exhausted the transaction is marked done, handed out one
/// last time for the worker runtime to close out, and the following call
/// reports exhaustion to the parent.
#[derive(Clone, Debug)]
pub struct TransactionController {
    core: ElementCore,
    generic: GenericController,
    transaction: Option<TransactionHandle>,
}

impl TransactionController {
    /// Creates a transaction controller.
    pub fn new(name: &str) -> Self {
        Self {
            core: ElementCore::named(name),
            generic: GenericController::default(),
            transaction: None,
        }
    }
}

impl Default for TransactionController {
    fn default() -> Self {
        Self::new("Transaction Controller")
    }
}

impl Controller for TransactionController {
    fn generic(&self) -> &GenericController {
        &self.generic
    }

    fn generic_mut(&mut self) -> &mut GenericController {
        &mut self.generic
    }

    fn next(&mut self, tree: &mut TestTree, ctx: &mut ThreadContext) -> ControlResult {
        if let Some(transaction) = &self.transaction {
            if transaction.is_done() {
                debug!(controller = %self.name(), "end of transaction");
                self.transaction = None;
                return Ok(None);
            }
        }

        if self.generic.first {
            debug!(controller = %self.name(), "start of transaction");
            let controller = self
                .core
                .node_id()
                .expect("transaction controller is part of a tree");
            self.transaction = Some(TransactionHandle::new(controller, self.name()));
        }

        let sub_sampler = self.generic_next(tree, ctx)?;
        // The transaction can be gone here when an exhausted controller is
        // revisited before its parent re-initializes it.
        let Some(transaction) = self.transaction.clone() else {
            return Ok(None);
        };
        transaction.set_sub_sampler(sub_sampler.clone());
        if sub_sampler.is_none() {
            transaction.set_transaction_done();
        }
        Ok(Some(NextSampler::Transaction(transaction)))
    }

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
                // Resume the scan for the next real child instead of
                // re-entering `next()`, which would wrap the exhausted
                // state in the transaction sampler again.
                self.generic_next(tree, ctx)
            }
        }
    }

    fn trigger_end_of_loop(&mut self) {
        // Called when an error ends an outer loop: the normal close-out
        // does not happen, so fold a nested transaction's result in and
        // mark this one done.
        if let Some(transaction) = self.transaction.take() {
            if let Some(NextSampler::Transaction(sub)) = transaction.sub_sampler() {
                transaction.add_sub_sampler_result(&sub.result());
            }
            transaction.set_transaction_done();
        }
        self.re_initialize();
    }
}

impl_test_element!(TransactionController {
    caps: Caps::CONTROLLER.union(Caps::TRANSACTION),
    accessors: [controller],
});

/// Shared handle to a [`TransactionSampler`].
#[derive(Clone, Debug)]
pub struct TransactionHandle {
    inner: Arc<Mutex<TransactionSampler>>,
}

impl TransactionHandle {
    fn new(controller: NodeId, name: SmolStr) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TransactionSampler::new(controller, name))),
        }
    }

    /// The transaction controller this sampler belongs to.
    pub fn controller(&self) -> NodeId {
        lock(&self.inner).controller
    }

    /// The transaction name.
    pub fn name(&self) -> SmolStr {
        lock(&self.inner).name.clone()
    }

    /// Whether the transaction has completed.
    pub fn is_done(&self) -> bool {
        lock(&self.inner).done
    }

    /// Number of sub-results aggregated so far.
    pub fn calls(&self) -> u32 {
        lock(&self.inner).calls
    }

    /// The current real child to process.
    pub fn sub_sampler(&self) -> Option<NextSampler> {
        lock(&self.inner).sub_sampler.clone()
    }

    /// Sets the current real child.
    pub fn set_sub_sampler(&self, sub_sampler: Option<NextSampler>) {
        lock(&self.inner).sub_sampler = sub_sampler;
    }

    /// A snapshot of the aggregated transaction result.
    pub fn result(&self) -> SampleResult {
        lock(&self.inner).result.clone()
    }

    /// Aggregates a child's result into the transaction.
    pub fn add_sub_sampler_result(&self, result: &SampleResult) {
        lock(&self.inner).add_sub_sampler_result(result);
    }

    /// Marks the transaction done and finalizes its timing and response
    /// code.
    pub fn set_transaction_done(&self) {
        lock(&self.inner).set_transaction_done();
    }
}

/// The virtual sampler aggregating a transaction's descendant samples into
/// one composite result.
#[derive(Debug)]
pub struct TransactionSampler {
    controller: NodeId,
    name: SmolStr,
    done: bool,
    sub_sampler: Option<NextSampler>,
    calls: u32,
    failing: u32,
    total_time: u64,
    result: SampleResult,
}

impl TransactionSampler {
    fn new(controller: NodeId, name: SmolStr) -> Self {
        let mut result = SampleResult::new(name.clone());
        result.sample_start();
        Self {
            controller,
            name,
            done: false,
            sub_sampler: None,
            calls: 0,
            failing: 0,
            total_time: 0,
            result,
        }
    }

    fn add_sub_sampler_result(&mut self, result: &SampleResult) {
        self.calls += 1;

        // The transaction reports the first response code observed before
        // anything failed.
        if self.failing == 0 {
            self.result.response_code = result.response_code.clone();
        }
        if !result.success {
            self.result.success = false;
            self.failing += 1;
        }

        self.result.add_subresult(result.clone());

        // Time spent paused does not count against the transaction.
        self.total_time += result.elapsed_time.saturating_sub(result.idle_time);
    }

    fn set_transaction_done(&mut self) {
        self.done = true;
        self.result.elapsed_time = self.total_time;
        if self.result.success {
            self.result.response_code = "200".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{elements::builtin::DebugSampler, tree::TestTree};
    use pretty_assertions::assert_eq;

    fn next_of(tree: &mut TestTree, id: NodeId, ctx: &mut ThreadContext) -> Option<NextSampler> {
        tree.with_taken(id, |el, tree| {
            el.as_controller_mut().unwrap().next(tree, ctx)
        })
        .unwrap()
    }

    #[test]
    fn empty_transaction_completes_immediately_with_a_success_result() {
        let mut tree = TestTree::new();
        let id = tree.insert(&[], Box::new(TransactionController::new("t")));
        let mut ctx = ThreadContext::detached();

        let first = next_of(&mut tree, id, &mut ctx);
        let Some(NextSampler::Transaction(handle)) = first else {
            panic!("expected a transaction sampler");
        };
        assert!(handle.is_done());
        assert!(handle.result().success);
        assert_eq!(handle.result().response_code, "200");

        assert!(next_of(&mut tree, id, &mut ctx).is_none());
    }

    #[test]
    fn children_are_handed_out_through_the_transaction_sampler() {
        let mut tree = TestTree::new();
        let id = tree.insert(&[], Box::new(TransactionController::new("t")));
        let s1 = tree.insert(&[id], Box::new(DebugSampler::new("s1")));
        let s2 = tree.insert(&[id], Box::new(DebugSampler::new("s2")));
        tree.with_node_mut(id, |el| {
            let controller = el.as_controller_mut().unwrap();
            controller.add_child(s1);
            controller.add_child(s2);
        });
        let mut ctx = ThreadContext::detached();

        let mut subs = Vec::new();
        loop {
            match next_of(&mut tree, id, &mut ctx) {
                Some(NextSampler::Transaction(handle)) => {
                    if handle.is_done() {
                        subs.push(None);
                        break;
                    }
                    match handle.sub_sampler() {
                        Some(NextSampler::Node(node)) => subs.push(Some(node)),
                        other => panic!("unexpected sub-sampler {other:?}"),
                    }
                }
                Some(NextSampler::Node(_)) => panic!("transaction leaked a raw node"),
                None => break,
            }
        }
        assert_eq!(subs, vec![Some(s1), Some(s2), None]);
    }

    #[test]
    fn aggregation_ors_success_and_reports_the_first_code() {
        let mut tree = TestTree::new();
        let id = tree.insert(&[], Box::new(TransactionController::new("t")));
        let handle = {
            let mut ctx = ThreadContext::detached();
            match next_of(&mut tree, id, &mut ctx) {
                Some(NextSampler::Transaction(handle)) => handle,
                other => panic!("unexpected {other:?}"),
            }
        };

        let mut ok = SampleResult::new("a");
        ok.response_code = "201".to_string();
        ok.elapsed_time = 5;
        handle.add_sub_sampler_result(&ok);

        let mut failed = SampleResult::new("b");
        failed.success = false;
        failed.response_code = "502".to_string();
        failed.elapsed_time = 7;
        failed.idle_time = 2;
        handle.add_sub_sampler_result(&failed);

        handle.set_transaction_done();
        let result = handle.result();
        assert!(!result.success);
        assert_eq!(result.response_code, "201");
        assert_eq!(result.elapsed_time, 10);
        assert_eq!(result.subresults.len(), 2);
    }
}
