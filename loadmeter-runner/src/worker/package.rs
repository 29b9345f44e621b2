// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The precomputed per-sampler context.

use crate::tree::{NodeArena, NodeId};
use tracing::debug;

/// Everything a single sampler invocation needs, precomputed from the
/// sampler's ancestor scopes by the test compiler: configs, listeners,
/// the controllers on the path (nearest first), processors, assertions,
/// and timers, each in execution order.
#[derive(Clone, Debug, Default)]
pub struct SamplePackage {
    /// The sampler this package belongs to (unset for transaction-scoped
    /// packages).
    pub sampler: Option<NodeId>,
    /// Config elements to merge into the sampler, inner scope first.
    pub configs: Vec<NodeId>,
    /// Sample listeners in scope.
    pub listeners: Vec<NodeId>,
    /// Ancestor controllers, nearest first.
    pub controllers: Vec<NodeId>,
    /// Transaction listeners (transaction-scoped packages only).
    pub trans_listeners: Vec<NodeId>,
    /// Pre-processors in execution order.
    pub pre_processors: Vec<NodeId>,
    /// Post-processors in execution order.
    pub post_processors: Vec<NodeId>,
    /// Assertions in execution order.
    pub assertions: Vec<NodeId>,
    /// Timers in scope, inner first.
    pub timers: Vec<NodeId>,
}

impl SamplePackage {
    fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.configs
            .iter()
            .chain(&self.listeners)
            .chain(&self.controllers)
            .chain(&self.trans_listeners)
            .chain(&self.pre_processors)
            .chain(&self.post_processors)
            .chain(&self.assertions)
            .chain(&self.timers)
            .chain(&self.sampler)
            .copied()
    }

    /// Broadcasts the running-version flag to every member.
    pub fn set_running_version(&self, arena: &mut NodeArena, running: bool) {
        debug!(sampler = ?self.sampler, running, "package running version");
        for id in self.members() {
            arena.with_mut(id, |el| el.set_running_version(running));
        }
    }

    /// Rolls every member back to its pre-run configuration.
    pub fn recover_running_version(&self, arena: &mut NodeArena) {
        for id in self.members() {
            arena.with_mut(id, |el| el.recover_running_version());
        }
    }

    /// Called when the sample (or transaction) this package drove has
    /// finished.
    pub fn done(&self, arena: &mut NodeArena) {
        self.recover_running_version(arena);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        elements::{builtin::DebugSampler, TestElement},
        tree::TestTree,
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn set_and_recover_running_version_is_an_identity() {
        let mut tree = TestTree::new();
        let sampler = tree.insert(&[], Box::new(DebugSampler::new("s")));
        tree.with_node_mut(sampler, |el| {
            el.core_mut().put_basic("key", "value");
        });

        let package = SamplePackage {
            sampler: Some(sampler),
            ..SamplePackage::default()
        };
        package.set_running_version(tree.arena_mut(), true);
        package.recover_running_version(tree.arena_mut());

        tree.with_node(sampler, |el| {
            assert_eq!(el.core().raw_str("key").unwrap(), "value");
            assert!(el.running_version());
        });
    }

    #[test]
    fn done_rolls_back_temporary_properties() {
        let mut tree = TestTree::new();
        let sampler = tree.insert(&[], Box::new(DebugSampler::new("s")));
        let package = SamplePackage {
            sampler: Some(sampler),
            ..SamplePackage::default()
        };
        package.set_running_version(tree.arena_mut(), true);

        tree.with_node_mut(sampler, |el| {
            el.core_mut().put_basic("merged", "config value");
        });
        tree.with_node(sampler, |el| {
            assert!(el.core().get_property("merged").is_some());
        });

        package.done(tree.arena_mut());
        tree.with_node(sampler, |el| {
            assert!(el.core().get_property("merged").is_none());
        });
    }
}
