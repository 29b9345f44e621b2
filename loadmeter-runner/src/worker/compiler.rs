// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test compiler.
//!
//! A traversal visitor that precomputes one [`SamplePackage`] per sampler
//! and one per transaction controller, so the worker runtime never walks
//! ancestor scopes at sample time. It also assigns scope levels, registers
//! loop-iteration listeners with their ancestor controllers, and attaches
//! samplers and controllers to their parent controllers.

use crate::{
    controls::{Controller, IterationListenerRef},
    elements::{Caps, ElementCore, TestElement},
    tree::{HashTree, NodeArena, NodeId, TestTree, TreeVisitor},
    worker::SamplePackage,
};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Property key under which any sampler may carry its own running
/// strategy.
pub const SAMPLER_STRATEGY_KEY: &str = "Sampler__running_strategy";

/// The component classes a strategy can filter or reverse.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScopeStage {
    /// Pre-processors.
    Pre,
    /// Post-processors.
    Post,
    /// Assertions.
    Assert,
}

/// One side of a component filter. Empty attribute lists match anything.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComponentMatch {
    /// Component classes to match.
    #[serde(rename = "type")]
    pub types: Vec<ScopeStage>,
    /// Scope levels to match (1 collection, 2 worker, 3 controller,
    /// 4 sampler).
    pub level: Vec<u8>,
}

impl ComponentMatch {
    fn matches(&self, stage: ScopeStage, level: u8) -> bool {
        let type_ok = self.types.is_empty() || self.types.contains(&stage);
        let level_ok = self.level.is_empty() || self.level.contains(&level);
        type_ok && level_ok
    }

    fn is_empty(&self) -> bool {
        self.types.is_empty() && self.level.is_empty()
    }
}

/// An include/exclude component filter.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComponentFilter {
    /// Components to keep; everything else is dropped.
    pub include: Option<ComponentMatch>,
    /// Components to drop.
    pub exclude: Option<ComponentMatch>,
}

/// The per-sampler (or per-worker, or per-collection) compile strategy:
/// which inherited processors and assertions apply, and whether their
/// scope ordering is reversed.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunningStrategy {
    /// The component filter, if any.
    pub filter: Option<ComponentFilter>,
    /// Stages whose scope ordering is reversed (outermost first becomes
    /// innermost first and vice versa).
    pub reverse: Vec<ScopeStage>,
}

impl RunningStrategy {
    /// Whether the strategy carries neither filter nor reverse rules.
    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
            && self
                .filter
                .as_ref()
                .is_none_or(|f| {
                    f.include.as_ref().is_none_or(ComponentMatch::is_empty)
                        && f.exclude.as_ref().is_none_or(ComponentMatch::is_empty)
                })
    }

    /// Whether a component of `stage` at `level` is filtered out.
    pub fn filters_out(&self, stage: ScopeStage, level: u8) -> bool {
        let Some(filter) = &self.filter else {
            return false;
        };
        if let Some(include) = &filter.include {
            if !include.is_empty() && !include.matches(stage, level) {
                return true;
            }
        }
        if let Some(exclude) = &filter.exclude {
            if !exclude.is_empty() && exclude.matches(stage, level) {
                return true;
            }
        }
        false
    }

    /// Whether the scope ordering of `stage` is reversed.
    pub fn reversed(&self, stage: ScopeStage) -> bool {
        self.reverse.contains(&stage)
    }
}

/// Reads a running strategy from an element property (an object property,
/// or a string holding JSON).
pub(crate) fn strategy_from_core(core: &ElementCore, key: &str) -> RunningStrategy {
    let Some(prop) = core.get_property(key) else {
        return RunningStrategy::default();
    };
    if let Some(value) = prop.as_object() {
        return serde_json::from_value(value.clone()).unwrap_or_default();
    }
    serde_json::from_str(&prop.raw_str()).unwrap_or_default()
}

fn scope_level(owner: Caps) -> u8 {
    if owner.contains(Caps::COLLECTION) {
        1
    } else if owner.contains(Caps::WORKER) {
        2
    } else if owner.contains(Caps::CONTROLLER) {
        3
    } else {
        4
    }
}

fn is_structural(caps: Caps) -> bool {
    caps.intersects(Caps::COLLECTION | Caps::WORKER | Caps::CONTROLLER | Caps::SAMPLER)
}

/// Compiles a worker subtree into sample packages.
#[derive(Debug)]
pub struct TestCompiler {
    stack: Vec<NodeId>,
    tree: HashTree,
    strategy: RunningStrategy,
    sample_packages: indexmap::IndexMap<NodeId, SamplePackage>,
    trans_packages: indexmap::IndexMap<NodeId, SamplePackage>,
    pairing: HashSet<(NodeId, NodeId)>,
}

impl TestCompiler {
    /// Creates a compiler over the structure it will be traversed with,
    /// with the worker- or collection-level default strategy.
    pub fn new(tree: HashTree, strategy: RunningStrategy) -> Self {
        Self {
            stack: Vec::new(),
            tree,
            strategy,
            sample_packages: indexmap::IndexMap::new(),
            trans_packages: indexmap::IndexMap::new(),
            pairing: HashSet::new(),
        }
    }

    /// The package compiled for a sampler.
    pub fn sample_package(&self, sampler: NodeId) -> Option<&SamplePackage> {
        self.sample_packages.get(&sampler)
    }

    /// The package compiled for a transaction controller.
    pub fn transaction_package(&self, controller: NodeId) -> Option<&SamplePackage> {
        self.trans_packages.get(&controller)
    }

    /// Number of sampler packages compiled.
    pub fn sample_package_count(&self) -> usize {
        self.sample_packages.len()
    }

    /// Number of transaction packages compiled.
    pub fn transaction_package_count(&self) -> usize {
        self.trans_packages.len()
    }

    /// Returns a sampler's package and merges its config elements into the
    /// sampler element (skipping `NO_CONFIG_MERGE` ones). The merged
    /// properties are temporary and roll back when the package is done.
    pub fn configure_sampler(&self, sampler: NodeId, tree: &mut TestTree) -> Option<SamplePackage> {
        let package = self.sample_packages.get(&sampler)?.clone();
        for config in &package.configs {
            if tree.caps(*config).contains(Caps::NO_CONFIG_MERGE) {
                continue;
            }
            let source = tree.with_node(*config, |el| el.core().clone());
            tree.with_node_mut(sampler, |el| el.core_mut().merge_from(&source));
        }
        Some(package)
    }

    fn merged_strategy(&self, sampler: NodeId, arena: &mut NodeArena) -> RunningStrategy {
        let own = arena.with(sampler, |el| {
            strategy_from_core(el.core(), SAMPLER_STRATEGY_KEY)
        });
        if own.is_empty() {
            self.strategy.clone()
        } else {
            own
        }
    }

    fn track_iteration_listeners(&mut self, child: NodeId, arena: &mut NodeArena) {
        if !arena.caps(child).contains(Caps::LOOP_ITERATION_LISTENER) {
            return;
        }
        for ancestor in self.stack.iter().rev().copied() {
            if ancestor == child {
                continue;
            }
            if arena.caps(ancestor).contains(Caps::CONTROLLER) {
                arena.with_mut(ancestor, |el| {
                    if let Some(controller) = el.as_controller_mut() {
                        controller.add_iteration_listener(IterationListenerRef::Node(child));
                    }
                });
            }
        }
    }

    /// Classifies a scope member, backfilling its level from the scope
    /// owner so filter predicates always see one.
    fn stage_level(&self, item: NodeId, owner: NodeId, arena: &mut NodeArena) -> u8 {
        let owner_caps = arena.caps(owner);
        arena.assign_level(item, scope_level(owner_caps));
        arena.level(item).unwrap_or(0)
    }

    fn save_sample_package(&mut self, sampler: NodeId, arena: &mut NodeArena) {
        let strategy = self.merged_strategy(sampler, arena);

        let mut configs = Vec::new();
        let mut listeners = Vec::new();
        let mut controllers = Vec::new();
        let mut pre_processors: Vec<NodeId> = Vec::new();
        let mut post_processors: Vec<NodeId> = Vec::new();
        let mut assertions: Vec<NodeId> = Vec::new();
        let mut timers = Vec::new();

        debug!(sampler = %arena.name(sampler), "building sample package");
        for depth in (0..self.stack.len()).rev() {
            let owner = self.stack[depth];
            if arena.caps(owner).contains(Caps::CONTROLLER) {
                controllers.push(owner);
            }
            let mut depth_pre = Vec::new();
            let mut depth_post = Vec::new();
            let mut depth_assert = Vec::new();
            for item in self.tree.list_by_treepath(&self.stack[0..=depth]) {
                let caps = arena.caps(item);
                if caps.contains(Caps::CONFIG) && !caps.contains(Caps::TRANSACTION_CONFIG) {
                    configs.push(item);
                }
                if caps.contains(Caps::SAMPLE_LISTENER) {
                    listeners.push(item);
                }
                if caps.contains(Caps::TIMER) {
                    timers.push(item);
                }
                if caps.contains(Caps::PRE_PROCESSOR) {
                    let level = self.stage_level(item, owner, arena);
                    if !strategy.filters_out(ScopeStage::Pre, level) {
                        depth_pre.push(item);
                    }
                }
                if caps.contains(Caps::POST_PROCESSOR) {
                    let level = self.stage_level(item, owner, arena);
                    if !strategy.filters_out(ScopeStage::Post, level) {
                        depth_post.push(item);
                    }
                }
                if caps.contains(Caps::ASSERTION) {
                    let level = self.stage_level(item, owner, arena);
                    if !strategy.filters_out(ScopeStage::Assert, level) {
                        depth_assert.push(item);
                    }
                }
            }
            pre_processors.splice(0..0, depth_pre);
            post_processors.splice(0..0, depth_post);
            assertions.splice(0..0, depth_assert);
        }

        // Inner scope runs first by default; a reverse entry flips to
        // outer-first. Levels grow inward, so inner-first sorts
        // descending.
        let order = |ids: &mut Vec<NodeId>, stage: ScopeStage| {
            let reversed = strategy.reversed(stage);
            ids.sort_by_key(|id| {
                let level = i16::from(arena.level(*id).unwrap_or(0));
                if reversed { level } else { -level }
            });
        };
        order(&mut pre_processors, ScopeStage::Pre);
        order(&mut post_processors, ScopeStage::Post);
        order(&mut assertions, ScopeStage::Assert);

        let package = SamplePackage {
            sampler: Some(sampler),
            configs,
            listeners,
            controllers,
            trans_listeners: Vec::new(),
            pre_processors,
            post_processors,
            assertions,
            timers,
        };
        package.set_running_version(arena, true);
        self.sample_packages.insert(sampler, package);
    }

    fn save_trans_package(&mut self, controller: NodeId, arena: &mut NodeArena) {
        let direct_level = self.stack.len() - 1;
        let mut listeners = Vec::new();
        let mut controllers = Vec::new();
        let mut trans_listeners = Vec::new();
        let mut assertions = Vec::new();
        let mut trans_configs = Vec::new();
        let mut trans_samplers = Vec::new();

        debug!(transaction = %arena.name(controller), "building transaction package");
        for depth in (0..self.stack.len()).rev() {
            let owner = self.stack[depth];
            if arena.caps(owner).contains(Caps::CONTROLLER) {
                controllers.push(owner);
            }
            for item in self.tree.list_by_treepath(&self.stack[0..=depth]) {
                let caps = arena.caps(item);
                if caps.contains(Caps::SAMPLE_LISTENER) {
                    listeners.push(item);
                }
                if caps.contains(Caps::ASSERTION) {
                    assertions.push(item);
                }
                if depth == direct_level {
                    if caps.contains(Caps::TRANSACTION_LISTENER) {
                        trans_listeners.push(item);
                    }
                    if caps.contains(Caps::CONFIG) && caps.contains(Caps::TRANSACTION_CONFIG) {
                        trans_configs.push(item);
                    }
                    if caps.contains(Caps::SAMPLER) {
                        trans_samplers.push(item);
                    }
                }
            }
        }

        // Transaction configs prepend to each direct-child sampler's
        // config list, so they merge ahead of inherited configs.
        for sampler in trans_samplers {
            if let Some(package) = self.sample_packages.get_mut(&sampler) {
                package.configs.splice(0..0, trans_configs.iter().copied());
            }
        }

        let package = SamplePackage {
            sampler: None,
            configs: Vec::new(),
            listeners,
            controllers,
            trans_listeners,
            pre_processors: Vec::new(),
            post_processors: Vec::new(),
            assertions,
            timers: Vec::new(),
        };
        package.set_running_version(arena, true);
        self.trans_packages.insert(controller, package);
    }
}

impl TreeVisitor for TestCompiler {
    fn add_node(&mut self, id: NodeId, _subtree: &HashTree, arena: &mut NodeArena) {
        if let Some(&parent) = self.stack.last() {
            let caps = arena.caps(id);
            if !is_structural(caps) && arena.level(id).is_none() {
                let level = scope_level(arena.caps(parent));
                arena.assign_level(id, level);
            }
        }
        self.stack.push(id);
    }

    fn subtract_node(&mut self, arena: &mut NodeArena) {
        let child = *self.stack.last().expect("subtract matches a prior add");

        self.track_iteration_listeners(child, arena);

        let child_caps = arena.caps(child);
        if child_caps.contains(Caps::SAMPLER) {
            self.save_sample_package(child, arena);
        } else if child_caps.contains(Caps::TRANSACTION) {
            self.save_trans_package(child, arena);
        }

        self.stack.pop();
        let Some(&parent) = self.stack.last() else {
            return;
        };

        if arena.caps(parent).contains(Caps::CONTROLLER)
            && child_caps.intersects(Caps::SAMPLER | Caps::CONTROLLER)
        {
            if !self.pairing.insert((parent, child)) {
                warn!(
                    parent = %arena.name(parent),
                    child = %arena.name(child),
                    "unexpected duplicate parent-child attachment"
                );
                return;
            }
            arena.with_mut(parent, |el| {
                el.as_controller_mut()
                    .expect("parent has controller capability")
                    .add_child(child);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controls::{LoopController, TransactionController},
        elements::{
            builtin::{
                ArgumentsConfig, ConstantTimer, DebugSampler, ResponseAssertion, ResultCollector,
                TransactionArguments, VariablesPreProcessor,
            },
            Property,
        },
        tree::TestTree,
        worker::TestWorker,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn compile_with(tree: &mut TestTree, strategy: RunningStrategy) -> TestCompiler {
        let mut compiler = TestCompiler::new(tree.structure().clone(), strategy);
        tree.traverse(&mut compiler);
        compiler
    }

    fn compile(tree: &mut TestTree) -> TestCompiler {
        compile_with(tree, RunningStrategy::default())
    }

    struct Fixture {
        tree: TestTree,
        sampler: NodeId,
        looped: NodeId,
        worker: NodeId,
        pre_outer: NodeId,
        pre_inner: NodeId,
    }

    fn scoped_fixture() -> Fixture {
        let mut tree = TestTree::new();
        let worker = tree.insert(&[], Box::new(TestWorker::new("w", 1, 1)));
        let pre_outer = tree.insert(
            &[worker],
            Box::new(VariablesPreProcessor::new("pre-outer")),
        );
        let looped = tree.insert(&[worker], Box::new(LoopController::new("loop", 2)));
        let sampler = tree.insert(&[worker, looped], Box::new(DebugSampler::new("s")));
        let pre_inner = tree.insert(
            &[worker, looped, sampler],
            Box::new(VariablesPreProcessor::new("pre-inner")),
        );
        Fixture {
            tree,
            sampler,
            looped,
            worker,
            pre_outer,
            pre_inner,
        }
    }

    #[test]
    fn one_package_per_sampler_with_ancestors_nearest_first() {
        let mut fixture = scoped_fixture();
        let timer = fixture.tree.insert(
            &[fixture.worker],
            Box::new(ConstantTimer::new("t", Duration::from_millis(1))),
        );
        let compiler = compile(&mut fixture.tree);

        assert_eq!(compiler.sample_package_count(), 1);
        assert_eq!(compiler.transaction_package_count(), 0);
        let package = compiler.sample_package(fixture.sampler).unwrap();
        assert_eq!(package.controllers, vec![fixture.looped, fixture.worker]);
        assert_eq!(package.timers, vec![timer]);
        // Inner scope runs first by default.
        assert_eq!(
            package.pre_processors,
            vec![fixture.pre_inner, fixture.pre_outer]
        );
    }

    #[test]
    fn reverse_strategy_flips_processor_order() {
        let mut fixture = scoped_fixture();
        let strategy: RunningStrategy =
            serde_json::from_value(json!({"reverse": ["PRE"]})).unwrap();
        let compiler = compile_with(&mut fixture.tree, strategy);
        let package = compiler.sample_package(fixture.sampler).unwrap();
        assert_eq!(
            package.pre_processors,
            vec![fixture.pre_outer, fixture.pre_inner]
        );
    }

    #[test]
    fn exclude_filters_drop_matching_components() {
        let mut fixture = scoped_fixture();
        let strategy: RunningStrategy = serde_json::from_value(json!({
            "filter": {"exclude": {"type": ["PRE"], "level": [2]}}
        }))
        .unwrap();
        let compiler = compile_with(&mut fixture.tree, strategy);
        let package = compiler.sample_package(fixture.sampler).unwrap();
        assert_eq!(package.pre_processors, vec![fixture.pre_inner]);
    }

    #[test]
    fn include_filters_keep_only_matching_components() {
        let mut fixture = scoped_fixture();
        let assertion = fixture.tree.insert(
            &[fixture.worker],
            Box::new(ResponseAssertion::contains("a", "x")),
        );
        let strategy: RunningStrategy = serde_json::from_value(json!({
            "filter": {"include": {"type": ["ASSERT"]}}
        }))
        .unwrap();
        let compiler = compile_with(&mut fixture.tree, strategy);
        let package = compiler.sample_package(fixture.sampler).unwrap();
        assert!(package.pre_processors.is_empty());
        assert_eq!(package.assertions, vec![assertion]);
    }

    #[test]
    fn sampler_strategy_overrides_the_default() {
        let mut fixture = scoped_fixture();
        fixture.tree.with_node_mut(fixture.sampler, |el| {
            el.core_mut()
                .add_property(
                    SAMPLER_STRATEGY_KEY,
                    Property::object(json!({"filter": {"exclude": {"type": ["PRE"]}}})),
                )
                .unwrap();
        });
        let compiler = compile(&mut fixture.tree);
        let package = compiler.sample_package(fixture.sampler).unwrap();
        assert!(package.pre_processors.is_empty());
    }

    #[test]
    fn compiler_attaches_children_to_parent_controllers_once() {
        let mut fixture = scoped_fixture();
        let mut compiler = compile(&mut fixture.tree);
        // A second traversal warns about the duplicates and leaves the
        // attachments alone.
        fixture.tree.traverse(&mut compiler);

        let children = fixture.tree.with_node(fixture.looped, |el| {
            el.as_controller().unwrap().generic().children().to_vec()
        });
        assert_eq!(children, vec![fixture.sampler]);
    }

    #[test]
    fn levels_are_assigned_from_the_owning_scope() {
        let mut fixture = scoped_fixture();
        let _ = compile(&mut fixture.tree);
        assert_eq!(fixture.tree.arena().level(fixture.pre_outer), Some(2));
        assert_eq!(fixture.tree.arena().level(fixture.pre_inner), Some(4));
    }

    #[test]
    fn transaction_packages_collect_direct_members() {
        let mut tree = TestTree::new();
        let worker = tree.insert(&[], Box::new(TestWorker::new("w", 1, 1)));
        let config = tree.insert(
            &[worker],
            Box::new(ArgumentsConfig::new("outer").with_argument("k", "v")),
        );
        let trans = tree.insert(&[worker], Box::new(TransactionController::new("t")));
        let trans_config = tree.insert(
            &[worker, trans],
            Box::new(TransactionArguments::new("tc").with_argument("tk", "tv")),
        );
        let listener = tree.insert(&[worker, trans], Box::new(ResultCollector::new("rc")));
        let s1 = tree.insert(&[worker, trans], Box::new(DebugSampler::new("s1")));
        let s2 = tree.insert(&[worker, trans], Box::new(DebugSampler::new("s2")));

        let compiler = compile(&mut tree);
        assert_eq!(compiler.sample_package_count(), 2);
        assert_eq!(compiler.transaction_package_count(), 1);

        let package = compiler.transaction_package(trans).unwrap();
        assert_eq!(package.trans_listeners, vec![listener]);
        assert!(package.configs.is_empty());

        // The transaction config is excluded from per-sampler packages but
        // prepended to the direct children's config lists.
        for sampler in [s1, s2] {
            let sample_package = compiler.sample_package(sampler).unwrap();
            assert_eq!(sample_package.configs, vec![trans_config, config]);
        }
    }

    #[test]
    fn strategy_parsing_treats_garbage_as_empty() {
        assert!(RunningStrategy::default().is_empty());
        let parsed: RunningStrategy =
            serde_json::from_value(json!({"filter": {}, "reverse": []})).unwrap();
        assert!(parsed.is_empty());
    }
}
