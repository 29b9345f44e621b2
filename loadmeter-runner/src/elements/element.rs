// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test element trait and its shared core state.

use crate::{
    controls::Controller,
    elements::{
        interface::{
            Assertion, CollectionListener, LoopIterationListener, PostProcessor, PreProcessor,
            SampleListener, TestIterationListener, Timer, TransactionListener, WorkerListener,
        },
        Caps, Property,
    },
    errors::InvalidPropertyError,
    sample::Sampler,
    tree::NodeId,
    worker::ThreadContext,
};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::{any::Any, fmt};

/// Property key for the element name.
pub const NAME_KEY: &str = "TestElement__name";
/// Property key for the element description.
pub const DESC_KEY: &str = "TestElement__desc";

/// State shared by every test element: the ordered property map, the
/// running-version flag, the compiler-assigned scope level, and the node id
/// in the owning arena.
#[derive(Clone, Debug, Default)]
pub struct ElementCore {
    props: IndexMap<SmolStr, Property>,
    running_version: bool,
    level: Option<u8>,
    node_id: Option<NodeId>,
}

impl ElementCore {
    /// Creates an empty core.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a core with a name property.
    pub fn named(name: impl Into<SmolStr>) -> Self {
        let mut core = Self::default();
        core.put_basic(NAME_KEY, name.into());
        core
    }

    /// The scope level assigned during compilation (1 collection, 2 worker,
    /// 3 controller, 4 sampler).
    pub fn level(&self) -> Option<u8> {
        self.level
    }

    /// Assigns the scope level.
    pub fn set_level(&mut self, level: u8) {
        self.level = Some(level);
    }

    pub(crate) fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    pub(crate) fn set_node_id(&mut self, id: NodeId) {
        self.node_id = Some(id);
    }

    /// Whether the element is in its running version.
    pub fn running_version(&self) -> bool {
        self.running_version
    }

    /// Sets a scalar property. While running, an existing property is
    /// mutated in place (so the write rolls back on recovery); otherwise a
    /// new property is installed, marked temporary when running.
    pub fn set_property(
        &mut self,
        key: &str,
        value: impl Into<String>,
    ) -> Result<(), InvalidPropertyError> {
        if key.is_empty() {
            return Err(InvalidPropertyError);
        }
        self.put_basic(key, value);
        Ok(())
    }

    /// Infallible internal variant of [`set_property`](Self::set_property)
    /// for constant keys.
    pub(crate) fn put_basic(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if self.running_version {
            if let Some(existing) = self.props.get_mut(key) {
                if !existing.is_null() && existing.set_string_in_place(value.clone()) {
                    return;
                }
            }
        }
        let _ = self.add_property(key, Property::basic(value));
    }

    /// Installs a property under `key`. Properties added while running are
    /// recorded as temporary and removed again by
    /// [`recover_running_version`](Self::recover_running_version).
    pub fn add_property(
        &mut self,
        key: &str,
        mut property: Property,
    ) -> Result<(), InvalidPropertyError> {
        if key.is_empty() {
            return Err(InvalidPropertyError);
        }
        if self.running_version {
            property.set_temporary(true);
            property.set_running_version(true);
        } else {
            property.set_temporary(false);
        }
        self.props.insert(SmolStr::new(key), property);
        Ok(())
    }

    /// Looks up a property.
    pub fn get_property(&self, key: &str) -> Option<&Property> {
        self.props.get(key)
    }

    /// Looks up a property, mutably.
    pub fn get_property_mut(&mut self, key: &str) -> Option<&mut Property> {
        self.props.get_mut(key)
    }

    /// Removes a property.
    pub fn remove_property(&mut self, key: &str) -> Option<Property> {
        self.props.shift_remove(key)
    }

    /// The ordered property keys.
    pub fn property_keys(&self) -> impl Iterator<Item = &SmolStr> {
        self.props.keys()
    }

    /// Iterates over all properties.
    pub fn properties(&self) -> impl Iterator<Item = (&SmolStr, &Property)> {
        self.props.iter()
    }

    /// The property value as a string; empty when absent.
    pub fn prop_str(&mut self, key: &str, ctx: &ThreadContext) -> String {
        match self.props.get_mut(key) {
            Some(p) if !p.is_null() => p.as_str(ctx),
            _ => String::new(),
        }
    }

    /// The property value as an integer; zero when absent.
    pub fn prop_int(&mut self, key: &str, ctx: &ThreadContext) -> i64 {
        match self.props.get_mut(key) {
            Some(p) if !p.is_null() => p.as_int(ctx),
            _ => 0,
        }
    }

    /// The property value as a float; zero when absent.
    pub fn prop_float(&mut self, key: &str, ctx: &ThreadContext) -> f64 {
        match self.props.get_mut(key) {
            Some(p) if !p.is_null() => p.as_float(ctx),
            _ => 0.0,
        }
    }

    /// The property value as a boolean; false when absent.
    pub fn prop_bool(&mut self, key: &str, ctx: &ThreadContext) -> bool {
        match self.props.get_mut(key) {
            Some(p) if !p.is_null() => p.as_bool(ctx),
            _ => false,
        }
    }

    /// The property value without evaluation; `None` when absent.
    pub fn raw_str(&self, key: &str) -> Option<String> {
        self.props.get(key).map(Property::raw_str)
    }

    /// Enters or leaves the running version, propagating to every
    /// property.
    pub fn set_running_version(&mut self, running: bool) {
        self.running_version = running;
        for prop in self.props.values_mut() {
            prop.set_running_version(running);
        }
    }

    /// Removes every temporary property and asks the rest to roll back to
    /// their snapshots.
    pub fn recover_running_version(&mut self) {
        self.props.retain(|_, prop| !prop.is_temporary());
        for prop in self.props.values_mut() {
            prop.recover_running_version();
        }
    }

    /// Merges another element's properties in, the way config elements are
    /// applied to samplers. Existing scalar values are overwritten in place
    /// (snapshot-protected while running); everything else is installed as
    /// a new property. Element identity (name, description) does not merge.
    pub fn merge_from(&mut self, source: &ElementCore) {
        for (key, prop) in &source.props {
            if key == NAME_KEY || key == DESC_KEY {
                continue;
            }
            if self.running_version {
                if let Some(existing) = self.props.get_mut(key.as_str()) {
                    if !existing.is_null() && existing.set_string_in_place(prop.raw_str()) {
                        continue;
                    }
                }
            }
            let _ = self.add_property(key.as_str(), prop.clone());
        }
    }
}

/// A configurable node in the test tree.
///
/// Elements declare the capabilities they satisfy both through [`caps`]
/// (used by the compiler's filter predicates and the runtime's dispatch)
/// and through the `as_*` accessor methods, which expose the corresponding
/// behavioral trait. The [`crate::impl_test_element!`] macro generates the
/// mechanical part of an implementation.
///
/// [`caps`]: TestElement::caps
pub trait TestElement: Send + fmt::Debug {
    /// The shared element core.
    fn core(&self) -> &ElementCore;

    /// The shared element core, mutably.
    fn core_mut(&mut self) -> &mut ElementCore;

    /// The capability set of this element.
    fn caps(&self) -> Caps;

    /// Deep-copies this element. The clone shares no mutable state with
    /// the original.
    fn boxed_clone(&self) -> Box<dyn TestElement>;

    /// Upcast for concrete-type downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for concrete-type downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    // Capability accessors. An element overrides the accessors matching its
    // capability set; the default is "not satisfied".

    /// The controller capability, if satisfied.
    fn as_controller(&self) -> Option<&dyn Controller> {
        None
    }

    /// The controller capability, mutably.
    fn as_controller_mut(&mut self) -> Option<&mut dyn Controller> {
        None
    }

    /// The sampler capability, if satisfied.
    fn as_sampler_mut(&mut self) -> Option<&mut dyn Sampler> {
        None
    }

    /// The timer capability, if satisfied.
    fn as_timer_mut(&mut self) -> Option<&mut dyn Timer> {
        None
    }

    /// The assertion capability, if satisfied.
    fn as_assertion_mut(&mut self) -> Option<&mut dyn Assertion> {
        None
    }

    /// The pre-processor capability, if satisfied.
    fn as_pre_processor_mut(&mut self) -> Option<&mut dyn PreProcessor> {
        None
    }

    /// The post-processor capability, if satisfied.
    fn as_post_processor_mut(&mut self) -> Option<&mut dyn PostProcessor> {
        None
    }

    /// The sample-listener capability, if satisfied.
    fn as_sample_listener_mut(&mut self) -> Option<&mut dyn SampleListener> {
        None
    }

    /// The transaction-listener capability, if satisfied.
    fn as_transaction_listener_mut(&mut self) -> Option<&mut dyn TransactionListener> {
        None
    }

    /// The test-iteration-listener capability, if satisfied.
    fn as_test_iteration_listener_mut(&mut self) -> Option<&mut dyn TestIterationListener> {
        None
    }

    /// The loop-iteration-listener capability, if satisfied.
    fn as_loop_iteration_listener_mut(&mut self) -> Option<&mut dyn LoopIterationListener> {
        None
    }

    /// The worker-listener capability, if satisfied.
    fn as_worker_listener_mut(&mut self) -> Option<&mut dyn WorkerListener> {
        None
    }

    /// The collection-listener capability, if satisfied.
    fn as_collection_listener_mut(&mut self) -> Option<&mut dyn CollectionListener> {
        None
    }

    // Provided conveniences over the core.

    /// The element name.
    fn name(&self) -> SmolStr {
        self.core()
            .raw_str(NAME_KEY)
            .map(SmolStr::new)
            .unwrap_or_default()
    }

    /// Sets the element name.
    fn set_name(&mut self, name: &str) {
        self.core_mut().put_basic(NAME_KEY, name);
    }

    /// The element description.
    fn desc(&self) -> SmolStr {
        self.core()
            .raw_str(DESC_KEY)
            .map(SmolStr::new)
            .unwrap_or_default()
    }

    /// Sets the element description.
    fn set_desc(&mut self, desc: &str) {
        self.core_mut().put_basic(DESC_KEY, desc);
    }

    /// Whether the element is in its running version.
    fn running_version(&self) -> bool {
        self.core().running_version()
    }

    /// Enters or leaves the running version.
    fn set_running_version(&mut self, running: bool) {
        self.core_mut().set_running_version(running);
    }

    /// Rolls temporary state back to the pre-run configuration.
    fn recover_running_version(&mut self) {
        self.core_mut().recover_running_version();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::builtin::DebugSampler;
    use pretty_assertions::assert_eq;

    #[test]
    fn clone_shares_no_mutable_state() {
        let mut sampler = DebugSampler::new("A");
        sampler.core_mut().put_basic("key", "one");
        let mut cloned = sampler.boxed_clone();
        cloned.core_mut().put_basic("key", "two");
        assert_eq!(sampler.core().raw_str("key").unwrap(), "one");
        assert_eq!(cloned.core().raw_str("key").unwrap(), "two");
        assert_eq!(cloned.name(), sampler.name());
    }

    #[test]
    fn set_property_rejects_empty_keys() {
        let mut core = ElementCore::new();
        assert_eq!(core.set_property("", "x"), Err(InvalidPropertyError));
        assert_eq!(
            core.add_property("", Property::basic("x")),
            Err(InvalidPropertyError)
        );
    }

    #[test]
    fn recovery_removes_exactly_the_running_additions() {
        let mut core = ElementCore::named("el");
        core.put_basic("permanent", "before");
        core.set_running_version(true);

        core.add_property("temp-a", Property::basic("gone"))
            .unwrap();
        core.put_basic("permanent", "during");
        core.add_property("temp-b", Property::basic("gone too"))
            .unwrap();
        assert_eq!(core.raw_str("permanent").unwrap(), "during");

        core.recover_running_version();
        assert!(core.get_property("temp-a").is_none());
        assert!(core.get_property("temp-b").is_none());
        assert_eq!(core.raw_str("permanent").unwrap(), "before");
        assert_eq!(core.raw_str(NAME_KEY).unwrap(), "el");
    }

    #[test]
    fn merge_applies_values_but_not_identity() {
        let mut target = ElementCore::named("sampler");
        let mut source = ElementCore::named("config");
        source.put_basic("header", "x-test");

        target.set_running_version(true);
        target.merge_from(&source);
        assert_eq!(target.raw_str("header").unwrap(), "x-test");
        assert_eq!(target.raw_str(NAME_KEY).unwrap(), "sampler");

        target.recover_running_version();
        assert!(target.get_property("header").is_none());
    }

    #[test]
    fn merge_overwrites_in_place_and_rolls_back() {
        let mut target = ElementCore::named("sampler");
        target.put_basic("shared", "mine");
        let mut source = ElementCore::new();
        source.put_basic("shared", "theirs");

        target.set_running_version(true);
        target.merge_from(&source);
        assert_eq!(target.raw_str("shared").unwrap(), "theirs");

        target.recover_running_version();
        assert_eq!(target.raw_str("shared").unwrap(), "mine");
    }
}
