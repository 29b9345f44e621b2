// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed property values and the running-version discipline.
//!
//! Every property tracks two flags: `running_version`, which makes writes
//! temporary, and `temporary`, which marks properties installed while the
//! owning element was running so that recovery can remove them. Setting the
//! running version captures a snapshot of the value; recovery copies the
//! snapshot back (or invalidates the cache, for function properties).

use crate::{elements::TestElement, functions::CompoundVariable, worker::ThreadContext};
use indexmap::IndexMap;
use serde_json::Value;
use smol_str::SmolStr;
use std::fmt;

/// A property value variant.
#[derive(Debug)]
pub enum PropValue {
    /// The absent sentinel; all accessors return the zero value.
    Null,
    /// A scalar encoded as a string, with typed accessors.
    Basic {
        /// The current value.
        value: String,
        /// Snapshot taken when the running version was set.
        saved: Option<String>,
    },
    /// An opaque JSON value.
    Object {
        /// The current value.
        value: Value,
        /// Snapshot taken when the running version was set.
        saved: Option<Value>,
    },
    /// A compiled compound variable, evaluated lazily.
    Function(FunctionProperty),
    /// A nested test element.
    Element(Box<dyn TestElement>),
    /// An ordered sequence of properties.
    Collection {
        /// The current items.
        items: Vec<Property>,
        /// Snapshot taken when the running version was set.
        saved: Option<Vec<Property>>,
    },
    /// A keyed set of properties.
    Map {
        /// The current entries.
        entries: IndexMap<SmolStr, Property>,
        /// Snapshot taken when the running version was set.
        saved: Option<IndexMap<SmolStr, Property>>,
    },
}

impl Clone for PropValue {
    fn clone(&self) -> Self {
        match self {
            PropValue::Null => PropValue::Null,
            PropValue::Basic { value, saved } => PropValue::Basic {
                value: value.clone(),
                saved: saved.clone(),
            },
            PropValue::Object { value, saved } => PropValue::Object {
                value: value.clone(),
                saved: saved.clone(),
            },
            PropValue::Function(f) => PropValue::Function(f.clone()),
            PropValue::Element(el) => PropValue::Element(el.boxed_clone()),
            PropValue::Collection { items, saved } => PropValue::Collection {
                items: items.clone(),
                saved: saved.clone(),
            },
            PropValue::Map { entries, saved } => PropValue::Map {
                entries: entries.clone(),
                saved: saved.clone(),
            },
        }
    }
}

/// A named, typed value held by a test element.
#[derive(Clone, Debug)]
pub struct Property {
    value: PropValue,
    running_version: bool,
    temporary: bool,
}

impl Property {
    fn from_value(value: PropValue) -> Self {
        Self {
            value,
            running_version: false,
            temporary: false,
        }
    }

    /// The absent property.
    pub fn null() -> Self {
        Self::from_value(PropValue::Null)
    }

    /// A scalar property.
    pub fn basic(value: impl Into<String>) -> Self {
        Self::from_value(PropValue::Basic {
            value: value.into(),
            saved: None,
        })
    }

    /// An opaque JSON value property.
    pub fn object(value: Value) -> Self {
        Self::from_value(PropValue::Object { value, saved: None })
    }

    /// A function property over a compiled compound variable.
    pub fn function(function: CompoundVariable) -> Self {
        Self::from_value(PropValue::Function(FunctionProperty::new(function)))
    }

    /// An element-valued property.
    pub fn element(element: Box<dyn TestElement>) -> Self {
        Self::from_value(PropValue::Element(element))
    }

    /// An ordered collection property.
    pub fn collection(items: Vec<Property>) -> Self {
        Self::from_value(PropValue::Collection { items, saved: None })
    }

    /// A keyed map property.
    pub fn map(entries: IndexMap<SmolStr, Property>) -> Self {
        Self::from_value(PropValue::Map {
            entries,
            saved: None,
        })
    }

    /// The raw variant.
    pub fn value(&self) -> &PropValue {
        &self.value
    }

    /// The raw variant, mutably.
    pub fn value_mut(&mut self) -> &mut PropValue {
        &mut self.value
    }

    /// True for the absent sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self.value, PropValue::Null)
    }

    /// Whether this property was installed while the owner was running.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub(crate) fn set_temporary(&mut self, temporary: bool) {
        self.temporary = temporary;
    }

    /// Whether writes are currently temporary.
    pub fn running_version(&self) -> bool {
        self.running_version
    }

    /// The property value as a string. Function properties return the raw
    /// source text unless running, in which case they evaluate (caching per
    /// iteration).
    pub fn as_str(&mut self, ctx: &ThreadContext) -> String {
        let running = self.running_version;
        match &mut self.value {
            PropValue::Null => String::new(),
            PropValue::Basic { value, .. } => value.clone(),
            PropValue::Object { value, .. } => render_value(value),
            PropValue::Function(f) => f.get_str(running, ctx),
            PropValue::Element(el) => el.name().to_string(),
            PropValue::Collection { items, .. } => format!("{items:?}"),
            PropValue::Map { entries, .. } => format!("{entries:?}"),
        }
    }

    /// The property value parsed as an integer; zero when absent or
    /// unparsable.
    pub fn as_int(&mut self, ctx: &ThreadContext) -> i64 {
        let s = self.as_str(ctx);
        s.trim().parse().unwrap_or(0)
    }

    /// The property value parsed as a float; zero when absent or
    /// unparsable.
    pub fn as_float(&mut self, ctx: &ThreadContext) -> f64 {
        let s = self.as_str(ctx);
        s.trim().parse().unwrap_or(0.0)
    }

    /// The property value parsed as a boolean; `true` only for the literal
    /// string `true` (case-insensitive).
    pub fn as_bool(&mut self, ctx: &ThreadContext) -> bool {
        self.as_str(ctx).trim().eq_ignore_ascii_case("true")
    }

    /// The value without evaluation: function properties yield their raw
    /// source text.
    pub fn raw_str(&self) -> String {
        match &self.value {
            PropValue::Null => String::new(),
            PropValue::Basic { value, .. } => value.clone(),
            PropValue::Object { value, .. } => render_value(value),
            PropValue::Function(f) => f.raw().to_string(),
            PropValue::Element(el) => el.name().to_string(),
            PropValue::Collection { items, .. } => format!("{items:?}"),
            PropValue::Map { entries, .. } => format!("{entries:?}"),
        }
    }

    /// The JSON value of an object property.
    pub fn as_object(&self) -> Option<&Value> {
        match &self.value {
            PropValue::Object { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The nested element of an element property.
    pub fn as_element_mut(&mut self) -> Option<&mut Box<dyn TestElement>> {
        match &mut self.value {
            PropValue::Element(el) => Some(el),
            _ => None,
        }
    }

    /// The nested element of an element property, shared.
    pub fn as_element(&self) -> Option<&dyn TestElement> {
        match &self.value {
            PropValue::Element(el) => Some(el.as_ref()),
            _ => None,
        }
    }

    /// The items of a collection property.
    pub fn as_collection(&self) -> Option<&[Property]> {
        match &self.value {
            PropValue::Collection { items, .. } => Some(items),
            _ => None,
        }
    }

    /// The entries of a map property.
    pub fn as_map(&self) -> Option<&IndexMap<SmolStr, Property>> {
        match &self.value {
            PropValue::Map { entries, .. } => Some(entries),
            _ => None,
        }
    }

    /// Overwrites the value in place where the variant supports it (basic
    /// and object properties), keeping any running-version snapshot so the
    /// write rolls back on recovery. Returns false when the variant cannot
    /// be written in place.
    pub(crate) fn set_string_in_place(&mut self, new_value: impl Into<String>) -> bool {
        match &mut self.value {
            PropValue::Basic { value, .. } => {
                *value = new_value.into();
                true
            }
            PropValue::Object { value, .. } => {
                *value = Value::String(new_value.into());
                true
            }
            _ => false,
        }
    }

    /// Enters or leaves the running version, capturing or dropping value
    /// snapshots. Multi-valued variants propagate to their children.
    pub fn set_running_version(&mut self, running: bool) {
        self.running_version = running;
        match &mut self.value {
            PropValue::Null | PropValue::Function(_) => {}
            PropValue::Basic { value, saved } => {
                *saved = running.then(|| value.clone());
            }
            PropValue::Object { value, saved } => {
                *saved = running.then(|| value.clone());
            }
            PropValue::Element(el) => {
                el.set_running_version(running);
            }
            PropValue::Collection { items, saved } => {
                for item in items.iter_mut() {
                    item.set_running_version(running);
                }
                *saved = running.then(|| items.clone());
            }
            PropValue::Map { entries, saved } => {
                for item in entries.values_mut() {
                    item.set_running_version(running);
                }
                *saved = running.then(|| entries.clone());
            }
        }
    }

    /// Rolls the value back to the snapshot taken when the running version
    /// was entered. Multi-valued variants recurse; function properties
    /// invalidate their cached evaluation.
    pub fn recover_running_version(&mut self) {
        match &mut self.value {
            PropValue::Null => {}
            PropValue::Basic { value, saved } => {
                if let Some(saved) = saved {
                    *value = saved.clone();
                }
            }
            PropValue::Object { value, saved } => {
                if let Some(saved) = saved {
                    *value = saved.clone();
                }
            }
            PropValue::Function(f) => f.recover(),
            PropValue::Element(el) => el.recover_running_version(),
            PropValue::Collection { items, saved } => {
                if let Some(saved) = saved {
                    *items = saved.clone();
                }
                items.retain(|item| !item.is_temporary());
                for item in items.iter_mut() {
                    item.recover_running_version();
                }
            }
            PropValue::Map { entries, saved } => {
                if let Some(saved) = saved {
                    *entries = saved.clone();
                }
                entries.retain(|_, item| !item.is_temporary());
                for item in entries.values_mut() {
                    item.recover_running_version();
                }
            }
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A property holding a compiled compound variable.
///
/// Outside the running version it exposes the raw source text. While
/// running, the expression is re-evaluated whenever the worker's iteration
/// counter advances past the cached iteration, or when the cache is empty.
#[derive(Clone, Debug)]
pub struct FunctionProperty {
    function: CompoundVariable,
    cache: Option<String>,
    cached_iteration: Option<u64>,
}

impl FunctionProperty {
    /// Wraps a compiled compound variable.
    pub fn new(function: CompoundVariable) -> Self {
        Self {
            function,
            cache: None,
            cached_iteration: None,
        }
    }

    /// The raw source text.
    pub fn raw(&self) -> &str {
        self.function.raw()
    }

    /// The underlying compound variable.
    pub fn function(&self) -> &CompoundVariable {
        &self.function
    }

    fn get_str(&mut self, running: bool, ctx: &ThreadContext) -> String {
        if !running {
            return self.function.raw().to_string();
        }

        let iteration = ctx.variables.iteration();
        if let Some(cached) = self.cached_iteration {
            // The counter went backwards: a fresh unit reused this element.
            if iteration < cached {
                self.cached_iteration = None;
            }
        }

        let stale = self
            .cached_iteration
            .is_none_or(|cached| iteration > cached);
        if stale || self.cache.is_none() {
            self.cached_iteration = Some(iteration);
            self.cache = Some(self.function.execute(ctx));
        }

        self.cache.clone().unwrap_or_default()
    }

    fn recover(&mut self) {
        self.cache = None;
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{CompoundVariable, FunctionRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx() -> ThreadContext {
        ThreadContext::detached()
    }

    #[test]
    fn basic_property_rolls_back_to_snapshot() {
        let mut prop = Property::basic("original");
        prop.set_running_version(true);
        assert!(prop.set_string_in_place("changed"));
        assert_eq!(prop.as_str(&ctx()), "changed");
        prop.recover_running_version();
        assert_eq!(prop.as_str(&ctx()), "original");
    }

    #[test]
    fn repeated_writes_roll_back_to_the_first_snapshot() {
        let mut prop = Property::basic("v0");
        prop.set_running_version(true);
        for value in ["v1", "v2", "v3"] {
            prop.set_string_in_place(value);
        }
        prop.recover_running_version();
        assert_eq!(prop.as_str(&ctx()), "v0");
    }

    #[test]
    fn object_property_rolls_back() {
        let mut prop = Property::object(json!({"k": 1}));
        prop.set_running_version(true);
        prop.set_string_in_place("overwritten");
        prop.recover_running_version();
        assert_eq!(prop.as_object().unwrap(), &json!({"k": 1}));
    }

    #[test]
    fn collection_recovery_restores_snapshot_and_drops_temporaries() {
        let mut prop = Property::collection(vec![Property::basic("a")]);
        prop.set_running_version(true);
        if let PropValue::Collection { items, .. } = prop.value_mut() {
            let mut temp = Property::basic("b");
            temp.set_temporary(true);
            items.push(temp);
        }
        prop.recover_running_version();
        assert_eq!(prop.as_collection().unwrap().len(), 1);
    }

    #[test]
    fn typed_accessors_parse_scalars() {
        assert_eq!(Property::basic("42").as_int(&ctx()), 42);
        assert_eq!(Property::basic("1.5").as_float(&ctx()), 1.5);
        assert!(Property::basic("TRUE").as_bool(&ctx()));
        assert!(!Property::basic("yes").as_bool(&ctx()));
        assert_eq!(Property::basic("nope").as_int(&ctx()), 0);
        assert_eq!(Property::null().as_str(&ctx()), "");
        assert_eq!(Property::null().as_int(&ctx()), 0);
    }

    #[test]
    fn function_property_returns_raw_when_not_running() {
        let registry = FunctionRegistry::default();
        let compiled = CompoundVariable::compile("${__uuid()}", &registry).unwrap();
        let mut prop = Property::function(compiled);
        assert_eq!(prop.as_str(&ctx()), "${__uuid()}");
    }

    #[test]
    fn function_property_caches_within_an_iteration() {
        let registry = FunctionRegistry::default();
        let compiled = CompoundVariable::compile("${__uuid()}", &registry).unwrap();
        let mut prop = Property::function(compiled);
        prop.set_running_version(true);

        let mut ctx = ThreadContext::detached();
        ctx.variables.inc_iteration();
        let first = prop.as_str(&ctx);
        assert_eq!(prop.as_str(&ctx), first);

        ctx.variables.inc_iteration();
        let second = prop.as_str(&ctx);
        assert_ne!(first, second);
    }

    #[test]
    fn function_property_recovery_invalidates_the_cache() {
        let registry = FunctionRegistry::default();
        let compiled = CompoundVariable::compile("${__uuid()}", &registry).unwrap();
        let mut prop = Property::function(compiled);
        prop.set_running_version(true);

        let mut ctx = ThreadContext::detached();
        ctx.variables.inc_iteration();
        let first = prop.as_str(&ctx);
        prop.recover_running_version();
        assert_ne!(prop.as_str(&ctx), first);
    }
}
