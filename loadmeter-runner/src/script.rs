// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Script deserialization: a JSON list of node objects becomes a
//! [`TestTree`].
//!
//! Each node is `{name, desc, class, enabled, property, child}`. Disabled
//! nodes are pruned with their subtrees. `class` resolves through the
//! [`ElementRegistry`]; property strings containing `${…}` compile to
//! function properties, nested `class` objects become element properties,
//! plain objects become object properties, and lists become collection
//! properties.

use crate::{
    controls::{
        ForeachController, IfController, LoopController, RetryController, TransactionController,
    },
    elements::{
        builtin::{
            ArgumentsConfig, ConstantTimer, DebugSampler, RegexExtractPostProcessor,
            ResponseAssertion, ResultCollector, TransactionArguments, VariablesPreProcessor,
        },
        Property, TestElement, DESC_KEY, NAME_KEY,
    },
    errors::ScriptParseError,
    functions::{compile_property, FunctionRegistry},
    tree::{NodeId, TestTree},
    worker::{TestCollection, TestWorker},
};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use smol_str::SmolStr;
use tracing::warn;

type ElementFactory = fn() -> Box<dyn TestElement>;

const REQUIRED_FIELDS: [&str; 6] = ["name", "desc", "class", "enabled", "property", "child"];

/// Maps class-name strings to element factories, and carries the function
/// registry used to compile `${…}` property values.
#[derive(Debug)]
pub struct ElementRegistry {
    elements: IndexMap<SmolStr, ElementFactory>,
    functions: FunctionRegistry,
}

impl ElementRegistry {
    /// A registry with no classes and the default function set.
    pub fn empty() -> Self {
        Self {
            elements: IndexMap::new(),
            functions: FunctionRegistry::default(),
        }
    }

    /// Registers a class.
    pub fn register(&mut self, class: &str, factory: ElementFactory) {
        self.elements.insert(SmolStr::new(class), factory);
    }

    /// The function registry used for property compilation.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// The function registry, mutably, for registering extensions.
    pub fn functions_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.functions
    }

    /// Deserializes a script document into a test tree.
    pub fn load_tree(&self, content: &str) -> Result<TestTree, ScriptParseError> {
        let value: Value =
            serde_json::from_str(content).map_err(ScriptParseError::InvalidDocument)?;
        self.load_value(&value)
    }

    /// Builds a test tree from an already parsed document.
    pub fn load_value(&self, script: &Value) -> Result<TestTree, ScriptParseError> {
        let nodes = script.as_array().ok_or(ScriptParseError::NotAList)?;
        let mut tree = TestTree::new();
        let added = self.parse_nodes(nodes, &mut tree, &[])?;
        if !added {
            return Err(ScriptParseError::Empty);
        }
        Ok(tree)
    }

    fn parse_nodes(
        &self,
        nodes: &[Value],
        tree: &mut TestTree,
        path: &[NodeId],
    ) -> Result<bool, ScriptParseError> {
        let mut added = false;
        for node in nodes {
            let fields = node.as_object().ok_or(ScriptParseError::NotAnObject)?;
            check_fields(fields)?;
            if !fields
                .get("enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                continue;
            }

            let element = self.build_element(fields)?;
            let id = tree.insert(path, element);
            added = true;

            if let Some(children) = fields.get("child").and_then(Value::as_array) {
                let mut child_path = path.to_vec();
                child_path.push(id);
                self.parse_nodes(children, tree, &child_path)?;
            }
        }
        Ok(added)
    }

    fn build_element(
        &self,
        fields: &Map<String, Value>,
    ) -> Result<Box<dyn TestElement>, ScriptParseError> {
        let class = fields
            .get("class")
            .and_then(Value::as_str)
            .ok_or_else(|| missing(fields, "class"))?;
        let factory = self
            .elements
            .get(class)
            .ok_or_else(|| ScriptParseError::UnknownClass {
                class: SmolStr::new(class),
            })?;
        let mut element = factory();

        if let Some(name) = fields.get("name").and_then(Value::as_str) {
            self.set_replaced(element.as_mut(), NAME_KEY, name);
        }
        if let Some(desc) = fields.get("desc").and_then(Value::as_str) {
            self.set_replaced(element.as_mut(), DESC_KEY, desc);
        }

        if let Some(properties) = fields.get("property").and_then(Value::as_object) {
            for (key, value) in properties {
                if key.is_empty() {
                    warn!(class, "skipping property with empty key");
                    continue;
                }
                self.apply_property(element.as_mut(), key, value)?;
            }
        }
        Ok(element)
    }

    fn apply_property(
        &self,
        element: &mut dyn TestElement,
        key: &str,
        value: &Value,
    ) -> Result<(), ScriptParseError> {
        let property = match value {
            Value::String(text) => {
                self.set_replaced(element, key, text);
                return Ok(());
            }
            Value::Object(fields) if fields.contains_key("class") => {
                Property::element(self.build_element(fields)?)
            }
            Value::Object(_) => Property::object(value.clone()),
            Value::Array(items) => {
                let mut properties = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Object(fields) if fields.contains_key("class") => {
                            properties.push(Property::element(self.build_element(fields)?));
                        }
                        Value::String(text) => properties.push(self.replaced(key, text)),
                        other => properties.push(Property::object(other.clone())),
                    }
                }
                Property::collection(properties)
            }
            Value::Bool(flag) => Property::basic(flag.to_string()),
            Value::Number(number) => Property::basic(number.to_string()),
            Value::Null => Property::null(),
        };
        let _ = element.core_mut().add_property(key, property);
        Ok(())
    }

    /// Compiles a string value, degrading to the raw text when the
    /// expression is malformed.
    fn replaced(&self, key: &str, value: &str) -> Property {
        match compile_property(value, &self.functions) {
            Ok(property) => property,
            Err(err) => {
                warn!(key, %err, "invalid expression, keeping raw text");
                Property::basic(value)
            }
        }
    }

    fn set_replaced(&self, element: &mut dyn TestElement, key: &str, value: &str) {
        let property = self.replaced(key, value);
        let _ = element.core_mut().add_property(key, property);
    }
}

impl Default for ElementRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("TestCollection", || Box::new(TestCollection::default()));
        registry.register("TestWorker", || Box::new(TestWorker::default()));
        registry.register("TeardownWorker", || {
            Box::new(TestWorker::new_teardown("Teardown Worker", 1, 1))
        });
        registry.register("LoopController", || Box::new(LoopController::default()));
        registry.register("IfController", || Box::new(IfController::default()));
        registry.register("ForeachController", || {
            Box::new(ForeachController::default())
        });
        registry.register("RetryController", || Box::new(RetryController::default()));
        registry.register("TransactionController", || {
            Box::new(TransactionController::default())
        });
        registry.register("DebugSampler", || Box::new(DebugSampler::default()));
        registry.register("ConstantTimer", || Box::new(ConstantTimer::default()));
        registry.register("ResponseAssertion", || {
            Box::new(ResponseAssertion::default())
        });
        registry.register("ArgumentsConfig", || Box::new(ArgumentsConfig::default()));
        registry.register("TransactionArguments", || {
            Box::new(TransactionArguments::default())
        });
        registry.register("VariablesPreProcessor", || {
            Box::new(VariablesPreProcessor::default())
        });
        registry.register("RegexExtractPostProcessor", || {
            Box::new(RegexExtractPostProcessor::default())
        });
        registry.register("ResultCollector", || Box::new(ResultCollector::default()));
        registry
    }
}

fn check_fields(fields: &Map<String, Value>) -> Result<(), ScriptParseError> {
    for field in REQUIRED_FIELDS {
        if !fields.contains_key(field) {
            return Err(missing(fields, field));
        }
    }
    Ok(())
}

fn missing(fields: &Map<String, Value>, field: &'static str) -> ScriptParseError {
    let node = fields
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("?");
    ScriptParseError::MissingField {
        node: SmolStr::new(node),
        field,
    }
}
