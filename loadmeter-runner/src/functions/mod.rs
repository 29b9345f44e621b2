// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `${…}` expression language.
//!
//! A property value string is a sequence of literal characters interleaved
//! with placeholders: `${name}` resolves a variable (worker variables
//! first, then engine properties, then the literal text), and
//! `${__func(a,b)}` calls a registered function whose arguments are
//! themselves compound variables. Compilation happens once, at load time;
//! evaluation happens per sample while the owning element is running.

pub mod builtin;
mod parser;

pub use parser::compile_string;

use crate::{
    elements::Property,
    errors::{FunctionError, InvalidVariableError},
    worker::ThreadContext,
};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::fmt;
use tracing::{debug, error};

/// A runtime-evaluated function reachable from `${__name(…)}` expressions.
pub trait Function: Send + fmt::Debug {
    /// The reference key the function is addressed by, including the `__`
    /// prefix.
    fn reference_key(&self) -> &'static str;

    /// Binds the compiled argument list, validating its arity.
    fn set_parameters(&mut self, params: Vec<CompoundVariable>) -> Result<(), FunctionError>;

    /// Evaluates the function.
    fn execute(&mut self, ctx: &ThreadContext) -> Result<String, FunctionError>;

    /// Deep-copies the function with its bound parameters.
    fn boxed_clone(&self) -> Box<dyn Function>;
}

/// Validates an exact parameter count.
pub fn check_parameter_count(
    function: &'static str,
    params: &[CompoundVariable],
    expected: usize,
) -> Result<(), FunctionError> {
    check_parameter_range(function, params, expected, expected)
}

/// Validates a `min..=max` parameter count.
pub fn check_parameter_range(
    function: &'static str,
    params: &[CompoundVariable],
    min: usize,
    max: usize,
) -> Result<(), FunctionError> {
    if params.len() < min || params.len() > max {
        return Err(FunctionError::BadArgCount {
            function: SmolStr::new_static(function),
            min,
            max,
            actual: params.len(),
        });
    }
    Ok(())
}

/// Factory registry mapping function reference keys to constructors.
///
/// The registry is an explicit value threaded through the script loader
/// and parser; there is no process-global function table.
#[derive(Clone)]
pub struct FunctionRegistry {
    factories: IndexMap<SmolStr, fn() -> Box<dyn Function>>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            factories: IndexMap::new(),
        }
    }

    /// Registers a function constructor under the key the constructed
    /// function reports.
    pub fn register(&mut self, factory: fn() -> Box<dyn Function>) {
        let key = factory().reference_key();
        self.factories.insert(SmolStr::new_static(key), factory);
    }

    /// Instantiates the function registered under `key`.
    pub fn instantiate(&self, key: &str) -> Option<Box<dyn Function>> {
        self.factories.get(key).map(|factory| factory())
    }

    /// Whether `key` names a registered function.
    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(builtin::YearFunction::boxed);
        registry.register(builtin::SecondFunction::boxed);
        registry.register(builtin::RandomFunction::boxed);
        registry.register(builtin::Base64Function::boxed);
        registry.register(builtin::UuidFunction::boxed);
        registry
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A `${name}` reference, resolved at evaluation time against the worker
/// variables, then the engine properties, then falling back to the literal
/// placeholder text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleVariable {
    name: SmolStr,
}

impl SimpleVariable {
    /// Creates a reference to `name`.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self { name: name.into() }
    }

    /// The referenced name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves the reference.
    pub fn value(&self, ctx: &ThreadContext) -> String {
        if let Some(value) = ctx.variables.get_str(&self.name) {
            return value;
        }
        if let Some(value) = ctx.properties().get(self.name.as_str()) {
            return value.clone();
        }
        debug!(name = %self.name, "variable not found, returning placeholder text");
        format!("${{{}}}", self.name)
    }
}

/// One compiled piece of a compound variable.
#[derive(Debug)]
pub enum Piece {
    /// Literal text.
    Literal(String),
    /// A `${name}` reference.
    Variable(SimpleVariable),
    /// A `${__func(…)}` call with bound parameters.
    Function(Box<dyn Function>),
}

impl Clone for Piece {
    fn clone(&self) -> Self {
        match self {
            Piece::Literal(s) => Piece::Literal(s.clone()),
            Piece::Variable(v) => Piece::Variable(v.clone()),
            Piece::Function(f) => Piece::Function(f.boxed_clone()),
        }
    }
}

/// A compiled `${…}` expression: an ordered list of pieces.
///
/// An expression is *dynamic* iff it contains a variable or function
/// piece; a purely literal expression caches its result permanently after
/// the first evaluation.
#[derive(Clone, Debug)]
pub struct CompoundVariable {
    raw: String,
    pieces: Vec<Piece>,
    has_function: bool,
    dynamic: bool,
    permanent: Option<String>,
}

impl CompoundVariable {
    /// Compiles `source` against `registry`.
    pub fn compile(
        source: &str,
        registry: &FunctionRegistry,
    ) -> Result<Self, InvalidVariableError> {
        let pieces = compile_string(source, registry)?;
        let has_function =
            pieces.len() > 1 || !matches!(pieces.first(), Some(Piece::Literal(_)) | None);
        let dynamic = pieces
            .iter()
            .any(|p| matches!(p, Piece::Variable(_) | Piece::Function(_)));
        Ok(Self {
            raw: source.to_string(),
            pieces,
            has_function,
            dynamic,
            permanent: None,
        })
    }

    /// The raw source text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the expression contains any placeholder.
    pub fn has_function(&self) -> bool {
        self.has_function
    }

    /// Whether the expression must be re-evaluated per use.
    pub fn dynamic(&self) -> bool {
        self.dynamic
    }

    /// The compiled pieces.
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Evaluates the expression. Function-internal errors render inline as
    /// the stringified error message.
    pub fn execute(&mut self, ctx: &ThreadContext) -> String {
        if !self.dynamic {
            if let Some(cached) = &self.permanent {
                return cached.clone();
            }
        }
        if self.pieces.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        for piece in &mut self.pieces {
            match piece {
                Piece::Literal(s) => out.push_str(s),
                Piece::Variable(v) => out.push_str(&v.value(ctx)),
                Piece::Function(f) => match f.execute(ctx) {
                    Ok(result) => {
                        debug!(function = f.reference_key(), %result, "function executed");
                        out.push_str(&result);
                    }
                    Err(err) => {
                        error!(function = f.reference_key(), %err, "function failed");
                        out.push_str(&err.to_string());
                    }
                },
            }
        }

        if !self.dynamic {
            self.permanent = Some(out.clone());
        }
        out
    }
}

/// Compiles a property value: strings containing placeholders become
/// function properties, plain strings become scalar properties.
pub fn compile_property(
    source: &str,
    registry: &FunctionRegistry,
) -> Result<Property, InvalidVariableError> {
    let compiled = CompoundVariable::compile(source, registry)?;
    if compiled.has_function() {
        Ok(Property::function(compiled))
    } else {
        Ok(Property::basic(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FunctionError, InvalidVariableError};
    use chrono::{Datelike, Local};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Arc;

    /// Joins its evaluated arguments with `-`; test-only.
    #[derive(Debug, Default)]
    struct JoinFunction {
        params: Vec<CompoundVariable>,
    }

    impl JoinFunction {
        fn boxed() -> Box<dyn Function> {
            Box::new(Self::default())
        }
    }

    impl Function for JoinFunction {
        fn reference_key(&self) -> &'static str {
            "__join"
        }

        fn set_parameters(&mut self, params: Vec<CompoundVariable>) -> Result<(), FunctionError> {
            check_parameter_range("__join", &params, 1, 8)?;
            self.params = params;
            Ok(())
        }

        fn execute(&mut self, ctx: &ThreadContext) -> Result<String, FunctionError> {
            let parts: Vec<String> = self.params.iter_mut().map(|p| p.execute(ctx)).collect();
            Ok(parts.join("-"))
        }

        fn boxed_clone(&self) -> Box<dyn Function> {
            Box::new(Self {
                params: self.params.clone(),
            })
        }
    }

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::default();
        registry.register(JoinFunction::boxed);
        registry
    }

    fn ctx_with_var(name: &str, value: &str) -> ThreadContext {
        let mut ctx = ThreadContext::detached();
        ctx.variables.put(name, value);
        ctx
    }

    #[test]
    fn literal_expression_is_static_and_cached() {
        let mut compiled = CompoundVariable::compile("plain text", &registry()).unwrap();
        assert!(!compiled.dynamic());
        assert!(!compiled.has_function());
        let ctx = ThreadContext::detached();
        assert_eq!(compiled.execute(&ctx), "plain text");
        assert_eq!(compiled.execute(&ctx), "plain text");
    }

    #[test]
    fn variables_resolve_before_properties_before_literal() {
        let mut compiled = CompoundVariable::compile("${v}", &registry()).unwrap();

        assert_eq!(compiled.execute(&ctx_with_var("v", "from-vars")), "from-vars");

        let mut properties = indexmap::IndexMap::new();
        properties.insert(smol_str::SmolStr::new("v"), "from-props".to_string());
        let ctx = ThreadContext::new(Arc::new(properties));
        assert_eq!(compiled.execute(&ctx), "from-props");

        assert_eq!(compiled.execute(&ThreadContext::detached()), "${v}");
    }

    #[test]
    fn nested_function_calls_compile_to_one_function_piece() {
        let mut compiled =
            CompoundVariable::compile("${__join(${__join(1,2)},${v})}", &registry()).unwrap();
        assert_eq!(compiled.pieces().len(), 1);
        assert!(matches!(compiled.pieces()[0], Piece::Function(_)));
        assert!(compiled.dynamic());

        assert_eq!(compiled.execute(&ctx_with_var("v", "x")), "1-2-x");
        assert_eq!(compiled.execute(&ThreadContext::detached()), "1-2-${v}");
    }

    #[test]
    fn unknown_function_decays_to_a_simple_variable() {
        let mut compiled = CompoundVariable::compile("${__missing}", &registry()).unwrap();
        assert_eq!(compiled.execute(&ThreadContext::detached()), "${__missing}");

        let mut with_args = CompoundVariable::compile("${__nope(1)}", &registry()).unwrap();
        assert_eq!(with_args.execute(&ThreadContext::detached()), "${__nope(1)}");
    }

    #[test]
    fn unterminated_calls_are_invalid() {
        assert!(matches!(
            CompoundVariable::compile("${__join(1,2)", &registry()),
            Err(InvalidVariableError::UnterminatedFunction { .. })
        ));
        assert!(matches!(
            CompoundVariable::compile("${__join(1,2}", &registry()),
            Err(InvalidVariableError::UnterminatedParams { .. })
        ));
    }

    #[test]
    fn escaped_placeholders_stay_literal() {
        let mut compiled = CompoundVariable::compile(r"\${v}", &registry()).unwrap();
        assert!(!compiled.has_function());
        assert_eq!(compiled.execute(&ThreadContext::detached()), "${v}");
    }

    #[test]
    fn escaped_commas_do_not_split_arguments() {
        let mut compiled = CompoundVariable::compile(r"${__join(a\,b,c)}", &registry()).unwrap();
        assert_eq!(compiled.execute(&ThreadContext::detached()), "a,b-c");
    }

    #[test]
    fn parentheses_inside_arguments_balance() {
        let mut compiled = CompoundVariable::compile("${__join((1,2),3)}", &registry()).unwrap();
        assert_eq!(compiled.execute(&ThreadContext::detached()), "(1,2)-3");
    }

    #[test]
    fn argument_counts_are_validated_at_compile_time() {
        assert!(matches!(
            CompoundVariable::compile("${__uuid(1)}", &registry()),
            Err(InvalidVariableError::BadFunction(
                FunctionError::BadArgCount { .. }
            ))
        ));
    }

    #[test]
    fn year_function_applies_its_offset() {
        let mut compiled = CompoundVariable::compile("${__year(1)}", &registry()).unwrap();
        let expected = (Local::now().year() + 1).to_string();
        assert_eq!(compiled.execute(&ThreadContext::detached()), expected);
    }

    #[test]
    fn compile_property_picks_the_variant() {
        let registry = registry();
        let plain = compile_property("hello", &registry).unwrap();
        assert!(!matches!(
            plain.value(),
            crate::elements::PropValue::Function(_)
        ));
        let dynamic = compile_property("a ${v} b", &registry).unwrap();
        assert!(matches!(
            dynamic.value(),
            crate::elements::PropValue::Function(_)
        ));
    }

    proptest! {
        #[test]
        fn plain_strings_compile_to_themselves(source in "[a-zA-Z0-9 .:_-]{0,40}") {
            let mut compiled = CompoundVariable::compile(&source, &registry()).unwrap();
            prop_assert_eq!(compiled.execute(&ThreadContext::detached()), source);
        }
    }
}
