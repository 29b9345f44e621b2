// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by loadmeter.

use smol_str::SmolStr;
use thiserror::Error;

/// An error that occurred while mutating a test element's property map.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("property key must not be empty")]
pub struct InvalidPropertyError;

/// An error that occurred while compiling a `${…}` expression.
#[derive(Debug, Error)]
pub enum InvalidVariableError {
    /// A function call was not terminated properly.
    #[error("expected `}}` after `{function}` function call in `{expr}`")]
    UnterminatedFunction {
        /// The function reference key being parsed.
        function: SmolStr,
        /// The full source expression.
        expr: String,
    },

    /// A function parameter list ran off the end of the expression.
    #[error("unterminated parameter list in `{expr}`")]
    UnterminatedParams {
        /// The full source expression.
        expr: String,
    },

    /// A function rejected its compiled parameters.
    #[error("invalid function parameters")]
    BadFunction(#[from] FunctionError),
}

/// An error raised by a function implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FunctionError {
    /// The wrong number of arguments was supplied.
    #[error(
        "function `{function}` expects between {min} and {max} parameters, got {actual}"
    )]
    BadArgCount {
        /// The function reference key.
        function: SmolStr,
        /// Minimum accepted parameter count.
        min: usize,
        /// Maximum accepted parameter count.
        max: usize,
        /// The count that was supplied.
        actual: usize,
    },

    /// The function failed while executing.
    #[error("function `{function}` failed: {message}")]
    Execution {
        /// The function reference key.
        function: SmolStr,
        /// A human-readable description of the failure.
        message: String,
    },
}

/// An error that occurred while deserializing a script into a test tree.
#[derive(Debug, Error)]
pub enum ScriptParseError {
    /// The document was not valid JSON.
    #[error("script is not valid JSON")]
    InvalidDocument(#[source] serde_json::Error),

    /// The script contained no enabled nodes.
    #[error("script is empty or every node is disabled")]
    Empty,

    /// The document was not a list of nodes.
    #[error("script must be a list of node objects")]
    NotAList,

    /// A node was not a JSON object.
    #[error("script node must be an object")]
    NotAnObject,

    /// A node was missing one of its required fields.
    #[error("script node `{node}` is missing the `{field}` field")]
    MissingField {
        /// Name of the offending node, or `?` when the node has no name yet.
        node: SmolStr,
        /// The missing field.
        field: &'static str,
    },

    /// A node referenced a class that is not registered.
    #[error("unknown element class `{class}`")]
    UnknownClass {
        /// The unresolved class name.
        class: SmolStr,
    },
}

/// A control-flow signal raised from inside a sampler or processor.
///
/// The worker loop catches these and invokes the corresponding stop method
/// on the worker or engine instead of treating them as failures.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StopSignal {
    /// Stop every execution unit of the current worker.
    #[error("stop test worker requested")]
    StopWorker,

    /// Ask the engine to stop all workers gracefully.
    #[error("stop test requested")]
    StopTest,

    /// Ask the engine to kill all workers immediately.
    #[error("immediate stop requested")]
    StopTestNow,

    /// The user interrupted the run.
    #[error("user interrupted")]
    UserInterrupted,
}

/// An error produced by a sampler invocation.
#[derive(Debug, Error)]
pub enum SamplerError {
    /// The sampler failed; the message becomes the failed result's response
    /// data.
    #[error("sampler failed: {0}")]
    Failed(String),

    /// A control-flow signal to stop the worker, test, or run.
    #[error(transparent)]
    Stop(#[from] StopSignal),
}

/// An error produced by a pre- or post-processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The processor failed. Logged; the worker carries on.
    #[error("processor failed: {0}")]
    Failed(String),

    /// A control-flow signal to stop the worker, test, or run.
    #[error(transparent)]
    Stop(#[from] StopSignal),
}

/// An error raised while *executing* an assertion, as opposed to the
/// assertion predicate evaluating to false.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("assertion failed to execute: {message}")]
pub struct AssertionError {
    /// A human-readable description of the failure.
    pub message: String,
}

/// An error inside the controller state machine. These propagate out of the
/// execution unit and terminate it.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A transaction sampler had no concrete sub-sampler to resolve.
    #[error("transaction `{transaction}` yielded no sub-sampler")]
    MissingSubSampler {
        /// Name of the transaction controller.
        transaction: SmolStr,
    },
}

/// An error produced by the engine front-end.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The test tree has no collection at its root.
    #[error("test tree has no collection root")]
    MissingCollection,

    /// The tokio runtime for the blocking entry point could not be created.
    #[error("failed to create tokio runtime")]
    RuntimeCreate(#[source] std::io::Error),
}
