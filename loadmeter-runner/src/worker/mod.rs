// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workers, per-unit context, and the test compiler.

mod collection;
pub(crate) mod compiler;
mod context;
mod package;
#[allow(clippy::module_inception)]
mod worker;

pub use collection::TestCollection;
pub use compiler::{
    ComponentFilter, ComponentMatch, RunningStrategy, ScopeStage, TestCompiler,
    SAMPLER_STRATEGY_KEY,
};
pub use context::{EngineProperties, ThreadContext, Variables};
pub use package::SamplePackage;
pub use worker::{OnSampleError, TestWorker};
