// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core execution engine for loadmeter test plans.
//!
//! loadmeter interprets a declarative tree of test elements (workers,
//! controllers, samplers, processors, assertions, timers, listeners) and
//! drives it across concurrent execution units, producing a stream of
//! sampling results with assertion outcomes.
//!
//! The flow: [`script::ElementRegistry`] deserializes a script into a
//! [`tree::TestTree`]; [`runner::Engine`] clones each worker's subtree per
//! execution unit, compiles a [`worker::SamplePackage`] per sampler with
//! [`worker::TestCompiler`], and runs the sample loop until the worker's
//! root controller reports done. Result sinks plug in as listener
//! elements (see [`elements::interface`]).

pub mod config;
pub mod controls;
pub mod elements;
pub mod errors;
pub mod functions;
pub mod runner;
pub mod sample;
pub mod script;
pub mod tree;
pub mod worker;
