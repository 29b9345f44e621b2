// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The engine and the per-unit execution loop.
//!
//! [`Engine`] validates the tree, spawns each worker's execution units
//! over per-unit clones of the worker subtree, and joins them back in;
//! the executor drives the sample loop inside every unit.

mod executor;
mod imp;

pub use executor::LAST_SAMPLE_OK;
pub use imp::{Engine, EngineHandle, RunStats, WorkerHandle};
