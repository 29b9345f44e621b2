// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine configuration.

use indexmap::IndexMap;
use serde::Deserialize;
use smol_str::SmolStr;
use std::time::Duration;

/// Configuration the engine is constructed with. The core reads no
/// environment variables or files itself.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long to wait for a worker's execution units to stop after a
    /// graceful stop before aborting them.
    #[serde(with = "humantime_serde")]
    pub wait_to_die: Duration,

    /// Engine-wide properties, visible to `${…}` expressions in every
    /// worker. Frozen when the run starts.
    pub properties: IndexMap<SmolStr, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wait_to_die: Duration::from_secs(5),
            properties: IndexMap::new(),
        }
    }
}
