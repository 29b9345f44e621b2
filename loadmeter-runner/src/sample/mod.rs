// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Samplers and their results.

use crate::{elements::TestElement, errors::SamplerError, worker::ThreadContext};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// An element that performs an atomic action producing a [`SampleResult`].
///
/// Sampling is the unit's main suspension point, so the capability is
/// async; `BoxFuture` keeps the trait dyn-compatible.
pub trait Sampler: TestElement {
    /// Performs the action.
    fn sample<'a>(
        &'a mut self,
        ctx: &'a mut ThreadContext,
    ) -> BoxFuture<'a, Result<SampleResult, SamplerError>>;
}

/// The outcome of evaluating an assertion predicate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssertionOutcome {
    /// The predicate evaluated to false.
    pub failure: bool,
    /// Human-readable detail, set on failure.
    pub message: String,
}

impl AssertionOutcome {
    /// A passing outcome.
    pub fn passed() -> Self {
        Self::default()
    }

    /// A failing outcome with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            failure: true,
            message: message.into(),
        }
    }
}

/// The recorded outcome of one assertion against one sample.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    /// Name of the assertion element.
    pub name: SmolStr,
    /// The predicate evaluated to false.
    pub failure: bool,
    /// The assertion itself failed to execute.
    pub error: bool,
    /// Human-readable detail.
    pub message: String,
}

impl AssertionResult {
    /// A passing result for the named assertion.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// The result of one sampler invocation.
///
/// Serialized field names are camelCase; timestamps are UTC epoch
/// milliseconds and `elapsedTime` is in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleResult {
    /// Name of the sampler that produced this result.
    pub sampler_name: SmolStr,
    /// Description of the sampler.
    pub sampler_desc: SmolStr,

    /// Request target.
    pub request_url: String,
    /// Request payload.
    pub request_data: String,
    /// Request headers.
    pub request_headers: IndexMap<SmolStr, String>,

    /// Response code.
    pub response_code: String,
    /// Human-readable response or failure message.
    pub response_message: String,
    /// Response payload (or a failure trace).
    pub response_data: String,
    /// Response headers.
    pub response_headers: IndexMap<SmolStr, String>,

    /// When sampling started.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    /// When sampling ended.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub end_time: Option<DateTime<Utc>>,
    /// Elapsed milliseconds.
    pub elapsed_time: u64,
    /// Milliseconds spent paused rather than sampling.
    pub idle_time: u64,

    /// Request bytes.
    pub request_size: u64,
    /// Response bytes.
    pub response_size: u64,

    /// Whether the sample (and all its assertions) succeeded.
    pub success: bool,
    /// The sample was produced during a retry attempt.
    pub retrying: bool,

    /// Ask the worker's peers to stop.
    pub stop_worker: bool,
    /// Ask the engine to stop all workers gracefully.
    pub stop_test: bool,
    /// Ask the engine to kill all workers.
    pub stop_now: bool,

    /// Assertion outcomes attached to this sample.
    pub assertions: Vec<AssertionResult>,
    /// Sub-results aggregated into this result (transactions).
    pub subresults: Vec<SampleResult>,
}

impl SampleResult {
    /// Creates an empty, successful result for the named sampler.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            sampler_name: name.into(),
            sampler_desc: SmolStr::default(),
            request_url: String::new(),
            request_data: String::new(),
            request_headers: IndexMap::new(),
            response_code: String::new(),
            response_message: String::new(),
            response_data: String::new(),
            response_headers: IndexMap::new(),
            start_time: None,
            end_time: None,
            elapsed_time: 0,
            idle_time: 0,
            request_size: 0,
            response_size: 0,
            success: true,
            retrying: false,
            stop_worker: false,
            stop_test: false,
            stop_now: false,
            assertions: Vec::new(),
            subresults: Vec::new(),
        }
    }

    /// Whether sampling has started.
    pub fn started(&self) -> bool {
        self.start_time.is_some()
    }

    /// Stamps the start time.
    pub fn sample_start(&mut self) {
        self.start_time = Some(Utc::now());
    }

    /// Stamps the end time and computes the elapsed milliseconds.
    pub fn sample_end(&mut self) {
        let end = Utc::now();
        self.end_time = Some(end);
        if let Some(start) = self.start_time {
            self.elapsed_time = (end - start).num_milliseconds().max(0) as u64;
        }
    }

    /// Adds `subresult`, extending the end time to cover it and
    /// accumulating its byte counts.
    pub fn add_subresult(&mut self, subresult: SampleResult) {
        self.end_time = match (self.end_time, subresult.end_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.request_size += subresult.request_size;
        self.response_size += subresult.response_size;
        self.subresults.push(subresult);
    }
}
