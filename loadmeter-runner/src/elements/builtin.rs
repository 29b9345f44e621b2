// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in elements: a debug sampler, a constant timer, a response
//! assertion, argument configs, simple processors, and an in-process
//! result collector.
//!
//! Concrete protocol samplers (HTTP, SQL) and external sinks live
//! outside the core; these implementations are enough to exercise every
//! capability and to stand in for those collaborators in tests.

use crate::{
    elements::{
        interface::{
            Assertion, CollectionListener, PostProcessor, PreProcessor, SampleListener, Timer,
            TransactionListener, WorkerListener,
        },
        Caps, ElementCore, PropValue, Property, TestElement,
    },
    errors::{AssertionError, ProcessorError, SamplerError},
    impl_test_element,
    sample::{AssertionOutcome, SampleResult, Sampler},
    tree::lock,
    worker::ThreadContext,
};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use regex::Regex;
use smol_str::SmolStr;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// A sampler producing a configurable result, with an optional forced
/// failure pattern. Stands in for protocol samplers in tests and demos.
#[derive(Clone, Debug)]
pub struct DebugSampler {
    core: ElementCore,
    calls: u64,
}

impl DebugSampler {
    /// Property key for the response code.
    pub const RESPONSE_CODE: &'static str = "DebugSampler__response_code";
    /// Property key for the response data.
    pub const RESPONSE_DATA: &'static str = "DebugSampler__response_data";
    /// Property key forcing every sample to fail.
    pub const FAIL: &'static str = "DebugSampler__fail";
    /// Property key failing only the first N samples of each unit.
    pub const FAIL_TIMES: &'static str = "DebugSampler__fail_times";

    /// Creates a debug sampler.
    pub fn new(name: &str) -> Self {
        Self {
            core: ElementCore::named(name),
            calls: 0,
        }
    }

    /// Sets the response data (may contain `${…}` once compiled by the
    /// loader; literal here).
    pub fn with_response_data(mut self, data: &str) -> Self {
        self.core.put_basic(Self::RESPONSE_DATA, data);
        self
    }

    /// Makes every sample fail.
    pub fn failing(mut self) -> Self {
        self.core.put_basic(Self::FAIL, "true");
        self
    }

    /// Makes the first `times` samples of each unit fail.
    pub fn failing_times(mut self, times: u64) -> Self {
        self.core.put_basic(Self::FAIL_TIMES, times.to_string());
        self
    }
}

impl Default for DebugSampler {
    fn default() -> Self {
        Self::new("Debug Sampler")
    }
}

impl Sampler for DebugSampler {
    fn sample<'a>(
        &'a mut self,
        ctx: &'a mut ThreadContext,
    ) -> BoxFuture<'a, Result<SampleResult, SamplerError>> {
        Box::pin(async move {
            self.calls += 1;
            let mut result = SampleResult::new(self.name());
            result.sampler_desc = self.desc();
            result.sample_start();
            result.request_url = format!("debug://{}", result.sampler_name);

            let fail_always = self.core.prop_bool(Self::FAIL, ctx);
            let fail_times = self.core.prop_int(Self::FAIL_TIMES, ctx).max(0) as u64;
            let failing = fail_always || self.calls <= fail_times;

            result.response_data = self.core.prop_str(Self::RESPONSE_DATA, ctx);
            result.response_size = result.response_data.len() as u64;

            let code = self.core.prop_str(Self::RESPONSE_CODE, ctx);
            result.response_code = if !code.is_empty() {
                code
            } else if failing {
                "500".to_string()
            } else {
                "200".to_string()
            };
            result.success = !failing;
            result.response_message = if failing {
                "forced failure".to_string()
            } else {
                "OK".to_string()
            };
            result.sample_end();
            Ok(result)
        })
    }
}

impl_test_element!(DebugSampler {
    caps: Caps::SAMPLER,
    accessors: [sampler],
});

/// A timer adding a fixed delay before each sampler in scope.
#[derive(Clone, Debug)]
pub struct ConstantTimer {
    core: ElementCore,
}

impl ConstantTimer {
    /// Property key for the delay in milliseconds.
    pub const DELAY: &'static str = "ConstantTimer__delay";

    /// Creates a timer with the given delay.
    pub fn new(name: &str, delay: Duration) -> Self {
        let mut timer = Self {
            core: ElementCore::named(name),
        };
        timer
            .core
            .put_basic(Self::DELAY, delay.as_millis().to_string());
        timer
    }
}

impl Default for ConstantTimer {
    fn default() -> Self {
        Self::new("Constant Timer", Duration::ZERO)
    }
}

impl Timer for ConstantTimer {
    fn delay(&mut self, ctx: &ThreadContext) -> Duration {
        Duration::from_millis(self.core.prop_int(Self::DELAY, ctx).max(0) as u64)
    }
}

impl_test_element!(ConstantTimer {
    caps: Caps::TIMER,
    accessors: [timer],
});

/// Asserts on a sample's response data with a contains/equals rule.
#[derive(Clone, Debug)]
pub struct ResponseAssertion {
    core: ElementCore,
}

impl ResponseAssertion {
    /// Property key for the expected text.
    pub const EXPECTED: &'static str = "ResponseAssertion__expected";
    /// Property key for the match rule (`CONTAINS` or `EQUALS`).
    pub const RULE: &'static str = "ResponseAssertion__rule";
    /// Property key inverting the match.
    pub const NEGATE: &'static str = "ResponseAssertion__negate";

    /// Creates a contains-assertion on the response data.
    pub fn contains(name: &str, expected: &str) -> Self {
        let mut assertion = Self {
            core: ElementCore::named(name),
        };
        assertion.core.put_basic(Self::EXPECTED, expected);
        assertion.core.put_basic(Self::RULE, "CONTAINS");
        assertion
    }

    /// Creates an equals-assertion on the response data.
    pub fn equals(name: &str, expected: &str) -> Self {
        let mut assertion = Self::contains(name, expected);
        assertion.core.put_basic(Self::RULE, "EQUALS");
        assertion
    }

    /// Inverts the match.
    pub fn negated(mut self) -> Self {
        self.core.put_basic(Self::NEGATE, "true");
        self
    }
}

impl Default for ResponseAssertion {
    fn default() -> Self {
        Self::contains("Response Assertion", "")
    }
}

impl Assertion for ResponseAssertion {
    fn assert_result(
        &mut self,
        result: &SampleResult,
        ctx: &mut ThreadContext,
    ) -> Result<AssertionOutcome, AssertionError> {
        let expected = self.core.prop_str(Self::EXPECTED, ctx);
        let rule = self.core.prop_str(Self::RULE, ctx);
        let negate = self.core.prop_bool(Self::NEGATE, ctx);
        let actual = &result.response_data;

        let matched = match rule.trim() {
            "" | "CONTAINS" => actual.contains(&expected),
            "EQUALS" => actual == &expected,
            other => {
                return Err(AssertionError {
                    message: format!("unknown match rule `{other}`"),
                });
            }
        };

        if matched != negate {
            Ok(AssertionOutcome::passed())
        } else {
            Ok(AssertionOutcome::failed(format!(
                "expected response data {}to {} `{expected}`, got `{actual}`",
                if negate { "not " } else { "" },
                if rule.trim() == "EQUALS" { "equal" } else { "contain" },
            )))
        }
    }
}

impl_test_element!(ResponseAssertion {
    caps: Caps::ASSERTION,
    accessors: [assertion],
});

/// Key/value config merged into every sampler in scope.
#[derive(Clone, Debug)]
pub struct ArgumentsConfig {
    core: ElementCore,
    no_merge: bool,
}

impl ArgumentsConfig {
    /// Creates an empty arguments config.
    pub fn new(name: &str) -> Self {
        Self {
            core: ElementCore::named(name),
            no_merge: false,
        }
    }

    /// Adds an argument.
    pub fn with_argument(mut self, key: &str, value: &str) -> Self {
        self.core.put_basic(key, value);
        self
    }

    /// Adds a pre-compiled property (e.g. a function property).
    pub fn with_property(mut self, key: &str, property: Property) -> Self {
        let _ = self.core.add_property(key, property);
        self
    }

    /// Marks the config as held in scope but never merged into
    /// samplers.
    pub fn no_merge(mut self) -> Self {
        self.no_merge = true;
        self
    }
}

impl Default for ArgumentsConfig {
    fn default() -> Self {
        Self::new("Arguments")
    }
}

// Implemented by hand: the capability set depends on the no-merge flag.
impl TestElement for ArgumentsConfig {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ElementCore {
        &mut self.core
    }

    fn caps(&self) -> Caps {
        if self.no_merge {
            Caps::CONFIG | Caps::NO_CONFIG_MERGE
        } else {
            Caps::CONFIG
        }
    }

    fn boxed_clone(&self) -> Box<dyn TestElement> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Key/value config scoped to transactions: excluded from per-sampler
/// packages and merged only through the enclosing transaction.
#[derive(Clone, Debug)]
pub struct TransactionArguments {
    core: ElementCore,
}

impl TransactionArguments {
    /// Creates an empty transaction arguments config.
    pub fn new(name: &str) -> Self {
        Self {
            core: ElementCore::named(name),
        }
    }

    /// Adds an argument.
    pub fn with_argument(mut self, key: &str, value: &str) -> Self {
        self.core.put_basic(key, value);
        self
    }
}

impl Default for TransactionArguments {
    fn default() -> Self {
        Self::new("Transaction Arguments")
    }
}

impl_test_element!(TransactionArguments {
    caps: Caps::CONFIG.union(Caps::TRANSACTION_CONFIG),
    accessors: [],
});

/// Pre-processor setting variables before each sample in scope.
#[derive(Clone, Debug)]
pub struct VariablesPreProcessor {
    core: ElementCore,
}

impl VariablesPreProcessor {
    /// Property key for the variable map.
    pub const VARIABLES: &'static str = "VariablesPreProcessor__variables";

    /// Creates an empty variables pre-processor.
    pub fn new(name: &str) -> Self {
        Self {
            core: ElementCore::named(name),
        }
    }

    /// Adds a variable assignment.
    pub fn with_variable(mut self, name: &str, value: Property) -> Self {
        let has_map = matches!(
            self.core.get_property(Self::VARIABLES).map(Property::value),
            Some(PropValue::Map { .. })
        );
        if !has_map {
            let _ = self
                .core
                .add_property(Self::VARIABLES, Property::map(IndexMap::new()));
        }
        if let Some(PropValue::Map { entries, .. }) = self
            .core
            .get_property_mut(Self::VARIABLES)
            .map(Property::value_mut)
        {
            entries.insert(SmolStr::new(name), value);
        }
        self
    }
}

impl Default for VariablesPreProcessor {
    fn default() -> Self {
        Self::new("Variables")
    }
}

impl PreProcessor for VariablesPreProcessor {
    fn process(&mut self, ctx: &mut ThreadContext) -> Result<(), ProcessorError> {
        let assignments: Vec<(SmolStr, String)> = match self
            .core
            .get_property_mut(Self::VARIABLES)
            .map(Property::value_mut)
        {
            Some(PropValue::Map { entries, .. }) => entries
                .iter_mut()
                .map(|(name, value)| (name.clone(), value.as_str(&*ctx)))
                .collect(),
            Some(PropValue::Object { value, .. }) => match value {
                serde_json::Value::Object(entries) => entries
                    .iter()
                    .map(|(name, value)| {
                        let rendered = match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (SmolStr::new(name), rendered)
                    })
                    .collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        for (name, value) in assignments {
            ctx.variables.put(name, value);
        }
        Ok(())
    }
}

impl_test_element!(VariablesPreProcessor {
    caps: Caps::PRE_PROCESSOR,
    accessors: [pre_processor],
});

/// Post-processor extracting a regex capture from the previous response
/// data into a variable.
#[derive(Clone, Debug)]
pub struct RegexExtractPostProcessor {
    core: ElementCore,
}

impl RegexExtractPostProcessor {
    /// Property key for the pattern (first capture group wins).
    pub const PATTERN: &'static str = "RegexExtractPostProcessor__pattern";
    /// Property key for the target variable name.
    pub const VARIABLE: &'static str = "RegexExtractPostProcessor__variable";
    /// Property key for the value used when nothing matches.
    pub const DEFAULT: &'static str = "RegexExtractPostProcessor__default";

    /// Creates an extractor assigning the first capture of `pattern` to
    /// `variable`.
    pub fn new(name: &str, variable: &str, pattern: &str) -> Self {
        let mut processor = Self {
            core: ElementCore::named(name),
        };
        processor.core.put_basic(Self::VARIABLE, variable);
        processor.core.put_basic(Self::PATTERN, pattern);
        processor
    }
}

impl Default for RegexExtractPostProcessor {
    fn default() -> Self {
        Self::new("Regex Extractor", "extracted", "")
    }
}

impl PostProcessor for RegexExtractPostProcessor {
    fn process(&mut self, ctx: &mut ThreadContext) -> Result<(), ProcessorError> {
        let pattern = self.core.prop_str(Self::PATTERN, ctx);
        let variable = self.core.prop_str(Self::VARIABLE, ctx);
        if pattern.is_empty() || variable.is_empty() {
            return Ok(());
        }
        let regex = Regex::new(&pattern)
            .map_err(|err| ProcessorError::Failed(format!("invalid pattern `{pattern}`: {err}")))?;

        let captured = {
            let Some(previous) = ctx.previous_result() else {
                return Ok(());
            };
            regex
                .captures(&previous.response_data)
                .and_then(|captures| captures.get(1).or_else(|| captures.get(0)))
                .map(|capture| capture.as_str().to_string())
        };

        match captured {
            Some(value) => ctx.variables.put(variable, value),
            None => {
                let default = self.core.prop_str(Self::DEFAULT, ctx);
                if !default.is_empty() {
                    ctx.variables.put(variable, default);
                } else {
                    warn!(pattern = %pattern, "extractor matched nothing");
                }
            }
        }
        Ok(())
    }
}

impl_test_element!(RegexExtractPostProcessor {
    caps: Caps::POST_PROCESSOR,
    accessors: [post_processor],
});

/// An event observed by a [`ResultCollector`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectorEvent {
    /// The collection run started.
    CollectionStarted,
    /// The collection run ended.
    CollectionEnded,
    /// An execution unit started.
    WorkerStarted,
    /// An execution unit finished.
    WorkerFinished,
    /// A sampler is about to sample.
    SampleStarted(SmolStr),
    /// A sampler finished sampling.
    SampleEnded(SmolStr),
    /// A finished result was published.
    SampleOccurred(SmolStr),
    /// A transaction opened.
    TransactionStarted,
    /// A transaction closed.
    TransactionEnded,
}

#[derive(Debug, Default)]
struct CollectorState {
    events: Vec<CollectorEvent>,
    results: Vec<SampleResult>,
}

/// In-process result sink: records every event and result into a shared
/// buffer and optionally forwards results over a channel.
///
/// The collector is `NO_THREAD_CLONE`: all execution units share one
/// instance, so its state is internally synchronized.
#[derive(Clone, Debug)]
pub struct ResultCollector {
    core: ElementCore,
    state: Arc<Mutex<CollectorState>>,
    forward: Option<UnboundedSender<SampleResult>>,
}

impl ResultCollector {
    /// Creates a collector.
    pub fn new(name: &str) -> Self {
        Self {
            core: ElementCore::named(name),
            state: Arc::new(Mutex::new(CollectorState::default())),
            forward: None,
        }
    }

    /// Forwards every published result over `sender` as well.
    pub fn with_channel(mut self, sender: UnboundedSender<SampleResult>) -> Self {
        self.forward = Some(sender);
        self
    }

    /// The events observed so far.
    pub fn events(&self) -> Vec<CollectorEvent> {
        lock(&self.state).events.clone()
    }

    /// The results published so far.
    pub fn results(&self) -> Vec<SampleResult> {
        lock(&self.state).results.clone()
    }

    fn push(&self, event: CollectorEvent) {
        lock(&self.state).events.push(event);
    }
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new("Result Collector")
    }
}

impl SampleListener for ResultCollector {
    fn sample_started(&mut self, sampler_name: &str) {
        self.push(CollectorEvent::SampleStarted(SmolStr::new(sampler_name)));
    }

    fn sample_ended(&mut self, result: &SampleResult) {
        self.push(CollectorEvent::SampleEnded(result.sampler_name.clone()));
    }

    fn sample_occurred(&mut self, result: &SampleResult) {
        let mut state = lock(&self.state);
        state
            .events
            .push(CollectorEvent::SampleOccurred(result.sampler_name.clone()));
        state.results.push(result.clone());
        drop(state);
        if let Some(sender) = &self.forward {
            // The receiver may be gone when the run outlives the
            // consumer; drop the result in that case.
            let _ = sender.send(result.clone());
        }
    }
}

impl TransactionListener for ResultCollector {
    fn transaction_started(&mut self) {
        self.push(CollectorEvent::TransactionStarted);
    }

    fn transaction_ended(&mut self) {
        self.push(CollectorEvent::TransactionEnded);
    }
}

impl WorkerListener for ResultCollector {
    fn worker_started(&mut self) {
        self.push(CollectorEvent::WorkerStarted);
    }

    fn worker_finished(&mut self) {
        self.push(CollectorEvent::WorkerFinished);
    }
}

impl CollectionListener for ResultCollector {
    fn collection_started(&mut self) {
        self.push(CollectorEvent::CollectionStarted);
    }

    fn collection_ended(&mut self) {
        self.push(CollectorEvent::CollectionEnded);
    }
}

impl_test_element!(ResultCollector {
    caps: Caps::SAMPLE_LISTENER
        .union(Caps::TRANSACTION_LISTENER)
        .union(Caps::WORKER_LISTENER)
        .union(Caps::COLLECTION_LISTENER)
        .union(Caps::NO_THREAD_CLONE),
    accessors: [
        sample_listener,
        transaction_listener,
        worker_listener,
        collection_listener
    ],
});
