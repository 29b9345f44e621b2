// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-unit execution loop.
//!
//! Each execution unit owns a clone of its worker's subtree, compiles it
//! once, and then repeatedly asks the root controller for the next
//! sampler. Processing a sampler walks its precomputed package: merge
//! configs, run pre-processors, sleep the timers, sample, run
//! post-processors, evaluate assertions, notify listeners, and aggregate
//! into an enclosing transaction.

use crate::{
    controls::{Controller, IterationListenerRef, NextSampler, RetryController, TransactionHandle},
    elements::Caps,
    errors::{ControllerError, ProcessorError, SamplerError, StopSignal},
    runner::imp::{EngineHandle, UnitStats, WorkerHandle},
    sample::{AssertionResult, SampleResult},
    tree::{FindAncestors, NodeId, SearchByCaps, TestTree},
    worker::{
        EngineProperties, OnSampleError, RunningStrategy, SamplePackage, TestCompiler,
        ThreadContext, Variables,
    },
};
use smol_str::SmolStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Variable recording whether the previous sample succeeded.
pub const LAST_SAMPLE_OK: &str = "ExecutionUnit__last_sample_ok";

/// Why the unit's loop ended early.
#[derive(Debug)]
enum UnitStop {
    Signal(StopSignal),
    Controller(ControllerError),
}

impl From<StopSignal> for UnitStop {
    fn from(signal: StopSignal) -> Self {
        UnitStop::Signal(signal)
    }
}

/// One concurrent driver of a worker's cloned subtree.
pub(crate) struct ExecutionUnit {
    tree: TestTree,
    root: NodeId,
    compiler: TestCompiler,
    ctx: ThreadContext,
    worker: WorkerHandle,
    engine: EngineHandle,
    running: bool,
    next_continue: bool,
    stats: UnitStats,
    worker_listeners: Vec<NodeId>,
}

impl ExecutionUnit {
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn new(
        tree: TestTree,
        worker: WorkerHandle,
        engine: EngineHandle,
        properties: EngineProperties,
        base_variables: Variables,
        thread_number: u32,
        thread_name: String,
        strategy: RunningStrategy,
    ) -> Self {
        let root = tree
            .roots()
            .first()
            .copied()
            .expect("unit tree is rooted at the worker element");
        let compiler = TestCompiler::new(tree.structure().clone(), strategy);
        let mut ctx = ThreadContext::new(properties);
        ctx.variables.update(&base_variables);
        ctx.set_engine(engine.clone());
        ctx.set_worker(worker.clone());
        ctx.set_thread_number(thread_number);
        ctx.set_thread_name(thread_name);
        Self {
            tree,
            root,
            compiler,
            ctx,
            worker,
            engine,
            running: true,
            next_continue: true,
            stats: UnitStats::default(),
            worker_listeners: Vec::new(),
        }
    }

    /// Runs the unit to completion, returning its statistics.
    pub(crate) async fn run(mut self) -> UnitStats {
        self.init_run();
        match self.run_loop().await {
            Ok(()) => {}
            Err(UnitStop::Signal(signal)) => {
                debug!(unit = %self.ctx.thread_name(), %signal, "caught stop signal");
                self.apply_stop_signal(signal);
            }
            Err(UnitStop::Controller(err)) => {
                error!(
                    unit = %self.ctx.thread_name(),
                    %err,
                    "controller error, terminating execution unit"
                );
            }
        }
        info!(unit = %self.ctx.thread_name(), "execution unit finished");
        self.notify_worker_listeners(false);
        self.ctx.clear();
        self.stats
    }

    /// Compiles the cloned tree, initializes the root controller, and
    /// fires the start events.
    fn init_run(&mut self) {
        let mut worker_listeners = SearchByCaps::new(Caps::WORKER_LISTENER);
        self.tree.traverse(&mut worker_listeners);
        self.worker_listeners = worker_listeners.results().to_vec();

        let mut iteration_listeners = SearchByCaps::new(Caps::TEST_ITERATION_LISTENER);
        self.tree.traverse(&mut iteration_listeners);
        self.ctx
            .set_test_iteration_listeners(iteration_listeners.results().to_vec());

        self.ctx.variables.put(LAST_SAMPLE_OK, true);

        debug!(unit = %self.ctx.thread_name(), "compiling worker tree");
        self.tree.traverse(&mut self.compiler);

        let Self {
            tree, ctx, root, ..
        } = self;
        tree.with_taken(*root, |el, tree| {
            let controller = el
                .as_controller_mut()
                .expect("worker root is a controller");
            controller.initialize(tree, ctx);
            controller.add_iteration_listener(IterationListenerRef::WorkerHook);
        });

        self.notify_worker_listeners(true);
    }

    async fn run_loop(&mut self) -> Result<(), UnitStop> {
        while self.keep_running() {
            let mut sampler = self.controller_next()?;
            while self.keep_running() && sampler.is_some() {
                let current = sampler.take().expect("checked is_some");
                debug!(unit = %self.ctx.thread_name(), "processing next sampler");
                self.process_sampler(current.clone(), None).await?;

                let last_ok = self.ctx.variables.get_bool(LAST_SAMPLE_OK);
                let on_continue = self.worker.on_sample_error() == OnSampleError::Continue;
                if !self.next_continue || (!last_ok && on_continue) {
                    self.control_loop_by_logical_action(current);
                    self.next_continue = true;
                } else {
                    sampler = self.controller_next()?;
                }
            }
            if self.root_done() {
                self.running = false;
                debug!(unit = %self.ctx.thread_name(), "root controller done");
            }
        }
        Ok(())
    }

    fn keep_running(&self) -> bool {
        self.running && self.worker.is_running() && !self.engine.is_killed()
    }

    fn controller_next(&mut self) -> Result<Option<NextSampler>, UnitStop> {
        let Self {
            tree, ctx, root, ..
        } = self;
        tree.with_taken(*root, |el, tree| {
            el.as_controller_mut()
                .expect("worker root is a controller")
                .next(tree, ctx)
        })
        .map_err(UnitStop::Controller)
    }

    fn root_done(&self) -> bool {
        self.tree.with_node(self.root, |el| {
            el.as_controller().map(|c| c.done()).unwrap_or(true)
        })
    }

    /// Processes one scheduled sampler. Transactions recurse into their
    /// sub-sampler and return the composite result once the transaction
    /// completes.
    async fn process_sampler(
        &mut self,
        current: NextSampler,
        parent: Option<TransactionHandle>,
    ) -> Result<Option<SampleResult>, UnitStop> {
        let mut transaction_result = None;
        let mut trans_handle = None;
        let mut trans_package = None;
        let mut current = Some(current);

        if let Some(NextSampler::Transaction(handle)) = current.clone() {
            trans_handle = Some(handle.clone());
            let Some(package) = self
                .compiler
                .transaction_package(handle.controller())
                .cloned()
            else {
                warn!(transaction = %handle.name(), "no transaction package, skipping");
                return Ok(None);
            };

            if handle.is_done() {
                transaction_result =
                    Some(self.end_transaction(&handle, &package, parent.as_ref()));
                current = None;
            } else {
                if handle.calls() == 0 {
                    debug!(transaction = %handle.name(), "transaction started");
                    self.notify_transaction_listeners(&package, true);
                }
                let previous = NextSampler::Transaction(handle.clone());
                current = handle.sub_sampler();
                if let Some(NextSampler::Transaction(inner)) = current.clone() {
                    // A nested transaction: recurse, then fold its result
                    // into this one.
                    let result = Box::pin(
                        self.process_sampler(
                            NextSampler::Transaction(inner),
                            Some(handle.clone()),
                        ),
                    )
                    .await?;
                    self.ctx.set_current_sampler(previous);
                    current = None;
                    if let Some(result) = result {
                        handle.add_sub_sampler_result(&result);
                    }
                }
            }
            trans_package = Some(package);
        }

        if let Some(NextSampler::Node(id)) = current {
            self.execute_sample_package(id, trans_handle.as_ref(), trans_package.as_ref())
                .await?;
        }

        // The unit stopped mid-transaction: close the transaction out so
        // its result is still reported.
        if !self.running && transaction_result.is_none() {
            if let (Some(handle), Some(package)) = (&trans_handle, &trans_package) {
                transaction_result = Some(self.end_transaction(handle, package, parent.as_ref()));
            }
        }

        Ok(transaction_result)
    }

    /// Runs one concrete sampler through its precomputed package.
    async fn execute_sample_package(
        &mut self,
        sampler: NodeId,
        transaction: Option<&TransactionHandle>,
        trans_package: Option<&SamplePackage>,
    ) -> Result<(), UnitStop> {
        self.ctx.set_current_sampler(NextSampler::Node(sampler));
        let Some(package) = self.compiler.configure_sampler(sampler, &mut self.tree) else {
            warn!(sampler = %self.tree.name(sampler), "no sample package, skipping");
            return Ok(());
        };

        self.run_pre_processors(&package.pre_processors)?;
        self.run_timers(&package.timers).await;

        if !self.keep_running() {
            package.done(self.tree.arena_mut());
            return Ok(());
        }

        let mut result = match self.do_sampling(sampler, &package.listeners).await {
            Ok(result) => result,
            Err(stop) => {
                package.done(self.tree.arena_mut());
                return Err(stop);
            }
        };

        self.ctx.set_previous_result(result.clone());
        self.run_post_processors(&package.post_processors)?;
        self.check_assertions(&package.assertions, &mut result);
        self.mark_retrying(&package.controllers, &mut result);

        self.stats.samples += 1;
        if !result.success {
            self.stats.failures += 1;
        }

        let listeners = effective_listeners(&package, trans_package, transaction.is_some());
        self.notify_sample_occurred(&listeners, &result);

        package.done(self.tree.arena_mut());

        if let Some(handle) = transaction {
            handle.add_sub_sampler_result(&result);
        }

        let on_error = self.worker.on_sample_error();
        if result.stop_worker || (!result.success && on_error == OnSampleError::StopWorker) {
            info!(unit = %self.ctx.thread_name(), "stop worker requested by sample");
            self.stop_unit();
        }
        if result.stop_test || (!result.success && on_error == OnSampleError::StopTest) {
            info!(unit = %self.ctx.thread_name(), "stop test requested by sample");
            self.stop_test();
        }
        if result.stop_now || (!result.success && on_error == OnSampleError::StopNow) {
            info!(unit = %self.ctx.thread_name(), "immediate stop requested by sample");
            self.stop_now();
        }
        if !result.success {
            self.next_continue = false;
        }
        Ok(())
    }

    /// Invokes the sampler, fanning the started/ended events out around
    /// it. Sampler failures become failed results; stop signals
    /// propagate.
    async fn do_sampling(
        &mut self,
        sampler: NodeId,
        listeners: &[NodeId],
    ) -> Result<SampleResult, UnitStop> {
        let name = self.tree.name(sampler);
        self.notify_sample_started(listeners, &name);
        info!(unit = %self.ctx.thread_name(), sampler = %name, "sampling");

        let mut element = self.tree.arena_mut().take(sampler);
        let outcome = {
            let sampler = element
                .as_sampler_mut()
                .expect("node has sampler capability");
            sampler.sample(&mut self.ctx).await
        };
        self.tree.arena_mut().restore(sampler, element);

        let result = match outcome {
            Ok(result) => result,
            Err(SamplerError::Stop(signal)) => {
                let failed = failed_result(&name, signal.to_string());
                self.notify_sample_ended(listeners, &failed);
                return Err(UnitStop::Signal(signal));
            }
            Err(err) => {
                error!(unit = %self.ctx.thread_name(), sampler = %name, %err, "sampler failed");
                failed_result(&name, err.to_string())
            }
        };

        self.notify_sample_ended(listeners, &result);
        Ok(result)
    }

    /// Closes a transaction: evaluates transaction-scoped assertions,
    /// notifies listeners, and recovers the package.
    fn end_transaction(
        &mut self,
        handle: &TransactionHandle,
        package: &SamplePackage,
        parent: Option<&TransactionHandle>,
    ) -> SampleResult {
        debug!(transaction = %handle.name(), "ending transaction");
        if !handle.is_done() {
            handle.set_transaction_done();
        }
        let mut result = handle.result();
        self.check_assertions(&package.assertions, &mut result);

        // Listeners that receive the transaction result do not also get
        // it as a sub-sample of an outer transaction.
        if parent.is_none() {
            self.notify_sample_occurred(&package.listeners, &result);
        }
        self.notify_transaction_listeners(package, false);
        package.done(self.tree.arena_mut());
        self.stats.transactions += 1;
        result
    }

    fn run_pre_processors(&mut self, processors: &[NodeId]) -> Result<(), UnitStop> {
        for id in processors {
            debug!(unit = %self.ctx.thread_name(), processor = %self.tree.name(*id), "pre-processing");
            let Self { tree, ctx, .. } = self;
            let outcome = tree.with_taken(*id, |el, _tree| {
                el.as_pre_processor_mut().map(|p| p.process(ctx))
            });
            match outcome {
                Some(Err(ProcessorError::Stop(signal))) => return Err(signal.into()),
                Some(Err(err)) => error!(processor = %self.tree.name(*id), %err, "pre-processor failed"),
                _ => {}
            }
        }
        Ok(())
    }

    fn run_post_processors(&mut self, processors: &[NodeId]) -> Result<(), UnitStop> {
        for id in processors {
            debug!(unit = %self.ctx.thread_name(), processor = %self.tree.name(*id), "post-processing");
            let Self { tree, ctx, .. } = self;
            let outcome = tree.with_taken(*id, |el, _tree| {
                el.as_post_processor_mut().map(|p| p.process(ctx))
            });
            match outcome {
                Some(Err(ProcessorError::Stop(signal))) => return Err(signal.into()),
                Some(Err(err)) => error!(processor = %self.tree.name(*id), %err, "post-processor failed"),
                _ => {}
            }
        }
        Ok(())
    }

    /// Sums the timer delays (plus any controller-queued delay) and
    /// sleeps once.
    async fn run_timers(&mut self, timers: &[NodeId]) {
        let mut total = self.ctx.take_pending_delay();
        for id in timers {
            let Self { tree, ctx, .. } = self;
            total += tree.with_taken(*id, |el, _tree| {
                el.as_timer_mut()
                    .map(|t| t.delay(ctx))
                    .unwrap_or(Duration::ZERO)
            });
        }
        if !total.is_zero() {
            debug!(unit = %self.ctx.thread_name(), ?total, "sleeping timers");
            tokio::time::sleep(total).await;
        }
    }

    /// Evaluates each assertion, folding the outcomes into the result's
    /// success flag and updating the last-sample-ok variable.
    fn check_assertions(&mut self, assertions: &[NodeId], result: &mut SampleResult) {
        for id in assertions {
            let name = self.tree.name(*id);
            let Self { tree, ctx, .. } = self;
            let outcome = tree.with_taken(*id, |el, _tree| {
                el.as_assertion_mut().map(|a| a.assert_result(result, ctx))
            });
            let assertion_result = match outcome {
                Some(Ok(outcome)) => {
                    if outcome.failure {
                        debug!(assertion = %name, message = %outcome.message, "assertion failed");
                    }
                    AssertionResult {
                        name,
                        failure: outcome.failure,
                        error: false,
                        message: outcome.message,
                    }
                }
                Some(Err(err)) => {
                    error!(assertion = %name, %err, "assertion error");
                    AssertionResult {
                        name,
                        failure: false,
                        error: true,
                        message: err.to_string(),
                    }
                }
                None => continue,
            };
            result.success =
                result.success && !assertion_result.error && !assertion_result.failure;
            result.assertions.push(assertion_result);
        }
        self.ctx.variables.put(LAST_SAMPLE_OK, result.success);
    }

    /// Marks results produced under a retrying retry controller.
    fn mark_retrying(&mut self, controllers: &[NodeId], result: &mut SampleResult) {
        for id in controllers {
            if !self.tree.caps(*id).contains(Caps::RETRY) {
                continue;
            }
            let attempts = self.tree.with_node(*id, |el| {
                el.as_any()
                    .downcast_ref::<RetryController>()
                    .map(RetryController::attempts)
            });
            if let Some(attempts) = attempts {
                if attempts > 0 {
                    result.retrying = true;
                    result.sampler_name =
                        SmolStr::new(format!("{} (retry {})", result.sampler_name, attempts));
                }
                break;
            }
        }
    }

    /// Dispatches the worker's error policy after a failed sample,
    /// preferring a retry when a retry controller in scope has attempts
    /// left.
    fn control_loop_by_logical_action(&mut self, sampler: NextSampler) {
        let Some(real) = sampler.real_sampler() else {
            error!(
                unit = %self.ctx.thread_name(),
                "no concrete sampler behind the failed sample, skipping error dispatch"
            );
            return;
        };

        let mut finder = FindAncestors::new(real);
        self.tree.traverse(&mut finder);
        let ancestors = finder.controllers_to_root(self.tree.arena());

        if self.is_retrying(&ancestors) {
            debug!(unit = %self.ctx.thread_name(), "last sample failed, retrying");
            self.continue_on_retry(&ancestors);
        } else {
            match self.worker.on_sample_error() {
                OnSampleError::Continue => {}
                OnSampleError::StartNextIterationOfThread => {
                    self.continue_on_main_loop(&ancestors);
                }
                OnSampleError::StartNextIterationOfCurrentLoop => {
                    self.continue_on_current_loop(&ancestors);
                }
                OnSampleError::BreakCurrentLoop => self.break_on_current_loop(&ancestors),
                OnSampleError::StopWorker => self.stop_worker_peers(),
                OnSampleError::StopTest => self.stop_test(),
                OnSampleError::StopNow => self.stop_now(),
            }
        }

        // When a start-next-loop action ends a transaction early, the
        // transaction result still has to be reported.
        if let NextSampler::Transaction(handle) = &sampler {
            if handle.is_done() {
                if let Some(package) = self
                    .compiler
                    .transaction_package(handle.controller())
                    .cloned()
                {
                    self.end_transaction(handle, &package, None);
                }
            }
        }
    }

    fn is_retrying(&mut self, ancestors: &[NodeId]) -> bool {
        for id in ancestors {
            if !self.tree.caps(*id).contains(Caps::RETRY) {
                continue;
            }
            let Self { tree, ctx, .. } = self;
            let has_retries = tree.with_node_mut(*id, |el| {
                el.as_any_mut()
                    .downcast_mut::<RetryController>()
                    .map(|r| r.has_retries_left(ctx))
                    .unwrap_or(false)
            });
            if has_retries {
                return true;
            }
        }
        false
    }

    fn continue_on_retry(&mut self, ancestors: &[NodeId]) {
        for id in ancestors {
            let caps = self.tree.caps(*id);
            if caps.contains(Caps::WORKER) {
                self.with_controller(*id, |c| c.start_next_loop());
            } else if caps.contains(Caps::RETRY) {
                self.with_controller(*id, |c| c.start_next_loop());
                break;
            } else {
                self.with_controller(*id, |c| c.trigger_end_of_loop());
            }
        }
    }

    fn continue_on_main_loop(&mut self, ancestors: &[NodeId]) {
        for id in ancestors {
            if self.tree.caps(*id).contains(Caps::WORKER) {
                self.with_controller(*id, |c| c.start_next_loop());
            } else {
                self.with_controller(*id, |c| c.trigger_end_of_loop());
            }
        }
    }

    fn continue_on_current_loop(&mut self, ancestors: &[NodeId]) {
        for id in ancestors {
            let caps = self.tree.caps(*id);
            if caps.contains(Caps::WORKER) {
                self.with_controller(*id, |c| c.start_next_loop());
            } else if caps.contains(Caps::ITERATING) {
                self.with_controller(*id, |c| c.start_next_loop());
                break;
            } else {
                self.with_controller(*id, |c| c.trigger_end_of_loop());
            }
        }
    }

    fn break_on_current_loop(&mut self, ancestors: &[NodeId]) {
        for id in ancestors {
            let caps = self.tree.caps(*id);
            if caps.contains(Caps::WORKER) {
                self.with_controller(*id, |c| c.break_loop());
            } else if caps.contains(Caps::ITERATING) {
                self.with_controller(*id, |c| c.break_loop());
                break;
            } else {
                self.with_controller(*id, |c| c.trigger_end_of_loop());
            }
        }
    }

    fn with_controller(&mut self, id: NodeId, f: impl FnOnce(&mut dyn Controller)) {
        self.tree.with_node_mut(id, |el| {
            if let Some(controller) = el.as_controller_mut() {
                f(controller);
            }
        });
    }

    fn apply_stop_signal(&mut self, signal: StopSignal) {
        match signal {
            StopSignal::StopWorker => self.stop_worker_peers(),
            StopSignal::StopTest => self.stop_test(),
            StopSignal::StopTestNow => self.stop_now(),
            StopSignal::UserInterrupted => self.stop_unit(),
        }
    }

    fn stop_unit(&mut self) {
        self.running = false;
    }

    fn stop_worker_peers(&mut self) {
        info!(unit = %self.ctx.thread_name(), worker = %self.worker.name(), "stopping worker");
        self.worker.stop_threads();
    }

    fn stop_test(&mut self) {
        self.running = false;
        self.engine.stop_test();
    }

    fn stop_now(&mut self) {
        self.running = false;
        self.engine.stop_test_now();
    }

    fn notify_sample_started(&mut self, listeners: &[NodeId], name: &str) {
        for id in listeners {
            self.tree.with_taken(*id, |el, _tree| {
                if let Some(listener) = el.as_sample_listener_mut() {
                    listener.sample_started(name);
                }
            });
        }
    }

    fn notify_sample_ended(&mut self, listeners: &[NodeId], result: &SampleResult) {
        for id in listeners {
            self.tree.with_taken(*id, |el, _tree| {
                if let Some(listener) = el.as_sample_listener_mut() {
                    listener.sample_ended(result);
                }
            });
        }
    }

    fn notify_sample_occurred(&mut self, listeners: &[NodeId], result: &SampleResult) {
        for id in listeners {
            self.tree.with_taken(*id, |el, _tree| {
                if let Some(listener) = el.as_sample_listener_mut() {
                    listener.sample_occurred(result);
                }
            });
        }
    }

    fn notify_transaction_listeners(&mut self, package: &SamplePackage, started: bool) {
        for id in &package.trans_listeners {
            self.tree.with_taken(*id, |el, _tree| {
                if let Some(listener) = el.as_transaction_listener_mut() {
                    if started {
                        listener.transaction_started();
                    } else {
                        listener.transaction_ended();
                    }
                }
            });
        }
    }

    fn notify_worker_listeners(&mut self, started: bool) {
        for id in self.worker_listeners.clone() {
            self.tree.with_taken(id, |el, _tree| {
                if let Some(listener) = el.as_worker_listener_mut() {
                    if started {
                        listener.worker_started();
                    } else {
                        listener.worker_finished();
                    }
                }
            });
        }
    }
}

fn failed_result(name: &str, message: String) -> SampleResult {
    let mut result = SampleResult::new(name);
    result.sample_start();
    result.success = false;
    result.response_message = message.clone();
    result.response_data = message;
    result.sample_end();
    result
}

fn effective_listeners(
    package: &SamplePackage,
    trans_package: Option<&SamplePackage>,
    in_transaction: bool,
) -> Vec<NodeId> {
    match trans_package {
        // Listeners that receive the transaction result do not also get
        // its sub-samples.
        Some(trans) if in_transaction => package
            .listeners
            .iter()
            .copied()
            .filter(|id| !trans.listeners.contains(id))
            .collect(),
        _ => package.listeners.clone(),
    }
}
