// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The engine front-end: validates the tree, starts the workers, fans
//! execution units out, and joins them back in.

use crate::{
    config::EngineConfig,
    elements::{Caps, TestElement},
    errors::EngineError,
    runner::executor::ExecutionUnit,
    tree::{HashTree, NodeId, SearchByCaps, TestTree, TreeCloner},
    worker::{
        compiler::strategy_from_core, EngineProperties, OnSampleError, RunningStrategy,
        TestCollection, TestWorker, ThreadContext, Variables,
    },
};
use chrono::Utc;
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::{sync::Notify, task::JoinSet, time::sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Statistics for one finished execution unit.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct UnitStats {
    pub(crate) samples: u64,
    pub(crate) failures: u64,
    pub(crate) transactions: u64,
}

/// Aggregate statistics for a run.
#[derive(Clone, Debug, Default)]
pub struct RunStats {
    /// Workers that were started.
    pub workers: usize,
    /// Execution units that were spawned.
    pub units: usize,
    /// Units that were aborted (killed or panicked).
    pub aborted_units: usize,
    /// Samples executed.
    pub samples: u64,
    /// Samples that failed.
    pub failures: u64,
    /// Transactions completed.
    pub transactions: u64,
    /// A graceful stop was requested during the run.
    pub stopped: bool,
    /// An immediate stop was requested during the run.
    pub killed: bool,
}

impl RunStats {
    /// Whether the run completed without being stopped or losing units.
    pub fn is_clean(&self) -> bool {
        !self.stopped && !self.killed && self.aborted_units == 0
    }

    fn merge_unit(&mut self, unit: UnitStats) {
        self.samples += unit.samples;
        self.failures += unit.failures;
        self.transactions += unit.transactions;
    }
}

#[derive(Debug)]
struct WorkerShared {
    name: SmolStr,
    number: usize,
    running: AtomicBool,
    on_error: OnSampleError,
}

/// Shared coordination handle for one worker's execution units.
///
/// Units each own a clone of the worker's element subtree, so cohort
/// control (the running flag, the error policy) lives here rather than on
/// the element.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    inner: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub(crate) fn new(name: SmolStr, number: usize, on_error: OnSampleError) -> Self {
        Self {
            inner: Arc::new(WorkerShared {
                name,
                number,
                running: AtomicBool::new(true),
                on_error,
            }),
        }
    }

    /// The worker element's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The worker's position among the started workers.
    pub fn number(&self) -> usize {
        self.inner.number
    }

    /// Whether the worker's units should keep running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stops every execution unit of this worker at its next iteration
    /// boundary.
    pub fn stop_threads(&self) {
        self.inner.running.store(false, Ordering::Release);
    }

    /// The worker's on-sample-error policy.
    pub fn on_sample_error(&self) -> OnSampleError {
        self.inner.on_error
    }
}

#[derive(Debug, Default)]
struct EngineShared {
    stop: AtomicBool,
    kill: AtomicBool,
    kill_notify: Notify,
    workers: Mutex<Vec<WorkerHandle>>,
}

/// Cloneable handle for stopping a running engine.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// Asks every worker to stop gracefully; units exit at their next
    /// iteration boundary.
    pub fn stop_test(&self) {
        info!("graceful stop requested");
        self.shared.stop.store(true, Ordering::Release);
        for worker in crate::tree::lock(&self.shared.workers).iter() {
            worker.stop_threads();
        }
    }

    /// Stops gracefully and additionally aborts in-flight units.
    pub fn stop_test_now(&self) {
        info!("immediate stop requested");
        self.stop_test();
        self.shared.kill.store(true, Ordering::Release);
        self.shared.kill_notify.notify_waiters();
    }

    /// Whether a graceful stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Whether an immediate stop has been requested.
    pub fn is_killed(&self) -> bool {
        self.shared.kill.load(Ordering::Acquire)
    }
}

/// The test engine: runs a loaded test tree to completion.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    shared: Arc<EngineShared>,
    run_id: Uuid,
}

impl Engine {
    /// Creates an engine with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            shared: Arc::new(EngineShared::default()),
            run_id: Uuid::new_v4(),
        }
    }

    /// The unique id of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// A handle that can stop this engine from other tasks.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocking entry point: builds a multi-thread runtime and runs the
    /// tree on it.
    pub fn execute(self, tree: TestTree) -> Result<RunStats, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("loadmeter-worker")
            .build()
            .map_err(EngineError::RuntimeCreate)?;
        runtime.block_on(self.run(tree))
    }

    /// Runs the tree: one concurrent (or sequential) pass over the
    /// regular workers, then the teardown workers, notifying collection
    /// listeners around the whole run.
    pub async fn run(self, mut tree: TestTree) -> Result<RunStats, EngineError> {
        info!(run_id = %self.run_id, "engine starting");

        let mut properties = self.config.properties.clone();
        properties.insert(
            SmolStr::new_static("TESTSTART.MS"),
            Utc::now().timestamp_millis().to_string(),
        );
        let properties: EngineProperties = Arc::new(properties);
        let mut engine_ctx = ThreadContext::new(Arc::clone(&properties));
        engine_ctx.set_engine(self.handle());

        let collection = tree
            .roots()
            .into_iter()
            .find(|id| tree.caps(*id).contains(Caps::COLLECTION))
            .ok_or(EngineError::MissingCollection)?;

        let (sequential, worker_delay, default_strategy) =
            tree.with_taken(collection, |el, _tree| {
                let strategy = strategy_from_core(el.core(), TestCollection::RUNNING_STRATEGY);
                let core = el.core_mut();
                let sequential = core.prop_bool(TestCollection::SEQUENTIAL, &engine_ctx);
                let delay = core.prop_int(TestCollection::DELAY, &engine_ctx).max(0) as u64;
                (
                    sequential,
                    std::time::Duration::from_millis(delay),
                    strategy,
                )
            });

        let mut listener_search = SearchByCaps::new(Caps::COLLECTION_LISTENER);
        tree.traverse(&mut listener_search);
        let collection_listeners = listener_search.results().to_vec();
        notify_collection(&mut tree, &collection_listeners, true);

        let mut worker_search = SearchByCaps::new(Caps::WORKER);
        tree.traverse(&mut worker_search);
        let subtrees: IndexMap<NodeId, HashTree> = worker_search
            .results()
            .iter()
            .filter_map(|id| worker_search.subtree(*id).map(|t| (*id, t.clone())))
            .collect();

        // Only direct children of the collection run as workers.
        let workers: Vec<NodeId> = tree
            .structure()
            .get(collection)
            .map(HashTree::list)
            .unwrap_or_default()
            .into_iter()
            .filter(|id| tree.caps(*id).contains(Caps::WORKER))
            .collect();
        let is_teardown = |tree: &TestTree, id: NodeId| {
            tree.with_node(id, |el| {
                el.as_any()
                    .downcast_ref::<TestWorker>()
                    .is_some_and(TestWorker::is_teardown)
            })
        };
        let regular: Vec<NodeId> = workers
            .iter()
            .copied()
            .filter(|id| !is_teardown(&tree, *id))
            .collect();
        let teardown: Vec<NodeId> = workers
            .iter()
            .copied()
            .filter(|id| is_teardown(&tree, *id))
            .collect();

        let mut stats = RunStats::default();
        self.run_worker_phase(
            &mut tree,
            &regular,
            &subtrees,
            &default_strategy,
            sequential,
            worker_delay,
            &properties,
            &engine_ctx,
            &mut stats,
        )
        .await;

        if !self.handle().is_killed() && !teardown.is_empty() {
            debug!("running teardown workers");
            self.run_worker_phase(
                &mut tree,
                &teardown,
                &subtrees,
                &default_strategy,
                sequential,
                worker_delay,
                &properties,
                &engine_ctx,
                &mut stats,
            )
            .await;
        } else if !teardown.is_empty() {
            warn!("skipping teardown workers: run was killed");
        }

        notify_collection(&mut tree, &collection_listeners, false);

        stats.stopped = self.handle().is_stopped();
        stats.killed = self.handle().is_killed();
        info!(
            run_id = %self.run_id,
            samples = stats.samples,
            failures = stats.failures,
            "engine finished"
        );
        Ok(stats)
    }

    #[expect(clippy::too_many_arguments)]
    async fn run_worker_phase(
        &self,
        tree: &mut TestTree,
        workers: &[NodeId],
        subtrees: &IndexMap<NodeId, HashTree>,
        default_strategy: &RunningStrategy,
        sequential: bool,
        worker_delay: std::time::Duration,
        properties: &EngineProperties,
        engine_ctx: &ThreadContext,
        stats: &mut RunStats,
    ) {
        let mut pending = Vec::new();
        for (index, worker_id) in workers.iter().copied().enumerate() {
            if self.handle().is_stopped() {
                break;
            }
            if index > 0 && !worker_delay.is_zero() {
                sleep(worker_delay).await;
            }
            let Some(subtree) = subtrees.get(&worker_id) else {
                continue;
            };
            let (handle, join) = self
                .start_worker(
                    tree,
                    worker_id,
                    index,
                    subtree,
                    default_strategy,
                    properties,
                    engine_ctx,
                    stats,
                )
                .await;
            if sequential {
                self.drain_worker(&handle, join, stats).await;
            } else {
                pending.push((handle, join));
            }
        }
        for (handle, join) in pending {
            self.drain_worker(&handle, join, stats).await;
        }
    }

    /// Spawns one worker's execution units, each over its own clone of
    /// the worker subtree, spacing spawns per the startup ramp.
    #[expect(clippy::too_many_arguments)]
    async fn start_worker(
        &self,
        tree: &mut TestTree,
        worker_id: NodeId,
        worker_index: usize,
        subtree: &HashTree,
        default_strategy: &RunningStrategy,
        properties: &EngineProperties,
        engine_ctx: &ThreadContext,
        stats: &mut RunStats,
    ) -> (WorkerHandle, JoinSet<UnitStats>) {
        let (name, threads, startups_per_second, on_error, own_strategy) =
            tree.with_taken(worker_id, |el, _tree| {
                let name = el.name();
                let own_strategy = strategy_from_core(el.core(), TestWorker::RUNNING_STRATEGY);
                let core = el.core_mut();
                let threads = if core.get_property(TestWorker::NUMBER_OF_THREADS).is_none() {
                    1
                } else {
                    core.prop_int(TestWorker::NUMBER_OF_THREADS, engine_ctx).max(0) as u32
                };
                let startups = core
                    .prop_float(TestWorker::STARTUPS_PER_SECOND, engine_ctx)
                    .max(0.0);
                let on_error =
                    OnSampleError::parse(&core.prop_str(TestWorker::ON_SAMPLE_ERROR, engine_ctx));
                (name, threads, startups, on_error, own_strategy)
            });
        let strategy = if own_strategy.is_empty() {
            default_strategy.clone()
        } else {
            own_strategy
        };

        let handle = WorkerHandle::new(name.clone(), worker_index, on_error);
        crate::tree::lock(&self.shared.workers).push(handle.clone());
        info!(worker = %name, threads, "starting worker");

        let mut join = JoinSet::new();
        for unit_number in 0..threads {
            if !handle.is_running() || self.handle().is_stopped() {
                break;
            }
            if unit_number > 0 && startups_per_second > 0.0 {
                sleep(std::time::Duration::from_secs_f64(1.0 / startups_per_second)).await;
            }
            let mut cloner = TreeCloner::new(true);
            subtree.traverse(tree.arena_mut(), &mut cloner);
            let unit_tree = cloner.into_tree();

            let thread_name = format!("{name} w{}t{}", worker_index + 1, unit_number + 1);
            let mut base_variables = Variables::new();
            base_variables.update(&engine_ctx.variables);
            let unit = ExecutionUnit::new(
                unit_tree,
                handle.clone(),
                self.handle(),
                Arc::clone(properties),
                base_variables,
                unit_number,
                thread_name,
                strategy.clone(),
            );
            join.spawn(unit.run());
            stats.units += 1;
        }
        stats.workers += 1;

        (handle, join)
    }

    /// Waits for a worker's units, aborting them on kill or after the
    /// configured grace period once a stop was requested.
    async fn drain_worker(
        &self,
        handle: &WorkerHandle,
        mut join: JoinSet<UnitStats>,
        stats: &mut RunStats,
    ) {
        loop {
            if self.handle().is_killed() {
                join.abort_all();
            }
            tokio::select! {
                result = join.join_next() => match result {
                    None => break,
                    Some(Ok(unit_stats)) => stats.merge_unit(unit_stats),
                    Some(Err(err)) if err.is_cancelled() => stats.aborted_units += 1,
                    Some(Err(err)) => {
                        error!(worker = %handle.name(), %err, "execution unit panicked");
                        stats.aborted_units += 1;
                    }
                },
                _ = self.shared.kill_notify.notified() => {
                    join.abort_all();
                }
                _ = sleep(self.config.wait_to_die), if self.handle().is_stopped() => {
                    warn!(worker = %handle.name(), "timed out waiting for units to stop, aborting");
                    join.abort_all();
                }
            }
        }
        debug!(worker = %handle.name(), "worker drained");
    }
}

fn notify_collection(tree: &mut TestTree, listeners: &[NodeId], started: bool) {
    for id in listeners {
        tree.with_node_mut(*id, |el| {
            if let Some(listener) = el.as_collection_listener_mut() {
                if started {
                    listener.collection_started();
                } else {
                    listener.collection_ended();
                }
            }
        });
    }
}
