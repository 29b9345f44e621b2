// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end engine scenarios over in-process trees.

use loadmeter_runner::{
    config::EngineConfig,
    controls::{IfController, LoopController, RetryController, TransactionController},
    elements::{
        builtin::{CollectorEvent, DebugSampler, ResultCollector},
        TestElement,
    },
    errors::EngineError,
    functions::{compile_property, FunctionRegistry},
    runner::Engine,
    script::ElementRegistry,
    tree::{NodeId, TestTree},
    worker::{TestCollection, TestWorker},
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn occurred(events: &[CollectorEvent], name: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CollectorEvent::SampleOccurred(n) if n == name))
        .count()
}

fn count(events: &[CollectorEvent], expected: &CollectorEvent) -> usize {
    events.iter().filter(|e| *e == expected).count()
}

/// Asserts that `needles` appear in `events` in order (not necessarily
/// adjacent).
fn assert_subsequence(events: &[CollectorEvent], needles: &[CollectorEvent]) {
    let mut position = 0;
    for needle in needles {
        let found = events[position..].iter().position(|e| e == needle);
        match found {
            Some(offset) => position += offset + 1,
            None => panic!("expected {needle:?} after position {position} in {events:#?}"),
        }
    }
}

struct Plan {
    tree: TestTree,
    collection: NodeId,
    collector: ResultCollector,
}

/// A collection with a shared result collector; the collector is cloned
/// into whatever scopes a scenario needs (clones share their buffer).
fn plan() -> Plan {
    let mut tree = TestTree::new();
    let collection = tree.insert(&[], Box::new(TestCollection::new("collection")));
    let collector = ResultCollector::new("collector");
    Plan {
        tree,
        collection,
        collector,
    }
}

fn dynamic_sampler(name: &str, data_expr: &str) -> Box<dyn TestElement> {
    let registry = FunctionRegistry::default();
    let mut sampler = DebugSampler::new(name);
    sampler
        .core_mut()
        .add_property(
            DebugSampler::RESPONSE_DATA,
            compile_property(data_expr, &registry).unwrap(),
        )
        .unwrap();
    Box::new(sampler)
}

#[tokio::test]
async fn two_units_each_run_the_sampler_once() {
    let mut plan = plan();
    let worker = plan
        .tree
        .insert(&[plan.collection], Box::new(TestWorker::new("w", 2, 1)));
    plan.tree
        .insert(&[plan.collection, worker], Box::new(plan.collector.clone()));
    plan.tree
        .insert(&[plan.collection, worker], Box::new(DebugSampler::new("A")));

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.units, 2);
    assert_eq!(stats.samples, 2);
    assert_eq!(stats.failures, 0);
    assert!(stats.is_clean());

    let events = plan.collector.events();
    assert_eq!(count(&events, &CollectorEvent::WorkerStarted), 2);
    assert_eq!(count(&events, &CollectorEvent::WorkerFinished), 2);
    assert_eq!(occurred(&events, "A"), 2);
    assert_eq!(events.first(), Some(&CollectorEvent::CollectionStarted));
    assert_eq!(events.last(), Some(&CollectorEvent::CollectionEnded));
}

#[tokio::test]
async fn worker_loops_multiply_with_inner_loops() {
    let mut plan = plan();
    let worker = plan
        .tree
        .insert(&[plan.collection], Box::new(TestWorker::new("w", 1, 3)));
    plan.tree
        .insert(&[plan.collection, worker], Box::new(plan.collector.clone()));
    let inner = plan.tree.insert(
        &[plan.collection, worker],
        Box::new(LoopController::new("inner", 2)),
    );
    plan.tree.insert(
        &[plan.collection, worker, inner],
        Box::new(DebugSampler::new("S")),
    );

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert_eq!(stats.samples, 6);
    assert_eq!(occurred(&plan.collector.events(), "S"), 6);
}

#[tokio::test]
async fn transactions_group_their_children() {
    let mut plan = plan();
    let worker = plan
        .tree
        .insert(&[plan.collection], Box::new(TestWorker::new("w", 1, 1)));
    let transaction = plan.tree.insert(
        &[plan.collection, worker],
        Box::new(TransactionController::new("T")),
    );
    // One logical collector observes the transaction and each child.
    plan.tree.insert(
        &[plan.collection, worker, transaction],
        Box::new(plan.collector.clone()),
    );
    let s1 = plan.tree.insert(
        &[plan.collection, worker, transaction],
        Box::new(DebugSampler::new("S1")),
    );
    plan.tree.insert(
        &[plan.collection, worker, transaction, s1],
        Box::new(plan.collector.clone()),
    );
    let s2 = plan.tree.insert(
        &[plan.collection, worker, transaction],
        Box::new(DebugSampler::new("S2")),
    );
    plan.tree.insert(
        &[plan.collection, worker, transaction, s2],
        Box::new(plan.collector.clone()),
    );

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert_eq!(stats.samples, 2);
    assert_eq!(stats.transactions, 1);

    let events = plan.collector.events();
    assert_subsequence(
        &events,
        &[
            CollectorEvent::TransactionStarted,
            CollectorEvent::SampleOccurred("S1".into()),
            CollectorEvent::SampleOccurred("S2".into()),
            CollectorEvent::SampleOccurred("T".into()),
            CollectorEvent::TransactionEnded,
        ],
    );

    let results = plan.collector.results();
    let transaction_result = results
        .iter()
        .find(|r| r.sampler_name == "T")
        .expect("transaction result was published");
    assert_eq!(transaction_result.subresults.len(), 2);
    assert_eq!(transaction_result.response_code, "200");
    assert!(transaction_result.success);
}

#[tokio::test]
async fn start_next_iteration_of_current_loop_skips_the_rest_of_the_pass() {
    let mut plan = plan();
    let worker = plan
        .tree
        .insert(&[plan.collection], Box::new(TestWorker::new("w", 1, 1)));
    plan.tree.with_node_mut(worker, |el| {
        el.core_mut().set_property(
            TestWorker::ON_SAMPLE_ERROR,
            "START_NEXT_ITERATION_OF_CURRENT_LOOP",
        ).unwrap();
    });
    plan.tree
        .insert(&[plan.collection, worker], Box::new(plan.collector.clone()));
    let inner = plan.tree.insert(
        &[plan.collection, worker],
        Box::new(LoopController::new("inner", 3)),
    );
    plan.tree.insert(
        &[plan.collection, worker, inner],
        Box::new(DebugSampler::new("A").failing()),
    );
    plan.tree.insert(
        &[plan.collection, worker, inner],
        Box::new(DebugSampler::new("B")),
    );

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert_eq!(stats.samples, 3);
    assert_eq!(stats.failures, 3);

    let events = plan.collector.events();
    assert_eq!(occurred(&events, "A"), 3);
    assert_eq!(occurred(&events, "B"), 0);
}

#[tokio::test]
async fn retry_controller_repeats_failed_samplers_and_marks_retries() {
    let mut plan = plan();
    let worker = plan
        .tree
        .insert(&[plan.collection], Box::new(TestWorker::new("w", 1, 1)));
    plan.tree
        .insert(&[plan.collection, worker], Box::new(plan.collector.clone()));
    let retry = plan.tree.insert(
        &[plan.collection, worker],
        Box::new(RetryController::new("retry", 2)),
    );
    plan.tree.insert(
        &[plan.collection, worker, retry],
        Box::new(DebugSampler::new("R").failing_times(2)),
    );

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert_eq!(stats.samples, 3);
    assert_eq!(stats.failures, 2);

    let results = plan.collector.results();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].sampler_name, "R");
    assert!(!results[0].retrying);
    assert!(!results[0].success);
    assert_eq!(results[1].sampler_name, "R (retry 1)");
    assert!(results[1].retrying);
    assert!(!results[1].success);
    assert_eq!(results[2].sampler_name, "R (retry 2)");
    assert!(results[2].retrying);
    assert!(results[2].success);
}

#[tokio::test]
async fn if_controllers_gate_their_subtree() {
    let mut plan = plan();
    let worker = plan
        .tree
        .insert(&[plan.collection], Box::new(TestWorker::new("w", 1, 1)));
    plan.tree
        .insert(&[plan.collection, worker], Box::new(plan.collector.clone()));
    let gate_off = plan.tree.insert(
        &[plan.collection, worker],
        Box::new(IfController::new("off", "false")),
    );
    plan.tree.insert(
        &[plan.collection, worker, gate_off],
        Box::new(DebugSampler::new("skipped")),
    );
    let gate_on = plan.tree.insert(
        &[plan.collection, worker],
        Box::new(IfController::new("on", "true")),
    );
    plan.tree.insert(
        &[plan.collection, worker, gate_on],
        Box::new(DebugSampler::new("taken")),
    );

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert_eq!(stats.samples, 1);

    let events = plan.collector.events();
    assert_eq!(occurred(&events, "skipped"), 0);
    assert_eq!(occurred(&events, "taken"), 1);
}

#[tokio::test]
async fn foreach_feeds_variables_into_function_properties() {
    let mut plan = plan();
    let worker = plan
        .tree
        .insert(&[plan.collection], Box::new(TestWorker::new("w", 1, 1)));
    plan.tree
        .insert(&[plan.collection, worker], Box::new(plan.collector.clone()));

    let mut each = loadmeter_runner::controls::ForeachController::new("each", "item", "ignored");
    each.core_mut().set_property(
        loadmeter_runner::controls::ForeachController::SOURCE,
        "CUSTOM",
    ).unwrap();
    each.core_mut().set_property(
        loadmeter_runner::controls::ForeachController::ITERABLE,
        r#"["alpha","beta"]"#,
    ).unwrap();
    let each = plan.tree.insert(&[plan.collection, worker], Box::new(each));
    plan.tree.insert(
        &[plan.collection, worker, each],
        dynamic_sampler("F", "${item}"),
    );

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert_eq!(stats.samples, 2);

    let data: Vec<String> = plan
        .collector
        .results()
        .iter()
        .map(|r| r.response_data.clone())
        .collect();
    assert_eq!(data, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn stop_test_policy_ends_the_run_gracefully() {
    let mut plan = plan();
    let worker = plan
        .tree
        .insert(&[plan.collection], Box::new(TestWorker::new("w", 1, -1)));
    plan.tree.with_node_mut(worker, |el| {
        el.core_mut()
            .set_property(TestWorker::ON_SAMPLE_ERROR, "STOP_TEST").unwrap();
        if let Some(w) = el.as_any_mut().downcast_mut::<TestWorker>() {
            w.set_continue_forever(true);
        }
    });
    plan.tree
        .insert(&[plan.collection, worker], Box::new(plan.collector.clone()));
    plan.tree.insert(
        &[plan.collection, worker],
        Box::new(DebugSampler::new("A").failing()),
    );

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert!(stats.stopped);
    assert!(!stats.killed);
    assert_eq!(stats.samples, 1);
}

#[tokio::test]
async fn stop_now_policy_kills_the_run() {
    let mut plan = plan();
    let worker = plan
        .tree
        .insert(&[plan.collection], Box::new(TestWorker::new("w", 1, -1)));
    plan.tree.with_node_mut(worker, |el| {
        el.core_mut()
            .set_property(TestWorker::ON_SAMPLE_ERROR, "STOP_NOW").unwrap();
        if let Some(w) = el.as_any_mut().downcast_mut::<TestWorker>() {
            w.set_continue_forever(true);
        }
    });
    plan.tree.insert(
        &[plan.collection, worker],
        Box::new(DebugSampler::new("A").failing()),
    );

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert!(stats.killed);
    assert!(stats.samples <= 1);
}

#[tokio::test]
async fn sequential_collections_run_workers_and_teardown_in_order() {
    let mut plan = plan();
    plan.tree.with_node_mut(plan.collection, |el| {
        el.core_mut()
            .set_property(TestCollection::SEQUENTIAL, "true").unwrap();
    });
    for (worker_name, sampler_name) in [("w1", "A1"), ("w2", "A2")] {
        let worker = plan.tree.insert(
            &[plan.collection],
            Box::new(TestWorker::new(worker_name, 1, 1)),
        );
        plan.tree
            .insert(&[plan.collection, worker], Box::new(plan.collector.clone()));
        plan.tree.insert(
            &[plan.collection, worker],
            Box::new(DebugSampler::new(sampler_name)),
        );
    }
    let teardown = plan.tree.insert(
        &[plan.collection],
        Box::new(TestWorker::new_teardown("td", 1, 1)),
    );
    plan.tree
        .insert(&[plan.collection, teardown], Box::new(plan.collector.clone()));
    plan.tree.insert(
        &[plan.collection, teardown],
        Box::new(DebugSampler::new("TD")),
    );

    let stats = Engine::new(EngineConfig::default())
        .run(plan.tree)
        .await
        .unwrap();
    assert_eq!(stats.workers, 3);
    assert_eq!(stats.samples, 3);

    let events = plan.collector.events();
    assert_subsequence(
        &events,
        &[
            CollectorEvent::SampleOccurred("A1".into()),
            CollectorEvent::SampleOccurred("A2".into()),
            CollectorEvent::SampleOccurred("TD".into()),
        ],
    );
}

#[tokio::test]
async fn a_tree_without_a_collection_is_rejected() {
    let mut tree = TestTree::new();
    tree.insert(&[], Box::new(TestWorker::new("w", 1, 1)));
    let result = Engine::new(EngineConfig::default()).run(tree).await;
    assert!(matches!(result, Err(EngineError::MissingCollection)));
}

#[tokio::test]
async fn scripts_load_and_run_end_to_end() {
    let registry = ElementRegistry::default();
    let script = json!([{
        "name": "collection", "desc": "", "class": "TestCollection", "enabled": true,
        "property": {},
        "child": [{
            "name": "worker", "desc": "", "class": "TestWorker", "enabled": true,
            "property": {"TestWorker__number_of_threads": "2"},
            "child": [{
                "name": "ping", "desc": "smoke", "class": "DebugSampler", "enabled": true,
                "property": {"DebugSampler__response_data": "pong ${__year()}"},
                "child": [],
            }],
        }],
    }]);
    let tree = registry.load_value(&script).unwrap();

    let stats = Engine::new(EngineConfig::default()).run(tree).await.unwrap();
    assert_eq!(stats.units, 2);
    assert_eq!(stats.samples, 2);
    assert_eq!(stats.failures, 0);
}
