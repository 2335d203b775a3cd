// tests/flow_scenarios.rs

use std::collections::HashSet;
use std::error::Error;
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::Utc;
use serde_json::json;

use auditflow::condition::Comparator;
use auditflow::dispatch::{Dispatcher, Job};
use auditflow::engine::{CompletionTrigger, NodeUpdate, StepExecutor};
use auditflow::graph::{FlowGraph, FlowObject};
use auditflow::store::{FlowRun, MemoryStore, Resource, Store};
use auditflow::types::{NodeStatus, ObjectStatus, ResourceKind, TaskType};
use auditflow_test_utils::builders::{GraphBuilder, NodeBuilder, compare, flow_run};
use auditflow_test_utils::fakes::RecordingDispatcher;
use auditflow_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

struct Harness {
    store: Arc<dyn Store>,
    queue: Arc<RecordingDispatcher>,
    executor: StepExecutor,
    trigger: CompletionTrigger,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let queue = Arc::new(RecordingDispatcher::new());
        let dispatcher: Arc<dyn Dispatcher> = queue.clone();
        let executor = StepExecutor::new(Arc::clone(&store), Arc::clone(&dispatcher));
        let trigger = CompletionTrigger::new(Arc::clone(&store), dispatcher, executor.clone());
        Self {
            store,
            queue,
            executor,
            trigger,
        }
    }

    fn start(&self, run: FlowRun) -> Result<String, Box<dyn Error>> {
        let id = run.id.clone();
        self.store.insert_flow_run(run)?;
        self.executor.advance(&id)?;
        Ok(id)
    }

    /// A finished scan resource with `data`.
    fn finished_scan(&self, data: serde_json::Value) -> Result<String, Box<dyn Error>> {
        let mut resource = Resource::new(ResourceKind::Scan, "acct", vec!["html".into()]);
        resource.data = data;
        resource.results.insert("html".into(), json!({ "ok": true }));
        resource.time_completed = Some(Utc::now());
        let id = resource.id.clone();
        self.store.insert_resource(resource)?;
        Ok(id)
    }
}

fn scan_then_test() -> FlowGraph {
    GraphBuilder::new()
        .node(NodeBuilder::new("1", TaskType::Scan).build())
        .after("1", NodeBuilder::new("2", TaskType::Test).build())
        .build()
}

fn passed(parent: &str, id: &str) -> FlowObject {
    FlowObject {
        parent: parent.to_string(),
        id: Some(id.to_string()),
        status: ObjectStatus::Passed,
    }
}

#[test]
fn scenario_a_scan_then_test_passes() -> TestResult {
    let h = Harness::new();
    let run_id = h.start(flow_run(scan_then_test()))?;

    let steps = h.queue.step_jobs();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].task_type, TaskType::Scan);
    assert_eq!(steps[0].node_index, 0);

    // Scan finished for its single object.
    let scan_id = h.finished_scan(json!({ "health": 80 }))?;
    h.trigger.report(
        &run_id,
        NodeUpdate::new(0).with_objects(vec![passed("https://example.com", &scan_id)]),
    )?;

    let steps = h.queue.step_jobs();
    assert_eq!(steps.len(), 2, "test dispatched after scan");
    assert_eq!(steps[1].task_type, TaskType::Test);
    assert!(steps[1].objects.is_empty(), "tests do not consume parent objects");

    let run = h
        .trigger
        .report(&run_id, NodeUpdate::new(1).with_status(NodeStatus::Passed))?;
    assert!(run.is_complete());
    assert_eq!(run.status, NodeStatus::Passed);
    assert!(run.graph.nodes().iter().all(|n| n.finalized));
    Ok(())
}

#[test]
fn scenario_b_failed_scan_ends_the_run() -> TestResult {
    let h = Harness::new();
    let run_id = h.start(flow_run(scan_then_test()))?;

    let run = h.trigger.report(
        &run_id,
        NodeUpdate::new(0)
            .with_status(NodeStatus::Failed)
            .with_message("max scans reached (0 allowed)"),
    )?;

    assert!(run.is_complete());
    assert_eq!(run.status, NodeStatus::Failed);
    assert_eq!(run.graph.node(1).map(|n| n.status), Some(NodeStatus::Queued));
    assert_eq!(h.queue.step_jobs().len(), 1, "test never dispatched");
    assert!(
        run.logs
            .iter()
            .any(|l| l.message == "max scans reached (0 allowed)")
    );
    Ok(())
}

#[test]
fn scenario_c_conditional_node_routes_each_object_once() -> TestResult {
    let h = Harness::new();
    let graph = GraphBuilder::new()
        .node(
            NodeBuilder::new("1", TaskType::Scan)
                .conditions(compare("health", Comparator::Ge, 50.0))
                .build(),
        )
        .after("1", NodeBuilder::new("2", TaskType::Slack).start_if(true).build())
        .after("1", NodeBuilder::new("3", TaskType::Email).start_if(false).build())
        .build();
    let run_id = h.start(flow_run(graph))?;

    let healthy_a = h.finished_scan(json!({ "health": 90 }))?;
    let healthy_b = h.finished_scan(json!({ "health": 70 }))?;
    let sick = h.finished_scan(json!({ "health": 10 }))?;
    h.trigger.report(
        &run_id,
        NodeUpdate::new(0).with_objects(vec![
            passed("p1", &healthy_a),
            passed("p2", &healthy_b),
            passed("p3", &sick),
        ]),
    )?;

    let steps = h.queue.step_jobs();
    let slack = steps
        .iter()
        .find(|j| j.task_type == TaskType::Slack)
        .ok_or("slack not dispatched")?;
    let email = steps
        .iter()
        .find(|j| j.task_type == TaskType::Email)
        .ok_or("email not dispatched")?;
    assert_eq!(slack.objects.len(), 2);
    assert_eq!(email.objects.len(), 1);
    assert_eq!(email.objects[0].id.as_deref(), Some(sick.as_str()));

    let routed: HashSet<_> = slack
        .objects
        .iter()
        .chain(&email.objects)
        .map(|o| o.parent.clone())
        .collect();
    assert_eq!(routed.len(), 3, "every routed object gets a fresh parent");
    assert!(!routed.contains("p1"));

    let run = h.store.get_flow_run(&run_id)?;
    assert!(run.graph.node(0).is_some_and(|n| n.finalized));
    assert_eq!(run.graph.node(1).map(|n| n.objects.len()), Some(2));
    Ok(())
}

#[test]
fn advance_is_a_no_op_after_completion() -> TestResult {
    let h = Harness::new();
    let run_id = h.start(flow_run(scan_then_test()))?;
    h.trigger
        .report(&run_id, NodeUpdate::new(0).with_status(NodeStatus::Failed))?;

    let done = h.store.get_flow_run(&run_id)?;
    let jobs_before = h.queue.jobs().len();
    for _ in 0..3 {
        let again = h.executor.advance(&run_id)?;
        assert_eq!(again, done);
    }
    assert_eq!(h.queue.jobs().len(), jobs_before);

    // Late reports are ignored too.
    let late = h
        .trigger
        .report(&run_id, NodeUpdate::new(1).with_status(NodeStatus::Passed))?;
    assert_eq!(late.graph, done.graph);
    Ok(())
}

#[test]
fn repeated_advance_while_working_dispatches_nothing_new() -> TestResult {
    let h = Harness::new();
    let run_id = h.start(flow_run(scan_then_test()))?;

    for _ in 0..5 {
        h.executor.advance(&run_id)?;
    }
    assert_eq!(h.queue.step_jobs().len(), 1);
    Ok(())
}

#[test]
fn resource_completion_advances_referencing_runs() -> TestResult {
    let h = Harness::new();
    let run_id = h.start(flow_run(scan_then_test()))?;

    let mut scan = Resource::new(ResourceKind::Scan, "acct", vec!["html".into()]);
    scan.flow_refs.push(auditflow::store::FlowRef {
        flow_run_id: run_id.clone(),
        node_index: 0,
        parent: "https://example.com".into(),
    });
    let scan_id = scan.id.clone();
    h.store.insert_resource(scan)?;

    // The step reported a working object.
    h.trigger.report(
        &run_id,
        NodeUpdate::new(0).with_objects(vec![FlowObject::working(
            "https://example.com",
            Some(scan_id.clone()),
        )]),
    )?;
    assert_eq!(h.queue.step_jobs().len(), 1);

    h.store.update_resource(&scan_id, &mut |r| {
        r.results.insert("html".into(), json!({}));
        r.time_completed = Some(Utc::now());
        Ok(())
    })?;
    h.trigger.resource_completed(&scan_id)?;

    let steps = h.queue.step_jobs();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].task_type, TaskType::Test);
    Ok(())
}

#[test]
fn completed_resource_starts_its_dependents() -> TestResult {
    let h = Harness::new();

    let test = Resource::new(ResourceKind::Test, "acct", vec!["vrt".into()]);
    let test_id = test.id.clone();
    h.store.insert_resource(test)?;

    let mut post_scan = Resource::new(ResourceKind::Scan, "acct", vec!["html".into()]);
    post_scan.dependents.push(test_id.clone());
    post_scan.results.insert("html".into(), json!({}));
    post_scan.time_completed = Some(Utc::now());
    let post_scan_id = post_scan.id.clone();
    h.store.insert_resource(post_scan)?;

    h.trigger.resource_completed(&post_scan_id)?;

    let jobs = h.queue.component_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].1.resource_id, test_id);
    assert_eq!(jobs[0].1.component, "vrt");
    assert!(matches!(h.queue.jobs()[0].1, Job::Component(_)));
    Ok(())
}

#[test]
fn concurrent_advance_dispatches_the_entry_once() -> TestResult {
    const THREADS: usize = 16;
    let h = Harness::new();
    let run = flow_run(scan_then_test());
    let run_id = run.id.clone();
    h.store.insert_flow_run(run)?;

    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                h.executor.advance(&run_id).unwrap();
            });
        }
    });

    let steps = h.queue.step_jobs();
    assert_eq!(steps.len(), 1, "{steps:?}");
    let run = h.store.get_flow_run(&run_id)?;
    assert_eq!(run.graph.node(0).map(|n| n.status), Some(NodeStatus::Working));
    assert_eq!(run.graph.node(1).map(|n| n.status), Some(NodeStatus::Queued));
    Ok(())
}

#[test]
fn concurrent_reports_for_one_node_are_all_merged() -> TestResult {
    for _ in 0..10 {
        let h = Harness::new();
        let run_id = h.start(flow_run(scan_then_test()))?;
        h.trigger.report(
            &run_id,
            NodeUpdate::new(0).with_objects(vec![
                FlowObject::working("a", Some("scan-a".to_string())),
                FlowObject::working("b", Some("scan-b".to_string())),
            ]),
        )?;

        let barrier = Barrier::new(2);
        thread::scope(|s| {
            for (parent, id) in [("a", "scan-a"), ("b", "scan-b")] {
                let (h, barrier, run_id) = (&h, &barrier, &run_id);
                s.spawn(move || {
                    barrier.wait();
                    h.trigger
                        .report(run_id, NodeUpdate::new(0).with_objects(vec![passed(parent, id)]))
                        .unwrap();
                });
            }
        });

        let run = h.store.get_flow_run(&run_id)?;
        let scan = run.graph.node(0).ok_or("scan node")?;
        assert_eq!(scan.objects.len(), 2);
        assert!(scan.objects.iter().all(|o| o.status == ObjectStatus::Passed));
        assert_eq!(scan.status, NodeStatus::Passed);
        assert_eq!(h.queue.step_jobs().len(), 2, "test dispatched exactly once");
    }
    Ok(())
}
