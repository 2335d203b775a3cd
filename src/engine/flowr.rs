// src/engine/flowr.rs

//! Pure step logic for a flow run.
//!
//! [`step`] looks at a flow run, performs at most one transition (dispatch the
//! entry node, route a conditional node, move past a finished node, or finish
//! the run) and returns the commands the IO shell has to execute afterwards.
//! It never performs IO itself; backing resources are read through a lookup
//! closure so it can be unit tested with plain maps.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::condition::Condition;
use crate::dispatch::{NotifyJob, StepJob};
use crate::graph::{FlowObject, StepTask};
use crate::store::{FlowRun, Resource};
use crate::types::{NodeStatus, ObjectStatus};

/// Resolves an object id to its backing resource.
pub type ResourceLookup<'a> = &'a dyn Fn(&str) -> Option<Resource>;

/// Side effects requested by the step logic.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowCommand {
    /// Send `job` under `task_id`, which is already recorded on the node.
    Dispatch { task_id: String, job: StepJob },
    Notify(NotifyJob),
}

/// Result of one call to [`step`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowStep {
    pub commands: Vec<FlowCommand>,
    /// The run changed and another step may be possible.
    pub progressed: bool,
}

impl FlowStep {
    fn idle() -> Self {
        Self::default()
    }
}

/// Perform the next transition of `run`, if any.
pub fn step(run: &mut FlowRun, lookup: ResourceLookup<'_>) -> FlowStep {
    let mut out = FlowStep::idle();
    if run.is_complete() {
        return out;
    }

    let Some(current) = current_step(run) else {
        let entry = run.graph.entry_index();
        let Some(node) = run.graph.node(entry) else {
            return out;
        };
        if node.status != NodeStatus::Queued {
            return out;
        }
        let task_type = node.task_type;

        out.progressed = true;
        match task_type {
            None => complete_run(run, Some(entry), &mut out),
            Some(task_type) => {
                // Alert-style entry nodes act on the flow run itself.
                let objects = if task_type.consumes_parent_objects() {
                    vec![FlowObject::working(run.id.clone(), Some(run.id.clone()))]
                } else {
                    Vec::new()
                };
                dispatch(run, entry, objects, lookup, &mut out);
            }
        }
        return out;
    };

    let Some(node) = run.graph.node(current) else {
        return out;
    };
    let end_on_fail = run.configs.end_on_fail;
    let status = node.status;
    let has_task = node.task_type.is_some();
    let condition = node
        .conditions
        .clone()
        .filter(|_| status != NodeStatus::Failed || !end_on_fail);
    out.progressed = true;

    if !has_task {
        complete_run(run, Some(current), &mut out);
    } else if let Some(condition) = condition {
        route(run, current, &condition, lookup, &mut out);
    } else {
        match status {
            NodeStatus::Passed => {
                finalize_node(run, current);
                continue_to_child(run, current, lookup, &mut out);
            }
            NodeStatus::Failed => {
                finalize_node(run, current);
                if end_on_fail {
                    complete_run(run, Some(current), &mut out);
                } else {
                    continue_to_child(run, current, lookup, &mut out);
                }
            }
            // Completed but explicitly reported as still working; wait for
            // the next report.
            NodeStatus::Queued | NodeStatus::Working => out.progressed = false,
        }
    }
    out
}

/// Most recently completed node that has not been finalized.
pub fn current_step(run: &FlowRun) -> Option<usize> {
    run.graph
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, n)| !n.finalized)
        .filter_map(|(i, n)| n.time_completed.map(|t| (t, i)))
        .max()
        .map(|(_, i)| i)
}

/// Split objects into (true, false) buckets by evaluating `condition` against
/// each object's backing resource. Every routed object gets a fresh parent
/// id. Objects without a resource are evaluated against `null`.
pub fn partition_objects(
    condition: &Condition,
    objects: &[FlowObject],
    lookup: ResourceLookup<'_>,
) -> (Vec<FlowObject>, Vec<FlowObject>) {
    let mut yes = Vec::new();
    let mut no = Vec::new();
    for object in objects {
        let data = object
            .id
            .as_deref()
            .and_then(lookup)
            .map(|r| r.data)
            .unwrap_or(Value::Null);
        let routed = FlowObject::working(Uuid::new_v4().to_string(), object.id.clone());
        if condition.evaluate(&data) {
            yes.push(routed);
        } else {
            no.push(routed);
        }
    }
    (yes, no)
}

fn route(
    run: &mut FlowRun,
    index: usize,
    condition: &Condition,
    lookup: ResourceLookup<'_>,
    out: &mut FlowStep,
) {
    finalize_node(run, index);

    let objects = run
        .graph
        .node(index)
        .map(|n| n.objects.clone())
        .unwrap_or_default();
    let (yes, no) = partition_objects(condition, &objects, lookup);

    let children = run.graph.children_of(index);
    let child_for = |branch: bool| {
        children
            .iter()
            .copied()
            .find(|&c| run.graph.node(c).is_some_and(|n| n.start_if == Some(branch)))
    };
    let (true_child, false_child) = (child_for(true), child_for(false));

    let mut dispatched = false;
    for (bucket, child) in [(yes, true_child), (no, false_child)] {
        if bucket.is_empty() {
            continue;
        }
        let Some(child) = child else { continue };
        let Some(task_type) = run.graph.node(child).and_then(|n| n.task_type) else {
            continue;
        };
        let objects = if task_type.consumes_parent_objects() {
            bucket
        } else {
            Vec::new()
        };
        dispatch(run, child, objects, lookup, out);
        dispatched = true;
    }

    if !dispatched {
        complete_run(run, Some(index), out);
    }
}

fn continue_to_child(
    run: &mut FlowRun,
    index: usize,
    lookup: ResourceLookup<'_>,
    out: &mut FlowStep,
) {
    let children = run.graph.children_of(index);
    let next = match children.as_slice() {
        [only] => run
            .graph
            .node(*only)
            .and_then(|n| n.task_type)
            .map(|t| (*only, t)),
        _ => None,
    };

    match next {
        Some((child, task_type)) => {
            let objects = if task_type.consumes_parent_objects() {
                run.graph
                    .node(index)
                    .map(|n| n.objects.clone())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            dispatch(run, child, objects, lookup, out);
        }
        None => complete_run(run, Some(index), out),
    }
}

fn finalize_node(run: &mut FlowRun, index: usize) {
    if let Some(node) = run.graph.node_mut(index) {
        node.finalized = true;
    }
}

fn dispatch(
    run: &mut FlowRun,
    index: usize,
    objects: Vec<FlowObject>,
    lookup: ResourceLookup<'_>,
    out: &mut FlowStep,
) {
    let Some(node) = run.graph.node_mut(index) else {
        return;
    };
    let Some(task_type) = node.task_type else {
        return;
    };

    let task_id = Uuid::new_v4().to_string();
    node.status = NodeStatus::Working;
    node.time_started = Some(Utc::now());
    node.time_completed = None;
    node.objects = if task_type.records_dispatched_objects() {
        objects.clone()
    } else {
        Vec::new()
    };
    node.step_task = Some(StepTask {
        task_id: task_id.clone(),
        attempts: 1,
        objects,
        reported: false,
    });

    let Some(job) = step_job(run, index) else {
        return;
    };
    let message = format!(
        "starting job ID: {} | job type is [ {} ]",
        job.node_id,
        task_type.as_str().to_uppercase()
    );

    run.graph.set_incoming_edge_animated(index, true);
    run.log(job.node_id.clone(), message);
    out.commands.push(FlowCommand::Dispatch { task_id, job });

    check_all_working_nodes(run, index, lookup);
}

/// Build the job for the step task recorded on node `index`.
pub fn step_job(run: &FlowRun, index: usize) -> Option<StepJob> {
    let node = run.graph.node(index)?;
    let task = node.step_task.as_ref()?;
    Some(StepJob {
        task_type: node.task_type?,
        flow_run_id: run.id.clone(),
        node_index: index,
        node_id: node.id.clone(),
        objects: task.objects.clone(),
        configs: node.configs.clone(),
        account_id: run.account_id.clone(),
        site: run.site.clone(),
    })
}

/// Complete every other working node whose backing resources have all
/// finished, without waiting for its own completion report.
///
/// Only nodes that track resources are considered; objects without an id or
/// whose resource is missing count as still working.
pub fn check_all_working_nodes(run: &mut FlowRun, skip: usize, lookup: ResourceLookup<'_>) {
    for index in 0..run.graph.len() {
        if index == skip {
            continue;
        }
        let Some(node) = run.graph.node(index) else {
            continue;
        };
        let Some(kind) = node.task_type.and_then(|t| t.resource_kind()) else {
            continue;
        };
        if node.status != NodeStatus::Working || node.objects.is_empty() {
            continue;
        }

        let mut outcomes = Vec::with_capacity(node.objects.len());
        for object in &node.objects {
            if object.status != ObjectStatus::Working {
                outcomes.push(object.status);
                continue;
            }
            let finished = object
                .id
                .as_deref()
                .and_then(lookup)
                .filter(|r| r.kind == kind && r.is_complete());
            match finished {
                Some(resource) => outcomes.push(ObjectStatus::from(resource.succeeded())),
                None => {
                    outcomes.clear();
                    break;
                }
            }
        }
        if outcomes.is_empty() {
            continue;
        }

        let Some(node) = run.graph.node_mut(index) else {
            continue;
        };
        for (object, status) in node.objects.iter_mut().zip(outcomes) {
            object.status = status;
        }
        node.status = node.derived_status();
        node.time_completed = Some(Utc::now());
        run.graph.set_incoming_edge_animated(index, false);
    }
}

/// Finish the run unless another node is still working.
fn complete_run(run: &mut FlowRun, current: Option<usize>, out: &mut FlowStep) {
    if let Some(node) = current.and_then(|i| run.graph.node_mut(i)) {
        node.finalized = true;
        if node.status == NodeStatus::Working {
            node.status = NodeStatus::Passed;
        }
    }

    let others_working = run
        .graph
        .nodes()
        .iter()
        .enumerate()
        .any(|(i, n)| Some(i) != current && n.status == NodeStatus::Working);
    if others_working {
        return;
    }

    let failed = run
        .graph
        .nodes()
        .iter()
        .any(|n| n.status == NodeStatus::Failed);
    let status = if failed {
        NodeStatus::Failed
    } else {
        NodeStatus::Passed
    };

    let step_id = current
        .and_then(|i| run.graph.node(i))
        .map(|n| n.id.clone())
        .or_else(|| last_completed_node_id(run))
        .unwrap_or_default();

    run.status = status;
    run.time_completed = Some(Utc::now());
    run.log(
        step_id,
        format!(
            "flowrun completed with status: {}",
            if failed { "❌ FAILED" } else { "✅ PASSED" }
        ),
    );

    let alert_id = current
        .and_then(|i| run.graph.node(i))
        .and_then(|n| n.alert_id.clone());
    if let Some(alert_id) = alert_id {
        out.commands.push(FlowCommand::Notify(NotifyJob {
            alert_id,
            flow_run_id: run.id.clone(),
        }));
    }
}

fn last_completed_node_id(run: &FlowRun) -> Option<String> {
    run.graph
        .nodes()
        .iter()
        .filter_map(|n| n.time_completed.map(|t| (t, n.id.clone())))
        .max()
        .map(|(_, id)| id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::condition::{Comparator, Literal};
    use crate::graph::{Edge, FlowGraph, Node};
    use crate::store::SiteRef;
    use crate::types::{ResourceKind, TaskType};

    fn run_of(nodes: Vec<Node>, edges: Vec<Edge>) -> FlowRun {
        FlowRun::new(
            "acct",
            SiteRef {
                id: "site-1".into(),
                url: "https://example.com".into(),
            },
            FlowGraph::new(nodes, edges).unwrap(),
        )
    }

    fn no_resources(_: &str) -> Option<Resource> {
        None
    }

    fn complete(run: &mut FlowRun, index: usize, status: NodeStatus) {
        let node = run.graph.node_mut(index).unwrap();
        node.status = status;
        node.time_completed = Some(Utc::now());
    }

    fn dispatched(step: &FlowStep) -> Vec<&StepJob> {
        step.commands
            .iter()
            .filter_map(|c| match c {
                FlowCommand::Dispatch { job, .. } => Some(job),
                FlowCommand::Notify(_) => None,
            })
            .collect()
    }

    #[test]
    fn entry_node_is_dispatched_once() {
        let mut run = run_of(vec![Node::new("1", Some(TaskType::Scan))], vec![]);

        let first = step(&mut run, &no_resources);
        assert!(first.progressed);
        assert_eq!(dispatched(&first).len(), 1);
        assert_eq!(run.graph.node(0).unwrap().status, NodeStatus::Working);
        assert!(run.graph.node(0).unwrap().time_started.is_some());

        let second = step(&mut run, &no_resources);
        assert!(!second.progressed);
        assert!(second.commands.is_empty());
    }

    #[test]
    fn dispatch_is_recorded_on_the_node() {
        let mut run = run_of(vec![Node::new("1", Some(TaskType::Slack))], vec![]);
        let out = step(&mut run, &no_resources);

        let Some(FlowCommand::Dispatch { task_id, job }) = out.commands.first() else {
            panic!("expected a dispatch, got {:?}", out.commands);
        };
        let task = run.graph.node(0).unwrap().step_task.clone().unwrap();
        assert_eq!(&task.task_id, task_id);
        assert_eq!(task.attempts, 1);
        assert!(!task.reported);
        assert_eq!(step_job(&run, 0).as_ref(), Some(job));
    }

    #[test]
    fn alert_entry_node_gets_the_flow_run_as_object() {
        let mut run = run_of(vec![Node::new("1", Some(TaskType::Slack))], vec![]);
        let out = step(&mut run, &no_resources);

        let job = dispatched(&out)[0];
        assert_eq!(job.objects.len(), 1);
        assert_eq!(job.objects[0].id.as_deref(), Some(run.id.as_str()));
    }

    #[test]
    fn entry_without_task_type_completes_the_run() {
        let mut run = run_of(vec![Node::new("1", None)], vec![]);
        step(&mut run, &no_resources);
        assert!(run.is_complete());
        assert_eq!(run.status, NodeStatus::Passed);
    }

    #[test]
    fn passed_node_dispatches_its_child_then_run_completes() {
        let mut run = run_of(
            vec![
                Node::new("1", Some(TaskType::Scan)),
                Node::new("2", Some(TaskType::Test)),
            ],
            vec![Edge::new("1", "2")],
        );
        step(&mut run, &no_resources);
        complete(&mut run, 0, NodeStatus::Passed);

        let out = step(&mut run, &no_resources);
        assert_eq!(dispatched(&out)[0].node_index, 1);
        assert!(run.graph.node(0).unwrap().finalized);
        assert!(run.graph.edges()[0].animated);

        complete(&mut run, 1, NodeStatus::Passed);
        step(&mut run, &no_resources);
        assert!(run.is_complete());
        assert_eq!(run.status, NodeStatus::Passed);
        assert!(run.logs.last().unwrap().message.contains("PASSED"));
    }

    #[test]
    fn failed_node_ends_run_when_end_on_fail() {
        let mut run = run_of(
            vec![
                Node::new("1", Some(TaskType::Scan)),
                Node::new("2", Some(TaskType::Test)),
            ],
            vec![Edge::new("1", "2")],
        );
        step(&mut run, &no_resources);
        complete(&mut run, 0, NodeStatus::Failed);

        let out = step(&mut run, &no_resources);
        assert!(dispatched(&out).is_empty());
        assert!(run.is_complete());
        assert_eq!(run.status, NodeStatus::Failed);
        assert_eq!(run.graph.node(1).unwrap().status, NodeStatus::Queued);
    }

    #[test]
    fn failed_node_continues_without_end_on_fail() {
        let mut run = run_of(
            vec![
                Node::new("1", Some(TaskType::Scan)),
                Node::new("2", Some(TaskType::Email)),
            ],
            vec![Edge::new("1", "2")],
        );
        run.configs.end_on_fail = false;
        step(&mut run, &no_resources);
        run.graph.node_mut(0).unwrap().objects =
            vec![FlowObject::working("site-1", Some("scan-1".into()))];
        complete(&mut run, 0, NodeStatus::Failed);

        let out = step(&mut run, &no_resources);
        let job = dispatched(&out)[0];
        assert_eq!(job.task_type, TaskType::Email);
        assert_eq!(job.objects.len(), 1, "alert children carry parent objects");
    }

    #[test]
    fn completion_is_deferred_while_another_node_works() {
        let mut root = Node::new("1", Some(TaskType::Scan));
        root.conditions = Some(Condition::comparison("health", Comparator::Ge, Literal::Number(50.0)));
        let mut yes = Node::new("2", Some(TaskType::Slack));
        yes.start_if = Some(true);
        let mut no = Node::new("3", Some(TaskType::Email));
        no.start_if = Some(false);
        let mut run = run_of(vec![root, yes, no], vec![Edge::new("1", "2"), Edge::new("1", "3")]);

        let mut resources = HashMap::new();
        for (id, health) in [("a", 90), ("b", 10)] {
            let mut r = Resource::new(ResourceKind::Scan, "acct", vec![]);
            r.id = id.to_string();
            r.data = serde_json::json!({ "health": health });
            resources.insert(id.to_string(), r);
        }
        let lookup = |id: &str| resources.get(id).cloned();

        step(&mut run, &lookup);
        run.graph.node_mut(0).unwrap().objects = vec![
            FlowObject::working("p1", Some("a".into())),
            FlowObject::working("p2", Some("b".into())),
        ];
        complete(&mut run, 0, NodeStatus::Passed);
        let out = step(&mut run, &lookup);
        assert_eq!(dispatched(&out).len(), 2);

        complete(&mut run, 1, NodeStatus::Passed);
        step(&mut run, &lookup);
        assert!(!run.is_complete(), "node 3 is still working");

        complete(&mut run, 2, NodeStatus::Passed);
        step(&mut run, &lookup);
        assert!(run.is_complete());
    }

    #[test]
    fn terminal_alert_is_requested_once() {
        let mut node = Node::new("1", Some(TaskType::Scan));
        node.alert_id = Some("alert-1".into());
        let mut run = run_of(vec![node], vec![]);
        step(&mut run, &no_resources);
        complete(&mut run, 0, NodeStatus::Passed);

        let out = step(&mut run, &no_resources);
        assert!(matches!(&out.commands[..], [FlowCommand::Notify(n)] if n.alert_id == "alert-1"));
        assert!(step(&mut run, &no_resources).commands.is_empty());
    }

    #[test]
    fn working_nodes_complete_when_their_resources_finish() {
        let mut run = run_of(
            vec![
                Node::new("1", Some(TaskType::Scan)),
                Node::new("2", Some(TaskType::Test)),
            ],
            vec![Edge::new("1", "2")],
        );
        let mut scan = Resource::new(ResourceKind::Scan, "acct", vec![]);
        scan.time_completed = Some(Utc::now());
        let scan_id = scan.id.clone();

        {
            let node = run.graph.node_mut(0).unwrap();
            node.status = NodeStatus::Working;
            node.objects = vec![FlowObject::working("site-1", Some(scan_id.clone()))];
        }
        check_all_working_nodes(&mut run, 1, &|id: &str| (id == scan_id).then(|| scan.clone()));

        let node = run.graph.node(0).unwrap();
        assert_eq!(node.status, NodeStatus::Passed);
        assert!(node.time_completed.is_some());
    }

    #[test]
    fn objects_without_ids_keep_nodes_working() {
        let mut run = run_of(vec![Node::new("1", Some(TaskType::Test))], vec![]);
        {
            let node = run.graph.node_mut(0).unwrap();
            node.status = NodeStatus::Working;
            node.objects = vec![FlowObject::working("site-1", None)];
        }
        check_all_working_nodes(&mut run, usize::MAX, &no_resources);
        assert_eq!(run.graph.node(0).unwrap().status, NodeStatus::Working);
    }
}
