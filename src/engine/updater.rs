// src/engine/updater.rs

use chrono::Utc;
use tracing::debug;

use crate::errors::{FlowError, Result};
use crate::graph::FlowObject;
use crate::store::FlowRun;
use crate::types::NodeStatus;

/// Progress reported by a job for one node of a flow run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub node_index: usize,
    /// Explicit status. When absent the status is derived from the objects.
    pub status: Option<NodeStatus>,
    /// Merged into the node's objects by `parent`, last writer wins.
    pub objects: Vec<FlowObject>,
    /// Comma-separated log messages.
    pub message: Option<String>,
}

impl NodeUpdate {
    pub fn new(node_index: usize) -> Self {
        Self {
            node_index,
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_objects(mut self, objects: Vec<FlowObject>) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Apply `update` to `run`. Completed runs are left untouched.
pub fn apply_node_update(run: &mut FlowRun, update: &NodeUpdate) -> Result<()> {
    if run.is_complete() {
        debug!(flow_run_id = %run.id, node_index = update.node_index, "ignoring update for completed run");
        return Ok(());
    }

    let run_id = run.id.clone();
    let node = run
        .graph
        .node_mut(update.node_index)
        .ok_or_else(|| FlowError::NodeNotFound {
            flow_run_id: run_id,
            index: update.node_index,
        })?;

    if !update.objects.is_empty() {
        node.merge_objects(update.objects.iter().cloned());
    }
    if let Some(task) = node.step_task.as_mut() {
        task.reported = true;
    }

    // The executor has moved past a finalized node; its outcome is fixed.
    let finalized = node.finalized;
    if !finalized {
        let now = Utc::now();
        match update.status {
            Some(status) => {
                node.status = status;
                if status != NodeStatus::Working {
                    node.time_completed = Some(now);
                }
            }
            None => {
                if node.objects_complete() {
                    node.status = node.derived_status();
                    node.time_completed = Some(now);
                } else {
                    node.status = NodeStatus::Working;
                    node.time_completed = None;
                }
            }
        }
    }

    let status = node.status;
    let step = node.id.clone();
    if !finalized {
        run.graph
            .set_incoming_edge_animated(update.node_index, status == NodeStatus::Working);
    }

    if let Some(message) = &update.message {
        for part in message.split(',').map(str::trim).filter(|m| !m.is_empty()) {
            run.log(step.clone(), part);
        }
    }

    debug!(
        flow_run_id = %run.id,
        node_index = update.node_index,
        %status,
        finalized,
        "node updated"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, FlowGraph, Node};
    use crate::store::SiteRef;
    use crate::types::{ObjectStatus, TaskType};

    fn run() -> FlowRun {
        let graph = FlowGraph::new(
            vec![
                Node::new("1", Some(TaskType::Scan)),
                Node::new("2", Some(TaskType::Test)),
            ],
            vec![Edge::new("1", "2")],
        )
        .unwrap();
        FlowRun::new(
            "acct",
            SiteRef {
                id: "s".into(),
                url: "https://example.com".into(),
            },
            graph,
        )
    }

    fn object(parent: &str, status: ObjectStatus) -> FlowObject {
        FlowObject {
            parent: parent.into(),
            id: Some(format!("id-{parent}")),
            status,
        }
    }

    #[test]
    fn derived_status_waits_for_every_object() {
        let mut run = run();
        apply_node_update(
            &mut run,
            &NodeUpdate::new(1).with_objects(vec![
                object("a", ObjectStatus::Passed),
                object("b", ObjectStatus::Working),
            ]),
        )
        .unwrap();
        let node = run.graph.node(1).unwrap();
        assert_eq!(node.status, NodeStatus::Working);
        assert!(node.time_completed.is_none());
        assert!(run.graph.edges()[0].animated);

        apply_node_update(
            &mut run,
            &NodeUpdate::new(1).with_objects(vec![object("b", ObjectStatus::Failed)]),
        )
        .unwrap();
        let node = run.graph.node(1).unwrap();
        assert_eq!(node.objects.len(), 2, "merged by parent");
        assert_eq!(node.status, NodeStatus::Failed);
        assert!(node.time_completed.is_some());
        assert!(!run.graph.edges()[0].animated);
    }

    #[test]
    fn empty_object_set_is_vacuously_passed() {
        let mut run = run();
        apply_node_update(&mut run, &NodeUpdate::new(0)).unwrap();
        assert_eq!(run.graph.node(0).unwrap().status, NodeStatus::Passed);
    }

    #[test]
    fn explicit_status_and_split_messages() {
        let mut run = run();
        apply_node_update(
            &mut run,
            &NodeUpdate::new(0)
                .with_status(NodeStatus::Failed)
                .with_message("max scans reached, upgrade plan"),
        )
        .unwrap();
        assert_eq!(run.graph.node(0).unwrap().status, NodeStatus::Failed);
        let messages: Vec<_> = run.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["max scans reached", "upgrade plan"]);
    }

    #[test]
    fn finalized_node_keeps_its_outcome() {
        let mut run = run();
        apply_node_update(
            &mut run,
            &NodeUpdate::new(0).with_objects(vec![
                object("a", ObjectStatus::Working),
                object("b", ObjectStatus::Failed),
            ]),
        )
        .unwrap();
        apply_node_update(
            &mut run,
            &NodeUpdate::new(0).with_objects(vec![object("a", ObjectStatus::Passed)]),
        )
        .unwrap();
        let node = run.graph.node_mut(0).unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        node.finalized = true;
        let completed_at = node.time_completed;

        // A late report that would re-derive the status as passed.
        apply_node_update(
            &mut run,
            &NodeUpdate::new(0)
                .with_objects(vec![object("b", ObjectStatus::Passed)])
                .with_message("late result"),
        )
        .unwrap();
        let node = run.graph.node(0).unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.time_completed, completed_at);
        assert_eq!(node.objects[1].status, ObjectStatus::Passed, "objects still merge");
        assert_eq!(run.logs.last().map(|l| l.message.as_str()), Some("late result"));

        apply_node_update(
            &mut run,
            &NodeUpdate::new(0).with_status(NodeStatus::Passed),
        )
        .unwrap();
        assert_eq!(run.graph.node(0).unwrap().status, NodeStatus::Failed);
    }

    #[test]
    fn unknown_node_is_an_error() {
        let mut run = run();
        assert!(matches!(
            apply_node_update(&mut run, &NodeUpdate::new(9)),
            Err(FlowError::NodeNotFound { index: 9, .. })
        ));
    }
}
