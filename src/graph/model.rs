// src/graph/model.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::{self, Condition};
use crate::errors::FlowError;
use crate::graph::validate::validate_graph;
use crate::types::{NodeStatus, ObjectStatus, TaskType};

/// One unit of work within a node's fan-out set (e.g. one scan of one site).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowObject {
    /// Identity used when merging updates into `objects[]`.
    pub parent: String,
    /// Backing record id; `None` until the job has created it.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: ObjectStatus,
}

impl FlowObject {
    pub fn working(parent: impl Into<String>, id: Option<String>) -> Self {
        Self {
            parent: parent.into(),
            id,
            status: ObjectStatus::Working,
        }
    }

    /// Objects without an id are never complete.
    pub fn is_complete(&self) -> bool {
        self.id.is_some() && self.status != ObjectStatus::Working
    }
}

/// A step in the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub objects: Vec<FlowObject>,
    #[serde(default, deserialize_with = "condition::deserialize_lenient")]
    pub conditions: Option<Condition>,
    /// Filled from the incoming edge when absent.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Which branch of a conditional parent this node belongs to.
    #[serde(default)]
    pub start_if: Option<bool>,
    /// Opaque handler configuration.
    #[serde(default)]
    pub configs: Map<String, Value>,
    /// Notification target invoked once if the run terminates on this node.
    #[serde(default)]
    pub alert_id: Option<String>,
    #[serde(default)]
    pub time_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_completed: Option<DateTime<Utc>>,
    /// One-way latch: the node will never be revisited by the executor.
    #[serde(default)]
    pub finalized: bool,
    /// The step job currently assigned to this node, persisted with the run
    /// so a job lost with its process can be sent again.
    #[serde(default)]
    pub step_task: Option<StepTask>,
}

/// Durable record of a node's step job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTask {
    pub task_id: String,
    /// Times the step job was sent, the first dispatch included.
    pub attempts: u32,
    /// Objects the job was dispatched with.
    #[serde(default)]
    pub objects: Vec<FlowObject>,
    /// A job for this node has reported back at least once.
    #[serde(default)]
    pub reported: bool,
}

impl Node {
    pub fn new(id: impl Into<String>, task_type: Option<TaskType>) -> Self {
        Self {
            id: id.into(),
            task_type,
            status: NodeStatus::Queued,
            objects: Vec::new(),
            conditions: None,
            parent_id: None,
            start_if: None,
            configs: Map::new(),
            alert_id: None,
            time_started: None,
            time_completed: None,
            finalized: false,
            step_task: None,
        }
    }

    /// Whether every object is non-working. An empty set is vacuously complete.
    pub fn objects_complete(&self) -> bool {
        self.objects.iter().all(FlowObject::is_complete)
    }

    /// Collective status of the object set.
    pub fn derived_status(&self) -> NodeStatus {
        if !self.objects_complete() {
            NodeStatus::Working
        } else if self.objects.iter().any(|o| o.status == ObjectStatus::Failed) {
            NodeStatus::Failed
        } else {
            NodeStatus::Passed
        }
    }

    /// Replace or append objects, keyed by `parent`.
    pub fn merge_objects(&mut self, updates: impl IntoIterator<Item = FlowObject>) {
        for update in updates {
            match self.objects.iter_mut().find(|o| o.parent == update.parent) {
                Some(existing) => *existing = update,
                None => self.objects.push(update),
            }
        }
    }
}

/// Presentation-only edge state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub animated: bool,
    #[serde(default)]
    pub style: Option<Value>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            animated: false,
            style: None,
        }
    }
}

/// Unvalidated graph as read from storage or a definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFlowGraph {
    #[serde(alias = "node")]
    pub nodes: Vec<Node>,
    #[serde(default, alias = "edge")]
    pub edges: Vec<Edge>,
}

/// Validated flow topology plus per-node execution state.
///
/// Topology (node order, ids, edges) is fixed at construction. Only node and
/// edge *state* is mutated afterwards, through the accessors below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFlowGraph")]
pub struct FlowGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    #[serde(skip)]
    entry: usize,
}

impl TryFrom<RawFlowGraph> for FlowGraph {
    type Error = FlowError;

    fn try_from(raw: RawFlowGraph) -> Result<Self, Self::Error> {
        FlowGraph::new(raw.nodes, raw.edges)
    }
}

impl FlowGraph {
    /// Validate and build a graph.
    pub fn new(mut nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self, FlowError> {
        let entry = validate_graph(&nodes, &edges)?;

        for node in nodes.iter_mut() {
            if node.parent_id.is_none() {
                node.parent_id = edges
                    .iter()
                    .find(|e| e.target == node.id)
                    .map(|e| e.source.clone());
            }
        }

        Ok(Self {
            nodes,
            edges,
            entry,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index)
    }

    /// Index of the single node without incoming edges.
    pub fn entry_index(&self) -> usize {
        self.entry
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Indexes of the direct children of `index`, in edge order.
    pub fn children_of(&self, index: usize) -> Vec<usize> {
        let Some(node) = self.nodes.get(index) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|e| e.source == node.id)
            .filter_map(|e| self.index_of(&e.target))
            .collect()
    }

    /// Update the presentation state of the edge leading into `index`.
    pub fn set_incoming_edge_animated(&mut self, index: usize, animated: bool) {
        let Some(target) = self.nodes.get(index).map(|n| n.id.clone()) else {
            return;
        };
        if let Some(edge) = self.edges.iter_mut().find(|e| e.target == target) {
            edge.animated = animated;
            edge.style = animated.then(|| serde_json::json!({ "stroke": "#60a5fa" }));
        }
    }
}
