#![allow(dead_code)]

use auditflow::condition::{Comparator, Condition, Literal};
use auditflow::graph::{Edge, FlowDefinition, FlowGraph, Node};
use auditflow::store::{Account, FlowRun, SiteRef};
use auditflow::types::{AccountTier, TaskType, UsageKind};
use serde_json::Value;

/// Builder for `FlowGraph` to simplify test setup.
///
/// Nodes are added in order; `after` wires an edge from an existing node.
pub struct GraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    end_on_fail: bool,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            end_on_fail: true,
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    /// Add `node` as a child of `parent`.
    pub fn after(self, parent: &str, node: Node) -> Self {
        let target = node.id.clone();
        self.node(node).edge(parent, &target)
    }

    pub fn end_on_fail(mut self, val: bool) -> Self {
        self.end_on_fail = val;
        self
    }

    pub fn build(self) -> FlowGraph {
        FlowGraph::new(self.nodes, self.edges).expect("Failed to build valid graph from builder")
    }

    pub fn definition(self, name: &str) -> FlowDefinition {
        let end_on_fail = self.end_on_fail;
        FlowDefinition {
            name: name.to_string(),
            end_on_fail,
            graph: self.build(),
        }
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `Node`.
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    pub fn new(id: &str, task_type: TaskType) -> Self {
        Self {
            node: Node::new(id, Some(task_type)),
        }
    }

    /// A node without task type.
    pub fn empty(id: &str) -> Self {
        Self {
            node: Node::new(id, None),
        }
    }

    pub fn conditions(mut self, condition: Condition) -> Self {
        self.node.conditions = Some(condition);
        self
    }

    pub fn start_if(mut self, val: bool) -> Self {
        self.node.start_if = Some(val);
        self
    }

    pub fn config(mut self, key: &str, value: Value) -> Self {
        self.node.configs.insert(key.to_string(), value);
        self
    }

    pub fn alert(mut self, alert_id: &str) -> Self {
        self.node.alert_id = Some(alert_id.to_string());
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}

/// `field <op> number`.
pub fn compare(field: &str, op: Comparator, value: f64) -> Condition {
    Condition::comparison(field, op, Literal::Number(value))
}

pub fn site() -> SiteRef {
    SiteRef {
        id: "site-1".to_string(),
        url: "https://example.com".to_string(),
    }
}

pub fn flow_run(graph: FlowGraph) -> FlowRun {
    FlowRun::new("acct", site(), graph)
}

/// Capped account with generous allowances for every usage kind.
pub fn roomy_account(id: &str) -> Account {
    [UsageKind::Scans, UsageKind::Tests, UsageKind::CaseRuns, UsageKind::FlowRuns]
        .into_iter()
        .fold(Account::new(id, AccountTier::Capped), |account, kind| {
            account.with_allowance(kind, 1_000)
        })
}
