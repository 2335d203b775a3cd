// src/graph/validate.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{FlowError, Result};
use crate::graph::model::{Edge, Node};

/// Check the topology invariants of a flow graph and return the entry index.
///
/// This checks:
/// - there is at least one node and node ids are unique
/// - every edge refers to known nodes and is not a self-loop
/// - exactly one node has no incoming edge and none has more than one
/// - the graph has no cycles
/// - a node without conditions has at most one child
/// - a conditional node has at most one child per `start_if` value, and each
///   of its children declares `start_if`
/// - every condition is structurally valid
pub fn validate_graph(nodes: &[Node], edges: &[Edge]) -> Result<usize> {
    if nodes.is_empty() {
        return Err(invalid("flow graph must contain at least one node"));
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        if index.insert(node.id.as_str(), i).is_some() {
            return Err(invalid(format!("duplicate node id '{}'", node.id)));
        }
    }

    // Edge direction: source -> target.
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for i in 0..nodes.len() {
        graph.add_node(i);
    }
    for edge in edges {
        let source = *index
            .get(edge.source.as_str())
            .ok_or_else(|| invalid(format!("edge from unknown node '{}'", edge.source)))?;
        let target = *index
            .get(edge.target.as_str())
            .ok_or_else(|| invalid(format!("edge to unknown node '{}'", edge.target)))?;
        if source == target {
            return Err(invalid(format!("node '{}' has an edge to itself", edge.source)));
        }
        graph.add_edge(source, target, ());
    }

    let entries: Vec<usize> = (0..nodes.len())
        .filter(|&i| {
            graph
                .neighbors_directed(i, petgraph::Direction::Incoming)
                .next()
                .is_none()
        })
        .collect();
    let entry = match entries.as_slice() {
        [single] => *single,
        [] => return Err(invalid("flow graph has no entry node")),
        many => {
            let ids: Vec<&str> = many.iter().map(|&i| nodes[i].id.as_str()).collect();
            return Err(invalid(format!("flow graph has several entry nodes: {ids:?}")));
        }
    };

    if let Err(cycle) = toposort(&graph, None) {
        return Err(invalid(format!(
            "cycle detected in flow graph involving node '{}'",
            nodes[cycle.node_id()].id
        )));
    }

    for (i, node) in nodes.iter().enumerate() {
        let parents = graph
            .neighbors_directed(i, petgraph::Direction::Incoming)
            .count();
        if parents > 1 {
            return Err(invalid(format!(
                "node '{}' has {parents} incoming edges; a node has one parent",
                node.id
            )));
        }
    }

    for (i, node) in nodes.iter().enumerate() {
        let children: Vec<usize> = graph
            .neighbors_directed(i, petgraph::Direction::Outgoing)
            .collect();

        match &node.conditions {
            None if children.len() > 1 => {
                return Err(invalid(format!(
                    "node '{}' has {} children but no conditions",
                    node.id,
                    children.len()
                )));
            }
            None => {}
            Some(condition) => {
                condition.validate()?;
                let mut seen = HashSet::new();
                for child in children {
                    let child = &nodes[child];
                    let Some(branch) = child.start_if else {
                        return Err(invalid(format!(
                            "child '{}' of conditional node '{}' has no start_if",
                            child.id, node.id
                        )));
                    };
                    if !seen.insert(branch) {
                        return Err(invalid(format!(
                            "conditional node '{}' has two children with start_if = {}",
                            node.id, branch
                        )));
                    }
                }
            }
        }
    }

    Ok(entry)
}

fn invalid(msg: impl Into<String>) -> FlowError {
    FlowError::InvalidGraph(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Comparator, Condition, Literal};
    use crate::types::TaskType;

    fn node(id: &str) -> Node {
        Node::new(id, Some(TaskType::Scan))
    }

    #[test]
    fn linear_chain_is_valid_and_entry_is_found() {
        let nodes = vec![node("2"), node("1")];
        let edges = vec![Edge::new("1", "2")];
        assert_eq!(validate_graph(&nodes, &edges).unwrap(), 1);
    }

    #[test]
    fn cycles_are_rejected() {
        let nodes = vec![node("0"), node("1"), node("2")];
        let edges = vec![Edge::new("0", "1"), Edge::new("1", "2"), Edge::new("2", "1")];
        let err = validate_graph(&nodes, &edges).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn unconditional_fan_out_is_rejected() {
        let nodes = vec![node("1"), node("2"), node("3")];
        let edges = vec![Edge::new("1", "2"), Edge::new("1", "3")];
        assert!(validate_graph(&nodes, &edges).is_err());
    }

    #[test]
    fn conditional_children_need_distinct_branches() {
        let mut root = node("1");
        root.conditions = Some(Condition::comparison(
            "score",
            Comparator::Ge,
            Literal::Number(90.0),
        ));
        let mut yes = node("2");
        yes.start_if = Some(true);
        let mut also_yes = node("3");
        also_yes.start_if = Some(true);

        let edges = vec![Edge::new("1", "2"), Edge::new("1", "3")];
        assert!(validate_graph(&[root.clone(), yes.clone(), also_yes.clone()], &edges).is_err());

        also_yes.start_if = Some(false);
        assert_eq!(validate_graph(&[root, yes, also_yes], &edges).unwrap(), 0);
    }

    #[test]
    fn joins_are_rejected() {
        let mut root = node("1");
        root.conditions = Some(Condition::comparison("x", Comparator::Eq, Literal::Bool(true)));
        let mut yes = node("2");
        yes.start_if = Some(true);
        let mut no = node("3");
        no.start_if = Some(false);
        let edges = vec![
            Edge::new("1", "2"),
            Edge::new("1", "3"),
            Edge::new("2", "4"),
            Edge::new("3", "4"),
        ];
        let err = validate_graph(&[root, yes, no, node("4")], &edges).unwrap_err();
        assert!(err.to_string().contains("incoming edges"), "{err}");
    }

    #[test]
    fn two_entries_are_rejected() {
        let nodes = vec![node("1"), node("2")];
        assert!(validate_graph(&nodes, &[]).is_err());
    }
}
