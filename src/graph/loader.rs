// src/graph/loader.rs

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::errors::Result;
use crate::graph::model::{Edge, FlowGraph, Node};

/// A reusable flow: its graph plus run-level options.
///
/// Definition files are TOML (default) or JSON (`.json` extension):
///
/// ```toml
/// name = "nightly audit"
/// end_on_fail = false
///
/// [[node]]
/// id = "1"
/// task_type = "scan"
///
/// [[node]]
/// id = "2"
/// task_type = "test"
///
/// [[edge]]
/// source = "1"
/// target = "2"
/// ```
#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub name: String,
    pub end_on_fail: bool,
    pub graph: FlowGraph,
}

#[derive(Debug, Deserialize)]
struct RawFlowDefinition {
    #[serde(default)]
    name: String,
    #[serde(default = "default_end_on_fail")]
    end_on_fail: bool,
    #[serde(alias = "node")]
    nodes: Vec<Node>,
    #[serde(default, alias = "edge")]
    edges: Vec<Edge>,
}

fn default_end_on_fail() -> bool {
    true
}

impl FlowDefinition {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawFlowDefinition = toml::from_str(contents)?;
        Self::from_raw(raw)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let raw: RawFlowDefinition = serde_json::from_str(contents)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawFlowDefinition) -> Result<Self> {
        Ok(Self {
            name: raw.name,
            end_on_fail: raw.end_on_fail,
            graph: FlowGraph::new(raw.nodes, raw.edges)?,
        })
    }
}

/// Load and validate a flow definition file.
pub fn load_flow_definition(path: impl AsRef<Path>) -> Result<FlowDefinition> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        FlowDefinition::from_json_str(&contents)
    } else {
        FlowDefinition::from_toml_str(&contents)
    }
}
