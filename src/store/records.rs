// src/store/records.rs

//! Persisted documents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::graph::FlowGraph;
use crate::types::{AccountTier, NodeStatus, ResourceKind, UsageKind};

/// Current layout of [`FlowRun`] documents.
pub const FLOW_RUN_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    FLOW_RUN_SCHEMA_VERSION
}

/// The site a flow run audits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRef {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfigs {
    /// Finalize the whole run as `failed` on the first failed node.
    #[serde(default = "default_end_on_fail")]
    pub end_on_fail: bool,
}

fn default_end_on_fail() -> bool {
    true
}

impl Default for RunConfigs {
    fn default() -> Self {
        Self {
            end_on_fail: default_end_on_fail(),
        }
    }
}

/// Human-readable progress line shown to users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Id of the node the entry belongs to.
    pub step: String,
    pub message: String,
}

/// One execution of a flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Bumped by the store on every committed write.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub name: String,
    pub account_id: String,
    pub site: SiteRef,
    pub graph: FlowGraph,
    #[serde(default)]
    pub configs: RunConfigs,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub time_created: DateTime<Utc>,
    #[serde(default)]
    pub time_completed: Option<DateTime<Utc>>,
}

impl FlowRun {
    pub fn new(account_id: impl Into<String>, site: SiteRef, graph: FlowGraph) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            schema_version: FLOW_RUN_SCHEMA_VERSION,
            revision: 0,
            name: String::new(),
            account_id: account_id.into(),
            site,
            graph,
            configs: RunConfigs::default(),
            status: NodeStatus::Queued,
            logs: Vec::new(),
            time_created: Utc::now(),
            time_completed: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.time_completed.is_some()
    }

    pub fn log(&mut self, step: impl Into<String>, message: impl Into<String>) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            step: step.into(),
            message: message.into(),
        });
    }
}

/// Ledger entry for one component of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub component: String,
    pub task_id: String,
    pub attempts: u32,
    #[serde(default)]
    pub kwargs: Value,
}

/// Back-reference from a resource to the flow node that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRef {
    pub flow_run_id: String,
    pub node_index: usize,
    /// `FlowObject::parent` of the object tracking this resource.
    pub parent: String,
}

/// Backing record of a unit of work (a scan, a test, a case run, ...).
///
/// The `data` document is owned by the collaborator that performs the work;
/// conditions read it, the orchestration core never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    pub account_id: String,
    /// Components requested for this record (e.g. `html`, `lighthouse`).
    #[serde(default)]
    pub components: Vec<String>,
    /// Per-component results; an absent or null entry means "not produced".
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    /// Task ledger.
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub configs: Map<String, Value>,
    /// Final outcome once complete; `None` means passed.
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub flow_refs: Vec<FlowRef>,
    /// Records waiting for this one before their components can start.
    #[serde(default)]
    pub dependents: Vec<String>,
    pub time_created: DateTime<Utc>,
    #[serde(default)]
    pub time_completed: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(kind: ResourceKind, account_id: impl Into<String>, components: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            account_id: account_id.into(),
            components,
            results: BTreeMap::new(),
            tasks: Vec::new(),
            data: Value::Object(Map::new()),
            configs: Map::new(),
            success: None,
            flow_refs: Vec::new(),
            dependents: Vec::new(),
            time_created: Utc::now(),
            time_completed: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.time_completed.is_some()
    }

    pub fn has_result(&self, component: &str) -> bool {
        self.results.get(component).is_some_and(|v| !v.is_null())
    }

    pub fn task(&self, component: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.component == component)
    }

    /// Every requested component has produced a result.
    pub fn all_results_present(&self) -> bool {
        self.components.iter().all(|c| self.has_result(c))
    }

    /// Outcome used when the record completes; defaults to passed.
    pub fn succeeded(&self) -> bool {
        self.success.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub used: u64,
    pub allowed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub tier: AccountTier,
    /// Unfunded accounts may not create new work.
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub usage: BTreeMap<UsageKind, Usage>,
}

fn default_active() -> bool {
    true
}

impl Account {
    pub fn new(id: impl Into<String>, tier: AccountTier) -> Self {
        Self {
            id: id.into(),
            tier,
            active: true,
            usage: BTreeMap::new(),
        }
    }

    pub fn with_allowance(mut self, kind: UsageKind, allowed: u64) -> Self {
        self.usage.entry(kind).or_default().allowed = allowed;
        self
    }
}
