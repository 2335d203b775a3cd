// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a node in a flow run (and of the run itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Queued,
    Working,
    Passed,
    Failed,
}

impl NodeStatus {
    /// `passed` or `failed`.
    pub fn is_done(self) -> bool {
        matches!(self, NodeStatus::Passed | NodeStatus::Failed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Queued => "queued",
            NodeStatus::Working => "working",
            NodeStatus::Passed => "passed",
            NodeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status of one object in a node's fan-out set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    #[default]
    Working,
    Passed,
    Failed,
}

impl From<bool> for ObjectStatus {
    fn from(success: bool) -> Self {
        if success {
            ObjectStatus::Passed
        } else {
            ObjectStatus::Failed
        }
    }
}

/// The job a node performs.
///
/// This is a closed set: every variant must have a handler in the
/// [`DispatchTable`](crate::dispatch::DispatchTable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Scan,
    Test,
    Case,
    Report,
    Issue,
    Email,
    Phone,
    Slack,
    Webhook,
}

impl TaskType {
    pub const ALL: [TaskType; 9] = [
        TaskType::Scan,
        TaskType::Test,
        TaskType::Case,
        TaskType::Report,
        TaskType::Issue,
        TaskType::Email,
        TaskType::Phone,
        TaskType::Slack,
        TaskType::Webhook,
    ];

    /// Task types that operate directly on their parent's result set instead
    /// of producing their own objects.
    pub fn consumes_parent_objects(self) -> bool {
        matches!(
            self,
            TaskType::Report
                | TaskType::Issue
                | TaskType::Email
                | TaskType::Phone
                | TaskType::Slack
                | TaskType::Webhook
        )
    }

    /// Report and issue nodes start with an empty object list; their handler
    /// registers the records it creates.
    pub fn records_dispatched_objects(self) -> bool {
        !matches!(self, TaskType::Report | TaskType::Issue)
    }

    pub fn is_notification(self) -> bool {
        matches!(
            self,
            TaskType::Email | TaskType::Phone | TaskType::Slack | TaskType::Webhook
        )
    }

    /// Backing record kind created by this task type, if any.
    pub fn resource_kind(self) -> Option<ResourceKind> {
        match self {
            TaskType::Scan => Some(ResourceKind::Scan),
            TaskType::Test => Some(ResourceKind::Test),
            TaskType::Case => Some(ResourceKind::CaseRun),
            TaskType::Report => Some(ResourceKind::Report),
            TaskType::Issue => Some(ResourceKind::Issue),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Scan => "scan",
            TaskType::Test => "test",
            TaskType::Case => "case",
            TaskType::Report => "report",
            TaskType::Issue => "issue",
            TaskType::Email => "email",
            TaskType::Phone => "phone",
            TaskType::Slack => "slack",
            TaskType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown task type: {s}"))
    }
}

/// Kind of backing record a job writes its results onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Scan,
    Test,
    CaseRun,
    Report,
    Issue,
}

impl ResourceKind {
    /// Usage counter consumed when a record of this kind is created.
    pub fn usage_kind(self) -> Option<UsageKind> {
        match self {
            ResourceKind::Scan => Some(UsageKind::Scans),
            ResourceKind::Test => Some(UsageKind::Tests),
            ResourceKind::CaseRun => Some(UsageKind::CaseRuns),
            ResourceKind::Report | ResourceKind::Issue => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Scan => "scan",
            ResourceKind::Test => "test",
            ResourceKind::CaseRun => "caserun",
            ResourceKind::Report => "report",
            ResourceKind::Issue => "issue",
        };
        f.write_str(s)
    }
}

/// Metered usage counters on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Scans,
    Tests,
    CaseRuns,
    FlowRuns,
}

impl fmt::Display for UsageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UsageKind::Scans => "scans",
            UsageKind::Tests => "tests",
            UsageKind::CaseRuns => "caseruns",
            UsageKind::FlowRuns => "flowruns",
        };
        f.write_str(s)
    }
}

impl FromStr for UsageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scans" => Ok(UsageKind::Scans),
            "tests" => Ok(UsageKind::Tests),
            "caseruns" => Ok(UsageKind::CaseRuns),
            "flowruns" => Ok(UsageKind::FlowRuns),
            other => Err(format!("unknown usage kind: {other}")),
        }
    }
}

/// Billing tier of an account.
///
/// - `Metered`: overage is allowed and reported to billing.
/// - `Capped`: allowance is a hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountTier {
    Metered,
    #[default]
    Capped,
}

/// Which [`Store`](crate::store::Store) implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Everything in process memory (lost on restart).
    #[default]
    Memory,
    /// JSON documents under `[store].path`.
    File,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_parses_case_insensitively() {
        assert_eq!("Webhook".parse::<TaskType>(), Ok(TaskType::Webhook));
        assert!("lighthouse".parse::<TaskType>().is_err());
    }

    #[test]
    fn alert_types_consume_parent_objects() {
        let consuming: Vec<_> = TaskType::ALL
            .into_iter()
            .filter(|t| t.consumes_parent_objects())
            .collect();
        assert_eq!(consuming.len(), 6);
        assert!(!TaskType::Scan.consumes_parent_objects());
        assert!(!TaskType::Report.records_dispatched_objects());
    }
}
