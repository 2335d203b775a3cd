// src/dispatch/mod.rs

//! Job dispatch contract.
//!
//! The orchestration core never runs audit tools or notification channels
//! itself. It hands [`Job`]s to a [`Dispatcher`] (fire-and-forget) and workers
//! look up the handler for each job in the [`DispatchTable`].
//!
//! - [`queue`] is the in-process job queue used by `auditflow` workers; it
//!   also answers "which task ids are in flight" for the reconciler.
//! - [`simulated`] provides stand-in handlers so flows can run locally.

pub mod queue;
pub mod simulated;

use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{FlowError, Result};
use crate::gate::ResourceGate;
use crate::graph::FlowObject;
use crate::store::{FlowRef, FlowRun, Resource, SiteRef, Store};
use crate::types::{ResourceKind, TaskType};

pub use queue::{JobQueue, JobReceiver};

/// Execute one node of a flow run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepJob {
    pub task_type: TaskType,
    pub flow_run_id: String,
    pub node_index: usize,
    pub node_id: String,
    pub objects: Vec<FlowObject>,
    pub configs: Map<String, Value>,
    pub account_id: String,
    pub site: SiteRef,
}

/// Produce one component result of a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentJob {
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub component: String,
    pub kwargs: Value,
}

/// Send the terminal notification of a flow run.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyJob {
    pub alert_id: String,
    pub flow_run_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Step(StepJob),
    Component(ComponentJob),
    Notify(NotifyJob),
}

impl Job {
    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            Job::Step(j) => format!("step:{}:{}", j.task_type, j.node_id),
            Job::Component(j) => format!("component:{}:{}", j.resource_kind, j.component),
            Job::Notify(j) => format!("notify:{}", j.alert_id),
        }
    }
}

/// A job plus the task id the queue assigned to it.
#[derive(Debug, Clone)]
pub struct JobEnvelope {
    pub task_id: String,
    pub job: Job,
}

/// Enqueue jobs without waiting for them to run.
pub trait Dispatcher: Send + Sync + Debug {
    /// Enqueue `job` under a task id the caller has already recorded.
    fn dispatch_as(&self, task_id: String, job: Job) -> Result<()>;

    /// Enqueue `job` under a fresh task id and return it.
    fn dispatch(&self, job: Job) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        self.dispatch_as(task_id.clone(), job)?;
        Ok(task_id)
    }
}

/// Which task ids the queue considers in flight (queued or running).
pub trait QueueIntrospector: Send + Sync + Debug {
    fn active_task_ids(&self) -> Result<HashSet<String>>;
}

/// Future returned by handlers.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// What a step handler reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub success: bool,
    /// Objects the step created or finished. Working objects keep the node
    /// working until their resources complete.
    pub objects: Vec<FlowObject>,
    /// Comma-separated messages for the flow run log.
    pub message: Option<String>,
    /// Resources whose components the worker dispatches once this output is
    /// committed to the flow run.
    pub start: Vec<String>,
}

impl StepOutput {
    pub fn done(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// What a component handler produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentOutput {
    /// Stored under `results[component]`; `null` counts as not produced.
    pub result: Value,
    /// Merged into the resource's `data` document.
    pub data: Map<String, Value>,
    pub success: bool,
}

/// Runs the job behind a node task type.
pub trait StepHandler: Send + Sync {
    fn run<'a>(&'a self, ctx: &'a JobContext, job: &'a StepJob) -> HandlerFuture<'a, StepOutput>;
}

/// Produces one component of a resource.
pub trait ComponentHandler: Send + Sync {
    fn run<'a>(
        &'a self,
        ctx: &'a JobContext,
        resource: &'a Resource,
        job: &'a ComponentJob,
    ) -> HandlerFuture<'a, ComponentOutput>;
}

/// Delivers `alert_id` notifications.
pub trait Notifier: Send + Sync {
    fn notify<'a>(
        &'a self,
        ctx: &'a JobContext,
        alert_id: &'a str,
        run: &'a FlowRun,
    ) -> HandlerFuture<'a, ()>;
}

/// Services available to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub store: Arc<dyn Store>,
    pub gate: ResourceGate,
    pub dispatcher: Arc<dyn Dispatcher>,
}

impl JobContext {
    /// Create a resource for one object of a step.
    ///
    /// The account's allowance for `kind` is checked first; the resource is
    /// linked back to the node so its completion advances the flow run.
    /// Nothing is dispatched here: list the id in [`StepOutput::start`], or
    /// let a resource naming it in `dependents` start it.
    pub fn create_resource(
        &self,
        job: &StepJob,
        parent: &str,
        kind: ResourceKind,
        components: Vec<String>,
    ) -> Result<Resource> {
        if let Some(usage) = kind.usage_kind() {
            self.gate.require(&job.account_id, usage)?;
        }

        let mut resource = Resource::new(kind, job.account_id.clone(), components);
        resource.configs = job.configs.clone();
        resource.flow_refs.push(FlowRef {
            flow_run_id: job.flow_run_id.clone(),
            node_index: job.node_index,
            parent: parent.to_string(),
        });
        self.store.insert_resource(resource.clone())?;
        debug!(resource_id = %resource.id, %kind, parent, "resource created");
        Ok(resource)
    }
}

/// Dispatch a component job for each name in `components`.
pub fn dispatch_components(
    dispatcher: &dyn Dispatcher,
    resource: &Resource,
    components: &[String],
) -> Result<Vec<String>> {
    let kwargs = Value::Object(resource.configs.clone());
    components
        .iter()
        .map(|component| {
            let task_id = dispatcher.dispatch(Job::Component(ComponentJob {
                resource_kind: resource.kind,
                resource_id: resource.id.clone(),
                component: component.clone(),
                kwargs: kwargs.clone(),
            }))?;
            debug!(resource_id = %resource.id, %component, %task_id, "component dispatched");
            Ok(task_id)
        })
        .collect()
}

/// Explicit map from task type / resource kind to handler, built at startup.
#[derive(Default, Clone)]
pub struct DispatchTable {
    steps: BTreeMap<TaskType, Arc<dyn StepHandler>>,
    components: BTreeMap<ResourceKind, Arc<dyn ComponentHandler>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, task_type: TaskType, handler: Arc<dyn StepHandler>) -> Self {
        self.steps.insert(task_type, handler);
        self
    }

    pub fn with_component(
        mut self,
        kind: ResourceKind,
        handler: Arc<dyn ComponentHandler>,
    ) -> Self {
        self.components.insert(kind, handler);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn step(&self, task_type: TaskType) -> Result<Arc<dyn StepHandler>> {
        self.steps
            .get(&task_type)
            .cloned()
            .ok_or_else(|| FlowError::MissingHandler(format!("task type '{task_type}'")))
    }

    pub fn component(&self, kind: ResourceKind) -> Result<Arc<dyn ComponentHandler>> {
        self.components
            .get(&kind)
            .cloned()
            .ok_or_else(|| FlowError::MissingHandler(format!("resource kind '{kind}'")))
    }

    pub fn notifier(&self) -> Result<Arc<dyn Notifier>> {
        self.notifier
            .clone()
            .ok_or_else(|| FlowError::MissingHandler("notifier".to_string()))
    }

    /// Task types without a registered step handler.
    pub fn missing_step_handlers(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| !self.steps.contains_key(t))
            .collect()
    }
}
