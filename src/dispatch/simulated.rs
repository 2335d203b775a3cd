// src/dispatch/simulated.rs

//! Stand-in handlers used by the `auditflow` binary.
//!
//! They create real resources, consume real quota and walk the real
//! completion paths, but produce canned results instead of auditing
//! anything. Node `configs` steer them:
//!
//! - `pages`: list of URLs a scan fans out over (default: the site URL).
//! - `simulate_failure`: the step handler returns an error.
//! - `simulate_data`: object merged into every component's `data`.
//! - `simulate_component_failure`: components report `success = false`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch::{
    ComponentHandler, ComponentJob, ComponentOutput, DispatchTable, HandlerFuture, JobContext,
    Notifier, StepHandler, StepJob, StepOutput,
};
use crate::errors::{FlowError, Result};
use crate::graph::FlowObject;
use crate::store::{FlowRun, Resource};
use crate::types::{ObjectStatus, ResourceKind, TaskType};

pub const SCAN_COMPONENTS: [&str; 2] = ["html", "lighthouse"];
pub const TEST_COMPONENTS: [&str; 1] = ["vrt"];
pub const CASE_COMPONENTS: [&str; 1] = ["steps"];

impl DispatchTable {
    /// Every task type, resource kind and the notifier wired to simulated
    /// handlers.
    pub fn simulated(component_delay: Duration) -> Self {
        let components = Arc::new(SimulatedComponent {
            delay: component_delay,
        });
        let mut table = DispatchTable::new()
            .with_step(TaskType::Scan, Arc::new(ScanStep))
            .with_step(TaskType::Test, Arc::new(TestStep))
            .with_step(TaskType::Case, Arc::new(CaseStep))
            .with_step(TaskType::Report, Arc::new(RecordStep))
            .with_step(TaskType::Issue, Arc::new(RecordStep))
            .with_notifier(Arc::new(LogNotifier));
        for task_type in TaskType::ALL.into_iter().filter(|t| t.is_notification()) {
            table = table.with_step(task_type, Arc::new(NotificationStep));
        }
        for kind in [
            ResourceKind::Scan,
            ResourceKind::Test,
            ResourceKind::CaseRun,
            ResourceKind::Report,
            ResourceKind::Issue,
        ] {
            table = table.with_component(kind, components.clone());
        }
        table
    }
}

fn flag(configs: &Map<String, Value>, key: &str) -> bool {
    configs.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn check_failure(job: &StepJob) -> Result<()> {
    if flag(&job.configs, "simulate_failure") {
        return Err(FlowError::HandlerFailed {
            task: job.task_type.to_string(),
            reason: "simulated failure".to_string(),
        });
    }
    Ok(())
}

fn names(components: &[&str]) -> Vec<String> {
    components.iter().map(|c| c.to_string()).collect()
}

/// One scan resource per page.
#[derive(Debug)]
pub struct ScanStep;

impl StepHandler for ScanStep {
    fn run<'a>(&'a self, ctx: &'a JobContext, job: &'a StepJob) -> HandlerFuture<'a, StepOutput> {
        Box::pin(async move {
            check_failure(job)?;

            let pages: Vec<String> = match job.configs.get("pages").and_then(Value::as_array) {
                Some(pages) => pages
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                None => vec![job.site.url.clone()],
            };

            // A page the gate refuses fails on its own; scans already
            // created for earlier pages still run and are reported.
            let mut objects = Vec::with_capacity(pages.len());
            let mut start = Vec::with_capacity(pages.len());
            let mut refusals = Vec::new();
            for page in &pages {
                match ctx.create_resource(job, page, ResourceKind::Scan, names(&SCAN_COMPONENTS)) {
                    Ok(resource) => {
                        start.push(resource.id.clone());
                        objects.push(FlowObject::working(page.clone(), Some(resource.id)));
                    }
                    Err(e) if start.is_empty() && !matches!(e, FlowError::QuotaExhausted { .. }) => {
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(page = %page, error = %e, "scan not created; failing page");
                        objects.push(FlowObject {
                            parent: page.clone(),
                            id: Some(job.flow_run_id.clone()),
                            status: ObjectStatus::Failed,
                        });
                        refusals.push(format!("{page}: {e}"));
                    }
                }
            }

            let mut message = format!("started {} scan(s)", start.len());
            for refusal in &refusals {
                message.push_str(", ");
                message.push_str(&refusal.replace(',', ";"));
            }
            Ok(StepOutput {
                success: refusals.is_empty(),
                objects,
                message: Some(message),
                start,
            })
        })
    }
}

/// A test plus the post-scan it compares against. The test's components
/// start once the post-scan completes.
#[derive(Debug)]
pub struct TestStep;

impl StepHandler for TestStep {
    fn run<'a>(&'a self, ctx: &'a JobContext, job: &'a StepJob) -> HandlerFuture<'a, StepOutput> {
        Box::pin(async move {
            check_failure(job)?;

            let parent = job.site.url.clone();
            let test =
                ctx.create_resource(job, &parent, ResourceKind::Test, names(&TEST_COMPONENTS))?;

            let mut post_scan =
                Resource::new(ResourceKind::Scan, job.account_id.clone(), names(&SCAN_COMPONENTS));
            post_scan.configs = job.configs.clone();
            post_scan.dependents.push(test.id.clone());
            ctx.store.insert_resource(post_scan.clone())?;

            Ok(StepOutput {
                success: true,
                objects: vec![FlowObject::working(parent, Some(test.id))],
                message: Some("test started, waiting on post-scan".to_string()),
                start: vec![post_scan.id],
            })
        })
    }
}

#[derive(Debug)]
pub struct CaseStep;

impl StepHandler for CaseStep {
    fn run<'a>(&'a self, ctx: &'a JobContext, job: &'a StepJob) -> HandlerFuture<'a, StepOutput> {
        Box::pin(async move {
            check_failure(job)?;

            let parent = job.site.url.clone();
            let case_run =
                ctx.create_resource(job, &parent, ResourceKind::CaseRun, names(&CASE_COMPONENTS))?;

            Ok(StepOutput {
                success: true,
                objects: vec![FlowObject::working(parent, Some(case_run.id.clone()))],
                message: Some("case run started".to_string()),
                start: vec![case_run.id],
            })
        })
    }
}

/// Reports and issues: one finished record covering the carried objects.
#[derive(Debug)]
pub struct RecordStep;

impl StepHandler for RecordStep {
    fn run<'a>(&'a self, ctx: &'a JobContext, job: &'a StepJob) -> HandlerFuture<'a, StepOutput> {
        Box::pin(async move {
            check_failure(job)?;

            let kind = job
                .task_type
                .resource_kind()
                .ok_or_else(|| FlowError::MissingHandler(format!("task type '{}'", job.task_type)))?;

            let parent = Uuid::new_v4().to_string();
            let record = ctx.create_resource(job, &parent, kind, Vec::new())?;
            let covered: Vec<Value> = job
                .objects
                .iter()
                .filter_map(|o| o.id.clone().map(Value::String))
                .collect();
            let record = ctx.store.update_resource(&record.id, &mut |r| {
                r.data = json!({ "objects": covered.clone() });
                r.success = Some(true);
                r.time_completed = Some(Utc::now());
                Ok(())
            })?;

            Ok(StepOutput {
                success: true,
                objects: vec![FlowObject {
                    parent,
                    id: Some(record.id),
                    status: ObjectStatus::Passed,
                }],
                message: Some(format!("{} created for {} object(s)", kind, covered.len())),
                start: Vec::new(),
            })
        })
    }
}

/// Email, phone, slack and webhook steps: every carried object is reported
/// as delivered.
#[derive(Debug)]
pub struct NotificationStep;

impl StepHandler for NotificationStep {
    fn run<'a>(&'a self, _ctx: &'a JobContext, job: &'a StepJob) -> HandlerFuture<'a, StepOutput> {
        Box::pin(async move {
            check_failure(job)?;

            let objects: Vec<FlowObject> = job
                .objects
                .iter()
                .map(|o| FlowObject {
                    parent: o.parent.clone(),
                    id: o.id.clone().or_else(|| Some(job.flow_run_id.clone())),
                    status: ObjectStatus::Passed,
                })
                .collect();
            let target = job
                .configs
                .get("to")
                .and_then(Value::as_str)
                .unwrap_or("default channel");
            info!(
                flow_run_id = %job.flow_run_id,
                channel = %job.task_type,
                to = target,
                objects = objects.len(),
                "simulated notification sent"
            );

            Ok(StepOutput {
                success: true,
                message: Some(format!("{} sent to {target}", job.task_type)),
                objects,
                start: Vec::new(),
            })
        })
    }
}

/// Produces every component after `delay`.
#[derive(Debug, Clone)]
pub struct SimulatedComponent {
    pub delay: Duration,
}

impl ComponentHandler for SimulatedComponent {
    fn run<'a>(
        &'a self,
        _ctx: &'a JobContext,
        _resource: &'a Resource,
        job: &'a ComponentJob,
    ) -> HandlerFuture<'a, ComponentOutput> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let kwargs = job.kwargs.as_object();
            let mut data = Map::new();
            data.insert("health".to_string(), json!(75));
            if let Some(extra) = kwargs
                .and_then(|k| k.get("simulate_data"))
                .and_then(Value::as_object)
            {
                data.extend(extra.clone());
            }
            let success = !kwargs.is_some_and(|k| flag(k, "simulate_component_failure"));

            Ok(ComponentOutput {
                result: json!({ "component": job.component, "ok": success }),
                data,
                success,
            })
        })
    }
}

/// Writes terminal notifications to the log.
#[derive(Debug)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(
        &'a self,
        _ctx: &'a JobContext,
        alert_id: &'a str,
        run: &'a FlowRun,
    ) -> HandlerFuture<'a, ()> {
        Box::pin(async move {
            info!(
                alert_id,
                flow_run_id = %run.id,
                status = %run.status,
                "flow run notification"
            );
            Ok(())
        })
    }
}
