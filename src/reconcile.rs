// src/reconcile.rs

//! Retry reconciler: a periodic sweep that heals jobs which died silently.
//!
//! Workers record each component attempt in the ledger before running it.
//! A component whose recorded task is no longer in flight and whose result
//! is still empty was lost; the sweep dispatches it again until the ledger
//! ceiling is reached.
//!
//! Step jobs are recorded on their node when the executor dispatches them.
//! A working node whose step task is not in flight and never reported was
//! lost the same way. It is sent again under a new task id, and failed once
//! it has been sent `max_attempts` times.
//!
//! In-flight task ids come from this process's queue. Sweeping a store that
//! another live process is working on treats that process's jobs as lost.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{Dispatcher, Job, QueueIntrospector, dispatch_components};
use crate::engine::{CompletionTrigger, NodeUpdate, flowr};
use crate::errors::Result;
use crate::graph::{Node, StepTask};
use crate::store::{FlowRun, Resource, Store};
use crate::types::NodeStatus;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Task ids of re-sent or freshly sent component jobs.
    pub redispatched: Vec<String>,
    /// Resources marked complete by the sweep.
    pub completed: Vec<String>,
    /// `(resource_id, component)` pairs left incomplete at the ceiling.
    pub exhausted: Vec<(String, String)>,
    /// Task ids of re-sent step jobs.
    pub steps_redispatched: Vec<String>,
    /// `(flow_run_id, node_id)` steps failed at the ceiling.
    pub steps_exhausted: Vec<(String, String)>,
    /// Flow runs with nothing working that were advanced.
    pub advanced: Vec<String>,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        self.redispatched.is_empty()
            && self.completed.is_empty()
            && self.steps_redispatched.is_empty()
            && self.steps_exhausted.is_empty()
            && self.advanced.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RetryReconciler {
    store: Arc<dyn Store>,
    introspector: Arc<dyn QueueIntrospector>,
    dispatcher: Arc<dyn Dispatcher>,
    trigger: CompletionTrigger,
    max_attempts: u32,
}

impl RetryReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        introspector: Arc<dyn QueueIntrospector>,
        dispatcher: Arc<dyn Dispatcher>,
        trigger: CompletionTrigger,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            introspector,
            dispatcher,
            trigger,
            max_attempts,
        }
    }

    /// Run one pass over every incomplete flow run and resource.
    pub fn sweep(&self) -> Result<SweepReport> {
        let in_flight = self.introspector.active_task_ids()?;
        let runs: Vec<FlowRun> = self
            .store
            .list_flow_runs()?
            .into_iter()
            .filter(|r| !r.is_complete())
            .collect();
        let resources = self.store.list_incomplete_resources()?;

        let mut report = SweepReport::default();
        for run in &runs {
            self.sweep_steps(run, &in_flight, &mut report)?;
        }

        // Resources still waiting on another one start from its completion,
        // not from here.
        let blocked: HashSet<&str> = resources
            .iter()
            .flat_map(|r| r.dependents.iter().map(String::as_str))
            .collect();

        for resource in &resources {
            self.sweep_resource(resource, &in_flight, blocked.contains(resource.id.as_str()), &mut report)?;
        }

        if report.is_empty() {
            debug!(runs = runs.len(), resources = resources.len(), "sweep found nothing to do");
        } else {
            info!(
                runs = runs.len(),
                resources = resources.len(),
                redispatched = report.redispatched.len(),
                completed = report.completed.len(),
                exhausted = report.exhausted.len(),
                steps_redispatched = report.steps_redispatched.len(),
                steps_exhausted = report.steps_exhausted.len(),
                advanced = report.advanced.len(),
                "sweep finished"
            );
        }
        Ok(report)
    }

    fn sweep_steps(
        &self,
        run: &FlowRun,
        in_flight: &HashSet<String>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let mut working = false;
        for (index, node) in run.graph.nodes().iter().enumerate() {
            if node.status == NodeStatus::Working {
                working = true;
            }
            let Some(task) = lost_step(node, in_flight) else {
                continue;
            };

            if task.attempts >= self.max_attempts {
                warn!(
                    flow_run_id = %run.id,
                    node_id = %node.id,
                    attempts = task.attempts,
                    "step lost at the attempt ceiling; failing node"
                );
                let update = NodeUpdate::new(index)
                    .with_status(NodeStatus::Failed)
                    .with_message(format!(
                        "step {} lost after {} attempt(s)",
                        node.id, task.attempts
                    ));
                self.trigger.report(&run.id, update)?;
                report.steps_exhausted.push((run.id.clone(), node.id.clone()));
                continue;
            }

            // Re-check under the write: the step may have reported since the
            // listing.
            let task_id = Uuid::new_v4().to_string();
            let mut job = None;
            self.store.update_flow_run(&run.id, &mut |current| {
                job = None;
                let still_lost = !current.is_complete()
                    && current
                        .graph
                        .node(index)
                        .and_then(|n| lost_step(n, in_flight))
                        .is_some_and(|t| t.task_id == task.task_id);
                if !still_lost {
                    return Ok(());
                }
                if let Some(t) = current.graph.node_mut(index).and_then(|n| n.step_task.as_mut()) {
                    t.task_id = task_id.clone();
                    t.attempts += 1;
                }
                job = flowr::step_job(current, index);
                Ok(())
            })?;
            let Some(job) = job else {
                continue;
            };

            self.dispatcher.dispatch_as(task_id.clone(), Job::Step(job))?;
            warn!(
                flow_run_id = %run.id,
                node_id = %node.id,
                attempts = task.attempts + 1,
                %task_id,
                "redispatching lost step"
            );
            report.steps_redispatched.push(task_id);
        }

        // Nothing is working, so no report will ever move this run: the
        // process that committed the last transition died before acting on
        // it.
        if !working {
            let advanced = self.trigger.executor().advance(&run.id)?;
            info!(flow_run_id = %run.id, complete = advanced.is_complete(), "advanced stalled flow run");
            report.advanced.push(run.id.clone());
        }
        Ok(())
    }

    fn sweep_resource(
        &self,
        resource: &Resource,
        in_flight: &HashSet<String>,
        blocked: bool,
        report: &mut SweepReport,
    ) -> Result<()> {
        let mut redispatched = 0usize;
        let mut running = 0usize;
        let mut exhausted = 0usize;

        for task in &resource.tasks {
            if in_flight.contains(&task.task_id) {
                running += 1;
                continue;
            }
            if resource.has_result(&task.component) {
                continue;
            }
            if task.attempts >= self.max_attempts {
                exhausted += 1;
                report
                    .exhausted
                    .push((resource.id.clone(), task.component.clone()));
                continue;
            }

            let task_ids = dispatch_components(
                self.dispatcher.as_ref(),
                resource,
                std::slice::from_ref(&task.component),
            )?;
            // Point the ledger at the new task so the next sweep sees it in
            // flight; the worker bumps the attempt count when it starts.
            if let Some(task_id) = task_ids.first() {
                self.store.update_resource(&resource.id, &mut |r| {
                    if let Some(t) = r.tasks.iter_mut().find(|t| t.component == task.component) {
                        t.task_id = task_id.clone();
                    }
                    Ok(())
                })?;
            }
            warn!(
                resource_id = %resource.id,
                component = %task.component,
                attempts = task.attempts,
                "redispatching lost component"
            );
            redispatched += task_ids.len();
            report.redispatched.extend(task_ids);
        }

        if !blocked {
            let fresh: Vec<String> = resource
                .components
                .iter()
                .filter(|c| resource.task(c).is_none() && !resource.has_result(c))
                .cloned()
                .collect();
            if !fresh.is_empty() {
                debug!(resource_id = %resource.id, ?fresh, "dispatching never-recorded components");
                let task_ids = dispatch_components(self.dispatcher.as_ref(), resource, &fresh)?;
                redispatched += task_ids.len();
                report.redispatched.extend(task_ids);
            }
        }

        if redispatched == 0 && running == 0 && exhausted == 0 && !resource.tasks.is_empty() {
            let mut marked = false;
            self.store.update_resource(&resource.id, &mut |r| {
                marked = !r.is_complete();
                if marked {
                    r.time_completed = Some(Utc::now());
                }
                Ok(())
            })?;
            if marked {
                info!(resource_id = %resource.id, "sweep marked resource complete");
                report.completed.push(resource.id.clone());
                self.trigger.resource_completed(&resource.id)?;
            }
        }
        Ok(())
    }

    /// Sweep every `interval` until the task is dropped.
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let this = self.clone();
            match tokio::task::spawn_blocking(move || this.sweep()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "reconciler sweep failed"),
                Err(e) => warn!(error = %e, "reconciler sweep task failed"),
            }
        }
    }
}

/// The step task of a working node whose job is neither queued, running nor
/// heard from.
fn lost_step<'a>(node: &'a Node, in_flight: &HashSet<String>) -> Option<&'a StepTask> {
    if node.finalized || node.status != NodeStatus::Working {
        return None;
    }
    node.step_task
        .as_ref()
        .filter(|t| !t.reported && !in_flight.contains(&t.task_id))
}
