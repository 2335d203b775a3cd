// src/engine/worker.rs

//! Worker loop: pulls [`JobEnvelope`]s from the queue and runs them through
//! the [`DispatchTable`].
//!
//! Job-level failures are logged and recorded on the flow run or resource;
//! they never stop the worker. Store and lock calls are synchronous file or
//! memory IO and run on tokio's blocking pool; handlers run on the worker
//! task itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::{
    ComponentJob, ComponentOutput, DispatchTable, Job, JobContext, JobEnvelope, JobReceiver,
    NotifyJob, StepJob, dispatch_components,
};
use crate::engine::trigger::CompletionTrigger;
use crate::engine::updater::NodeUpdate;
use crate::errors::{FlowError, Result};
use crate::ledger::TaskLedger;
use crate::lock::{LockGuard, LockService, component_lock_name, try_lock};
use crate::store::Resource;
use crate::types::{NodeStatus, ObjectStatus};

/// Everything a worker needs to run jobs.
#[derive(Debug, Clone)]
pub struct Worker {
    pub ctx: JobContext,
    pub table: Arc<DispatchTable>,
    pub ledger: TaskLedger,
    pub locks: Arc<dyn LockService>,
    pub lock_ttl: Duration,
    pub trigger: CompletionTrigger,
}

impl Worker {
    /// Run one job to completion. Errors are logged, not returned.
    pub async fn handle(&self, envelope: JobEnvelope) {
        let label = envelope.job.label();
        let task_id = envelope.task_id;
        debug!(%task_id, job = %label, "job started");

        let result = match &envelope.job {
            Job::Step(job) => self.run_step(&task_id, job).await,
            Job::Component(job) => self.run_component(&task_id, job).await,
            Job::Notify(job) => self.run_notify(job).await,
        };

        match result {
            Ok(()) => debug!(%task_id, job = %label, "job finished"),
            Err(e) => error!(%task_id, job = %label, error = %e, "job failed"),
        }
    }

    /// Run store and lock IO on the blocking pool, off the runtime threads.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Worker) -> Result<T> + Send + 'static,
    {
        let worker = self.clone();
        tokio::task::spawn_blocking(move || f(&worker))
            .await
            .map_err(|e| FlowError::Other(e.into()))?
    }

    async fn run_step(&self, task_id: &str, job: &StepJob) -> Result<()> {
        let (current_id, current_job) = (task_id.to_string(), job.clone());
        if !self
            .blocking(move |w| w.step_is_current(&current_id, &current_job))
            .await?
        {
            debug!(
                %task_id,
                flow_run_id = %job.flow_run_id,
                node_index = job.node_index,
                "step task replaced or already reported; skipping"
            );
            return Ok(());
        }

        let outcome = match self.table.step(job.task_type) {
            Ok(handler) => handler.run(&self.ctx, job).await,
            Err(e) => Err(e),
        };

        let mut start = Vec::new();
        let update = match outcome {
            Ok(output) => {
                start = output.start;
                let pending = output
                    .objects
                    .iter()
                    .any(|o| o.status == ObjectStatus::Working);
                let mut update = NodeUpdate::new(job.node_index).with_objects(output.objects);
                if !pending {
                    update = update.with_status(if output.success {
                        NodeStatus::Passed
                    } else {
                        NodeStatus::Failed
                    });
                }
                update.message = output.message;
                update
            }
            Err(e) => {
                warn!(
                    flow_run_id = %job.flow_run_id,
                    node_index = job.node_index,
                    task_type = %job.task_type,
                    error = %e,
                    "step handler failed"
                );
                NodeUpdate::new(job.node_index)
                    .with_status(NodeStatus::Failed)
                    .with_message(e.to_string())
            }
        };

        let flow_run_id = job.flow_run_id.clone();
        self.blocking(move |w| w.commit_step(&flow_run_id, update, &start))
            .await
    }

    /// The node is still waiting on exactly this task.
    fn step_is_current(&self, task_id: &str, job: &StepJob) -> Result<bool> {
        let run = self.ctx.store.get_flow_run(&job.flow_run_id)?;
        if run.is_complete() {
            return Ok(false);
        }
        Ok(run.graph.node(job.node_index).is_some_and(|node| {
            node.status == NodeStatus::Working
                && node
                    .step_task
                    .as_ref()
                    .is_some_and(|t| t.task_id == task_id && !t.reported)
        }))
    }

    fn commit_step(&self, flow_run_id: &str, update: NodeUpdate, start: &[String]) -> Result<()> {
        self.trigger.report(flow_run_id, update)?;

        // Only now can a finished resource find its object on the node.
        for resource_id in start {
            let resource = self.ctx.store.get_resource(resource_id)?;
            let pending: Vec<String> = resource
                .components
                .iter()
                .filter(|c| resource.task(c).is_none() && !resource.has_result(c))
                .cloned()
                .collect();
            dispatch_components(self.ctx.dispatcher.as_ref(), &resource, &pending)?;
        }
        Ok(())
    }

    async fn run_component(&self, task_id: &str, job: &ComponentJob) -> Result<()> {
        let (claim_id, claim_job) = (task_id.to_string(), job.clone());
        let Some((guard, resource)) = self
            .blocking(move |w| w.claim_component(&claim_id, &claim_job))
            .await?
        else {
            return Ok(());
        };

        let handler = self.table.component(job.resource_kind)?;
        let output = handler.run(&self.ctx, &resource, job).await?;

        let job = job.clone();
        self.blocking(move |w| {
            let _guard = guard;
            w.commit_component(&job, &output)
        })
        .await
    }

    /// Take the component lock and record the attempt. `None` when another
    /// worker owns it, it is already produced, or the ceiling was hit.
    fn claim_component(
        &self,
        task_id: &str,
        job: &ComponentJob,
    ) -> Result<Option<(LockGuard, Resource)>> {
        let lock_name = component_lock_name(&job.resource_id, &job.component);
        let Some(guard) = try_lock(&self.locks, &lock_name, self.lock_ttl)? else {
            debug!(lock = %lock_name, "component already running elsewhere; skipping");
            return Ok(None);
        };

        let resource = self.ctx.store.get_resource(&job.resource_id)?;
        if resource.is_complete() || resource.has_result(&job.component) {
            debug!(resource_id = %job.resource_id, component = %job.component, "component already produced");
            return Ok(None);
        }

        let maxed = self.ledger.record(
            job.resource_kind,
            &job.resource_id,
            task_id,
            &job.component,
            job.kwargs.clone(),
        )?;
        if maxed {
            return Ok(None);
        }
        Ok(Some((guard, resource)))
    }

    fn commit_component(&self, job: &ComponentJob, output: &ComponentOutput) -> Result<()> {
        let mut completed = false;
        self.ctx.store.update_resource(&job.resource_id, &mut |r| {
            r.results.insert(job.component.clone(), output.result.clone());
            if let Some(data) = r.data.as_object_mut() {
                data.extend(output.data.clone());
            } else {
                r.data = serde_json::Value::Object(output.data.clone());
            }
            if !output.success {
                r.success = Some(false);
            }
            if !r.is_complete() && r.all_results_present() {
                r.time_completed = Some(Utc::now());
                completed = true;
            }
            Ok(())
        })?;

        if completed {
            self.trigger.resource_completed(&job.resource_id)?;
        }
        Ok(())
    }

    async fn run_notify(&self, job: &NotifyJob) -> Result<()> {
        let flow_run_id = job.flow_run_id.clone();
        let run = self
            .blocking(move |w| w.ctx.store.get_flow_run(&flow_run_id))
            .await?;
        let notifier = self.table.notifier()?;
        notifier.notify(&self.ctx, &job.alert_id, &run).await?;
        info!(flow_run_id = %job.flow_run_id, alert_id = %job.alert_id, "alert sent");
        Ok(())
    }
}

/// Spawn `count` workers sharing `receiver`. They exit once the queue closes.
pub fn spawn_workers(
    count: usize,
    receiver: Arc<JobReceiver>,
    worker: Arc<Worker>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|n| {
            let receiver = Arc::clone(&receiver);
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                debug!(worker = n, "worker started");
                while let Some(envelope) = receiver.recv().await {
                    let task_id = envelope.task_id.clone();
                    worker.handle(envelope).await;
                    receiver.finish(&task_id);
                }
                debug!(worker = n, "worker stopped (queue closed)");
            })
        })
        .collect()
}
