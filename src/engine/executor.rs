// src/engine/executor.rs

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, Job};
use crate::engine::flowr::{self, FlowCommand, FlowStep};
use crate::errors::{FlowError, Result};
use crate::store::{FlowRun, Resource, Store};

/// IO shell around [`flowr::step`].
///
/// Each transition is computed inside the store's atomic read-modify-write
/// of the flow run; its commands are executed only after the write commits.
/// Calling [`advance`](Self::advance) repeatedly, or from several workers at
/// once, is safe: a transition that has already happened is simply not found
/// again.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Move `flow_run_id` forward as far as currently possible.
    pub fn advance(&self, flow_run_id: &str) -> Result<FlowRun> {
        let mut run = self.store.get_flow_run(flow_run_id)?;
        if run.is_complete() {
            debug!(flow_run_id, "flow run already complete");
            return Ok(run);
        }

        let store = Arc::clone(&self.store);
        let lookup = move |id: &str| -> Option<Resource> {
            match store.get_resource(id) {
                Ok(resource) => Some(resource),
                Err(FlowError::ResourceNotFound(_)) => None,
                Err(e) => {
                    warn!(resource_id = id, error = %e, "failed to read resource");
                    None
                }
            }
        };

        loop {
            let mut step = FlowStep::default();
            run = self.store.update_flow_run(flow_run_id, &mut |run| {
                step = flowr::step(run, &lookup);
                Ok(())
            })?;

            for command in step.commands {
                self.execute(command)?;
            }

            if run.is_complete() {
                info!(flow_run_id, status = %run.status, "flow run completed");
                break;
            }
            if !step.progressed {
                break;
            }
        }
        Ok(run)
    }

    fn execute(&self, command: FlowCommand) -> Result<()> {
        match command {
            FlowCommand::Dispatch { task_id, job } => {
                let (node_index, task_type) = (job.node_index, job.task_type);
                let flow_run_id = job.flow_run_id.clone();
                self.dispatcher.dispatch_as(task_id.clone(), Job::Step(job))?;
                info!(%flow_run_id, node_index, %task_type, %task_id, "step dispatched");
            }
            FlowCommand::Notify(job) => {
                let alert_id = job.alert_id.clone();
                let task_id = self.dispatcher.dispatch(Job::Notify(job))?;
                debug!(%alert_id, %task_id, "terminal notification dispatched");
            }
        }
        Ok(())
    }
}
