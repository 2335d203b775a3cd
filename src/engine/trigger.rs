// src/engine/trigger.rs

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, dispatch_components};
use crate::engine::executor::StepExecutor;
use crate::engine::updater::{NodeUpdate, apply_node_update};
use crate::errors::{FlowError, Result};
use crate::graph::FlowObject;
use crate::store::{FlowRun, Store};
use crate::types::ObjectStatus;

/// Explicit "work finished" entry point.
///
/// Every code path that completes a unit of work calls one of these methods
/// after committing its own state; both end in
/// [`StepExecutor::advance`] for the affected flow run(s).
#[derive(Debug, Clone)]
pub struct CompletionTrigger {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn Dispatcher>,
    executor: StepExecutor,
}

impl CompletionTrigger {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn Dispatcher>,
        executor: StepExecutor,
    ) -> Self {
        Self {
            store,
            dispatcher,
            executor,
        }
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// A job reported progress for one node.
    ///
    /// Working objects whose resource already completed are settled inside
    /// the same write, so a resource finishing before its step reports back
    /// cannot leave the node working.
    pub fn report(&self, flow_run_id: &str, update: NodeUpdate) -> Result<FlowRun> {
        let store = Arc::clone(&self.store);
        self.store.update_flow_run(flow_run_id, &mut |run| {
            let mut update = update.clone();
            settle_objects(store.as_ref(), &mut update.objects);
            apply_node_update(run, &update)
        })?;
        self.executor.advance(flow_run_id)
    }

    /// A resource gained its completion timestamp.
    ///
    /// Updates the tracking object in every flow run referencing it, starts
    /// the components of resources that were waiting on it, then advances
    /// the flow runs.
    pub fn resource_completed(&self, resource_id: &str) -> Result<()> {
        let resource = self.store.get_resource(resource_id)?;
        if !resource.is_complete() {
            warn!(resource_id, "completion trigger for an incomplete resource");
            return Ok(());
        }

        let status = ObjectStatus::from(resource.succeeded());
        for flow_ref in &resource.flow_refs {
            let update = NodeUpdate::new(flow_ref.node_index).with_objects(vec![FlowObject {
                parent: flow_ref.parent.clone(),
                id: Some(resource.id.clone()),
                status,
            }]);
            match self.report(&flow_ref.flow_run_id, update) {
                Ok(_) => {}
                Err(FlowError::FlowRunNotFound(id)) => {
                    warn!(resource_id, flow_run_id = %id, "referenced flow run is gone");
                }
                Err(e) => return Err(e),
            }
        }

        for dependent_id in &resource.dependents {
            let dependent = match self.store.get_resource(dependent_id) {
                Ok(d) => d,
                Err(FlowError::ResourceNotFound(_)) => {
                    warn!(resource_id, dependent_id = %dependent_id, "dependent resource is gone");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if dependent.is_complete() {
                continue;
            }
            let pending: Vec<String> = dependent
                .components
                .iter()
                .filter(|c| dependent.task(c).is_none())
                .cloned()
                .collect();
            debug!(resource_id, dependent_id = %dependent_id, ?pending, "starting dependent resource");
            dispatch_components(self.dispatcher.as_ref(), &dependent, &pending)?;
        }

        info!(resource_id, kind = %resource.kind, success = resource.succeeded(), "resource completed");
        Ok(())
    }
}

fn settle_objects(store: &dyn Store, objects: &mut [FlowObject]) {
    for object in objects.iter_mut() {
        if object.status != ObjectStatus::Working {
            continue;
        }
        let Some(id) = object.id.as_deref() else {
            continue;
        };
        match store.get_resource(id) {
            Ok(resource) if resource.is_complete() => {
                object.status = ObjectStatus::from(resource.succeeded());
            }
            Ok(_) | Err(FlowError::ResourceNotFound(_)) => {}
            Err(e) => warn!(resource_id = id, error = %e, "failed to read resource"),
        }
    }
}
