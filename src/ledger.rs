// src/ledger.rs

//! Task ledger: which components of a resource were dispatched, under which
//! worker task id, and how many times.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{FlowError, Result};
use crate::store::{Store, TaskRecord};
use crate::types::ResourceKind;

/// Record one attempt of `component` in `tasks`.
///
/// Returns `true` if the existing entry was already at `ceiling`; the attempt
/// counter is then left untouched.
pub fn record_attempt(
    tasks: &mut Vec<TaskRecord>,
    component: &str,
    task_id: &str,
    kwargs: Value,
    ceiling: u32,
) -> bool {
    match tasks.iter_mut().find(|t| t.component == component) {
        Some(existing) => {
            let maxed = existing.attempts >= ceiling;
            if !maxed {
                existing.attempts += 1;
            }
            existing.task_id = task_id.to_string();
            existing.kwargs = kwargs;
            maxed
        }
        None => {
            tasks.push(TaskRecord {
                component: component.to_string(),
                task_id: task_id.to_string(),
                attempts: 1,
                kwargs,
            });
            false
        }
    }
}

/// Store-backed ledger with a fixed attempt ceiling.
#[derive(Debug, Clone)]
pub struct TaskLedger {
    store: Arc<dyn Store>,
    max_attempts: u32,
}

impl TaskLedger {
    pub fn new(store: Arc<dyn Store>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record that `task_id` is running `component` of a resource.
    ///
    /// Returns whether the component had already used up its attempts;
    /// callers stop retrying it when this is `true`.
    pub fn record(
        &self,
        resource_kind: ResourceKind,
        resource_id: &str,
        task_id: &str,
        component: &str,
        kwargs: Value,
    ) -> Result<bool> {
        let mut maxed = false;
        let ceiling = self.max_attempts;
        self.store.update_resource(resource_id, &mut |resource| {
            if resource.kind != resource_kind {
                return Err(FlowError::ResourceNotFound(format!(
                    "{resource_kind} {resource_id}"
                )));
            }
            maxed = record_attempt(&mut resource.tasks, component, task_id, kwargs.clone(), ceiling);
            Ok(())
        })?;

        if maxed {
            warn!(
                resource_id,
                component,
                max_attempts = ceiling,
                "component reached max attempts"
            );
        } else {
            debug!(resource_id, component, task_id, "recorded component attempt");
        }
        Ok(maxed)
    }
}
