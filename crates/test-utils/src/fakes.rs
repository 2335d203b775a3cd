#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use auditflow::dispatch::{
    ComponentHandler, ComponentJob, ComponentOutput, Dispatcher, HandlerFuture, Job, JobContext,
    QueueIntrospector, StepHandler, StepJob, StepOutput,
};
use auditflow::errors::{FlowError, Result};
use auditflow::gate::BillingMeter;
use auditflow::store::Resource;
use auditflow::types::UsageKind;
use serde_json::{Map, Value, json};

/// A fake queue that:
/// - records every dispatched job with a predictable task id (`task-1`, ...)
/// - reports those ids as in flight until [`forget_in_flight`] is called,
///   which simulates workers that died without a trace.
///
/// [`forget_in_flight`]: RecordingDispatcher::forget_in_flight
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    next: AtomicUsize,
    jobs: Mutex<Vec<(String, Job)>>,
    in_flight: Mutex<HashSet<String>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<(String, Job)> {
        self.jobs.lock().unwrap().clone()
    }

    /// Remove and return everything dispatched so far.
    pub fn take(&self) -> Vec<(String, Job)> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }

    pub fn step_jobs(&self) -> Vec<StepJob> {
        self.jobs()
            .into_iter()
            .filter_map(|(_, job)| match job {
                Job::Step(step) => Some(step),
                _ => None,
            })
            .collect()
    }

    pub fn component_jobs(&self) -> Vec<(String, ComponentJob)> {
        self.jobs()
            .into_iter()
            .filter_map(|(id, job)| match job {
                Job::Component(component) => Some((id, component)),
                _ => None,
            })
            .collect()
    }

    pub fn notify_count(&self) -> usize {
        self.jobs()
            .iter()
            .filter(|(_, job)| matches!(job, Job::Notify(_)))
            .count()
    }

    pub fn forget_in_flight(&self) {
        self.in_flight.lock().unwrap().clear();
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch_as(&self, task_id: String, job: Job) -> Result<()> {
        self.in_flight.lock().unwrap().insert(task_id.clone());
        self.jobs.lock().unwrap().push((task_id, job));
        Ok(())
    }

    fn dispatch(&self, job: Job) -> Result<String> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let task_id = format!("task-{n}");
        self.dispatch_as(task_id.clone(), job)?;
        Ok(task_id)
    }
}

impl QueueIntrospector for RecordingDispatcher {
    fn active_task_ids(&self) -> Result<HashSet<String>> {
        Ok(self.in_flight.lock().unwrap().clone())
    }
}

/// Records every overage report.
#[derive(Debug, Default)]
pub struct RecordingMeter {
    events: Mutex<Vec<(String, UsageKind, u64, u64)>>,
}

impl RecordingMeter {
    pub fn events(&self) -> Vec<(String, UsageKind, u64, u64)> {
        self.events.lock().unwrap().clone()
    }
}

impl BillingMeter for RecordingMeter {
    fn record_overage(&self, account_id: &str, kind: UsageKind, used: u64, allowed: u64) {
        self.events
            .lock()
            .unwrap()
            .push((account_id.to_string(), kind, used, allowed));
    }
}

/// Step handler returning a canned outcome and remembering its jobs.
#[derive(Debug, Default)]
pub struct ScriptedStep {
    pub fail: bool,
    pub output: StepOutput,
    seen: Mutex<Vec<StepJob>>,
}

impl ScriptedStep {
    pub fn passing() -> Self {
        Self {
            fail: false,
            output: StepOutput::done(true, "ok"),
            seen: Mutex::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            output: StepOutput::default(),
            seen: Mutex::default(),
        }
    }

    pub fn seen(&self) -> Vec<StepJob> {
        self.seen.lock().unwrap().clone()
    }
}

impl StepHandler for ScriptedStep {
    fn run<'a>(&'a self, _ctx: &'a JobContext, job: &'a StepJob) -> HandlerFuture<'a, StepOutput> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(job.clone());
            if self.fail {
                return Err(FlowError::HandlerFailed {
                    task: job.task_type.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            Ok(self.output.clone())
        })
    }
}

/// Component handler writing `data` onto the resource immediately.
#[derive(Debug, Default)]
pub struct StaticComponent {
    pub data: Map<String, Value>,
    pub success: bool,
    runs: AtomicUsize,
}

impl StaticComponent {
    pub fn new(data: Value, success: bool) -> Self {
        Self {
            data: data.as_object().cloned().unwrap_or_default(),
            success,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl ComponentHandler for StaticComponent {
    fn run<'a>(
        &'a self,
        _ctx: &'a JobContext,
        _resource: &'a Resource,
        job: &'a ComponentJob,
    ) -> HandlerFuture<'a, ComponentOutput> {
        Box::pin(async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ComponentOutput {
                result: json!({ "component": job.component }),
                data: self.data.clone(),
                success: self.success,
            })
        })
    }
}
