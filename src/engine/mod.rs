// src/engine/mod.rs

//! Orchestration engine for auditflow.
//!
//! This module ties together:
//! - the pure step function that decides what a flow run does next
//! - the executor that commits those decisions and dispatches jobs
//! - the completion trigger every finished unit of work calls
//! - the workers that run jobs from the queue
//!
//! The pure core lives in [`flowr`]; [`executor`], [`trigger`] and
//! [`worker`] are the IO shell around it. [`Engine`] wires everything to one
//! store.

pub mod executor;
pub mod flowr;
pub mod trigger;
pub mod updater;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ConfigFile, EngineOptions};
use crate::dispatch::{DispatchTable, JobContext, JobQueue, JobReceiver};
use crate::errors::{FlowError, Result};
use crate::gate::{BillingMeter, LogMeter, ResourceGate};
use crate::graph::FlowDefinition;
use crate::ledger::TaskLedger;
use crate::lock::{FileLockService, LockService, MemoryLockService};
use crate::reconcile::RetryReconciler;
use crate::store::{FlowRun, SiteRef, Store, open_store};
use crate::types::{StoreBackend, UsageKind};

pub use executor::StepExecutor;
pub use flowr::{FlowCommand, FlowStep};
pub use trigger::CompletionTrigger;
pub use updater::{NodeUpdate, apply_node_update};
pub use worker::{Worker, spawn_workers};

/// One store, one queue, and everything that works on them.
#[derive(Debug)]
pub struct Engine {
    store: Arc<dyn Store>,
    gate: ResourceGate,
    queue: JobQueue,
    receiver: Arc<JobReceiver>,
    executor: StepExecutor,
    trigger: CompletionTrigger,
    reconciler: RetryReconciler,
    worker: Arc<Worker>,
    options: EngineOptions,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<dyn LockService>,
        meter: Arc<dyn BillingMeter>,
        table: DispatchTable,
        options: EngineOptions,
    ) -> Self {
        let (queue, receiver) = JobQueue::new();
        let dispatcher: Arc<JobQueue> = Arc::new(queue.clone());

        let gate = ResourceGate::new(Arc::clone(&store), meter);
        let ledger = TaskLedger::new(Arc::clone(&store), options.max_attempts);
        let executor = StepExecutor::new(Arc::clone(&store), dispatcher.clone());
        let trigger = CompletionTrigger::new(Arc::clone(&store), dispatcher.clone(), executor.clone());
        let reconciler = RetryReconciler::new(
            Arc::clone(&store),
            dispatcher.clone(),
            dispatcher.clone(),
            trigger.clone(),
            options.max_attempts,
        );

        let worker = Arc::new(Worker {
            ctx: JobContext {
                store: Arc::clone(&store),
                gate: gate.clone(),
                dispatcher,
            },
            table: Arc::new(table),
            ledger,
            locks,
            lock_ttl: options.lock_ttl,
            trigger: trigger.clone(),
        });

        Self {
            store,
            gate,
            queue,
            receiver: Arc::new(receiver),
            executor,
            trigger,
            reconciler,
            worker,
            options,
        }
    }

    /// Open the configured store and lock backend and seed the configured
    /// accounts. Existing accounts are left as they are.
    pub fn from_config(config: &ConfigFile, table: DispatchTable) -> Result<Self> {
        let store = open_store(&config.store)?;
        let locks: Arc<dyn LockService> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryLockService::new()),
            StoreBackend::File => Arc::new(FileLockService::open(config.store.path.join("locks"))?),
        };

        for account in &config.accounts {
            match store.get_account(&account.id) {
                Ok(_) => debug!(account_id = %account.id, "account exists; not reseeding"),
                Err(FlowError::AccountNotFound(_)) => {
                    store.upsert_account(account.clone())?;
                    info!(account_id = %account.id, "seeded account");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self::new(
            store,
            locks,
            Arc::new(LogMeter),
            table,
            config.engine.clone(),
        ))
    }

    /// Create a flow run for `definition` and dispatch its entry node.
    ///
    /// The account's flow-run allowance is consumed first; a refusal creates
    /// nothing.
    pub fn start_flow_run(
        &self,
        definition: &FlowDefinition,
        account_id: &str,
        site: SiteRef,
    ) -> Result<FlowRun> {
        self.gate.require(account_id, UsageKind::FlowRuns)?;

        let mut run = FlowRun::new(account_id, site, definition.graph.clone());
        run.name = definition.name.clone();
        run.configs.end_on_fail = definition.end_on_fail;
        let id = run.id.clone();
        self.store.insert_flow_run(run)?;
        info!(flow_run_id = %id, name = %definition.name, account_id, "flow run created");

        self.executor.advance(&id)
    }

    /// Start `[engine].workers` workers on the shared queue.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        spawn_workers(
            self.options.workers,
            Arc::clone(&self.receiver),
            Arc::clone(&self.worker),
        )
    }

    /// Wait until no job is queued or running, polling every `poll`.
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, poll: Duration, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queue.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn trigger(&self) -> &CompletionTrigger {
        &self.trigger
    }

    pub fn reconciler(&self) -> &RetryReconciler {
        &self.reconciler
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}
