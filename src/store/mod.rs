// src/store/mod.rs

//! Persistence for flow runs, resources (with their task ledger) and accounts.
//!
//! All coordination state lives behind the [`Store`] trait; workers keep
//! nothing in memory between jobs.
//!
//! - [`memory::MemoryStore`] keeps documents in process memory (tests, `--once`).
//! - [`file::FileStore`] writes one JSON document per record and replaces it
//!   atomically (write to a temp file, then rename).
//!
//! Read-modify-write goes through the `update_*` methods. The memory store
//! serializes them per collection, the file store per document with a lock
//! file that other processes honour too. An update closure may read anything
//! but must not update the collection it runs under.

pub mod file;
pub mod memory;
pub mod records;

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::StoreSection;
use crate::errors::Result;
use crate::types::StoreBackend;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use records::{
    Account, FlowRef, FlowRun, LogEntry, Resource, RunConfigs, SiteRef, TaskRecord, Usage,
};

/// Closure applied to a document under the store's write guard.
pub type Mutation<'a, T> = &'a mut dyn FnMut(&mut T) -> Result<()>;

/// Abstract document store.
pub trait Store: Send + Sync + Debug {
    fn insert_flow_run(&self, run: FlowRun) -> Result<()>;
    fn get_flow_run(&self, id: &str) -> Result<FlowRun>;
    /// Atomically apply `f` and persist the result. Bumps `revision`.
    ///
    /// If `f` fails nothing is written.
    fn update_flow_run(&self, id: &str, f: Mutation<'_, FlowRun>) -> Result<FlowRun>;
    fn list_flow_runs(&self) -> Result<Vec<FlowRun>>;

    fn insert_resource(&self, resource: Resource) -> Result<()>;
    fn get_resource(&self, id: &str) -> Result<Resource>;
    fn update_resource(&self, id: &str, f: Mutation<'_, Resource>) -> Result<Resource>;
    /// Resources without a completion timestamp.
    fn list_incomplete_resources(&self) -> Result<Vec<Resource>>;

    fn upsert_account(&self, account: Account) -> Result<()>;
    fn get_account(&self, id: &str) -> Result<Account>;
    fn update_account(&self, id: &str, f: Mutation<'_, Account>) -> Result<Account>;
}

/// Open the store selected by `[store]`.
pub fn open_store(section: &StoreSection) -> Result<Arc<dyn Store>> {
    match section.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::File => Ok(Arc::new(FileStore::open(&section.path)?)),
    }
}
