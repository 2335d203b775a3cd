// src/store/memory.rs

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::errors::{FlowError, Result};
use crate::store::records::{Account, FlowRun, Resource};
use crate::store::{Mutation, Store};

/// In-process store. Documents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    flow_runs: Mutex<HashMap<String, FlowRun>>,
    resources: Mutex<HashMap<String, Resource>>,
    accounts: Mutex<HashMap<String, Account>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking mutation never reaches the insert below, so the map
    // itself is still consistent.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply `f` to a copy so a failing closure leaves the stored document as-is.
fn update_in<T: Clone>(
    map: &mut HashMap<String, T>,
    id: &str,
    f: Mutation<'_, T>,
    not_found: impl FnOnce(String) -> FlowError,
) -> Result<T> {
    let current = map.get(id).ok_or_else(|| not_found(id.to_string()))?;
    let mut next = current.clone();
    f(&mut next)?;
    map.insert(id.to_string(), next.clone());
    Ok(next)
}

impl Store for MemoryStore {
    fn insert_flow_run(&self, run: FlowRun) -> Result<()> {
        guard(&self.flow_runs).insert(run.id.clone(), run);
        Ok(())
    }

    fn get_flow_run(&self, id: &str) -> Result<FlowRun> {
        guard(&self.flow_runs)
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::FlowRunNotFound(id.to_string()))
    }

    fn update_flow_run(&self, id: &str, f: Mutation<'_, FlowRun>) -> Result<FlowRun> {
        let mut runs = guard(&self.flow_runs);
        update_in(
            &mut runs,
            id,
            &mut |run: &mut FlowRun| {
                f(run)?;
                run.revision += 1;
                Ok(())
            },
            FlowError::FlowRunNotFound,
        )
    }

    fn list_flow_runs(&self) -> Result<Vec<FlowRun>> {
        let mut runs: Vec<FlowRun> = guard(&self.flow_runs).values().cloned().collect();
        runs.sort_by_key(|r| r.time_created);
        Ok(runs)
    }

    fn insert_resource(&self, resource: Resource) -> Result<()> {
        guard(&self.resources).insert(resource.id.clone(), resource);
        Ok(())
    }

    fn get_resource(&self, id: &str) -> Result<Resource> {
        guard(&self.resources)
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::ResourceNotFound(id.to_string()))
    }

    fn update_resource(&self, id: &str, f: Mutation<'_, Resource>) -> Result<Resource> {
        update_in(&mut guard(&self.resources), id, f, FlowError::ResourceNotFound)
    }

    fn list_incomplete_resources(&self) -> Result<Vec<Resource>> {
        let mut out: Vec<Resource> = guard(&self.resources)
            .values()
            .filter(|r| !r.is_complete())
            .cloned()
            .collect();
        out.sort_by_key(|r| r.time_created);
        Ok(out)
    }

    fn upsert_account(&self, account: Account) -> Result<()> {
        guard(&self.accounts).insert(account.id.clone(), account);
        Ok(())
    }

    fn get_account(&self, id: &str) -> Result<Account> {
        guard(&self.accounts)
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::AccountNotFound(id.to_string()))
    }

    fn update_account(&self, id: &str, f: Mutation<'_, Account>) -> Result<Account> {
        update_in(&mut guard(&self.accounts), id, f, FlowError::AccountNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FlowGraph, Node};
    use crate::store::SiteRef;
    use crate::types::{ResourceKind, TaskType};

    fn run() -> FlowRun {
        let graph = FlowGraph::new(vec![Node::new("1", Some(TaskType::Scan))], vec![]).unwrap();
        FlowRun::new(
            "acct",
            SiteRef {
                id: "site".into(),
                url: "https://example.com".into(),
            },
            graph,
        )
    }

    #[test]
    fn update_bumps_revision_and_persists() {
        let store = MemoryStore::new();
        let run = run();
        let id = run.id.clone();
        store.insert_flow_run(run).unwrap();

        let updated = store
            .update_flow_run(&id, &mut |r| {
                r.log("1", "hello");
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.revision, 1);
        assert_eq!(store.get_flow_run(&id).unwrap().logs.len(), 1);
    }

    #[test]
    fn failed_mutation_writes_nothing() {
        let store = MemoryStore::new();
        let resource = Resource::new(ResourceKind::Scan, "acct", vec!["html".into()]);
        let id = resource.id.clone();
        store.insert_resource(resource).unwrap();

        let res = store.update_resource(&id, &mut |r| {
            r.components.clear();
            Err(FlowError::LockError("nope".into()))
        });
        assert!(res.is_err());
        assert_eq!(store.get_resource(&id).unwrap().components, vec!["html"]);
    }

    #[test]
    fn missing_documents_are_typed_errors() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_flow_run("x"),
            Err(FlowError::FlowRunNotFound(_))
        ));
        assert!(matches!(
            store.update_account("x", &mut |_| Ok(())),
            Err(FlowError::AccountNotFound(_))
        ));
    }
}
