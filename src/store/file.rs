// src/store/file.rs

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{FlowError, Result};
use crate::lock::{FileLockService, LockService};
use crate::store::records::{Account, FlowRun, Resource};
use crate::store::{Mutation, Store};

const FLOW_RUNS: &str = "flow_runs";
const RESOURCES: &str = "resources";
const ACCOUNTS: &str = "accounts";
const LOCKS: &str = "locks";

/// A document lock outliving this is treated as left behind by a dead process.
const DOCUMENT_LOCK_TTL: Duration = Duration::from_secs(30);
const DOCUMENT_LOCK_WAIT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_millis(20);

/// Durable store: one pretty-printed JSON document per record.
///
/// Layout under the root directory:
///
/// ```text
/// flow_runs/<id>.json
/// resources/<id>.json
/// accounts/<id>.json
/// locks/<collection>:<id>.lock
/// ```
///
/// Writes go to a temp file in the same directory which is then renamed over
/// the target, so readers never observe a half-written document.
///
/// Every read-modify-write holds a [`FileLockService`] lock named after the
/// document, so several processes sharing the root serialize their updates.
/// Plain inserts and reads take no lock.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    locks: FileLockService,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [FLOW_RUNS, RESOURCES, ACCOUNTS] {
            fs::create_dir_all(root.join(dir))?;
        }
        let locks = FileLockService::open(root.join(LOCKS))?;
        debug!(root = %root.display(), "opened file store");
        Ok(Self { root, locks })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, collection: &str, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(FlowError::Other(anyhow::anyhow!(
                "invalid document id '{id}'"
            )));
        }
        Ok(self.root.join(collection).join(format!("{id}.json")))
    }

    fn read<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
        not_found: impl FnOnce(String) -> FlowError,
    ) -> Result<T> {
        let path = self.path_for(collection, id)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn write<T: Serialize>(&self, collection: &str, id: &str, doc: &T) -> Result<()> {
        let path = self.path_for(collection, id)?;
        let dir = self.root.join(collection);
        let tmp = dir.join(format!(".{id}.{}.tmp", Uuid::new_v4()));

        let bytes = serde_json::to_vec_pretty(doc)?;
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.root.join(collection))? {
            let path = entry?.path();
            let is_doc = path.extension().is_some_and(|e| e == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_doc {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(doc) => out.push(doc),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable document"),
            }
        }
        Ok(out)
    }

    fn update<T: Serialize + DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
        f: Mutation<'_, T>,
        not_found: impl FnOnce(String) -> FlowError,
    ) -> Result<T> {
        // Reject bad ids before they become lock names.
        self.path_for(collection, id)?;
        let name = format!("{collection}:{id}");
        let token = self.acquire(&name)?;

        let result = self.read(collection, id, not_found).and_then(|mut doc: T| {
            f(&mut doc)?;
            self.write(collection, id, &doc)?;
            Ok(doc)
        });

        if let Err(e) = self.locks.release(&name, &token) {
            warn!(lock = %name, error = %e, "failed to release document lock; it will expire");
        }
        result
    }

    /// Block until the document lock `name` is ours.
    fn acquire(&self, name: &str) -> Result<String> {
        let deadline = Instant::now() + DOCUMENT_LOCK_WAIT;
        let mut backoff = Duration::from_millis(1);
        loop {
            if let Some(token) = self.locks.try_acquire(name, DOCUMENT_LOCK_TTL)? {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                return Err(FlowError::LockError(format!(
                    "timed out after {DOCUMENT_LOCK_WAIT:?} waiting for {name}"
                )));
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl Store for FileStore {
    fn insert_flow_run(&self, run: FlowRun) -> Result<()> {
        self.write(FLOW_RUNS, &run.id, &run)
    }

    fn get_flow_run(&self, id: &str) -> Result<FlowRun> {
        self.read(FLOW_RUNS, id, FlowError::FlowRunNotFound)
    }

    fn update_flow_run(&self, id: &str, f: Mutation<'_, FlowRun>) -> Result<FlowRun> {
        self.update(
            FLOW_RUNS,
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
        let mut runs: Vec<FlowRun> = self.list(FLOW_RUNS)?;
        runs.sort_by_key(|r| r.time_created);
        Ok(runs)
    }

    fn insert_resource(&self, resource: Resource) -> Result<()> {
        self.write(RESOURCES, &resource.id, &resource)
    }

    fn get_resource(&self, id: &str) -> Result<Resource> {
        self.read(RESOURCES, id, FlowError::ResourceNotFound)
    }

    fn update_resource(&self, id: &str, f: Mutation<'_, Resource>) -> Result<Resource> {
        self.update(RESOURCES, id, f, FlowError::ResourceNotFound)
    }

    fn list_incomplete_resources(&self) -> Result<Vec<Resource>> {
        let mut out: Vec<Resource> = self
            .list::<Resource>(RESOURCES)?
            .into_iter()
            .filter(|r| !r.is_complete())
            .collect();
        out.sort_by_key(|r| r.time_created);
        Ok(out)
    }

    fn upsert_account(&self, account: Account) -> Result<()> {
        self.write(ACCOUNTS, &account.id, &account)
    }

    fn get_account(&self, id: &str) -> Result<Account> {
        self.read(ACCOUNTS, id, FlowError::AccountNotFound)
    }

    fn update_account(&self, id: &str, f: Mutation<'_, Account>) -> Result<Account> {
        self.update(ACCOUNTS, id, f, FlowError::AccountNotFound)
    }
}
