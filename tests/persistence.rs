// tests/persistence.rs

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde_json::json;

use auditflow::engine::{CompletionTrigger, NodeUpdate, StepExecutor};
use auditflow::errors::FlowError;
use auditflow::lock::{FileLockService, LockService, MemoryLockService, try_lock};
use auditflow::store::{Account, FileStore, Resource, Store};
use auditflow::types::{AccountTier, NodeStatus, ResourceKind, UsageKind};
use auditflow_test_utils::builders::{GraphBuilder, NodeBuilder, flow_run};
use auditflow_test_utils::fakes::RecordingDispatcher;
use auditflow_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn file_store_survives_reopen_and_counts_revisions() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let graph = GraphBuilder::new()
        .node(NodeBuilder::new("1", auditflow::types::TaskType::Scan).build())
        .build();
    let run = flow_run(graph);
    let run_id = run.id.clone();

    {
        let store: Arc<dyn Store> = Arc::new(FileStore::open(dir.path())?);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let executor = StepExecutor::new(Arc::clone(&store), dispatcher.clone());
        let trigger = CompletionTrigger::new(Arc::clone(&store), dispatcher, executor.clone());

        store.insert_flow_run(run)?;
        executor.advance(&run_id)?;
        trigger.report(&run_id, NodeUpdate::new(0).with_status(NodeStatus::Passed))?;
    }

    let reopened = FileStore::open(dir.path())?;
    let run = reopened.get_flow_run(&run_id)?;
    assert!(run.is_complete());
    assert_eq!(run.status, NodeStatus::Passed);
    assert!(run.revision >= 2, "revision = {}", run.revision);
    assert_eq!(reopened.list_flow_runs()?.len(), 1);
    Ok(())
}

#[test]
fn file_store_lists_only_incomplete_resources() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = FileStore::open(dir.path())?;

    let open = Resource::new(ResourceKind::Scan, "acct", vec!["html".into()]);
    let open_id = open.id.clone();
    let mut done = Resource::new(ResourceKind::Test, "acct", vec!["vrt".into()]);
    done.results.insert("vrt".into(), json!({}));
    done.time_completed = Some(chrono::Utc::now());
    store.insert_resource(open)?;
    store.insert_resource(done)?;

    let incomplete = store.list_incomplete_resources()?;
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].id, open_id);
    Ok(())
}

#[test]
fn failed_update_writes_nothing() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = FileStore::open(dir.path())?;
    let resource = Resource::new(ResourceKind::Scan, "acct", vec!["html".into()]);
    let id = resource.id.clone();
    store.insert_resource(resource)?;

    let err = store
        .update_resource(&id, &mut |r| {
            r.results.insert("html".into(), json!({ "ok": true }));
            Err(FlowError::Other(anyhow::anyhow!("abort")))
        })
        .unwrap_err();
    assert!(matches!(err, FlowError::Other(_)));
    assert!(!store.get_resource(&id)?.has_result("html"));

    assert!(matches!(
        store.get_resource("missing"),
        Err(FlowError::ResourceNotFound(_))
    ));
    Ok(())
}

#[test]
fn two_file_stores_on_one_root_do_not_lose_updates() -> TestResult {
    const THREADS: usize = 8;
    const ROUNDS: u64 = 25;
    let dir = tempfile::tempdir()?;
    let stores: [Arc<dyn Store>; 2] = [
        Arc::new(FileStore::open(dir.path())?),
        Arc::new(FileStore::open(dir.path())?),
    ];
    stores[0].upsert_account(Account::new("acme", AccountTier::Metered).with_allowance(UsageKind::Scans, 0))?;
    let run = flow_run(
        GraphBuilder::new()
            .node(NodeBuilder::new("1", auditflow::types::TaskType::Scan).build())
            .build(),
    );
    let run_id = run.id.clone();
    stores[1].insert_flow_run(run)?;

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|n| {
            let store = Arc::clone(&stores[n % 2]);
            let barrier = Arc::clone(&barrier);
            let run_id = run_id.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    store
                        .update_account("acme", &mut |a| {
                            a.usage.entry(UsageKind::Scans).or_default().used += 1;
                            Ok(())
                        })
                        .unwrap();
                    store.update_flow_run(&run_id, &mut |_| Ok(())).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = THREADS as u64 * ROUNDS;
    assert_eq!(stores[0].get_account("acme")?.usage[&UsageKind::Scans].used, expected);
    assert_eq!(stores[1].get_flow_run(&run_id)?.revision, expected);
    Ok(())
}

/// Many threads race for one lock; exactly one wins each round.
fn exactly_one_winner(locks: Arc<dyn LockService>) {
    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS));
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let locks = Arc::clone(&locks);
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                barrier.wait();
                let guard = try_lock(&locks, "component:r1:html", Duration::from_secs(60)).unwrap();
                if guard.is_some() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                // Hold until everyone has tried.
                barrier.wait();
                drop(guard);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);

    // Released by the guard drop.
    assert!(try_lock(&locks, "component:r1:html", Duration::from_secs(60))
        .unwrap()
        .is_some());
}

#[test]
fn memory_locks_are_exclusive_across_threads() {
    exactly_one_winner(Arc::new(MemoryLockService::new()));
}

#[test]
fn file_locks_are_exclusive_across_threads() -> TestResult {
    let dir = tempfile::tempdir()?;
    exactly_one_winner(Arc::new(FileLockService::open(dir.path())?));
    Ok(())
}

#[test]
fn file_locks_are_shared_between_services_on_one_directory() -> TestResult {
    let dir = tempfile::tempdir()?;
    let a: Arc<dyn LockService> = Arc::new(FileLockService::open(dir.path())?);
    let b: Arc<dyn LockService> = Arc::new(FileLockService::open(dir.path())?);
    let ttl = Duration::from_secs(60);

    let held = try_lock(&a, "component:r2:vrt", ttl)?;
    assert!(held.is_some());
    assert!(try_lock(&b, "component:r2:vrt", ttl)?.is_none());
    drop(held);
    assert!(try_lock(&b, "component:r2:vrt", ttl)?.is_some());
    Ok(())
}
