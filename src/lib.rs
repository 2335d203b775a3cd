// src/lib.rs

pub mod cli;
pub mod condition;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod gate;
pub mod graph;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod reconcile;
pub mod store;
pub mod types;

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command};
use crate::config::loader::load_and_validate;
use crate::dispatch::DispatchTable;
use crate::engine::Engine;
use crate::graph::{FlowDefinition, load_flow_definition};
use crate::store::{FlowRun, SiteRef};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - store, locks and the engine
/// - workers with the simulated dispatch table
/// - the retry reconciler
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    match &args.command {
        Command::Validate { flow } => {
            let definition = load_flow_definition(flow)?;
            print_flow(&definition);
            Ok(())
        }
        Command::Start {
            flow,
            account,
            site,
            site_id,
            once,
        } => {
            let definition = load_flow_definition(flow)?;
            let engine = build_engine(&args)?;
            let workers = engine.spawn_workers();

            let site = SiteRef {
                id: site_id.clone().unwrap_or_else(|| site.clone()),
                url: site.clone(),
            };
            let run = engine.start_flow_run(&definition, account, site)?;
            info!(flow_run_id = %run.id, "flow run started");

            if *once {
                // Generous upper bound; simulated components finish in
                // milliseconds.
                if !engine.wait_idle(Duration::from_millis(20), Duration::from_secs(300)).await {
                    warn!(flow_run_id = %run.id, "queue did not drain; reporting current state");
                }
                let run = engine.store().get_flow_run(&run.id)?;
                print_run(&run);
            } else {
                serve_until_ctrl_c(&engine).await?;
            }

            for worker in workers {
                worker.abort();
            }
            Ok(())
        }
        Command::Serve => {
            let engine = build_engine(&args)?;
            let workers = engine.spawn_workers();
            serve_until_ctrl_c(&engine).await?;
            for worker in workers {
                worker.abort();
            }
            Ok(())
        }
        Command::Reconcile => {
            let engine = build_engine(&args)?;
            warn!("sweeping without a live queue; stop any `serve` on this store first");
            let workers = engine.spawn_workers();
            let report = engine.reconciler().sweep()?;
            engine
                .wait_idle(Duration::from_millis(20), Duration::from_secs(300))
                .await;
            println!(
                "redispatched {} job(s), completed {} resource(s), {} component(s) exhausted",
                report.redispatched.len(),
                report.completed.len(),
                report.exhausted.len()
            );
            println!(
                "redispatched {} step(s), {} step(s) exhausted, advanced {} flow run(s)",
                report.steps_redispatched.len(),
                report.steps_exhausted.len(),
                report.advanced.len()
            );
            for (resource_id, component) in &report.exhausted {
                println!("  exhausted: {resource_id} / {component}");
            }
            for (flow_run_id, node_id) in &report.steps_exhausted {
                println!("  step exhausted: {flow_run_id} / {node_id}");
            }
            for worker in workers {
                worker.abort();
            }
            Ok(())
        }
    }
}

fn build_engine(args: &CliArgs) -> Result<Engine> {
    let cfg = load_and_validate(&args.config)?;
    debug!(engine = ?cfg.engine, backend = ?cfg.store.backend, "configuration loaded");
    let table = DispatchTable::simulated(cfg.engine.component_delay);
    Ok(Engine::from_config(&cfg, table)?)
}

/// Run the reconciler on its interval until Ctrl-C.
async fn serve_until_ctrl_c(engine: &Engine) -> Result<()> {
    let interval = engine.options().reconcile_interval;
    let reconciler = engine.reconciler().clone();
    let sweeper = tokio::spawn(reconciler.run(interval));
    info!(?interval, "serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    sweeper.abort();
    Ok(())
}

/// Print nodes, edges and branch conditions of a flow definition.
fn print_flow(definition: &FlowDefinition) {
    let name = if definition.name.is_empty() {
        "(unnamed)"
    } else {
        definition.name.as_str()
    };
    println!("flow: {name}");
    println!("  end_on_fail = {}", definition.end_on_fail);
    println!();

    let graph = &definition.graph;
    println!("nodes ({}):", graph.len());
    for (index, node) in graph.nodes().iter().enumerate() {
        let task_type = node
            .task_type
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  [{index}] {} ({task_type})", node.id);
        if let Some(parent) = &node.parent_id {
            println!("      after: {parent}");
        }
        if let Some(branch) = node.start_if {
            println!("      start_if: {branch}");
        }
        if let Some(conditions) = &node.conditions {
            println!("      conditions: {conditions}");
        }
        if let Some(alert) = &node.alert_id {
            println!("      alert_id: {alert}");
        }
    }

    debug!("validate complete (no execution)");
}

fn print_run(run: &FlowRun) {
    println!("flow run {} ({})", run.id, run.status);
    for node in run.graph.nodes() {
        println!(
            "  {:<8} {:<8} objects={}",
            node.id,
            node.status.to_string(),
            node.objects.len()
        );
    }
    println!();
    for entry in &run.logs {
        println!("  {} [{}] {}", entry.timestamp.format("%H:%M:%S"), entry.step, entry.message);
    }
}
