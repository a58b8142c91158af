// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs the task manager against an in-process fleet.
//!
//! The fleet is seeded from a JSON file. With `--run`, one operation is
//! dispatched by name and the resulting fleet is printed; otherwise the
//! periodic maintenance hook runs until the process is interrupted.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context as _;
use dbaas_taskmanager::memory::MemoryFleet;
use dbaas_taskmanager::strategy::StrategyRegistry;
use dbaas_taskmanager::{Context, TaskManager, TaskManagerConfig};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, clap::Parser)]
#[clap(name = "dbaas-taskmanagerd", next_line_help = true)]
struct Args {
    #[clap(flatten)]
    taskmanager: dbaas_taskmanager::config::TaskManagerArgs,
    /// Which log messages to emit, in `RUST_LOG` syntax.
    #[clap(long, env = "TASKMANAGER_LOG_FILTER", default_value = "dbaas_taskmanager=info")]
    log_filter: String,
    /// JSON file the fleet is seeded from. The fleet starts empty without one.
    #[clap(long, env = "TASKMANAGER_FLEET_FILE", value_name = "PATH")]
    fleet_file: Option<PathBuf>,
    /// Dispatch this operation with the administrative context and exit.
    #[clap(long, value_name = "OPERATION")]
    run: Option<String>,
    /// JSON arguments for `--run`.
    #[clap(long, value_name = "JSON", default_value = "{}", requires = "run")]
    run_args: String,
}

#[tokio::main]
async fn main() {
    let args: Args = clap::Parser::parse();

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new(&args.log_filter))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();

    if let Err(err) = run(args).await {
        error!("dbaas-taskmanagerd: fatal: {err:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let fleet = match &args.fleet_file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading fleet file {}", path.display()))?;
            MemoryFleet::from_json(&json)
                .with_context(|| format!("parsing fleet file {}", path.display()))?
        }
        None => MemoryFleet::new(),
    };
    info!(instances = fleet.instances().len(), "loaded fleet");

    let config = TaskManagerConfig::from(args.taskmanager);
    let manager = TaskManager::new(
        config,
        Arc::new(fleet.clone()),
        Arc::new(fleet.clone()),
        Arc::new(StrategyRegistry::new()),
    )
    .with_exists_publisher(Arc::new(fleet.clone()));

    if let Some(operation) = &args.run {
        let op_args: Value =
            serde_json::from_str(&args.run_args).context("parsing --run-args")?;
        let ctx: Context = manager.admin_context().clone();
        manager.dispatch(&ctx, operation, op_args).await?;
        let instances = serde_json::to_string_pretty(&fleet.instances())?;
        println!("{instances}");
        return Ok(());
    }

    let periodic = manager.spawn_periodic_tasks();
    if periodic.is_none() {
        info!("periodic tasks disabled");
    }
    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("interrupted; shutting down");
    if let Some(periodic) = periodic {
        periodic.shutdown().await;
    }
    Ok(())
}
