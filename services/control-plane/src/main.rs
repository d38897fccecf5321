//! capsched admin binary.
//!
//! Runs migrations, recomputes cached capacity, answers placement queries
//! and lists nodes and bindings. `run` keeps the recompute worker going
//! until Ctrl-C.

use std::collections::BTreeSet;

use anyhow::Result;
use capsched_capacity::Requirements;
use capsched_control_plane::{
    config::Config,
    db::{Database, FleetStore},
    scheduler::{PgPlacement, RecomputeWorker},
};
use capsched_id::{DcId, NodeId};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod output;

use output::{print_error, print_info, print_output, print_success, BindingView, NodeView, OutputFormat};

#[derive(Debug, Parser)]
#[command(name = "capsched", version, about = "Capacity accounting and placement admin")]
struct Cli {
    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending database migrations.
    Migrate,

    /// Recompute cached capacity of one node, or of every compute node.
    Recompute {
        #[arg(long)]
        node: Option<NodeId>,
    },

    /// Show which node a VM of the given size would land on.
    Choose {
        #[arg(long)]
        dc: DcId,

        #[arg(long)]
        cpu: i64,

        /// MB, including hypervisor overhead.
        #[arg(long)]
        ram: i64,

        /// `zpool=MB`; repeatable.
        #[arg(long = "disk", value_parser = parse_disk)]
        disks: Vec<(String, i64)>,
    },

    /// List nodes with their cached free resources.
    Nodes,

    /// List the tenant bindings of a node.
    Bindings {
        #[arg(long)]
        node: NodeId,
    },

    /// Run the periodic recompute worker until Ctrl-C.
    Run,
}

fn parse_disk(raw: &str) -> Result<(String, i64), String> {
    let (zpool, size) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected zpool=MB, got '{raw}'"))?;
    if zpool.is_empty() {
        return Err(format!("empty zpool in '{raw}'"));
    }
    let size = size
        .parse()
        .map_err(|e| format!("invalid size in '{raw}': {e}"))?;
    Ok((zpool.to_string(), size))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CAPSCHED_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli, config).await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let db = Database::connect(&config.database).await?;
    db.health_check().await?;
    let store = db.fleet_store(config.settings.clone());

    match cli.command {
        Command::Migrate => {
            db.run_migrations().await?;
            print_success("migrations applied");
        }
        Command::Recompute { node: Some(node) } => {
            store.recompute_node(node).await?;
            print_success(&format!("{node} recomputed"));
        }
        Command::Recompute { node: None } => {
            let count = store.recompute_all().await?;
            print_success(&format!("{count} compute nodes recomputed"));
        }
        Command::Choose {
            dc,
            cpu,
            ram,
            disks,
        } => {
            let req = disks
                .into_iter()
                .fold(Requirements::new(cpu, ram), |req, (zpool, size)| {
                    req.with_disk(zpool, size)
                });
            let placement = PgPlacement::new(store);
            match placement.choose_node(dc, &req, &BTreeSet::new()).await {
                Ok(node) => print_success(&format!("{node}")),
                Err(e) if e.capacity().is_some_and(|c| c.is_capacity_exhausted()) => {
                    print_info(&e.to_string());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Nodes => {
            let rows: Vec<NodeView> = store
                .node_summaries()
                .await?
                .into_iter()
                .map(NodeView::from)
                .collect();
            print_output(&rows, format);
        }
        Command::Bindings { node } => {
            let rows: Vec<BindingView> = store
                .binding_summaries(node)
                .await?
                .into_iter()
                .map(BindingView::from)
                .collect();
            print_output(&rows, format);
        }
        Command::Run => run_worker(store, &config).await?,
    }
    Ok(())
}

async fn run_worker(store: FleetStore, config: &Config) -> Result<()> {
    info!("Starting capsched recompute worker");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = RecomputeWorker::new(store, config.recompute_interval);
    worker.run_once().await?;
    let handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    if shutdown_tx.send(true).is_err() {
        warn!("Recompute worker already stopped");
    }

    let shutdown_timeout = std::time::Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, handle).await {
        Ok(Ok(())) => info!("Recompute worker stopped"),
        Ok(Err(e)) => error!(error = %e, "Recompute worker panicked"),
        Err(_) => warn!("Recompute worker did not shut down in time"),
    }
    Ok(())
}
