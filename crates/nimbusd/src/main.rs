//! nimbusd — the Nimbus control-plane daemon.
//!
//! Single binary that assembles the whole operator:
//! - store (redb)
//! - node agent client
//! - deployment workflow engine
//! - scaling & health loops
//! - routing cache projector
//! - REST API
//!
//! # Usage
//!
//! ```text
//! nimbusd run --config /etc/nimbus/nimbus.toml
//! nimbusd add-region --code eu-central-1 --name "EU Central" --country de
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use nimbus_api::{build_router, ApiState};
use nimbus_core::ipam::UlaAllocator;
use nimbus_core::OperatorConfig;
use nimbus_nodeclient::HttpNodeClient;
use nimbus_routing::Projector;
use nimbus_scaling::{HealthCheckConfig, HealthEngine, ReconcileConfig, ReconcileEngine};
use nimbus_store::Store;
use nimbus_workflow::{WorkflowConfig, WorkflowEngine};

#[derive(Parser)]
#[command(name = "nimbusd", about = "Nimbus control-plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to the operator config file.
        #[arg(long, default_value = "/etc/nimbus/nimbus.toml")]
        config: PathBuf,

        /// Override the API listen port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Register a region (administrative bootstrap).
    AddRegion {
        #[arg(long, default_value = "/etc/nimbus/nimbus.toml")]
        config: PathBuf,

        #[arg(long)]
        code: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        country: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nimbusd=debug,nimbus=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => {
            let mut config = OperatorConfig::load(&config)?;
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.api.data_dir = data_dir.display().to_string();
            }
            run(config).await
        }
        Command::AddRegion {
            config,
            code,
            name,
            country,
        } => {
            let config = OperatorConfig::load(&config)?;
            let store = open_store(&config)?;
            let region = store.create_region(&name, &code, &country)?;
            info!(id = %region.id, code = %region.code, "region registered");
            Ok(())
        }
    }
}

fn open_store(config: &OperatorConfig) -> anyhow::Result<Store> {
    let data_dir = PathBuf::from(&config.api.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("nimbus.redb");
    let store = Store::open(&db_path)?;
    info!(path = ?db_path, "store opened");
    Ok(store)
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    info!("nimbus control plane starting");
    let store = open_store(&config)?;

    // ── Subsystems ─────────────────────────────────────────────

    let agent = HttpNodeClient::new(config.node_client_timeout());
    let allocator = Arc::new(UlaAllocator::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workflow = WorkflowEngine::new(
        store.clone(),
        agent.clone(),
        allocator.clone(),
        WorkflowConfig {
            regions: config.deployment.regions.clone(),
            rollover_grace: config.rollover_grace(),
            stop_grace: config.terminate_grace(),
            ..Default::default()
        },
        shutdown_rx.clone(),
    );
    let resumed = workflow.rebuild_runs().await?;
    if resumed > 0 {
        info!(count = resumed, "found in-flight deployments from a previous run");
    }

    let reconciler = ReconcileEngine::new(
        store.clone(),
        agent.clone(),
        allocator,
        ReconcileConfig {
            regions: config.deployment.regions.clone(),
            cooldown: config.cooldown(),
            scale_up_cpu: config.scaling.scale_up_cpu,
            scale_down_cpu: config.scaling.scale_down_cpu,
            max_multiplier: config.scaling.max_multiplier,
            terminate_grace: config.terminate_grace(),
            stop_grace: config.terminate_grace(),
            ..Default::default()
        },
    );
    let health = HealthEngine::new(store.clone(), agent, HealthCheckConfig::default());

    // Rebuild the routing projection before serving anything.
    let stats = Projector::new(store.clone()).sync_active()?;
    info!(
        domains = stats.domains_synced,
        backends = stats.backends_total,
        "routing cache rebuilt"
    );

    // ── Background tasks ───────────────────────────────────────

    // Workflow trigger channel: the API pushes deployment IDs, the
    // dispatcher drives the engine.
    let (workflow_tx, mut workflow_rx) = mpsc::channel::<String>(32);
    let dispatcher = {
        let workflow = workflow.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = workflow_rx.recv() => {
                        let Some(deployment_id) = next else { break };
                        match workflow.start(&deployment_id).await {
                            Ok(disposition) => {
                                info!(deployment = %deployment_id, ?disposition, "workflow finished")
                            }
                            Err(e) => {
                                error!(deployment = %deployment_id, error = %e, "workflow failed")
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let reconcile_handle = {
        let reconciler = reconciler.clone();
        let period = config.reconcile_period();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { reconciler.run(period, shutdown).await })
    };
    let health_handle = {
        let health = health.clone();
        let period = config.health_period();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { health.run(period, shutdown).await })
    };

    // ── API server ─────────────────────────────────────────────

    let router = build_router(ApiState {
        store,
        workflow_tx,
        default_min_instances: config.scaling.default_min_instances,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C handler");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    let _ = dispatcher.await;
    let _ = reconcile_handle.await;
    let _ = health_handle.await;

    info!("nimbus control plane stopped");
    Ok(())
}
