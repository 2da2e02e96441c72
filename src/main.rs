use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vcnest::agent::{AgentClient, WsAgentCall};
use vcnest::api::certs::MemoryCertStore;
use vcnest::api::Store;
use vcnest::cli::Args;
use vcnest::config::Settings;
use vcnest::controller::{
    EventRecorder, HostPortManager, KubeconfigApiFactory, NodeController, NodeHealthMonitor,
};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let ports = Arc::new(match args.port_pool.as_deref() {
        Some(path) => match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|doc| HostPortManager::from_yaml(&doc).map_err(|e| e.to_string()))
        {
            Ok(manager) => manager,
            Err(e) => {
                error!("Failed to load port pool {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => HostPortManager::new(Vec::new()),
    });
    info!(
        "port pool loaded with {} existing allocation(s)",
        ports.allocations().len()
    );

    let store = Arc::new(Store::new());
    let certs = Arc::new(MemoryCertStore::new());
    let events = Arc::new(EventRecorder::new());
    let agent = Arc::new(AgentClient::new(Arc::new(WsAgentCall::new()), &settings));

    let monitor = Arc::new(NodeHealthMonitor::new(store.clone()));
    let controller = Arc::new(NodeController::new(
        store.clone(),
        certs,
        agent,
        Arc::new(KubeconfigApiFactory),
        events,
        ports,
        settings.clone(),
    ));

    let cancel = CancellationToken::new();

    if args.once {
        for cluster in store.clusters.list() {
            if let Err(e) = controller.reconcile_cluster(&cluster.name, &cancel).await {
                error!("reconcile of '{}' failed: {}", cluster.name, e);
            }
        }
        monitor.evaluate_all(chrono::Utc::now()).await;
        return;
    }

    info!(
        "vcnest starting: reconcile every {}s, agent port {}",
        settings.reconcile_interval_secs, settings.agent_port
    );

    let monitor_cancel = cancel.clone();
    let monitor_task = tokio::spawn(async move {
        monitor
            .run(vcnest::controller::health::CHECK_INTERVAL, monitor_cancel)
            .await;
    });

    let controller_cancel = cancel.clone();
    let controller_task = tokio::spawn(async move {
        controller.run(controller_cancel).await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("shutdown requested, draining in-flight work");
    cancel.cancel();

    let _ = monitor_task.await;
    let _ = controller_task.await;
    info!("vcnest stopped");
}
