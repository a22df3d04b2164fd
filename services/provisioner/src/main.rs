//! slipway provisioner daemon.
//!
//! Wires the core against its production collaborators and runs the
//! background workers: the node healer and the record reconciliation
//! pass. The API layer that consumes the provisioner facade runs as a
//! separate service.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use slipway_provisioner::cluster::host::HttpHostClient;
use slipway_provisioner::cluster::Cluster;
use slipway_provisioner::config::Config;
use slipway_provisioner::fix::{recover_bindings, FixWorker};
use slipway_provisioner::healer::{NodeHealer, SuspicionTracker};
use slipway_provisioner::image::RegistryClient;
use slipway_provisioner::router::web::WebRouter;
use slipway_provisioner::router::RouterRegistry;
use slipway_provisioner::state::{CoreState, NullBinding};
use slipway_provisioner::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting slipway provisioner");

    let config = Config::from_env()?;
    info!(database = %config.database_path, "configuration loaded");

    let storage = Storage::open(&config.database_path)?;
    let host_client = Arc::new(HttpHostClient::new(config.host_connect_timeout));
    let cluster = Arc::new(Cluster::new(host_client));

    let routers = Arc::new(RouterRegistry::new());
    routers.register(Arc::new(WebRouter::new(config.router.clone())));

    let registry = config
        .registry
        .as_deref()
        .map(|address| Arc::new(RegistryClient::new(address)));

    let tracker = Arc::new(SuspicionTracker::new(
        config.healing.failure_threshold,
        config.healing.failure_window,
    ));
    cluster.set_failure_sink(tracker.clone());

    let state = Arc::new(CoreState {
        config,
        store: storage.containers(),
        catalog: storage.images(),
        healing: storage.healing(),
        cluster,
        routers,
        binding: Arc::new(NullBinding),
        registry,
    });

    let recovered = recover_bindings(&state).await?;
    info!(recovered, "startup recovery complete");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let healer = NodeHealer::new(state.clone(), tracker);
    let healer_shutdown = shutdown_rx.clone();
    let healer_task = tokio::spawn(async move { healer.run(healer_shutdown).await });

    let fixer = FixWorker::new(state.clone());
    let fixer_shutdown = shutdown_rx;
    let fixer_task = tokio::spawn(async move { fixer.run(fixer_shutdown).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = healer_task.await;
    let _ = fixer_task.await;

    Ok(())
}
