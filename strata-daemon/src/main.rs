use std::path::Path;
use std::sync::Arc;
use strata_core::cluster::ClusterDriver;
use strata_core::state::StackStore;
use strata_core::{
    catalog, init_observability, shutdown_observability, Caller, CatalogView, Config,
    HealthChecker, ServiceCatalog, SimulatedCluster, StateManager,
};
use tracing::{error, info, warn};

use strata_daemon::shutdown::{shutdown_signal, ShutdownManager};
use strata_daemon::{AccountManager, EventReconciler, StackOrchestrator, StateReconciler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(Config::load()?);

    // Initialize observability FIRST
    init_observability(&config.log_level, config.metrics_port)?;

    info!("strata daemon starting");

    let health_checker = HealthChecker::new();
    health_checker.register("daemon").await;

    let state = Arc::new(StateManager::new(&config.db_path).await?);
    let store: Arc<dyn StackStore> = state.clone();
    health_checker.register("store").await;

    let driver: Arc<dyn ClusterDriver> = Arc::new(SimulatedCluster::new());
    info!(driver = driver.name(), "Cluster driver initialized");
    health_checker.register("cluster").await;

    if let Some(dir) = &config.specs_dir {
        if let Err(e) = catalog::load_specs(&*store, Path::new(dir)).await {
            warn!("Failed to load service specs from {}: {}", dir, e);
        }
    }
    let catalog = ServiceCatalog::new(store.clone());
    let services = catalog.list(&Caller::admin(), CatalogView::System).await?;
    info!("System catalog holds {} services", services.len());

    let reconciler = match EventReconciler::new(store.clone()).spawn(&*driver).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to watch cluster events: {}", e);
            return Err(e.into());
        }
    };
    health_checker.register("reconciler").await;

    let orchestrator = StackOrchestrator::new(store.clone(), driver.clone(), config.clone());
    let accounts = AccountManager::new(store.clone(), driver.clone(), config.clone());

    let report = StateReconciler::new(store.clone(), accounts, orchestrator).reconcile().await?;
    if report.failed_accounts > 0 {
        health_checker
            .set(
                "reconciler",
                strata_core::observability::health::HealthStatus::Degraded,
                Some(format!("{} accounts could not be provisioned", report.failed_accounts)),
            )
            .await;
    }
    let resumed = report.starts + report.stops;
    tokio::spawn(async move {
        report.join().await;
        info!("{} resumed stack operations finished", resumed);
    });

    let health = health_checker.report().await;
    info!(health = %serde_json::to_string(&health)?, "strata daemon ready");

    let mut shutdown_rx = shutdown_signal();
    let _ = shutdown_rx.recv().await;

    ShutdownManager::new(state, reconciler).shutdown().await;

    info!("strata daemon shutting down");
    shutdown_observability();
    Ok(())
}
