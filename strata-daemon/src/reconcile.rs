//! State reconciliation for stratad.
//!
//! On daemon startup, re-provisions account namespaces the cluster lost and
//! re-enters every lifecycle operation that was interrupted: stacks persisted
//! as starting or started are started again (controller creation is
//! idempotent), stacks persisted as stopping are stopped again.

use crate::accounts::AccountManager;
use crate::orchestrator::StackOrchestrator;
use std::sync::Arc;
use strata_core::state::StackStore;
use strata_core::{Result, StackStatus};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Reconciles daemon state on startup.
pub struct StateReconciler {
    store: Arc<dyn StackStore>,
    accounts: AccountManager,
    orchestrator: StackOrchestrator,
}

impl StateReconciler {
    pub fn new(
        store: Arc<dyn StackStore>,
        accounts: AccountManager,
        orchestrator: StackOrchestrator,
    ) -> Self {
        Self { store, accounts, orchestrator }
    }

    /// Provision accounts and spawn one resume task per interrupted stack.
    ///
    /// Resumed operations run independently; the report carries their
    /// handles.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        info!("Reconciling daemon state...");
        let mut report = ReconcileReport::default();

        for account in self.store.list_accounts().await? {
            let namespace = account.namespace.clone();
            if let Err(e) = self.accounts.ensure_provisioned(&account).await {
                error!("Failed to provision account {}: {}", namespace, e);
                report.failed_accounts += 1;
                continue;
            }
            report.accounts += 1;

            let stacks = match self.store.list_stacks(&namespace).await {
                Ok(stacks) => stacks,
                Err(e) => {
                    error!("Failed to list stacks of {}: {}", namespace, e);
                    report.failed_accounts += 1;
                    continue;
                }
            };

            for stack in stacks {
                let orchestrator = self.orchestrator.clone();
                let namespace = namespace.clone();
                let stack_id = stack.id.clone();
                match stack.status {
                    StackStatus::Starting | StackStatus::Started => {
                        info!("Resuming start of stack {}/{}", namespace, stack_id);
                        report.starts += 1;
                        report.tasks.push(tokio::spawn(async move {
                            if let Err(e) = orchestrator.resume_start(&namespace, &stack_id).await {
                                warn!("Error starting stack {} {}: {}", namespace, stack_id, e);
                            }
                        }));
                    }
                    StackStatus::Stopping => {
                        info!("Resuming stop of stack {}/{}", namespace, stack_id);
                        report.stops += 1;
                        report.tasks.push(tokio::spawn(async move {
                            if let Err(e) = orchestrator.stop(&namespace, &stack_id).await {
                                warn!("Error stopping stack {} {}: {}", namespace, stack_id, e);
                            }
                        }));
                    }
                    StackStatus::Stopped | StackStatus::Error => {}
                }
            }
        }

        info!(
            "Reconciliation complete: {} accounts, {} starts resumed, {} stops resumed",
            report.accounts, report.starts, report.stops
        );
        Ok(report)
    }
}

/// Report of reconciliation actions taken.
#[derive(Default, Debug)]
pub struct ReconcileReport {
    /// Accounts whose namespace is in place
    pub accounts: usize,
    /// Accounts that could not be provisioned or listed
    pub failed_accounts: usize,
    pub starts: usize,
    pub stops: usize,
    /// Resume tasks, one per interrupted stack
    pub tasks: Vec<JoinHandle<()>>,
}

impl ReconcileReport {
    /// Wait for every resumed operation to finish.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Resume task panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::EventReconciler;
    use strata_core::types::{Dependency, PortSpec, Protocol};
    use strata_core::{
        state, Account, CatalogScope, ClusterDriver, Config, ServiceSpec, ServiceStatus,
        SimulatedCluster, Stack, StackService, StateManager,
    };

    fn specs() -> Vec<ServiceSpec> {
        let mut db = ServiceSpec::new("db", "postgres:16");
        db.ports = vec![PortSpec { port: 5432, protocol: Protocol::Tcp }];
        let mut web = ServiceSpec::new("web", "nginx:1.25");
        web.dependencies = vec![Dependency { key: "db".into(), required: true, share_config: false }];
        vec![db, web]
    }

    async fn seed(
        orchestrator: &StackOrchestrator,
        store: &StateManager,
        account: &str,
        status: StackStatus,
    ) -> String {
        let stack = Stack::new("web", status.to_string())
            .with_service(StackService::new("db"))
            .with_service(StackService::new("web"));
        let id = orchestrator.create_stack(account, stack).await.unwrap().id;
        state::update_stack(store, account, &id, |stack| {
            stack.status = status;
            Ok(true)
        })
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn test_reconcile_resumes_interrupted_stacks() {
        let store = Arc::new(StateManager::new_in_memory().await.unwrap());
        let cluster = SimulatedCluster::new();
        let config = Arc::new(Config { poll_interval_ms: 20, ..Config::default() });
        for spec in specs() {
            store.put_service_spec(CatalogScope::System, "", &spec).await.unwrap();
        }
        for namespace in ["demo", "broken"] {
            store
                .put_account(&Account {
                    namespace: namespace.into(),
                    name: namespace.into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        cluster.fail("create_namespace", "broken");

        let _events = EventReconciler::new(store.clone()).spawn(&cluster).await.unwrap();
        let driver: Arc<dyn ClusterDriver> = Arc::new(cluster.clone());
        let orchestrator = StackOrchestrator::new(store.clone(), driver.clone(), config.clone());
        let accounts = AccountManager::new(store.clone(), driver, config);

        let starting = seed(&orchestrator, &store, "demo", StackStatus::Starting).await;
        let started = seed(&orchestrator, &store, "demo", StackStatus::Started).await;
        let stopping = seed(&orchestrator, &store, "demo", StackStatus::Stopping).await;
        let stopped = seed(&orchestrator, &store, "demo", StackStatus::Stopped).await;
        let errored = seed(&orchestrator, &store, "demo", StackStatus::Error).await;
        let unreachable = seed(&orchestrator, &store, "broken", StackStatus::Starting).await;

        let reconciler = StateReconciler::new(store.clone(), accounts, orchestrator);
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.accounts, 1);
        assert_eq!(report.failed_accounts, 1);
        assert_eq!(report.starts, 2);
        assert_eq!(report.stops, 1);
        assert_eq!(report.tasks.len(), 3);

        tokio::time::timeout(std::time::Duration::from_secs(5), report.join()).await.unwrap();

        let status = |id: String| {
            let store = store.clone();
            async move { store.get_stack("demo", &id).await.unwrap().unwrap() }
        };
        for id in [starting, started] {
            let stack = status(id).await;
            assert_eq!(stack.status, StackStatus::Started);
            assert!(stack.services.iter().all(|s| s.status == ServiceStatus::Ready));
        }
        assert_eq!(status(stopping).await.status, StackStatus::Stopped);
        assert_eq!(status(stopped).await.status, StackStatus::Stopped);
        assert_eq!(status(errored).await.status, StackStatus::Error);

        assert!(cluster.namespace_exists("demo").await.unwrap());
        assert!(!cluster.namespace_exists("broken").await.unwrap());
        let stack = store.get_stack("broken", &unreachable).await.unwrap().unwrap();
        assert_eq!(stack.status, StackStatus::Starting);
        assert_eq!(cluster.operations("create_controller").len(), 4);
    }
}
