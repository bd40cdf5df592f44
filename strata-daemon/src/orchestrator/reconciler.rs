//! Cluster event reconciliation.
//!
//! Consumes the pod and controller watch streams and folds each notification
//! into the status of the stack service it concerns. The owning account is the
//! namespace; the stack and stack service come from the object labels.

use std::sync::Arc;
use strata_core::cluster::{
    ClusterDriver, ClusterEvent, ControllerEvent, PodEvent, PodState, WatchEventType, LABEL_NAME,
    LABEL_STACK, SYSTEM_NAMESPACES,
};
use strata_core::observability::metrics;
use strata_core::state::{self, StackStore};
use strata_core::types::{ServiceStatus, StackService};
use strata_core::{Result, StrataError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Event reasons that are transient and not worth recording.
const IGNORED_REASONS: &[&str] = &["MissingClusterDNS", "FailedSync"];

/// Warning reason that does not mean the service failed.
const UNHEALTHY: &str = "Unhealthy";

/// Handles of the two watch tasks.
pub struct ReconcilerHandle {
    pods: JoinHandle<()>,
    controllers: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn abort(&self) {
        self.pods.abort();
        self.controllers.abort();
    }

    /// True while either stream is still being consumed.
    pub fn is_running(&self) -> bool {
        !self.pods.is_finished() || !self.controllers.is_finished()
    }
}

/// Applies cluster events to persisted stack service status.
#[derive(Clone)]
pub struct EventReconciler {
    store: Arc<dyn StackStore>,
}

impl EventReconciler {
    pub fn new(store: Arc<dyn StackStore>) -> Self {
        Self { store }
    }

    /// Subscribe to both watch streams and consume each on its own task.
    ///
    /// The subscriptions exist when this returns, so no event emitted
    /// afterwards is missed.
    pub async fn spawn(&self, driver: &dyn ClusterDriver) -> Result<ReconcilerHandle> {
        let pod_events = driver.watch_pods().await?;
        let controller_events = driver.watch_controllers().await?;
        info!(driver = driver.name(), "Watching cluster events");

        let this = self.clone();
        let pods = tokio::spawn(async move { this.consume_pods(pod_events).await });
        let this = self.clone();
        let controllers =
            tokio::spawn(async move { this.consume_controllers(controller_events).await });

        Ok(ReconcilerHandle { pods, controllers })
    }

    async fn consume_pods(&self, mut events: mpsc::Receiver<PodEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_pod_event(&event).await {
                warn!(pod = %event.pod.name, error = %e, "Failed to apply pod event");
            }
        }
        info!("Pod watch stream closed");
    }

    async fn consume_controllers(&self, mut events: mpsc::Receiver<ControllerEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_controller_event(&event).await {
                warn!(controller = %event.controller.name, error = %e, "Failed to apply controller event");
            }
        }
        info!("Controller watch stream closed");
    }

    /// Apply one pod notification. Returns whether a stack was written.
    #[instrument(skip(self, event), fields(pod = %event.pod.name, event_type = ?event.event_type))]
    pub async fn handle_pod_event(&self, event: &PodEvent) -> Result<bool> {
        if let Some(cluster_event) = &event.event {
            if IGNORED_REASONS.contains(&cluster_event.reason.as_str()) {
                return Ok(false);
            }
        }

        let pod = &event.pod;
        let applied = self
            .apply(&pod.namespace, pod.label(LABEL_STACK), pod.label(LABEL_NAME), |service| {
                apply_pod_event(service, event.event_type, event.event.as_ref(), pod)
            })
            .await?;
        if applied {
            metrics::record_reconcile_event("pod");
        }
        Ok(applied)
    }

    /// Apply one controller notification. Returns whether a stack was written.
    #[instrument(skip(self, event), fields(controller = %event.controller.name))]
    pub async fn handle_controller_event(&self, event: &ControllerEvent) -> Result<bool> {
        let Some(cluster_event) = &event.event else {
            return Ok(false);
        };

        let controller = &event.controller;
        let applied = self
            .apply(
                &controller.namespace,
                controller.labels.get(LABEL_STACK).map(String::as_str),
                controller.labels.get(LABEL_NAME).map(String::as_str),
                |service| {
                    if cluster_event.is_warning() {
                        service.status = ServiceStatus::Error;
                    }
                    service.push_message(event_message(cluster_event));
                },
            )
            .await?;
        if applied {
            metrics::record_reconcile_event("controller");
        }
        Ok(applied)
    }

    /// Resolve the target stack service and rewrite its stack.
    async fn apply<F>(
        &self,
        namespace: &str,
        stack_id: Option<&str>,
        stack_service_id: Option<&str>,
        mut mutate: F,
    ) -> Result<bool>
    where
        F: FnMut(&mut StackService) + Send,
    {
        if SYSTEM_NAMESPACES.contains(&namespace) {
            return Ok(false);
        }
        let (Some(stack_id), Some(stack_service_id)) = (stack_id, stack_service_id) else {
            debug!(namespace, "Event without stack labels, ignoring");
            return Ok(false);
        };

        let mut applied = false;
        let result = state::update_stack(&*self.store, namespace, stack_id, |stack| {
            applied = false;
            match stack.service_by_id_mut(stack_service_id) {
                Some(service) => {
                    mutate(service);
                    debug!(
                        service = %stack_service_id,
                        status = %service.status,
                        message = service.last_message().unwrap_or(""),
                        "Stack service updated"
                    );
                    applied = true;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await;

        match result {
            Ok(_) => Ok(applied),
            Err(StrataError::StackNotFound { .. }) => {
                debug!(namespace, stack_id, "Event for unknown stack, ignoring");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn event_message(event: &ClusterEvent) -> String {
    format!("Reason={}, Message={}", event.reason, event.message)
}

/// Fold a pod notification into a stack service.
///
/// A cluster event about the pod marks the service as errored on any warning
/// other than `Unhealthy` and is always logged. A change of the pod object
/// itself follows the first condition: ready wins; a terminated container is
/// an error; otherwise an added pod is starting and a deleted one stopped.
/// An error sticks until the pod turns ready or goes away.
pub fn apply_pod_event(
    service: &mut StackService,
    event_type: WatchEventType,
    event: Option<&ClusterEvent>,
    pod: &PodState,
) {
    if let Some(event) = event {
        if event.is_warning() && event.reason != UNHEALTHY {
            service.status = ServiceStatus::Error;
        }
        service.push_message(event_message(event));
        return;
    }

    let mut ready = false;
    if let Some(condition) = pod.conditions.first() {
        if condition.condition_type == "Ready" {
            ready = condition.status;
        }

        match pod.container_statuses.first() {
            Some(container) => {
                if let Some(terminated) = &container.terminated {
                    service.status = ServiceStatus::Error;
                    service.push_message(format!(
                        "Reason={}, Message={}",
                        terminated.reason, terminated.message
                    ));
                    return;
                }
            }
            None => service.push_message(format!(
                "Reason={}, Message={}",
                condition.reason, condition.message
            )),
        }
    }

    if ready {
        service.status = ServiceStatus::Ready;
    } else {
        match event_type {
            WatchEventType::Added if service.status != ServiceStatus::Error => {
                service.status = ServiceStatus::Starting
            }
            WatchEventType::Added => {}
            WatchEventType::Deleted => service.status = ServiceStatus::Stopped,
            WatchEventType::Modified => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::cluster::sim::pod_for;
    use strata_core::cluster::{ContainerStatus, ControllerState, PodCondition, TerminatedState};
    use strata_core::types::{Stack, StackStatus};
    use strata_core::StateManager;

    fn ready(status: bool) -> PodCondition {
        PodCondition {
            condition_type: "Ready".into(),
            status,
            reason: String::new(),
            message: String::new(),
        }
    }

    async fn setup() -> (EventReconciler, Arc<StateManager>) {
        let store = Arc::new(StateManager::new_in_memory().await.unwrap());
        let mut stack = Stack::new("web", "blog")
            .with_service(StackService::new("web"))
            .with_service(StackService::new("db"));
        stack.id = "k3x9q".into();
        stack.status = StackStatus::Starting;
        stack.derive_service_ids();
        store.put_stack("demo", &stack).await.unwrap();
        (EventReconciler::new(store.clone()), store)
    }

    async fn service(store: &StateManager, key: &str) -> StackService {
        store.get_stack("demo", "k3x9q").await.unwrap().unwrap().service(key).unwrap().clone()
    }

    #[tokio::test]
    async fn test_pod_lifecycle() {
        let (reconciler, store) = setup().await;
        let mut pod = pod_for("demo", "k3x9q", "web");

        let added = PodEvent { event_type: WatchEventType::Added, event: None, pod: pod.clone() };
        assert!(reconciler.handle_pod_event(&added).await.unwrap());
        assert_eq!(service(&store, "web").await.status, ServiceStatus::Starting);

        pod.conditions = vec![ready(true)];
        pod.container_statuses = vec![ContainerStatus::default()];
        let modified = PodEvent { event_type: WatchEventType::Modified, event: None, pod: pod.clone() };
        reconciler.handle_pod_event(&modified).await.unwrap();
        assert_eq!(service(&store, "web").await.status, ServiceStatus::Ready);
        assert_eq!(service(&store, "db").await.status, ServiceStatus::Unset);

        pod.conditions = vec![ready(false)];
        let deleted = PodEvent { event_type: WatchEventType::Deleted, event: None, pod };
        reconciler.handle_pod_event(&deleted).await.unwrap();
        assert_eq!(service(&store, "web").await.status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_terminated_container_is_error() {
        let (reconciler, store) = setup().await;
        let mut pod = pod_for("demo", "k3x9q", "db");
        pod.conditions = vec![ready(false)];
        pod.container_statuses = vec![ContainerStatus {
            terminated: Some(TerminatedState { reason: "Error".into(), message: "exit 1".into() }),
        }];

        let event = PodEvent { event_type: WatchEventType::Added, event: None, pod: pod.clone() };
        reconciler.handle_pod_event(&event).await.unwrap();

        let db = service(&store, "db").await;
        assert_eq!(db.status, ServiceStatus::Error);
        assert_eq!(db.last_message(), Some("Reason=Error, Message=exit 1"));

        // A replacement pod does not clear the error
        pod.container_statuses = vec![ContainerStatus::default()];
        let restarted = PodEvent { event_type: WatchEventType::Added, event: None, pod };
        reconciler.handle_pod_event(&restarted).await.unwrap();
        assert_eq!(service(&store, "db").await.status, ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_pod_warnings() {
        let (reconciler, store) = setup().await;
        let pod = pod_for("demo", "k3x9q", "web");

        let ignored = PodEvent {
            event_type: WatchEventType::Modified,
            event: Some(ClusterEvent::warning("FailedSync", "sync race")),
            pod: pod.clone(),
        };
        assert!(!reconciler.handle_pod_event(&ignored).await.unwrap());
        assert!(service(&store, "web").await.status_messages.is_empty());

        let unhealthy = PodEvent {
            event_type: WatchEventType::Modified,
            event: Some(ClusterEvent::warning("Unhealthy", "probe failed")),
            pod: pod.clone(),
        };
        reconciler.handle_pod_event(&unhealthy).await.unwrap();
        let web = service(&store, "web").await;
        assert_eq!(web.status, ServiceStatus::Unset);
        assert_eq!(web.last_message(), Some("Reason=Unhealthy, Message=probe failed"));

        let failed = PodEvent {
            event_type: WatchEventType::Modified,
            event: Some(ClusterEvent::warning("FailedMount", "volume missing")),
            pod,
        };
        reconciler.handle_pod_event(&failed).await.unwrap();
        assert_eq!(service(&store, "web").await.status, ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_controller_events() {
        let (reconciler, store) = setup().await;
        let pod = pod_for("demo", "k3x9q", "db");
        let controller = ControllerState {
            name: "k3x9q-db".into(),
            namespace: "demo".into(),
            labels: pod.labels.clone(),
        };

        let normal = ControllerEvent {
            event_type: WatchEventType::Added,
            event: Some(ClusterEvent::normal("SuccessfulCreate", "Created pod")),
            controller: controller.clone(),
        };
        reconciler.handle_controller_event(&normal).await.unwrap();
        let db = service(&store, "db").await;
        assert_eq!(db.status, ServiceStatus::Unset);
        assert_eq!(db.status_messages.len(), 1);

        let warning = ControllerEvent {
            event_type: WatchEventType::Modified,
            event: Some(ClusterEvent::warning("FailedCreate", "quota exceeded")),
            controller,
        };
        reconciler.handle_controller_event(&warning).await.unwrap();
        assert_eq!(service(&store, "db").await.status, ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_ignores_system_and_unknown_targets() {
        let (reconciler, _store) = setup().await;

        let system = PodEvent {
            event_type: WatchEventType::Added,
            event: None,
            pod: pod_for("kube-system", "k3x9q", "web"),
        };
        assert!(!reconciler.handle_pod_event(&system).await.unwrap());

        let unknown_stack = PodEvent {
            event_type: WatchEventType::Added,
            event: None,
            pod: pod_for("demo", "zzzzz", "web"),
        };
        assert!(!reconciler.handle_pod_event(&unknown_stack).await.unwrap());

        let unlabeled = PodEvent {
            event_type: WatchEventType::Added,
            event: None,
            pod: PodState { name: "stray".into(), namespace: "demo".into(), ..Default::default() },
        };
        assert!(!reconciler.handle_pod_event(&unlabeled).await.unwrap());
    }

    #[tokio::test]
    async fn test_spawned_watches_apply_events() {
        let (reconciler, store) = setup().await;
        let cluster = strata_core::SimulatedCluster::new();
        let handle = reconciler.spawn(&cluster).await.unwrap();
        assert!(handle.is_running());

        let pod = pod_for("demo", "k3x9q", "web");
        cluster
            .inject_controller_event(ControllerEvent {
                event_type: WatchEventType::Added,
                event: Some(ClusterEvent::normal("SuccessfulCreate", "Created pod")),
                controller: ControllerState {
                    name: "k3x9q-web".into(),
                    namespace: "demo".into(),
                    labels: pod.labels.clone(),
                },
            })
            .await;
        cluster
            .inject_pod_event(PodEvent {
                event_type: WatchEventType::Modified,
                event: Some(ClusterEvent::warning("FailedMount", "volume missing")),
                pod,
            })
            .await;

        let mut web = service(&store, "web").await;
        for _ in 0..100 {
            if web.status == ServiceStatus::Error && web.status_messages.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            web = service(&store, "web").await;
        }
        assert_eq!(web.status, ServiceStatus::Error);
        assert_eq!(web.status_messages.len(), 2);

        handle.abort();
        for _ in 0..100 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!handle.is_running());
    }
}
