//! In-process cluster.
//!
//! `SimulatedCluster` keeps every object in memory and plays the part of the
//! pod scheduler: a created controller gets one pod that is reported `Added`
//! right away and turns ready (or crashes) after a short delay, all through
//! the same watch streams a real cluster would use. Failures can be injected
//! per operation and object name, and every mutation is journaled.

use crate::cluster::template::labels;
use crate::cluster::{
    ClusterDriver, ClusterEvent, ContainerStatus, ControllerEvent, ControllerState,
    ControllerTemplate, IngressSpec, PodCondition, PodEvent, PodPhase, PodState, Secret,
    ServiceObject, ServicePortStatus, ServiceTemplate, TerminatedState, WatchEventType,
    LABEL_NAME,
};
use crate::error::{Result, StrataError};
use crate::types::ResourceLimits;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

const WATCH_BUFFER_SIZE: usize = 256;
const READY_DELAY: Duration = Duration::from_millis(20);

/// Wildcard matching every object name in failure injection.
pub const ANY: &str = "*";

type ObjectKey = (String, String);

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

/// A journaled cluster mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub op: &'static str,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
struct Crash {
    reason: String,
    message: String,
}

#[derive(Default)]
struct SimState {
    namespaces: BTreeSet<String>,
    quotas: BTreeMap<String, ResourceLimits>,
    limit_ranges: BTreeMap<String, ResourceLimits>,
    secrets: BTreeMap<ObjectKey, Secret>,
    services: BTreeMap<ObjectKey, ServiceObject>,
    controllers: BTreeMap<ObjectKey, ControllerTemplate>,
    ingresses: BTreeMap<ObjectKey, IngressSpec>,
    pods: BTreeMap<ObjectKey, PodState>,
    logs: BTreeMap<ObjectKey, Vec<String>>,
    journal: Vec<Operation>,
    failures: BTreeMap<&'static str, BTreeSet<String>>,
    crashing: BTreeMap<String, Crash>,
    never_ready: BTreeSet<String>,
    pod_watchers: Vec<mpsc::Sender<PodEvent>>,
    controller_watchers: Vec<mpsc::Sender<ControllerEvent>>,
    next_ip: u32,
    next_node_port: u16,
    next_pod: u32,
}

impl SimState {
    fn check(&self, op: &'static str, name: &str) -> Result<()> {
        match self.failures.get(op) {
            Some(names) if names.contains(name) || names.contains(ANY) => {
                Err(StrataError::cluster(op, format!("injected failure for {}", name)))
            }
            _ => Ok(()),
        }
    }

    fn record(&mut self, op: &'static str, namespace: &str, name: &str) {
        self.journal.push(Operation { op, namespace: namespace.to_string(), name: name.to_string() });
    }

    fn remove_pods(&mut self, namespace: &str, controller: &str) -> Vec<PodState> {
        let doomed: Vec<ObjectKey> = self
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && pod.label(LABEL_NAME) == Some(controller))
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| {
                self.logs.remove(&k);
                self.pods.remove(&k)
            })
            .collect()
    }
}

/// In-memory [`ClusterDriver`].
#[derive(Clone)]
pub struct SimulatedCluster {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(SimState::default())) }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicked holder leaves plain data behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================
    // Test Controls
    // ========================

    /// Make `op` fail for object `name` (or every object with [`ANY`]).
    pub fn fail(&self, op: &'static str, name: &str) {
        self.lock().failures.entry(op).or_default().insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Pods of controller `name` terminate instead of turning ready.
    pub fn crash_controller(&self, name: &str, reason: &str, message: &str) {
        self.lock().crashing.insert(
            name.to_string(),
            Crash { reason: reason.to_string(), message: message.to_string() },
        );
    }

    /// Pods of controller `name` stay pending forever.
    pub fn hold_controller(&self, name: &str) {
        self.lock().never_ready.insert(name.to_string());
    }

    /// Every mutation so far, in order.
    pub fn journal(&self) -> Vec<Operation> {
        self.lock().journal.clone()
    }

    /// Object names of the journaled `op` mutations, in order.
    pub fn operations(&self, op: &str) -> Vec<String> {
        self.lock().journal.iter().filter(|o| o.op == op).map(|o| o.name.clone()).collect()
    }

    /// Index of the first journal entry matching `op` and `name`.
    pub fn position(&self, op: &str, name: &str) -> Option<usize> {
        self.lock().journal.iter().position(|o| o.op == op && o.name == name)
    }

    pub fn has_controller(&self, namespace: &str, name: &str) -> bool {
        self.lock().controllers.contains_key(&key(namespace, name))
    }

    pub fn controller(&self, namespace: &str, name: &str) -> Option<ControllerTemplate> {
        self.lock().controllers.get(&key(namespace, name)).cloned()
    }

    pub fn has_service(&self, namespace: &str, name: &str) -> bool {
        self.lock().services.contains_key(&key(namespace, name))
    }

    pub fn has_ingress(&self, namespace: &str, name: &str) -> bool {
        self.lock().ingresses.contains_key(&key(namespace, name))
    }

    pub fn quota(&self, namespace: &str) -> Option<ResourceLimits> {
        self.lock().quotas.get(namespace).copied()
    }

    pub fn limit_range(&self, namespace: &str) -> Option<ResourceLimits> {
        self.lock().limit_ranges.get(namespace).copied()
    }

    /// Seed a secret without journaling it (platform-provided objects).
    pub fn seed_secret(&self, namespace: &str, secret: Secret) {
        let mut state = self.lock();
        state.namespaces.insert(namespace.to_string());
        state.secrets.insert(key(namespace, &secret.name), secret);
    }

    /// Append a line to a pod's log.
    pub fn append_log(&self, namespace: &str, pod: &str, line: &str) {
        self.lock().logs.entry(key(namespace, pod)).or_default().push(line.to_string());
    }

    /// Deliver a pod notification as if the cluster had sent it.
    pub async fn inject_pod_event(&self, event: PodEvent) {
        self.send_pod_events(vec![event]).await;
    }

    /// Deliver a controller notification as if the cluster had sent it.
    pub async fn inject_controller_event(&self, event: ControllerEvent) {
        self.send_controller_events(vec![event]).await;
    }

    // ========================
    // Event Delivery
    // ========================

    async fn send_pod_events(&self, events: Vec<PodEvent>) {
        let watchers: Vec<_> = {
            let mut state = self.lock();
            state.pod_watchers.retain(|tx| !tx.is_closed());
            state.pod_watchers.clone()
        };
        for event in events {
            for tx in &watchers {
                let _ = tx.send(event.clone()).await;
            }
        }
    }

    async fn send_controller_events(&self, events: Vec<ControllerEvent>) {
        let watchers: Vec<_> = {
            let mut state = self.lock();
            state.controller_watchers.retain(|tx| !tx.is_closed());
            state.controller_watchers.clone()
        };
        for event in events {
            for tx in &watchers {
                let _ = tx.send(event.clone()).await;
            }
        }
    }

    /// Move a freshly added pod to its settled state and report it.
    async fn settle_pod(&self, namespace: String, pod_name: String, controller: String) {
        tokio::time::sleep(READY_DELAY).await;

        let event = {
            let mut state = self.lock();
            if state.never_ready.contains(&controller) {
                return;
            }
            let crash = state.crashing.get(&controller).cloned();
            let Some(pod) = state.pods.get_mut(&key(&namespace, &pod_name)) else {
                return;
            };
            match crash {
                Some(crash) => {
                    pod.phase = PodPhase::Failed;
                    pod.conditions = vec![ready_condition(false, "ContainersNotReady")];
                    pod.container_statuses = vec![ContainerStatus {
                        terminated: Some(TerminatedState {
                            reason: crash.reason,
                            message: crash.message,
                        }),
                    }];
                }
                None => {
                    pod.phase = PodPhase::Running;
                    pod.conditions = vec![ready_condition(true, "")];
                    pod.container_statuses = vec![ContainerStatus::default()];
                }
            }
            PodEvent { event_type: WatchEventType::Modified, event: None, pod: pod.clone() }
        };
        debug!(pod = %pod_name, phase = ?event.pod.phase, "Simulated pod settled");
        self.send_pod_events(vec![event]).await;
    }
}

fn ready_condition(ready: bool, reason: &str) -> PodCondition {
    PodCondition {
        condition_type: "Ready".to_string(),
        status: ready,
        reason: reason.to_string(),
        message: String::new(),
    }
}

#[async_trait]
impl ClusterDriver for SimulatedCluster {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        Ok(self.lock().namespaces.contains(namespace))
    }

    #[instrument(skip(self))]
    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("create_namespace", namespace)?;
        state.namespaces.insert(namespace.to_string());
        state.record("create_namespace", namespace, namespace);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("delete_namespace", namespace)?;
        state.namespaces.remove(namespace);
        state.quotas.remove(namespace);
        state.limit_ranges.remove(namespace);
        state.secrets.retain(|(ns, _), _| ns != namespace);
        state.services.retain(|(ns, _), _| ns != namespace);
        state.controllers.retain(|(ns, _), _| ns != namespace);
        state.ingresses.retain(|(ns, _), _| ns != namespace);
        state.pods.retain(|(ns, _), _| ns != namespace);
        state.logs.retain(|(ns, _), _| ns != namespace);
        state.record("delete_namespace", namespace, namespace);
        Ok(())
    }

    async fn create_resource_quota(&self, namespace: &str, limits: &ResourceLimits) -> Result<()> {
        let mut state = self.lock();
        state.check("create_resource_quota", namespace)?;
        state.quotas.insert(namespace.to_string(), *limits);
        state.record("create_resource_quota", namespace, namespace);
        Ok(())
    }

    async fn create_limit_range(&self, namespace: &str, limits: &ResourceLimits) -> Result<()> {
        let mut state = self.lock();
        state.check("create_limit_range", namespace)?;
        state.limit_ranges.insert(namespace.to_string(), *limits);
        state.record("create_limit_range", namespace, namespace);
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.lock().secrets.get(&key(namespace, name)).cloned())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let mut state = self.lock();
        state.check("create_secret", &secret.name)?;
        state.secrets.insert(key(namespace, &secret.name), secret.clone());
        state.record("create_secret", namespace, &secret.name);
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceObject>> {
        Ok(self.lock().services.get(&key(namespace, name)).cloned())
    }

    #[instrument(skip(self, template), fields(service = %template.name))]
    async fn create_service(
        &self,
        namespace: &str,
        template: &ServiceTemplate,
    ) -> Result<ServiceObject> {
        let mut state = self.lock();
        state.check("create_service", &template.name)?;
        if state.services.contains_key(&key(namespace, &template.name)) {
            return Err(StrataError::cluster(
                "create_service",
                format!("service {} already exists", template.name),
            ));
        }

        state.next_ip += 1;
        let cluster_ip = format!("10.96.{}.{}", state.next_ip / 250, state.next_ip % 250 + 1);
        let mut ports = Vec::with_capacity(template.ports.len());
        for port in &template.ports {
            let node_port = if template.external {
                state.next_node_port += 1;
                Some(30000 + state.next_node_port)
            } else {
                None
            };
            ports.push(ServicePortStatus { port: port.port, node_port });
        }

        let object = ServiceObject { name: template.name.clone(), cluster_ip, ports };
        state.services.insert(key(namespace, &template.name), object.clone());
        state.record("create_service", namespace, &template.name);
        Ok(object)
    }

    #[instrument(skip(self))]
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("delete_service", name)?;
        if state.services.remove(&key(namespace, name)).is_some() {
            state.record("delete_service", namespace, name);
        }
        Ok(())
    }

    #[instrument(skip(self, template), fields(controller = %template.name))]
    async fn create_controller(
        &self,
        namespace: &str,
        template: &ControllerTemplate,
    ) -> Result<()> {
        let (pod, replaced) = {
            let mut state = self.lock();
            state.check("create_controller", &template.name)?;

            // Apply semantics: a second create replaces the first
            let replaced = state.remove_pods(namespace, &template.name);
            state.controllers.insert(key(namespace, &template.name), template.clone());

            state.next_pod += 1;
            let pod = PodState {
                name: format!("{}-{:05}", template.name, state.next_pod),
                namespace: namespace.to_string(),
                labels: template.labels.clone(),
                phase: PodPhase::Pending,
                conditions: Vec::new(),
                container_statuses: Vec::new(),
            };
            state.pods.insert(key(namespace, &pod.name), pod.clone());
            state
                .logs
                .insert(key(namespace, &pod.name), vec![format!("Starting {}", template.image)]);
            state.record("create_controller", namespace, &template.name);
            (pod, replaced)
        };

        let controller = ControllerState {
            name: template.name.clone(),
            namespace: namespace.to_string(),
            labels: template.labels.clone(),
        };
        self.send_controller_events(vec![ControllerEvent {
            event_type: WatchEventType::Added,
            event: Some(ClusterEvent::normal(
                "SuccessfulCreate",
                format!("Created pod: {}", pod.name),
            )),
            controller,
        }])
        .await;

        let mut events: Vec<PodEvent> = replaced
            .into_iter()
            .map(|pod| PodEvent { event_type: WatchEventType::Deleted, event: None, pod })
            .collect();
        events.push(PodEvent { event_type: WatchEventType::Added, event: None, pod: pod.clone() });
        self.send_pod_events(events).await;

        let sim = self.clone();
        let controller_name = template.name.clone();
        tokio::spawn(async move {
            sim.settle_pod(pod.namespace, pod.name, controller_name).await;
        });
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_controller(&self, namespace: &str, name: &str) -> Result<()> {
        let removed = {
            let mut state = self.lock();
            state.check("delete_controller", name)?;
            if state.controllers.remove(&key(namespace, name)).is_none() {
                return Ok(());
            }
            state.record("delete_controller", namespace, name);
            state.remove_pods(namespace, name)
        };

        let events = removed
            .into_iter()
            .map(|mut pod| {
                pod.conditions = vec![ready_condition(false, "PodTerminating")];
                pod.container_statuses = vec![ContainerStatus::default()];
                PodEvent { event_type: WatchEventType::Deleted, event: None, pod }
            })
            .collect();
        self.send_pod_events(events).await;
        Ok(())
    }

    async fn create_ingress(&self, namespace: &str, ingress: &IngressSpec) -> Result<()> {
        let mut state = self.lock();
        state.check("create_ingress", &ingress.name)?;
        state.ingresses.insert(key(namespace, &ingress.name), ingress.clone());
        state.record("create_ingress", namespace, &ingress.name);
        Ok(())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("delete_ingress", name)?;
        if state.ingresses.remove(&key(namespace, name)).is_some() {
            state.record("delete_ingress", namespace, name);
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label: &str, value: &str) -> Result<Vec<PodState>> {
        let state = self.lock();
        state.check("list_pods", value)?;
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && pod.label(label) == Some(value))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn get_log(
        &self,
        namespace: &str,
        pod: &str,
        tail_lines: Option<usize>,
    ) -> Result<String> {
        let state = self.lock();
        let lines = state
            .logs
            .get(&key(namespace, pod))
            .ok_or_else(|| StrataError::cluster("get_log", format!("pod {} not found", pod)))?;
        let skip = tail_lines.map_or(0, |n| lines.len().saturating_sub(n));
        Ok(lines[skip..].iter().map(|l| format!("{}\n", l)).collect())
    }

    async fn watch_pods(&self) -> Result<mpsc::Receiver<PodEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER_SIZE);
        self.lock().pod_watchers.push(tx);
        Ok(rx)
    }

    async fn watch_controllers(&self) -> Result<mpsc::Receiver<ControllerEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER_SIZE);
        self.lock().controller_watchers.push(tx);
        Ok(rx)
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// Pod state for a stack service, for building injected events in tests.
pub fn pod_for(namespace: &str, stack_id: &str, service_key: &str) -> PodState {
    let labels = labels(stack_id, service_key);
    PodState {
        name: format!("{}-00000", labels[LABEL_NAME]),
        namespace: namespace.to_string(),
        labels,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::template::service_template;
    use crate::cluster::LABEL_STACK;
    use crate::types::{Access, PortSpec, Protocol, ServiceSpec};

    fn controller(name: &str) -> ControllerTemplate {
        ControllerTemplate {
            name: name.to_string(),
            labels: labels("k3x9q", name.trim_start_matches("k3x9q-")),
            image: "busybox".to_string(),
            command: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            resources: Default::default(),
            volumes: Vec::new(),
            volume_mounts: Vec::new(),
            replicas: 1,
        }
    }

    #[tokio::test]
    async fn test_controller_pod_lifecycle() {
        let sim = SimulatedCluster::new();
        let mut pods = sim.watch_pods().await.unwrap();

        sim.create_controller("demo", &controller("k3x9q-db")).await.unwrap();

        let added = pods.recv().await.unwrap();
        assert_eq!(added.event_type, WatchEventType::Added);
        assert_eq!(added.pod.label(LABEL_STACK), Some("k3x9q"));

        let ready = pods.recv().await.unwrap();
        assert_eq!(ready.event_type, WatchEventType::Modified);
        assert_eq!(ready.pod.phase, PodPhase::Running);
        assert!(ready.pod.conditions[0].status);

        sim.delete_controller("demo", "k3x9q-db").await.unwrap();
        let deleted = pods.recv().await.unwrap();
        assert_eq!(deleted.event_type, WatchEventType::Deleted);
        assert!(sim.list_pods("demo", LABEL_STACK, "k3x9q").await.unwrap().is_empty());
        assert_eq!(sim.operations("delete_controller"), vec!["k3x9q-db".to_string()]);
    }

    #[tokio::test]
    async fn test_crashing_controller() {
        let sim = SimulatedCluster::new();
        sim.crash_controller("k3x9q-db", "Error", "exit code 1");
        let mut pods = sim.watch_pods().await.unwrap();

        sim.create_controller("demo", &controller("k3x9q-db")).await.unwrap();
        let _added = pods.recv().await.unwrap();
        let crashed = pods.recv().await.unwrap();
        assert_eq!(crashed.pod.phase, PodPhase::Failed);
        let terminated = crashed.pod.container_statuses[0].terminated.clone().unwrap();
        assert_eq!(terminated.message, "exit code 1");
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let sim = SimulatedCluster::new();
        sim.fail("create_controller", "k3x9q-db");

        let err = sim.create_controller("demo", &controller("k3x9q-db")).await.unwrap_err();
        assert!(matches!(err, StrataError::ClusterError { .. }));
        assert!(!sim.has_controller("demo", "k3x9q-db"));

        sim.clear_failures();
        sim.create_controller("demo", &controller("k3x9q-db")).await.unwrap();
        assert!(sim.has_controller("demo", "k3x9q-db"));
    }

    #[tokio::test]
    async fn test_services_and_logs() {
        let sim = SimulatedCluster::new();
        let mut spec = ServiceSpec::new("web", "nginx");
        spec.ports = vec![PortSpec { port: 80, protocol: Protocol::Http }];
        spec.access = Access::External;

        let object = sim.create_service("demo", &service_template("k3x9q", &spec)).await.unwrap();
        assert!(object.port(80).unwrap().node_port.is_some());
        assert!(sim.create_service("demo", &service_template("k3x9q", &spec)).await.is_err());
        assert_eq!(sim.get_service("demo", "k3x9q-web").await.unwrap(), Some(object));

        sim.create_controller("demo", &controller("k3x9q-web")).await.unwrap();
        let pod = sim.list_pods("demo", LABEL_NAME, "k3x9q-web").await.unwrap().remove(0);
        sim.append_log("demo", &pod.name, "GET / 200");
        sim.append_log("demo", &pod.name, "GET /favicon.ico 404");

        let tail = sim.get_log("demo", &pod.name, Some(1)).await.unwrap();
        assert_eq!(tail, "GET /favicon.ico 404\n");
        let all = sim.get_log("demo", &pod.name, None).await.unwrap();
        assert_eq!(all.lines().count(), 3);
    }
}
