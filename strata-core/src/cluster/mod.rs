//! Container-orchestration cluster abstraction.
//!
//! The control plane drives the cluster through the `ClusterDriver` trait:
//! namespaces and their quotas, services, controllers, ingresses, pod
//! inspection, and two asynchronous watch streams (pods, controllers).

use crate::error::Result;
use crate::types::ResourceLimits;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

pub mod sim;
pub mod template;

pub use sim::SimulatedCluster;
pub use template::{
    controller_template, service_template, ControllerTemplate, IngressSpec, ServiceAddress,
    ServiceObject, ServicePortStatus, ServiceTemplate, TemplateContext, Volume, VolumeMount,
    VolumeSource,
};

/// Label carrying the stack service id.
pub const LABEL_NAME: &str = "name";
/// Label carrying the stack id.
pub const LABEL_STACK: &str = "stack";
/// Label carrying the catalog key.
pub const LABEL_SERVICE: &str = "service";

/// Namespaces owned by the platform rather than by an account.
pub const SYSTEM_NAMESPACES: &[&str] = &["default", "kube-system"];

/// Kind of change reported by a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Cluster event attached to a watched object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

impl ClusterEvent {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { severity: EventSeverity::Normal, reason: reason.into(), message: message.into() }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { severity: EventSeverity::Warning, reason: reason.into(), message: message.into() }
    }

    pub fn is_warning(&self) -> bool {
        self.severity == EventSeverity::Warning
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodCondition {
    /// e.g. "Ready"
    pub condition_type: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatedState {
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    pub terminated: Option<TerminatedState>,
}

/// Observed state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodState {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub phase: PodPhase,
    pub conditions: Vec<PodCondition>,
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodState {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Observed state of a controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

/// One notification from the pod watch stream.
///
/// `event` is set when the notification is a cluster event about the pod
/// rather than a change of the pod object itself.
#[derive(Debug, Clone)]
pub struct PodEvent {
    pub event_type: WatchEventType,
    pub event: Option<ClusterEvent>,
    pub pod: PodState,
}

/// One notification from the controller watch stream.
#[derive(Debug, Clone)]
pub struct ControllerEvent {
    pub event_type: WatchEventType,
    pub event: Option<ClusterEvent>,
    pub controller: ControllerState,
}

/// Opaque secret payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

/// Cluster driver trait.
///
/// Failures are reported as `StrataError::ClusterError` and surfaced to the
/// caller unmodified. Methods are instrumented by implementations.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;

    async fn create_namespace(&self, namespace: &str) -> Result<()>;

    /// Delete a namespace and everything in it.
    async fn delete_namespace(&self, namespace: &str) -> Result<()>;

    /// Cap total cpu and memory of the namespace.
    async fn create_resource_quota(&self, namespace: &str, limits: &ResourceLimits) -> Result<()>;

    /// Default per-container requests of the namespace.
    async fn create_limit_range(&self, namespace: &str, limits: &ResourceLimits) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceObject>>;

    async fn create_service(
        &self,
        namespace: &str,
        template: &ServiceTemplate,
    ) -> Result<ServiceObject>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_controller(&self, namespace: &str, template: &ControllerTemplate)
        -> Result<()>;

    /// Delete a controller and its pods.
    async fn delete_controller(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_ingress(&self, namespace: &str, ingress: &IngressSpec) -> Result<()>;

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()>;

    /// Pods whose label `label` equals `value`.
    async fn list_pods(&self, namespace: &str, label: &str, value: &str) -> Result<Vec<PodState>>;

    /// Pod log, optionally limited to the last `tail_lines` lines.
    async fn get_log(&self, namespace: &str, pod: &str, tail_lines: Option<usize>)
        -> Result<String>;

    /// Subscribe to pod changes and pod events across all namespaces.
    async fn watch_pods(&self) -> Result<mpsc::Receiver<PodEvent>>;

    /// Subscribe to controller events across all namespaces.
    async fn watch_controllers(&self) -> Result<mpsc::Receiver<ControllerEvent>>;

    /// Opaque lowercase alphanumeric id, used for stack ids.
    fn generate_name(&self, len: usize) -> String {
        random_lowercase(len)
    }

    /// Random suffix for scratch volume paths.
    fn random_suffix(&self, len: usize) -> String {
        random_lowercase(len)
    }

    /// Get driver name (for logging/metrics).
    fn name(&self) -> &str;
}

fn random_lowercase(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_lowercase() {
        let id = random_lowercase(5);
        assert_eq!(id.len(), 5);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
