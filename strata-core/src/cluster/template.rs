//! Cluster object templates for stack services.

use crate::cluster::{LABEL_NAME, LABEL_SERVICE, LABEL_STACK};
use crate::types::{
    stack_service_id, Access, PortSpec, ServiceResources, ServiceSpec, StackService, DOCKER_MOUNT,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Host socket bound by the `docker` catalog mount.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Name of the volume backing the account home directory.
pub const HOME_VOLUME: &str = "home";

/// Cluster-level service fronting a stack service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTemplate {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortSpec>,
    /// Publish on a node port
    pub external: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePortStatus {
    pub port: u16,
    pub node_port: Option<u16>,
}

/// A realized cluster-level service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceObject {
    pub name: String,
    pub cluster_ip: String,
    pub ports: Vec<ServicePortStatus>,
}

impl ServiceObject {
    pub fn port(&self, port: u16) -> Option<&ServicePortStatus> {
        self.ports.iter().find(|p| p.port == port)
    }
}

/// Internal address of a realized service, injected for service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    /// Catalog key
    pub service: String,
    pub host: String,
    pub port: u16,
    pub node_port: Option<u16>,
}

impl ServiceAddress {
    pub fn from_object(service: &str, object: &ServiceObject) -> Option<Self> {
        object.ports.first().map(|p| Self {
            service: service.to_string(),
            host: object.cluster_ip.clone(),
            port: p.port,
            node_port: p.node_port,
        })
    }
}

/// TLS ingress for an externally accessible service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressSpec {
    pub name: String,
    pub host: String,
    pub service_name: String,
    pub service_port: u16,
    pub tls_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    HostPath(String),
    /// Non-persistent scratch space
    EmptyDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// Single-container replicated workload for a stack service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerTemplate {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<u16>,
    pub resources: ServiceResources,
    pub volumes: Vec<Volume>,
    pub volume_mounts: Vec<VolumeMount>,
    pub replicas: u32,
}

impl ControllerTemplate {
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name == name)
    }
}

/// Labels identifying a stack service's cluster objects.
pub fn labels(stack_id: &str, service_key: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), stack_service_id(stack_id, service_key)),
        (LABEL_STACK.to_string(), stack_id.to_string()),
        (LABEL_SERVICE.to_string(), service_key.to_string()),
    ])
}

/// Service template for a spec declaring ports.
pub fn service_template(stack_id: &str, spec: &ServiceSpec) -> ServiceTemplate {
    ServiceTemplate {
        name: stack_service_id(stack_id, &spec.key),
        labels: labels(stack_id, &spec.key),
        ports: spec.ports.clone(),
        external: spec.access == Access::External,
    }
}

/// Inputs for building a controller template.
pub struct TemplateContext<'a> {
    pub account: &'a str,
    pub stack_id: &'a str,
    pub stack_service: &'a StackService,
    pub spec: &'a ServiceSpec,
    /// Addresses of every service realized in this start pass, by catalog key
    pub addresses: &'a BTreeMap<String, ServiceAddress>,
    /// Configuration shared by `share_config` dependencies
    pub shared_env: &'a BTreeMap<String, String>,
    /// Root of the account volume directories on the host
    pub vol_dir: &'a str,
    pub home_mount_path: &'a str,
}

/// Environment variable prefix for a catalog key.
fn env_prefix(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Build the controller template for one stack service.
///
/// Environment, lowest precedence first: discovery variables for every
/// realized service, the stack service's resolved configuration, then the
/// configuration shared by its dependencies.
pub fn controller_template(ctx: &TemplateContext<'_>) -> ControllerTemplate {
    let mut env = BTreeMap::new();
    for address in ctx.addresses.values() {
        let prefix = env_prefix(&address.service);
        env.insert(format!("{}_SERVICE_HOST", prefix), address.host.clone());
        env.insert(format!("{}_SERVICE_PORT", prefix), address.port.to_string());
    }
    env.extend(ctx.stack_service.config.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(ctx.shared_env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let (volumes, volume_mounts) = resolve_volumes(ctx);

    ControllerTemplate {
        name: stack_service_id(ctx.stack_id, &ctx.spec.key),
        labels: labels(ctx.stack_id, &ctx.spec.key),
        image: ctx.spec.image.clone(),
        command: ctx.spec.command.clone(),
        args: ctx.spec.args.clone(),
        env,
        ports: ctx.spec.ports.iter().map(|p| p.port).collect(),
        resources: ctx.spec.resource_limits,
        volumes,
        volume_mounts,
        replicas: 1,
    }
}

fn resolve_volumes(ctx: &TemplateContext<'_>) -> (Vec<Volume>, Vec<VolumeMount>) {
    let account_dir = format!("{}/{}", ctx.vol_dir.trim_end_matches('/'), ctx.account);

    let mut volumes = vec![Volume {
        name: HOME_VOLUME.to_string(),
        source: VolumeSource::HostPath(account_dir.clone()),
    }];
    let mut mounts = vec![VolumeMount {
        name: HOME_VOLUME.to_string(),
        mount_path: ctx.home_mount_path.to_string(),
    }];

    let mut user_idx = 0;
    for (host, container) in &ctx.stack_service.volume_mounts {
        let name = match ctx.spec.mount_for(container) {
            Some(declared) => declared.name.clone(),
            None => {
                let name = format!("user{}", user_idx);
                user_idx += 1;
                name
            }
        };
        volumes.push(Volume {
            name: name.clone(),
            source: VolumeSource::HostPath(format!("{}/{}", account_dir, host)),
        });
        mounts.push(VolumeMount { name, mount_path: container.clone() });
    }

    for declared in &ctx.spec.volume_mounts {
        if declared.name == DOCKER_MOUNT {
            volumes.push(Volume {
                name: DOCKER_MOUNT.to_string(),
                source: VolumeSource::HostPath(DOCKER_SOCKET.to_string()),
            });
            mounts.push(VolumeMount {
                name: DOCKER_MOUNT.to_string(),
                mount_path: declared.mount_path.clone(),
            });
        } else if !ctx.stack_service.volume_mounts.values().any(|c| *c == declared.mount_path) {
            warn!(
                service = %ctx.stack_service.id,
                mount = %declared.mount_path,
                "Required volume not mapped, using emptyDir"
            );
            volumes.push(Volume { name: declared.name.clone(), source: VolumeSource::EmptyDir });
            mounts.push(VolumeMount {
                name: declared.name.clone(),
                mount_path: declared.mount_path.clone(),
            });
        }
    }

    (volumes, mounts)
}
