//! Service catalog types.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the catalog mount that binds the host container-runtime socket.
pub const DOCKER_MOUNT: &str = "docker";

/// Catalog tier a spec was resolved from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogScope {
    #[default]
    System,
    User,
}

impl std::fmt::Display for CatalogScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogScope::System => write!(f, "system"),
            CatalogScope::User => write!(f, "user"),
        }
    }
}

/// Whether a service is reachable from outside the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Internal,
    External,
}

/// Application protocol spoken on a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Http,
    Https,
}

/// Exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Declared volume mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountSpec {
    pub name: String,
    pub mount_path: String,
}

/// Declared configuration variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVar {
    pub name: String,
    /// Default value
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub can_override: bool,
    #[serde(default)]
    pub is_password: bool,
}

/// Dependency on another catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Dependency key
    pub key: String,
    /// A required dependency must be ready before the dependent starts.
    #[serde(default)]
    pub required: bool,
    /// Merge the dependency's configuration into the dependent's environment.
    #[serde(default)]
    pub share_config: bool,
}

/// Per-container resource requests (millicores / MiB).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResources {
    #[serde(default)]
    pub cpu_max: u32,
    #[serde(default)]
    pub cpu_default: u32,
    #[serde(default)]
    pub memory_max: u32,
    #[serde(default)]
    pub memory_default: u32,
}

/// Catalog definition of a reusable service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub key: String,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub description: String,

    /// Container image reference
    pub image: String,

    /// Stamped by the store on read
    #[serde(default)]
    pub catalog: CatalogScope,

    #[serde(default)]
    pub ports: Vec<PortSpec>,

    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountSpec>,

    #[serde(default)]
    pub config: Vec<ConfigVar>,

    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    #[serde(default)]
    pub access: Access,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub resource_limits: ServiceResources,
}

impl ServiceSpec {
    /// Minimal spec with only a key and an image.
    pub fn new(key: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: String::new(),
            description: String::new(),
            image: image.into(),
            catalog: CatalogScope::System,
            ports: Vec::new(),
            volume_mounts: Vec::new(),
            config: Vec::new(),
            dependencies: Vec::new(),
            access: Access::Internal,
            command: Vec::new(),
            args: Vec::new(),
            resource_limits: ServiceResources::default(),
        }
    }

    /// Look up a declared configuration variable.
    pub fn config_var(&self, name: &str) -> Option<&ConfigVar> {
        self.config.iter().find(|c| c.name == name)
    }

    /// Declared mount for `mount_path`, if any.
    pub fn mount_for(&self, mount_path: &str) -> Option<&VolumeMountSpec> {
        self.volume_mounts.iter().find(|m| m.mount_path == mount_path)
    }

    /// Dependency entry for `key`, if any.
    pub fn dependency(&self, key: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.key == key)
    }

    /// Catalog defaults for every declared configuration variable.
    pub fn default_config(&self) -> BTreeMap<String, String> {
        self.config.iter().map(|c| (c.name.clone(), c.value.clone())).collect()
    }

    /// Resolve the configuration map for one instance of this service.
    ///
    /// Starts from the catalog defaults and applies `overrides`. Keys the spec
    /// does not declare pass through as custom variables. A declared key whose
    /// value differs from the default must be overridable.
    pub fn resolve_config(
        &self,
        overrides: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut resolved = self.default_config();
        for (name, value) in overrides {
            match self.config_var(name) {
                Some(var) if !var.can_override && var.value != *value => {
                    return Err(StrataError::NotOverridable {
                        key: self.key.clone(),
                        name: name.clone(),
                    });
                }
                _ => {
                    resolved.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_config() -> ServiceSpec {
        let mut spec = ServiceSpec::new("db", "postgres:16");
        spec.config = vec![
            ConfigVar {
                name: "POSTGRES_USER".into(),
                value: "admin".into(),
                can_override: true,
                is_password: false,
            },
            ConfigVar {
                name: "PGDATA".into(),
                value: "/var/lib/postgresql/data".into(),
                can_override: false,
                is_password: false,
            },
        ];
        spec
    }

    #[test]
    fn test_resolve_config_defaults_and_overrides() {
        let spec = spec_with_config();
        let overrides = BTreeMap::from([
            ("POSTGRES_USER".to_string(), "alice".to_string()),
            ("EXTRA_FLAG".to_string(), "1".to_string()),
        ]);

        let resolved = spec.resolve_config(&overrides).unwrap();
        assert_eq!(resolved["POSTGRES_USER"], "alice");
        assert_eq!(resolved["PGDATA"], "/var/lib/postgresql/data");
        assert_eq!(resolved["EXTRA_FLAG"], "1");
    }

    #[test]
    fn test_resolve_config_rejects_fixed_override() {
        let spec = spec_with_config();
        let overrides = BTreeMap::from([("PGDATA".to_string(), "/tmp".to_string())]);

        let err = spec.resolve_config(&overrides).unwrap_err();
        assert!(matches!(err, StrataError::NotOverridable { ref name, .. } if name == "PGDATA"));
    }

    #[test]
    fn test_resolve_config_accepts_unchanged_fixed_value() {
        // Clients echo the resolved map back on update.
        let spec = spec_with_config();
        let resolved = spec.resolve_config(&BTreeMap::new()).unwrap();
        assert_eq!(spec.resolve_config(&resolved).unwrap(), resolved);
    }

    #[test]
    fn test_spec_json_shape() {
        let json = r#"{
            "key": "web",
            "image": "nginx:1.25",
            "ports": [{"port": 80, "protocol": "http"}],
            "volumeMounts": [{"name": "content", "mountPath": "/usr/share/nginx/html"}],
            "dependencies": [{"key": "db", "required": true, "shareConfig": true}],
            "access": "external"
        }"#;
        let spec: ServiceSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.catalog, CatalogScope::System);
        assert_eq!(spec.ports[0].protocol, Protocol::Http);
        assert!(spec.dependency("db").unwrap().share_config);
        assert_eq!(spec.access, Access::External);
        assert!(spec.mount_for("/usr/share/nginx/html").is_some());
    }
}
