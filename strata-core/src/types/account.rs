//! Tenant account types.

use serde::{Deserialize, Serialize};

/// A tenant account. The namespace doubles as the primary key and as the
/// isolation boundary on the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Namespace id (primary key)
    pub namespace: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub email_address: String,

    /// Opaque credential blob; verification happens outside the control plane.
    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub organization: String,

    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

/// Per-account resource limits.
///
/// CPU is expressed in millicores, memory in MiB and storage in GiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu_max: u32,
    #[serde(default)]
    pub cpu_default: u32,
    #[serde(default)]
    pub memory_max: u32,
    #[serde(default)]
    pub memory_default: u32,
    #[serde(default)]
    pub storage_quota: u32,
}

impl ResourceLimits {
    /// True when no limit has been specified at all.
    pub fn is_unset(&self) -> bool {
        *self == Self::default()
    }

    /// Quota objects are only created when both maxima are positive.
    pub fn has_quota(&self) -> bool {
        self.cpu_max > 0 && self.memory_max > 0
    }
}
