//! Stack domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Derive the id of the stack service for `service_key` in `stack_id`.
///
/// Pure function of its inputs; the id survives restarts.
pub fn stack_service_id(stack_id: &str, service_key: &str) -> String {
    format!("{}-{}", stack_id, service_key)
}

/// Recover the stack id from a stack service id.
///
/// Stack ids never contain '-', so the first separator splits them off even
/// when the service key itself contains dashes.
pub fn stack_id_of(stack_service_id: &str) -> Option<&str> {
    stack_service_id.split_once('-').map(|(sid, _)| sid).filter(|sid| !sid.is_empty())
}

/// Lifecycle state of a stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
    Error,
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackStatus::Stopped => write!(f, "stopped"),
            StackStatus::Starting => write!(f, "starting"),
            StackStatus::Started => write!(f, "started"),
            StackStatus::Stopping => write!(f, "stopping"),
            StackStatus::Error => write!(f, "error"),
        }
    }
}

/// Status of one service within a stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Unset,
    Starting,
    Ready,
    Error,
    Stopped,
}

impl ServiceStatus {
    /// Ready or error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Ready | ServiceStatus::Error)
    }

    /// Not yet settled after a launch.
    pub fn is_pending(&self) -> bool {
        matches!(self, ServiceStatus::Unset | ServiceStatus::Starting)
    }

    /// Down: never started or already stopped.
    pub fn is_down(&self) -> bool {
        matches!(self, ServiceStatus::Unset | ServiceStatus::Stopped)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Unset => write!(f, "unset"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Ready => write!(f, "ready"),
            ServiceStatus::Error => write!(f, "error"),
            ServiceStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Externally reachable endpoint of a stack service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub port: u16,
    pub protocol: crate::types::Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Runtime instantiation of one catalog service within a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackService {
    /// `{stack id}-{service key}`
    #[serde(default)]
    pub id: String,

    /// Catalog key
    pub service: String,

    #[serde(default)]
    pub status: ServiceStatus,

    /// Append-only between lifecycle operations
    #[serde(default)]
    pub status_messages: Vec<String>,

    /// Resolved configuration (defaults + overrides + custom variables)
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Host subpath -> container path
    #[serde(default)]
    pub volume_mounts: BTreeMap<String, String>,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
}

impl StackService {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into(), ..Default::default() }
    }

    /// Append a message to the status log.
    pub fn push_message(&mut self, message: impl Into<String>) {
        self.status_messages.push(message.into());
    }

    /// Latest status message, if any.
    pub fn last_message(&self) -> Option<&str> {
        self.status_messages.last().map(String::as_str)
    }
}

/// A tenant's running instance of a composed application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stack {
    #[serde(default)]
    pub id: String,

    /// Catalog key of the root service
    pub key: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub status: StackStatus,

    #[serde(default)]
    pub services: Vec<StackService>,

    /// Optimistic-concurrency token, managed by the store
    #[serde(default)]
    pub revision: u64,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Stack {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            key: key.into(),
            name: name.into(),
            status: StackStatus::Stopped,
            services: Vec::new(),
            revision: 0,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Builder-style helper used by callers assembling a stack.
    pub fn with_service(mut self, service: StackService) -> Self {
        self.services.push(service);
        self
    }

    /// Stack service for a catalog key.
    pub fn service(&self, key: &str) -> Option<&StackService> {
        self.services.iter().find(|s| s.service == key)
    }

    pub fn service_mut(&mut self, key: &str) -> Option<&mut StackService> {
        self.services.iter_mut().find(|s| s.service == key)
    }

    /// Stack service by its derived id.
    pub fn service_by_id_mut(&mut self, stack_service_id: &str) -> Option<&mut StackService> {
        self.services.iter_mut().find(|s| s.id == stack_service_id)
    }

    /// (Re)derive every stack service id from the stack id.
    pub fn derive_service_ids(&mut self) {
        for service in &mut self.services {
            service.id = stack_service_id(&self.id, &service.service);
        }
    }

    /// Status a settled start resolves to: started iff every service is ready.
    pub fn settled_status(&self) -> StackStatus {
        if self.services.iter().all(|s| s.status == ServiceStatus::Ready) {
            StackStatus::Started
        } else {
            StackStatus::Error
        }
    }

    /// True when any service reports an error.
    pub fn has_error(&self) -> bool {
        self.services.iter().any(|s| s.status == ServiceStatus::Error)
    }
}
