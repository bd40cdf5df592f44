//! Core domain types for strata.

pub mod account;
pub mod service;
pub mod stack;
pub mod vocabulary;

// Re-exports
pub use account::{Account, ResourceLimits};
pub use service::{
    Access, CatalogScope, ConfigVar, Dependency, PortSpec, Protocol, ServiceResources,
    ServiceSpec, VolumeMountSpec, DOCKER_MOUNT,
};
pub use stack::{
    stack_id_of, stack_service_id, Endpoint, ServiceStatus, Stack, StackService, StackStatus,
};
pub use vocabulary::{Vocabulary, VocabularyTerm};
