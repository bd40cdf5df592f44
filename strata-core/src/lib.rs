//! Strata Core Library
//!
//! Shared types, storage, catalog and cluster abstractions for the strata
//! stack-lifecycle control plane.

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod observability;
pub mod paths;
pub mod state;
pub mod types;
pub mod volumes;

// Re-export commonly used items
pub use catalog::{Caller, CatalogView, ServiceCatalog};
pub use cluster::{ClusterDriver, SimulatedCluster};
pub use config::Config;
pub use error::{ErrorKind, Result, StrataError};
pub use events::{Event, EventBus, EventType};
pub use graph::DependencyGraph;
pub use observability::{
    health::HealthChecker, init as init_observability, shutdown as shutdown_observability,
};
pub use state::{StackStore, StateManager};
pub use types::{
    Account, CatalogScope, ResourceLimits, ServiceSpec, ServiceStatus, Stack, StackService,
    StackStatus,
};
