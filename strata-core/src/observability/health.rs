//! Subsystem health tracking for the daemon.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub subsystems: Vec<SubsystemHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Tracks the store, cluster and reconciler subsystems.
#[derive(Clone, Default)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<BTreeMap<String, SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subsystem as healthy. Re-registering resets it.
    pub async fn register(&self, name: &str) {
        self.set(name, HealthStatus::Healthy, None).await;
    }

    pub async fn set(&self, name: &str, status: HealthStatus, message: Option<String>) {
        let mut subsystems = self.subsystems.write().await;
        subsystems
            .insert(name.to_string(), SubsystemHealth { name: name.to_string(), status, message });
    }

    /// Worst status across subsystems.
    pub async fn report(&self) -> HealthReport {
        let subsystems: Vec<_> = self.subsystems.read().await.values().cloned().collect();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport { status, version: env!("CARGO_PKG_VERSION"), subsystems }
    }

    pub async fn is_ready(&self) -> bool {
        self.report().await.status == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worst_status_wins() {
        let checker = HealthChecker::new();
        checker.register("store").await;
        checker.register("reconciler").await;
        assert!(checker.is_ready().await);

        checker.set("reconciler", HealthStatus::Degraded, Some("pod stream closed".into())).await;
        assert_eq!(checker.report().await.status, HealthStatus::Degraded);

        checker.set("store", HealthStatus::Unhealthy, None).await;
        let report = checker.report().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.subsystems.len(), 2);

        checker.register("store").await;
        checker.register("reconciler").await;
        assert!(checker.is_ready().await);
    }
}
